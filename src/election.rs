//! Leader election over the store
//! One node at a time holds the election key and performs all shared-state writes

use crate::store::Store;
use etcd_client::ResignOptions;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Cluster role of this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

impl Role {
    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader)
    }
}

/// Campaigns for leadership and broadcasts role changes
pub struct LeaderElection {
    store: Store,
    election_root: String,
    node_id: String,
    lease_ttl: i64,
    role_tx: watch::Sender<Role>,
}

impl LeaderElection {
    /// Create the coordinator; the receiver reports this node's current role
    pub fn new(store: Store, election_root: &str, node_id: &str) -> (Self, watch::Receiver<Role>) {
        let (role_tx, role_rx) = watch::channel(Role::Follower);

        (
            Self {
                store,
                election_root: election_root.to_string(),
                node_id: node_id.to_string(),
                lease_ttl: 10,
                role_tx,
            },
            role_rx,
        )
    }

    /// Campaign for leadership and hold it while the lease renews; rejoin on loss
    ///
    /// Election failures are reported and retried; they never end the process.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut client = self.store.client();

        loop {
            if *shutdown.borrow() {
                return;
            }

            let lease = match client.lease_grant(self.lease_ttl, None).await {
                Ok(lease) => lease,
                Err(e) => {
                    warn!("Election lease grant failed: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };
            let lease_id = lease.id();

            debug!("Campaigning for leadership as {}", self.node_id);

            let campaign = tokio::select! {
                c = client.campaign(self.election_root.clone(), self.node_id.clone(), lease_id) => c,
                _ = shutdown.changed() => {
                    let _ = client.lease_revoke(lease_id).await;
                    return;
                }
            };

            let leader_key = match campaign {
                Ok(mut resp) => resp.take_leader(),
                Err(e) => {
                    warn!("Election campaign failed: {}", e);
                    let _ = client.lease_revoke(lease_id).await;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            info!("Elected leader as {}", self.node_id);
            let _ = self.role_tx.send(Role::Leader);

            let stopping = self.hold_leadership(lease_id, &mut shutdown).await;
            let _ = self.role_tx.send(Role::Follower);

            if stopping {
                if let Some(key) = leader_key {
                    let _ = client.resign(Some(ResignOptions::new().with_leader(key))).await;
                }
                let _ = client.lease_revoke(lease_id).await;
                info!("Resigned leadership");
                return;
            }

            warn!("Leadership lost, rejoining election");
            let _ = client.lease_revoke(lease_id).await;
        }
    }

    /// Renew the lease until it fails or shutdown arrives; true means shutdown
    async fn hold_leadership(&self, lease_id: i64, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut client = self.store.client();

        let (mut keeper, mut responses) = match client.lease_keep_alive(lease_id).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Lease keep-alive unavailable: {}", e);
                return false;
            }
        };

        let period = Duration::from_secs((self.lease_ttl as u64 / 3).max(1));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = keeper.keep_alive().await {
                        warn!("Lease renewal failed: {}", e);
                        return false;
                    }

                    match responses.message().await {
                        Ok(Some(resp)) if resp.ttl() > 0 => {}
                        Ok(_) => {
                            warn!("Leadership lease expired");
                            return false;
                        }
                        Err(e) => {
                            warn!("Lease renewal stream error: {}", e);
                            return false;
                        }
                    }
                }
                _ = shutdown.changed() => return true,
            }
        }
    }
}

/// Log cluster leader changes as every node observes them
pub async fn run_observer(store: Store, election_root: String, mut shutdown: watch::Receiver<bool>) {
    let mut client = store.client();
    let mut last_seen: Option<String> = None;

    loop {
        if *shutdown.borrow() {
            return;
        }

        let mut stream = match client.observe(election_root.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Leader observation failed to open: {}", e);
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        loop {
            let message = tokio::select! {
                m = stream.message() => m,
                _ = shutdown.changed() => return,
            };

            match message {
                Ok(Some(resp)) => {
                    let Some(kv) = resp.kv() else { continue };
                    let Ok(leader) = kv.value_str() else { continue };

                    if last_seen.as_deref() != Some(leader) {
                        info!("Cluster leader is {}", leader);
                        last_seen = Some(leader.to_string());
                    }
                }
                Ok(None) => {
                    warn!("Leader observation closed by the store");
                    break;
                }
                Err(e) => {
                    warn!("Leader observation error: {}", e);
                    break;
                }
            }
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_is_leader() {
        assert!(Role::Leader.is_leader());
        assert!(!Role::Follower.is_leader());
    }

    #[test]
    fn test_role_channel_starts_as_follower() {
        let (_tx, rx) = watch::channel(Role::Follower);
        assert_eq!(*rx.borrow(), Role::Follower);
    }
}

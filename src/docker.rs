//! Swarm service discovery
//! Turns docker service events and periodic listings into virtual host registrations

use crate::acme::AcmeManager;
use crate::election::Role;
use crate::store::{self, StoreWrite};
use crate::vhost::{VhostRegistry, VirtualHost, VIRTUAL_HOST_LABEL};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::system::EventsOptions;
use bollard::Docker;
use dashmap::DashMap;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// The service fields discovery cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSummary {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
}

impl ServiceSummary {
    /// A service is in scope once it names its public hostname
    pub fn in_scope(&self) -> bool {
        self.labels.contains_key(VIRTUAL_HOST_LABEL)
    }
}

/// Source of swarm service definitions
#[async_trait]
pub trait ServiceSource: Send + Sync {
    async fn list(&self) -> Result<Vec<ServiceSummary>>;
    async fn inspect(&self, service_id: &str) -> Result<ServiceSummary>;
}

/// Swarm API access over the local docker socket
pub struct SwarmClient {
    docker: Docker,
}

impl SwarmClient {
    pub fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("connect to the docker socket")?;
        Ok(Self { docker })
    }

    pub fn docker(&self) -> Docker {
        self.docker.clone()
    }
}

fn summarize(service: bollard::models::Service) -> Option<ServiceSummary> {
    let id = service.id?;
    let spec = service.spec?;
    let name = spec.name?;
    Some(ServiceSummary {
        id,
        name,
        labels: spec.labels.unwrap_or_default(),
    })
}

#[async_trait]
impl ServiceSource for SwarmClient {
    async fn list(&self) -> Result<Vec<ServiceSummary>> {
        let services = self
            .docker
            .list_services::<String>(None)
            .await
            .context("list swarm services")?;
        Ok(services.into_iter().filter_map(summarize).collect())
    }

    async fn inspect(&self, service_id: &str) -> Result<ServiceSummary> {
        let service = self
            .docker
            .inspect_service(service_id, None)
            .await
            .with_context(|| format!("inspect service {}", service_id))?;
        summarize(service)
            .ok_or_else(|| anyhow::anyhow!("service {} has no usable spec", service_id))
    }
}

/// Keeps the store's virtual hosts in agreement with labeled swarm services
///
/// Every node tracks service-to-domain ownership so removals resolve to the
/// right domain later; only the leader writes to the store.
pub struct ServiceReconciler {
    source: Arc<dyn ServiceSource>,
    store: Arc<dyn StoreWrite>,
    acme: Arc<AcmeManager>,
    services: DashMap<String, String>,
    role_rx: watch::Receiver<Role>,
    vhost_root: String,
    cert_root: String,
}

impl ServiceReconciler {
    pub fn new(
        source: Arc<dyn ServiceSource>,
        store: Arc<dyn StoreWrite>,
        acme: Arc<AcmeManager>,
        role_rx: watch::Receiver<Role>,
        vhost_root: &str,
        cert_root: &str,
    ) -> Self {
        Self {
            source,
            store,
            acme,
            services: DashMap::new(),
            role_rx,
            vhost_root: vhost_root.to_string(),
            cert_root: cert_root.to_string(),
        }
    }

    /// Seed service ownership from virtual hosts already in the registry, so
    /// removal events for services registered before this node started still
    /// resolve to a domain
    pub fn prime(&self, registry: &VhostRegistry) {
        for (domain, vhost) in registry.entries() {
            self.services.insert(vhost.service_id, domain);
        }
        debug!("Tracking {} existing services", self.services.len());
    }

    /// Register a discovered service; out-of-scope services are ignored
    pub async fn apply_service(&self, service: &ServiceSummary) -> Result<()> {
        let parsed = VirtualHost::from_labels(&service.id, &service.name, &service.labels)
            .with_context(|| format!("labels of service {}", service.id))?;
        let Some((domain, vhost)) = parsed else {
            return Ok(());
        };

        self.services.insert(service.id.clone(), domain.clone());

        if !self.role_rx.borrow().is_leader() {
            debug!("Tracking service {} for {} as follower", service.id, domain);
            return Ok(());
        }

        let key = store::join_key(&self.vhost_root, &domain);
        let json = serde_json::to_string(&vhost).context("serialize virtual host")?;
        self.store.write(&key, &json).await?;
        info!("Registered virtual host {} for service {}", domain, service.name);

        let cert_key = store::join_key(&self.cert_root, &domain);
        if self.store.read(&cert_key).await?.is_none() {
            self.acme.place_order(&domain).await?;
        }

        Ok(())
    }

    /// Inspect a service by ID and register it
    pub async fn apply_service_by_id(&self, service_id: &str) -> Result<()> {
        let service = self.source.inspect(service_id).await?;
        self.apply_service(&service).await
    }

    /// Drop a service's virtual host; repeated removal is a no-op
    pub async fn remove_service(&self, service_id: &str) -> Result<()> {
        let Some(domain) = self.services.get(service_id).map(|d| d.clone()) else {
            debug!("Service {} has no virtual host", service_id);
            return Ok(());
        };

        if self.role_rx.borrow().is_leader() {
            let key = store::join_key(&self.vhost_root, &domain);
            self.store.remove(&key).await?;
            info!("Removed virtual host {} for service {}", domain, service_id);
        }

        self.services.remove(service_id);
        Ok(())
    }

    /// Full pass against the service listing, covering missed events in both
    /// directions
    pub async fn reconcile(&self) -> Result<()> {
        let services = self.source.list().await?;

        for service in &services {
            if !service.in_scope() || self.services.contains_key(&service.id) {
                continue;
            }
            info!("Found unregistered service {}", service.id);
            if let Err(e) = self.apply_service(service).await {
                warn!("Could not register service {}: {}", service.id, e);
            }
        }

        let live: HashSet<&str> = services.iter().map(|s| s.id.as_str()).collect();
        let vanished: Vec<String> = self
            .services
            .iter()
            .filter(|entry| !live.contains(entry.key().as_str()))
            .map(|entry| entry.key().clone())
            .collect();

        for service_id in vanished {
            info!("Removing vanished service {}", service_id);
            if let Err(e) = self.remove_service(&service_id).await {
                warn!("Could not remove service {}: {}", service_id, e);
            }
        }

        Ok(())
    }

    /// Periodic reconciliation; the first pass runs immediately at startup
    pub async fn run_poll(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    debug!("Polling swarm services");
                    if let Err(e) = self.reconcile().await {
                        warn!("Service reconciliation failed: {}", e);
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}

/// Follow the docker event stream for service changes until shutdown
///
/// A broken stream is reopened after a short pause rather than left dead.
pub async fn run_event_listener(
    docker: Docker,
    reconciler: Arc<ServiceReconciler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["service".to_string()]);
        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };

        let mut events = Box::pin(docker.events(Some(options)));
        debug!("Listening for swarm service events");

        loop {
            let message = tokio::select! {
                m = events.next() => m,
                _ = shutdown.changed() => return,
            };

            match message {
                Some(Ok(event)) => {
                    let Some(actor_id) = event.actor.and_then(|a| a.id) else {
                        continue;
                    };

                    match event.action.as_deref() {
                        Some("create") | Some("update") => {
                            debug!("Service {} created or updated", actor_id);
                            if let Err(e) = reconciler.apply_service_by_id(&actor_id).await {
                                warn!("Could not register service {}: {}", actor_id, e);
                            }
                        }
                        Some("remove") => {
                            debug!("Service {} removed", actor_id);
                            if let Err(e) = reconciler.remove_service(&actor_id).await {
                                warn!("Could not remove service {}: {}", actor_id, e);
                            }
                        }
                        _ => {}
                    }
                }
                Some(Err(e)) => {
                    warn!("Docker event stream error: {}", e);
                    break;
                }
                None => {
                    warn!("Docker event stream closed");
                    break;
                }
            }
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

//! ACME certificate lifecycle
//! Leader-driven issuance and renewal through the HTTP-01 challenge flow

use crate::certificate;
use crate::election::Role;
use crate::store::{self, Store, StoreError, StoreWrite};
use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use etcd_client::EventType;
use http_body_util::Full;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, HttpClient, Identifier,
    LetsEncrypt, NewAccount, NewOrder, Order, OrderStatus,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

/// Unconsumed challenge records expire from the store after 10 days
const CHALLENGE_TTL_SECS: i64 = 864_000;

/// Issued certificates expire from the store after 90 days
const CERT_TTL_SECS: i64 = 7_776_000;

/// Renew once fewer than this many days of validity remain
const RENEWAL_THRESHOLD_DAYS: i64 = 45;

/// Upper bound on one placement attempt, CA round trips included
const ORDER_TIMEOUT: Duration = Duration::from_secs(120);

/// Upper bound on validating and finalizing one published challenge
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(600);

/// Stored challenge: everything any node needs to answer the CA's validation
/// request, and everything the leader needs to resume the order that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeRecord {
    pub domain: String,
    pub order: String,
    pub challenge: String,
    pub response: String,
}

/// Per-domain issuance progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertLifecycle {
    None,
    OrderCreated,
    Authorized,
    ChallengePublished,
    ChallengeValidating,
    ChallengeComplete,
    Finalizing,
    Issued,
}

/// Settings for the lifecycle manager
#[derive(Clone)]
pub struct AcmeConfig {
    pub challenge_root: String,
    pub cert_root: String,
    pub vhost_root: String,
    pub contact_email: String,
    pub staging: bool,
    /// Explicit directory, overriding the Let's Encrypt URL picked by `staging`
    pub directory_url: Option<String>,
    pub credentials_path: PathBuf,
    pub default_key_pem: String,
}

/// Drives per-domain certificate issuance; only acts while this node leads
pub struct AcmeManager {
    store: Arc<dyn StoreWrite>,
    config: AcmeConfig,
    directory_url: String,
    account: RwLock<Option<Arc<Account>>>,
    account_init: Mutex<()>,
    states: DashMap<String, CertLifecycle>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    role_rx: watch::Receiver<Role>,
}

impl AcmeManager {
    /// Create the manager; no CA traffic happens until this node is elected
    pub fn new(store: Arc<dyn StoreWrite>, role_rx: watch::Receiver<Role>, config: AcmeConfig) -> Self {
        let directory_url = config.directory_url.clone().unwrap_or_else(|| {
            if config.staging {
                LetsEncrypt::Staging.url().to_string()
            } else {
                LetsEncrypt::Production.url().to_string()
            }
        });

        Self {
            store,
            config,
            directory_url,
            account: RwLock::new(None),
            account_init: Mutex::new(()),
            states: DashMap::new(),
            locks: DashMap::new(),
            role_rx,
        }
    }

    /// Current lifecycle state for a domain
    pub fn state(&self, domain: &str) -> CertLifecycle {
        self.states
            .get(domain)
            .map(|s| *s)
            .unwrap_or(CertLifecycle::None)
    }

    fn set_state(&self, domain: &str, state: CertLifecycle) {
        debug!("Certificate lifecycle for {}: {:?}", domain, state);
        if state == CertLifecycle::None {
            self.states.remove(domain);
        } else {
            self.states.insert(domain.to_string(), state);
        }
    }

    fn domain_lock(&self, domain: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Load or register the ACME account; safe to call repeatedly
    pub async fn ensure_account(&self) -> Result<()> {
        let _init = self.account_init.lock().await;
        if self.account.read().is_some() {
            return Ok(());
        }

        if let Ok(json) = tokio::fs::read_to_string(&self.config.credentials_path).await {
            match self.account_from_json(&json).await {
                Ok(account) => {
                    info!("Loaded ACME account credentials from {}", self.config.credentials_path.display());
                    *self.account.write() = Some(Arc::new(account));
                    return Ok(());
                }
                Err(e) => {
                    warn!("Stored ACME credentials are unusable, registering anew: {}", e);
                }
            }
        }

        let contact = format!("mailto:{}", self.config.contact_email.trim_start_matches("mailto:"));
        let new_account = NewAccount {
            contact: &[contact.as_str()],
            terms_of_service_agreed: true,
            only_return_existing: false,
        };
        let (account, credentials) = match plain_http_client(&self.directory_url) {
            Some(http) => {
                Account::create_with_http(&new_account, &self.directory_url, None, http).await
            }
            None => Account::create(&new_account, &self.directory_url, None).await,
        }
        .context("ACME account registration failed")?;

        let json = serde_json::to_string(&credentials).context("serialize ACME credentials")?;
        tokio::fs::write(&self.config.credentials_path, json)
            .await
            .with_context(|| {
                format!("write ACME credentials to {}", self.config.credentials_path.display())
            })?;

        info!("Registered ACME account for {}", contact);
        *self.account.write() = Some(Arc::new(account));
        Ok(())
    }

    async fn account_from_json(&self, json: &str) -> Result<Account> {
        let credentials: AccountCredentials =
            serde_json::from_str(json).context("parse ACME credentials")?;
        let restored = match plain_http_client(&self.directory_url) {
            Some(http) => Account::from_credentials_and_http(credentials, http).await,
            None => Account::from_credentials(credentials).await,
        };
        restored.context("restore ACME account from credentials")
    }

    fn account(&self) -> Result<Arc<Account>> {
        self.account
            .read()
            .clone()
            .ok_or_else(|| anyhow!("ACME account is not initialized"))
    }

    /// Rebuild per-domain states from store contents
    ///
    /// Issued certificates map to `Issued`, published challenges to
    /// `ChallengePublished`; a leadership change mid-lifecycle resumes from
    /// there instead of starting over.
    pub async fn rebuild_states(&self) -> Result<(), StoreError> {
        self.states.clear();

        for (key, _) in self.store.read_prefix(&self.config.cert_root).await? {
            let domain = store::last_segment(&key).to_string();
            self.states.insert(domain, CertLifecycle::Issued);
        }

        for (_, value) in self.store.read_prefix(&self.config.challenge_root).await? {
            if let Ok(record) = serde_json::from_str::<ChallengeRecord>(&value) {
                self.states.insert(record.domain, CertLifecycle::ChallengePublished);
            }
        }

        info!("Rebuilt lifecycle state for {} domains", self.states.len());
        Ok(())
    }

    /// Start a new order for a domain and publish its HTTP-01 challenge
    ///
    /// Skips silently when this node is not leader or the domain already has
    /// a lifecycle in flight.
    pub async fn place_order(&self, domain: &str) -> Result<()> {
        if !self.role_rx.borrow().is_leader() {
            debug!("Not leader, skipping certificate order for {}", domain);
            return Ok(());
        }

        match self.state(domain) {
            CertLifecycle::None | CertLifecycle::Issued => {}
            state => {
                debug!("Lifecycle already in flight for {} ({:?})", domain, state);
                return Ok(());
            }
        }

        let lock = self.domain_lock(domain);
        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Lifecycle already locked for {}", domain);
                return Ok(());
            }
        };

        self.ensure_account().await?;
        let account = self.account()?;

        let result =
            match tokio::time::timeout(ORDER_TIMEOUT, self.place_order_inner(&account, domain))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(anyhow!("order placement for {} timed out", domain)),
            };
        if result.is_err() {
            self.set_state(domain, CertLifecycle::None);
        }
        result
    }

    async fn place_order_inner(&self, account: &Account, domain: &str) -> Result<()> {
        info!("Ordering certificate for {}", domain);
        self.set_state(domain, CertLifecycle::OrderCreated);

        let identifiers = vec![Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .with_context(|| format!("create order for {}", domain))?;

        let authorizations = order
            .authorizations()
            .await
            .with_context(|| format!("fetch authorizations for {}", domain))?;
        self.set_state(domain, CertLifecycle::Authorized);

        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => bail!("authorization for {} is {:?}", domain, status),
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| anyhow!("no HTTP-01 challenge offered for {}", domain))?;

            let record = ChallengeRecord {
                domain: domain.to_string(),
                order: order.url().to_string(),
                challenge: challenge.url.clone(),
                response: order.key_authorization(challenge).as_str().to_string(),
            };

            let key = store::join_key(&self.config.challenge_root, &challenge.token);
            let json = serde_json::to_string(&record).context("serialize challenge record")?;

            // State first: the watch event may fire the moment the put lands
            self.set_state(domain, CertLifecycle::ChallengePublished);
            self.store.write_with_ttl(&key, &json, CHALLENGE_TTL_SECS).await?;
            info!("Published challenge for {}", domain);
        }

        // Orders whose authorizations are already valid skip the challenge
        if order.state().status == OrderStatus::Ready {
            self.finalize_order(domain, &mut order).await?;
        }

        Ok(())
    }

    /// Validate a published challenge and carry the order through to a
    /// stored certificate; called by the watcher on the leader
    async fn complete_challenge(&self, token: &str, record: &ChallengeRecord) -> Result<()> {
        let domain = record.domain.as_str();

        // Wait for the publishing side to release the domain, then bow out
        // if another event already carried this challenge to completion
        let lock = self.domain_lock(domain);
        let _guard = lock.lock().await;
        if self.state(domain) == CertLifecycle::Issued {
            debug!("Certificate for {} already issued, ignoring challenge event", domain);
            return Ok(());
        }

        self.ensure_account().await?;
        let account = self.account()?;

        let mut order = account
            .order(record.order.clone())
            .await
            .with_context(|| format!("load order for {}", domain))?;

        self.set_state(domain, CertLifecycle::ChallengeValidating);
        order
            .set_challenge_ready(&record.challenge)
            .await
            .with_context(|| format!("signal challenge readiness for {}", domain))?;

        self.wait_for_validation(&mut order, domain).await?;

        let key = store::join_key(&self.config.challenge_root, token);
        self.store.remove(&key).await?;
        self.set_state(domain, CertLifecycle::ChallengeComplete);
        debug!("Challenge validated for {}", domain);

        self.finalize_order(domain, &mut order).await
    }

    /// Poll the order until validation reaches a definitive outcome
    async fn wait_for_validation(&self, order: &mut Order, domain: &str) -> Result<()> {
        let mut delay = Duration::from_secs(1);

        for _ in 0..10 {
            tokio::time::sleep(delay).await;

            order.refresh().await.context("refresh order")?;
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    let detail = order
                        .state()
                        .error
                        .as_ref()
                        .map(|p| format!("{:?}", p))
                        .unwrap_or_else(|| "no problem detail".to_string());
                    bail!("challenge validation for {} failed: {}", domain, detail)
                }
                _ => delay = (delay * 2).min(Duration::from_secs(30)),
            }
        }

        bail!("timed out waiting for challenge validation of {}", domain)
    }

    /// CSR, finalize, download, store with TTL
    async fn finalize_order(&self, domain: &str, order: &mut Order) -> Result<()> {
        self.set_state(domain, CertLifecycle::Finalizing);

        let csr = build_csr(domain, &self.config.default_key_pem)?;
        order
            .finalize(&csr)
            .await
            .with_context(|| format!("finalize order for {}", domain))?;

        let mut tries = 0;
        let chain = loop {
            match order.certificate().await.context("download certificate")? {
                Some(chain) => break chain,
                None if tries < 10 => {
                    tries += 1;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                None => bail!("certificate for {} never became available", domain),
            }
        };

        let key = store::join_key(&self.config.cert_root, domain);
        self.store.write_with_ttl(&key, &chain, CERT_TTL_SECS).await?;

        self.set_state(domain, CertLifecycle::Issued);
        info!("Certificate issued for {}", domain);
        Ok(())
    }

    /// Drop a failed attempt so the next sweep can retry from scratch
    async fn abandon_attempt(&self, domain: &str, token: &str) {
        let key = store::join_key(&self.config.challenge_root, token);
        if let Err(e) = self.store.remove(&key).await {
            warn!("Could not remove abandoned challenge for {}: {}", domain, e);
        }
        self.set_state(domain, CertLifecycle::None);
    }

    /// Drive a challenge to completion on its own task; failures abandon the
    /// attempt so the next sweep starts the domain over
    fn spawn_completion(self: &Arc<Self>, token: String, record: ChallengeRecord) {
        let manager = self.clone();
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(
                COMPLETION_TIMEOUT,
                manager.complete_challenge(&token, &record),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(anyhow!("challenge completion for {} timed out", record.domain)),
            };

            if let Err(e) = outcome {
                warn!("Challenge completion for {} failed: {}", record.domain, e);
                manager.abandon_attempt(&record.domain, &token).await;
            }
        });
    }

    /// Revive challenges published before this node took the lead
    ///
    /// No watch event will ever fire for a record that predates the watcher,
    /// so each one is driven explicitly. An order owned by a previous
    /// leader's account fails fast and is abandoned, clearing the way for
    /// the next sweep to reorder.
    pub async fn resume_challenges(self: &Arc<Self>) -> Result<(), StoreError> {
        for (key, value) in self.store.read_prefix(&self.config.challenge_root).await? {
            let record = match serde_json::from_str::<ChallengeRecord>(&value) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Malformed challenge record at {}: {}", key, e);
                    continue;
                }
            };

            info!("Resuming published challenge for {}", record.domain);
            self.spawn_completion(store::last_segment(&key).to_string(), record);
        }
        Ok(())
    }

    /// One renewal pass: renew expiring certificates and issue missing ones
    pub async fn sweep(&self) -> Result<()> {
        let certs = self.store.read_prefix(&self.config.cert_root).await?;

        for (key, pem) in &certs {
            let domain = store::last_segment(key).to_string();

            let vhost_key = store::join_key(&self.config.vhost_root, &domain);
            if self.store.read(&vhost_key).await?.is_none() {
                debug!("No active virtual host for {}, skipping renewal", domain);
                continue;
            }

            let expiry = match certificate::chain_expiry(pem) {
                Ok(expiry) => expiry,
                Err(e) => {
                    warn!("Unreadable stored certificate for {}: {}", domain, e);
                    continue;
                }
            };

            if needs_renewal(expiry) {
                let days_left = (expiry - Utc::now()).num_days();
                info!("Certificate for {} expires in {} days, renewing", domain, days_left);
                if let Err(e) = self.place_order(&domain).await {
                    warn!("Renewal order for {} failed: {}", domain, e);
                }
            }
        }

        // First issuance for registered hosts that never got a certificate
        let have_certs: Vec<String> = certs
            .iter()
            .map(|(key, _)| store::last_segment(key).to_string())
            .collect();

        for (key, _) in self.store.read_prefix(&self.config.vhost_root).await? {
            let domain = store::last_segment(&key).to_string();
            if have_certs.contains(&domain) {
                continue;
            }

            info!("Virtual host {} has no certificate, ordering one", domain);
            if let Err(e) = self.place_order(&domain).await {
                warn!("Certificate order for {} failed: {}", domain, e);
            }
        }

        Ok(())
    }

    /// Periodic leader-only renewal sweep
    pub async fn run_renewal_sweep(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if !self.role_rx.borrow().is_leader() {
                        continue;
                    }
                    if let Err(e) = self.sweep().await {
                        warn!("Renewal sweep failed: {}", e);
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// React to leadership changes: prepare the account and resume state
    pub async fn run_on_election(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut role_rx = self.role_rx.clone();

        loop {
            tokio::select! {
                changed = role_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if !role_rx.borrow_and_update().is_leader() {
                        continue;
                    }

                    if let Err(e) = self.ensure_account().await {
                        error!("ACME account initialization failed: {}", e);
                        continue;
                    }
                    if let Err(e) = self.rebuild_states().await {
                        warn!("Could not rebuild certificate lifecycle state: {}", e);
                    }
                    if let Err(e) = self.resume_challenges().await {
                        warn!("Could not resume published challenges: {}", e);
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Follow the store's challenge namespace; the leader validates each
    /// published challenge, other nodes only serve it on port 80
    pub async fn run_challenge_watcher(
        self: Arc<Self>,
        store: Store,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let (_watcher, mut stream) = match store.watch_prefix(&self.config.challenge_root).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Challenge watch failed to open: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            debug!("Watching challenges under {}", self.config.challenge_root);

            loop {
                let message = tokio::select! {
                    m = stream.message() => m,
                    _ = shutdown.changed() => return,
                };

                match message {
                    Ok(Some(resp)) => {
                        for event in resp.events() {
                            if event.event_type() != EventType::Put {
                                continue;
                            }
                            let Some(kv) = event.kv() else { continue };
                            let (Ok(key), Ok(value)) = (kv.key_str(), kv.value_str()) else {
                                continue;
                            };

                            if !self.role_rx.borrow().is_leader() {
                                continue;
                            }

                            let record = match serde_json::from_str::<ChallengeRecord>(value) {
                                Ok(record) => record,
                                Err(e) => {
                                    warn!("Malformed challenge record at {}: {}", key, e);
                                    continue;
                                }
                            };

                            self.spawn_completion(store::last_segment(key).to_string(), record);
                        }
                    }
                    Ok(None) => {
                        warn!("Challenge watch closed by the store");
                        break;
                    }
                    Err(e) => {
                        warn!("Challenge watch error: {}", e);
                        break;
                    }
                }
            }

            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }
}

/// Whether a certificate with this expiry is due for renewal
pub fn needs_renewal(expiry: DateTime<Utc>) -> bool {
    (expiry - Utc::now()).num_days() < RENEWAL_THRESHOLD_DAYS
}

/// Client for directories published over plain HTTP (private CAs, Pebble)
///
/// The bundled client refuses non-TLS URLs, so those directories get a bare
/// hyper client instead. Returns `None` for HTTPS directories.
fn plain_http_client(directory_url: &str) -> Option<Box<dyn HttpClient>> {
    if !directory_url.starts_with("http://") {
        return None;
    }
    let client: HyperClient<HttpConnector, Full<Bytes>> =
        HyperClient::builder(TokioExecutor::new()).build(HttpConnector::new());
    Some(Box::new(client))
}

/// Certificate signing request for a domain, signed with the shared default key
fn build_csr(domain: &str, key_pem: &str) -> Result<Vec<u8>> {
    let key_pair = rcgen::KeyPair::from_pem(key_pem).context("default key is not usable for CSR")?;
    let alg = key_pair
        .compatible_algs()
        .next()
        .ok_or_else(|| anyhow!("default key algorithm unsupported for CSR"))?;

    let mut params = rcgen::CertificateParams::new(vec![domain.to_string()]);
    params.distinguished_name = rcgen::DistinguishedName::new();
    params.alg = alg;
    params.key_pair = Some(key_pair);

    let cert = rcgen::Certificate::from_params(params).context("assemble CSR parameters")?;
    cert.serialize_request_der().context("serialize CSR")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_challenge_record_round_trip() {
        let record = ChallengeRecord {
            domain: "app.example.com".to_string(),
            order: "https://ca.example/order/1".to_string(),
            challenge: "https://ca.example/chall/2".to_string(),
            response: "token.keyauth".to_string(),
        };

        let json = serde_json::to_string(&record).unwrap();
        for field in ["domain", "order", "challenge", "response"] {
            assert!(json.contains(field));
        }

        let parsed: ChallengeRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_needs_renewal_threshold() {
        assert!(needs_renewal(Utc::now() + TimeDelta::days(30)));
        assert!(needs_renewal(Utc::now() + TimeDelta::days(44)));
        assert!(!needs_renewal(Utc::now() + TimeDelta::days(46)));
        assert!(!needs_renewal(Utc::now() + TimeDelta::days(80)));
        assert!(needs_renewal(Utc::now() - TimeDelta::days(1)));
    }

    #[test]
    fn test_build_csr_from_generated_key() {
        let key_pair = rcgen::KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let csr = build_csr("app.example.com", &key_pair.serialize_pem()).unwrap();
        assert!(!csr.is_empty());
    }

    #[test]
    fn test_build_csr_rejects_garbage_key() {
        assert!(build_csr("app.example.com", "not a key").is_err());
    }
}

//! Certificate cache for SNI-based TLS termination
//! Pairs PEM chains from the store with the node's default private key

use crate::store::{self, StoreError, StoreRead};
use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use etcd_client::EventType;
use rustls::ServerConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// In-memory projection of the store's certificate namespace
///
/// Stored chains carry no private key; every node pairs them with the shared
/// default key at config-build time. A chain that cannot be turned into a
/// working config is dropped and the domain stays unservable (fail closed).
pub struct CertificateCache {
    cache: DashMap<String, Arc<ServerConfig>>,
    store: Arc<dyn StoreRead>,
    cert_root: String,
    default_key_pem: String,
}

impl CertificateCache {
    /// Create an empty cache over the given store namespace
    pub fn new(store: Arc<dyn StoreRead>, cert_root: &str, default_key_pem: &str) -> Self {
        Self {
            cache: DashMap::new(),
            store,
            cert_root: cert_root.to_string(),
            default_key_pem: default_key_pem.to_string(),
        }
    }

    /// Load every stored certificate into the cache
    pub async fn prime(&self) -> Result<usize, StoreError> {
        let pairs = self.store.read_prefix(&self.cert_root).await?;
        let mut loaded = 0;

        for (key, value) in pairs {
            if self.apply_put(&key, &value) {
                loaded += 1;
            }
        }

        info!("Loaded {} certificates", loaded);
        Ok(loaded)
    }

    /// Resolve the TLS config for a server name: cache first, then the store
    ///
    /// Returns `None` when no usable certificate exists; the caller must refuse
    /// the handshake rather than substitute another domain's certificate.
    pub async fn config_for(&self, domain: &str) -> Option<Arc<ServerConfig>> {
        if let Some(cached) = self.cache.get(domain) {
            return Some(cached.clone());
        }

        let key = store::join_key(&self.cert_root, domain);
        match self.store.read(&key).await {
            Ok(Some(pem)) => {
                if self.apply_put(&key, &pem) {
                    self.cache.get(domain).map(|c| c.clone())
                } else {
                    None
                }
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Certificate lookup for {} failed: {}", domain, e);
                None
            }
        }
    }

    /// Whether the domain currently has a cached certificate
    pub fn contains(&self, domain: &str) -> bool {
        self.cache.contains_key(domain)
    }

    /// Apply a store put event; returns whether the chain was accepted
    fn apply_put(&self, key: &str, pem: &str) -> bool {
        let domain = store::last_segment(key);

        let server_config = match build_server_config(pem, &self.default_key_pem) {
            Ok(config) => Arc::new(config),
            Err(e) => {
                warn!("Rejecting stored certificate for {}: {}", domain, e);
                return false;
            }
        };

        match chain_expiry(pem) {
            Ok(expiry) => debug!("Certificate set: {} (expires {})", domain, expiry),
            Err(e) => {
                warn!("Cannot read expiry of certificate for {}: {}", domain, e);
                debug!("Certificate set: {}", domain);
            }
        }

        self.cache.insert(domain.to_string(), server_config);
        true
    }

    /// Apply a store delete or TTL-expiry event
    fn apply_delete(&self, key: &str) {
        let domain = store::last_segment(key);
        if self.cache.remove(domain).is_some() {
            info!("Certificate removed: {}", domain);
        }
    }

    /// Follow the store's certificate namespace until shutdown
    pub async fn run_watcher(
        self: Arc<Self>,
        store: crate::store::Store,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let (_watcher, mut stream) = match store.watch_prefix(&self.cert_root).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Certificate watch failed to open: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            debug!("Watching certificates under {}", self.cert_root);

            loop {
                let message = tokio::select! {
                    m = stream.message() => m,
                    _ = shutdown.changed() => return,
                };

                match message {
                    Ok(Some(resp)) => {
                        for event in resp.events() {
                            let Some(kv) = event.kv() else { continue };
                            let Ok(key) = kv.key_str() else { continue };

                            match event.event_type() {
                                EventType::Put => {
                                    if let Ok(pem) = kv.value_str() {
                                        self.apply_put(key, pem);
                                    }
                                }
                                EventType::Delete => self.apply_delete(key),
                            }
                        }
                    }
                    Ok(None) => {
                        warn!("Certificate watch closed by the store");
                        break;
                    }
                    Err(e) => {
                        warn!("Certificate watch error: {}", e);
                        break;
                    }
                }
            }

            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }
}

/// Build a server config from a PEM chain and a PEM private key
pub fn build_server_config(chain_pem: &str, key_pem: &str) -> Result<ServerConfig> {
    let certs = rustls_pemfile::certs(&mut chain_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .context("invalid certificate chain PEM")?;

    if certs.is_empty() {
        bail!("certificate chain contains no certificates");
    }

    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .context("invalid private key PEM")?
        .ok_or_else(|| anyhow!("no private key found in PEM"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("private key is not usable for a TLS server")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(config)
}

/// Expiry instant of the first certificate in a PEM chain
pub fn chain_expiry(chain_pem: &str) -> Result<DateTime<Utc>> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(chain_pem.as_bytes())
        .map_err(|e| anyhow!("certificate is not valid PEM: {}", e))?;
    let (_, cert) = x509_parser::parse_x509_certificate(&pem.contents)
        .map_err(|e| anyhow!("certificate is not valid X.509: {}", e))?;

    let not_after = cert.validity().not_after.timestamp();
    DateTime::from_timestamp(not_after, 0).ok_or_else(|| anyhow!("certificate expiry out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rcgen::generate_simple_self_signed;

    struct MemStore(DashMap<String, String>);

    #[async_trait]
    impl StoreRead for MemStore {
        async fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
            Ok(self.0.get(key).map(|v| v.clone()))
        }

        async fn read_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
            Ok(self
                .0
                .iter()
                .filter(|e| e.key().starts_with(prefix))
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect())
        }
    }

    fn self_signed(domain: &str) -> (String, String) {
        let cert = generate_simple_self_signed(vec![domain.to_string()]).unwrap();
        (cert.serialize_pem().unwrap(), cert.serialize_private_key_pem())
    }

    #[test]
    fn test_build_server_config_matching_pair() {
        let (chain, key) = self_signed("example.com");
        assert!(build_server_config(&chain, &key).is_ok());
    }

    #[test]
    fn test_build_server_config_garbage() {
        assert!(build_server_config("not a pem", "also not a pem").is_err());
    }

    #[test]
    fn test_chain_expiry_in_future() {
        let (chain, _) = self_signed("example.com");
        let expiry = chain_expiry(&chain).unwrap();
        assert!(expiry > Utc::now());
    }

    #[tokio::test]
    async fn test_config_for_unknown_domain_is_none() {
        let (_, key) = self_signed("example.com");
        let cache = CertificateCache::new(Arc::new(MemStore(DashMap::new())), "/certs", &key);

        assert!(cache.config_for("missing.example.com").await.is_none());
    }

    #[tokio::test]
    async fn test_config_for_reads_through_to_store() {
        let (chain, key) = self_signed("app.example.com");

        let mem = MemStore(DashMap::new());
        mem.0.insert("/certs/app.example.com".to_string(), chain);

        let cache = CertificateCache::new(Arc::new(mem), "/certs", &key);
        assert!(!cache.contains("app.example.com"));

        assert!(cache.config_for("app.example.com").await.is_some());
        assert!(cache.contains("app.example.com"));
    }

    #[tokio::test]
    async fn test_prime_and_delete() {
        let (chain, key) = self_signed("a.example.com");

        let mem = MemStore(DashMap::new());
        mem.0.insert("/certs/a.example.com".to_string(), chain);
        mem.0.insert("/certs/broken.example.com".to_string(), "junk".to_string());

        let cache = CertificateCache::new(Arc::new(mem), "/certs", &key);
        let loaded = cache.prime().await.unwrap();

        assert_eq!(loaded, 1);
        assert!(cache.contains("a.example.com"));

        cache.apply_delete("/certs/a.example.com");
        assert!(!cache.contains("a.example.com"));
    }
}

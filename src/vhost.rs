//! Virtual host registry
//! Maps public hostnames to backend targets, backed by the store and primed by label discovery

use crate::store::{self, StoreError, StoreRead};
use anyhow::{Context, Result, anyhow};
use base64::{Engine as _, engine::general_purpose};
use dashmap::DashMap;
use etcd_client::EventType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

/// Service label naming the public URL for a routed service
pub const VIRTUAL_HOST_LABEL: &str = "VIRTUAL_HOST";

/// Service label carrying base64 `username:passwordHash` for Basic Auth
pub const VIRTUAL_AUTH_LABEL: &str = "VIRTUAL_AUTH";

/// Basic Auth policy attached to a virtual host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPolicy {
    pub username: String,
    pub hash: String,
}

/// Backend routing options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingOptions {
    pub target: String,
}

/// A routed hostname: owning service, backend target and optional auth
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualHost {
    #[serde(rename = "serviceID")]
    pub service_id: String,
    pub options: RoutingOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthPolicy>,
}

impl VirtualHost {
    /// Build a virtual host from a service's label set
    ///
    /// Returns `Ok(None)` when the service carries no routing label. The public
    /// URL's host becomes the domain; its scheme and port combine with the
    /// service name to form the backend target, so `https://app.example.com:8080`
    /// on service `app-service` routes to `https://app-service:8080`.
    pub fn from_labels(
        service_id: &str,
        service_name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<Option<(String, VirtualHost)>> {
        let public_url = match labels.get(VIRTUAL_HOST_LABEL) {
            Some(value) => value,
            None => return Ok(None),
        };

        let url: Url = public_url
            .parse()
            .with_context(|| format!("invalid {} label: {}", VIRTUAL_HOST_LABEL, public_url))?;

        let domain = url
            .host_str()
            .ok_or_else(|| anyhow!("{} label has no host: {}", VIRTUAL_HOST_LABEL, public_url))?
            .to_string();

        let port = url
            .port_or_known_default()
            .ok_or_else(|| anyhow!("{} label has no usable port: {}", VIRTUAL_HOST_LABEL, public_url))?;

        let target = format!("{}://{}:{}", url.scheme(), service_name, port);

        let auth = match labels.get(VIRTUAL_AUTH_LABEL) {
            Some(encoded) => Some(Self::parse_auth_label(encoded)?),
            None => None,
        };

        Ok(Some((
            domain,
            VirtualHost {
                service_id: service_id.to_string(),
                options: RoutingOptions { target },
                auth,
            },
        )))
    }

    /// Decode a base64 `username:passwordHash` auth label
    fn parse_auth_label(encoded: &str) -> Result<AuthPolicy> {
        let decoded = general_purpose::STANDARD
            .decode(encoded.trim())
            .context("auth label is not valid base64")?;
        let decoded = String::from_utf8(decoded).context("auth label is not valid UTF-8")?;

        let (username, hash) = decoded
            .split_once(':')
            .ok_or_else(|| anyhow!("auth label is not username:passwordHash"))?;

        if username.is_empty() || hash.is_empty() {
            return Err(anyhow!("auth label has an empty username or hash"));
        }

        Ok(AuthPolicy {
            username: username.to_string(),
            hash: hash.to_string(),
        })
    }
}

/// In-memory projection of the store's virtual-host namespace
pub struct VhostRegistry {
    cache: DashMap<String, VirtualHost>,
    store: Arc<dyn StoreRead>,
    vhost_root: String,
}

impl VhostRegistry {
    /// Create an empty registry over the given store namespace
    pub fn new(store: Arc<dyn StoreRead>, vhost_root: &str) -> Self {
        Self {
            cache: DashMap::new(),
            store,
            vhost_root: vhost_root.to_string(),
        }
    }

    /// Load every stored virtual host into the cache
    pub async fn prime(&self) -> Result<usize, StoreError> {
        let pairs = self.store.read_prefix(&self.vhost_root).await?;
        let mut loaded = 0;

        for (key, value) in pairs {
            if self.apply_put(&key, &value) {
                loaded += 1;
            }
        }

        info!("Loaded {} virtual hosts", loaded);
        Ok(loaded)
    }

    /// Look up a domain: cache first, then a direct store read on miss
    pub async fn lookup(&self, domain: &str) -> Result<Option<VirtualHost>, StoreError> {
        if let Some(cached) = self.cache.get(domain) {
            return Ok(Some(cached.clone()));
        }

        let key = store::join_key(&self.vhost_root, domain);
        match self.store.read(&key).await? {
            Some(value) => match serde_json::from_str::<VirtualHost>(&value) {
                Ok(vhost) => {
                    self.cache.insert(domain.to_string(), vhost.clone());
                    Ok(Some(vhost))
                }
                Err(e) => {
                    warn!("Malformed virtual host record for {}: {}", domain, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Cached view only, no store fallback
    pub fn get_cached(&self, domain: &str) -> Option<VirtualHost> {
        self.cache.get(domain).map(|v| v.clone())
    }

    /// Whether the domain currently has a cached registration
    pub fn contains(&self, domain: &str) -> bool {
        self.cache.contains_key(domain)
    }

    /// Snapshot of every cached registration
    pub fn entries(&self) -> Vec<(String, VirtualHost)> {
        self.cache
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Apply a store put event; returns whether the record was accepted
    fn apply_put(&self, key: &str, value: &str) -> bool {
        let domain = store::last_segment(key);

        match serde_json::from_str::<VirtualHost>(value) {
            Ok(vhost) => {
                debug!("Virtual host set: {} -> {}", domain, vhost.options.target);
                self.cache.insert(domain.to_string(), vhost);
                true
            }
            Err(e) => {
                warn!("Ignoring malformed virtual host record for {}: {}", domain, e);
                false
            }
        }
    }

    /// Apply a store delete or expiry event
    fn apply_delete(&self, key: &str) {
        let domain = store::last_segment(key);
        if self.cache.remove(domain).is_some() {
            info!("Virtual host removed: {}", domain);
        }
    }

    /// Follow the store's virtual-host namespace until shutdown
    ///
    /// A broken watch is reopened after a short pause rather than left dead.
    pub async fn run_watcher(
        self: Arc<Self>,
        store: crate::store::Store,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let (_watcher, mut stream) = match store.watch_prefix(&self.vhost_root).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Virtual host watch failed to open: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            debug!("Watching virtual hosts under {}", self.vhost_root);

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
                                    if let Ok(value) = kv.value_str() {
                                        self.apply_put(key, value);
                                    }
                                }
                                EventType::Delete => self.apply_delete(key),
                            }
                        }
                    }
                    Ok(None) => {
                        warn!("Virtual host watch closed by the store");
                        break;
                    }
                    Err(e) => {
                        warn!("Virtual host watch error: {}", e);
                        break;
                    }
                }
            }

            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

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

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_from_labels_with_port() {
        let labels = labels(&[("VIRTUAL_HOST", "https://app.example.com:8080")]);
        let (domain, vhost) = VirtualHost::from_labels("svc1", "app-service", &labels)
            .unwrap()
            .unwrap();

        assert_eq!(domain, "app.example.com");
        assert_eq!(vhost.service_id, "svc1");
        assert_eq!(vhost.options.target, "https://app-service:8080");
        assert!(vhost.auth.is_none());
    }

    #[test]
    fn test_from_labels_default_port() {
        let labels = labels(&[("VIRTUAL_HOST", "https://app.example.com")]);
        let (_, vhost) = VirtualHost::from_labels("svc1", "app-service", &labels)
            .unwrap()
            .unwrap();

        assert_eq!(vhost.options.target, "https://app-service:443");
    }

    #[test]
    fn test_from_labels_no_routing_label() {
        let labels = labels(&[("other", "value")]);
        assert!(VirtualHost::from_labels("svc1", "app", &labels).unwrap().is_none());
    }

    #[test]
    fn test_from_labels_malformed_url() {
        let labels = labels(&[("VIRTUAL_HOST", "not a url")]);
        assert!(VirtualHost::from_labels("svc1", "app", &labels).is_err());
    }

    #[test]
    fn test_from_labels_with_auth() {
        // base64 of "admin:$2b$10$hash"
        let encoded = general_purpose::STANDARD.encode("admin:$2b$10$hash");
        let labels = labels(&[
            ("VIRTUAL_HOST", "https://secure.example.com"),
            ("VIRTUAL_AUTH", encoded.as_str()),
        ]);

        let (_, vhost) = VirtualHost::from_labels("svc1", "secure", &labels)
            .unwrap()
            .unwrap();
        let auth = vhost.auth.unwrap();

        assert_eq!(auth.username, "admin");
        assert_eq!(auth.hash, "$2b$10$hash");
    }

    #[test]
    fn test_from_labels_bad_auth_label() {
        let labels = labels(&[
            ("VIRTUAL_HOST", "https://secure.example.com"),
            ("VIRTUAL_AUTH", "!!not-base64!!"),
        ]);

        assert!(VirtualHost::from_labels("svc1", "secure", &labels).is_err());
    }

    #[test]
    fn test_record_round_trip() {
        let vhost = VirtualHost {
            service_id: "svc1".to_string(),
            options: RoutingOptions {
                target: "https://app-service:8080".to_string(),
            },
            auth: Some(AuthPolicy {
                username: "admin".to_string(),
                hash: "$2b$10$hash".to_string(),
            }),
        };

        let json = serde_json::to_string(&vhost).unwrap();
        let parsed: VirtualHost = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, vhost);
        assert!(json.contains("serviceID"));
    }

    #[tokio::test]
    async fn test_lookup_falls_back_to_store() {
        let mem = MemStore(DashMap::new());
        mem.0.insert(
            "/virtual-hosts/app.example.com".to_string(),
            r#"{"serviceID":"svc1","options":{"target":"http://app:80"}}"#.to_string(),
        );

        let registry = VhostRegistry::new(Arc::new(mem), "/virtual-hosts");
        assert!(registry.get_cached("app.example.com").is_none());

        let vhost = registry.lookup("app.example.com").await.unwrap().unwrap();
        assert_eq!(vhost.options.target, "http://app:80");

        // Populated the cache on the way through
        assert!(registry.get_cached("app.example.com").is_some());
    }

    #[tokio::test]
    async fn test_prime_and_events() {
        let mem = MemStore(DashMap::new());
        mem.0.insert(
            "/virtual-hosts/a.example.com".to_string(),
            r#"{"serviceID":"svc1","options":{"target":"http://a:80"}}"#.to_string(),
        );
        mem.0.insert(
            "/virtual-hosts/broken.example.com".to_string(),
            "not json".to_string(),
        );

        let registry = VhostRegistry::new(Arc::new(mem), "/virtual-hosts");
        let loaded = registry.prime().await.unwrap();

        assert_eq!(loaded, 1);
        assert!(registry.contains("a.example.com"));
        assert!(!registry.contains("broken.example.com"));

        registry.apply_delete("/virtual-hosts/a.example.com");
        assert!(!registry.contains("a.example.com"));
    }
}

//! Shared state store backed by etcd
//! Typed wrapper providing bounded KV operations, per-key TTL leases and prefix watches

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, GetOptions, PutOptions, WatchOptions, WatchStream, Watcher,
};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("store request timed out after {0:?}")]
    Timeout(Duration),
    #[error("store value at {0} is not valid UTF-8")]
    Encoding(String),
}

/// Read access to the store, as used by the request paths and cache priming
#[async_trait]
pub trait StoreRead: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn read_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;
}

/// Full access to the store, as used by the certificate lifecycle and the
/// service reconciler
#[async_trait]
pub trait StoreWrite: StoreRead {
    async fn write(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn write_with_ttl(&self, key: &str, value: &str, ttl_secs: i64) -> Result<(), StoreError>;
    /// Remove a key; returns whether anything was removed
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;
}

/// Store client shared by every component
#[derive(Clone)]
pub struct Store {
    client: Client,
    request_timeout: Duration,
}

impl Store {
    /// Connect to the etcd cluster
    pub async fn connect(endpoints: &[String], request_timeout: Duration) -> Result<Self, StoreError> {
        let options = ConnectOptions::new().with_connect_timeout(request_timeout);
        let client = Client::connect(endpoints, Some(options)).await?;

        Ok(Self {
            client,
            request_timeout,
        })
    }

    /// Raw client handle for long-lived calls (election, lease keep-alive)
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Get a single value
    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut client = self.client.clone();
        let owned = key.to_string();
        let resp = self.bounded(async move { client.get(owned, None).await }).await?;

        match resp.kvs().first() {
            Some(kv) => {
                let value = kv
                    .value_str()
                    .map_err(|_| StoreError::Encoding(key.to_string()))?;
                Ok(Some(value.to_string()))
            }
            None => Ok(None),
        }
    }

    /// List all key/value pairs under a prefix
    pub async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let mut client = self.client.clone();
        let owned = prefix.to_string();
        let resp = self
            .bounded(async move { client.get(owned, Some(GetOptions::new().with_prefix())).await })
            .await?;

        let mut pairs = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let key = kv
                .key_str()
                .map_err(|_| StoreError::Encoding(prefix.to_string()))?;
            let value = kv
                .value_str()
                .map_err(|_| StoreError::Encoding(key.to_string()))?;
            pairs.push((key.to_string(), value.to_string()));
        }

        Ok(pairs)
    }

    /// Put a value with no expiry
    pub async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        let key = key.to_string();
        let value = value.to_string();
        self.bounded(async move { client.put(key, value, None).await }).await?;
        Ok(())
    }

    /// Put a value that expires after `ttl_secs`
    pub async fn put_with_ttl(&self, key: &str, value: &str, ttl_secs: i64) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        let lease = self
            .bounded({
                let mut client = client.clone();
                async move { client.lease_grant(ttl_secs, None).await }
            })
            .await?;

        let key = key.to_string();
        let value = value.to_string();
        let options = PutOptions::new().with_lease(lease.id());
        self.bounded(async move { client.put(key, value, Some(options)).await })
            .await?;
        Ok(())
    }

    /// Delete a key; returns whether anything was removed
    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut client = self.client.clone();
        let key = key.to_string();
        let resp = self.bounded(async move { client.delete(key, None).await }).await?;
        Ok(resp.deleted() > 0)
    }

    /// Open a watch over every key under a prefix
    pub async fn watch_prefix(&self, prefix: &str) -> Result<(Watcher, WatchStream), StoreError> {
        let mut client = self.client.clone();
        let owned = prefix.to_string();
        let (watcher, stream) = self
            .bounded(async move { client.watch(owned, Some(WatchOptions::new().with_prefix())).await })
            .await?;
        Ok((watcher, stream))
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, etcd_client::Error>>,
    {
        match timeout(self.request_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout(self.request_timeout)),
        }
    }
}

#[async_trait]
impl StoreRead for Store {
    async fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.get(key).await
    }

    async fn read_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        self.get_prefix(prefix).await
    }
}

#[async_trait]
impl StoreWrite for Store {
    async fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.put(key, value).await
    }

    async fn write_with_ttl(&self, key: &str, value: &str, ttl_secs: i64) -> Result<(), StoreError> {
        self.put_with_ttl(key, value, ttl_secs).await
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        self.delete(key).await
    }
}

/// Join a root path and a leaf name with exactly one separator
pub fn join_key(root: &str, name: &str) -> String {
    format!("{}/{}", root.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// Last path segment of a store key
pub fn last_segment(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("/certs", "example.com"), "/certs/example.com");
        assert_eq!(join_key("/certs/", "example.com"), "/certs/example.com");
        assert_eq!(join_key("/certs", "/example.com"), "/certs/example.com");
    }

    #[test]
    fn test_last_segment() {
        assert_eq!(last_segment("/challenges/abc123"), "abc123");
        assert_eq!(last_segment("/virtual-hosts/app.example.com"), "app.example.com");
        assert_eq!(last_segment("bare"), "bare");
    }
}

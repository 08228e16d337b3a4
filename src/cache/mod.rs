//! Get-or-fetch lookup cache
//!
//! Wraps expensive lookups (usernames to user records) behind a TTL store.
//! Cache trouble never fails the caller once a live fetch has succeeded.

mod memory;

pub use memory::MemoryStore;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use log::{debug, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ExporterError, Result};

/// Prefix shared by every key this process writes
pub const KEY_PREFIX: &str = "twitch_exporter";

/// Default entry lifetime
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

/// Byte-oriented backend behind [`LookupCache`]
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// `Ok(None)` means not found; `Err` is a backend failure
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
}

/// Build a namespaced key from a category, a sub-category and the inputs
///
/// Inputs are joined in the given order, so callers wanting order
/// independence must sort them first.
pub fn build_key<S: AsRef<str>>(category: &str, subcategory: &str, inputs: &[S]) -> String {
    let joined = inputs
        .iter()
        .map(|s| s.as_ref())
        .collect::<Vec<_>>()
        .join("-");
    [KEY_PREFIX, category, subcategory, &STANDARD.encode(joined)].join(":")
}

/// TTL cache with get-or-fetch semantics
#[derive(Clone)]
pub struct LookupCache {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl std::fmt::Debug for LookupCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl LookupCache {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// An in-memory cache with the given TTL
    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryStore::new("lookup")), ttl)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the cached list for `key`, or run `fetch` and cache a non-empty result
    ///
    /// Backend read errors fail the call. Empty results are returned but never
    /// stored. Encode or store failures after a successful fetch only warn.
    pub async fn get_or_fetch<T, F, Fut>(&self, key: &str, fetch: F) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        if let Some(bytes) = self.store.get(key).await.map_err(|e| {
            ExporterError::Cache(format!("could not read '{}' from cache: {}", key, e))
        })? {
            debug!("Cache hit for {}", key);
            return serde_json::from_slice(&bytes).map_err(|e| {
                ExporterError::Cache(format!("corrupt cache entry '{}': {}", key, e))
            });
        }

        debug!("Cache miss for {}", key);
        let values = fetch().await?;

        if values.is_empty() {
            debug!("Not caching empty result for {}", key);
            return Ok(values);
        }

        match serde_json::to_vec(&values) {
            Ok(bytes) => {
                if let Err(e) = self.store.set(key, bytes, self.ttl).await {
                    warn!("Could not cache result for {}: {}", key, e);
                }
            }
            Err(e) => warn!("Could not encode result for {}: {}", key, e),
        }

        Ok(values)
    }
}

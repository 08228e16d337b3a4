use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;

use super::CacheStore;
use crate::error::{ExporterError, Result};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-process TTL store
///
/// Expired entries are invisible to `get` and are swept on every `set`.
#[derive(Debug)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, Entry>>,
    name: String,
}

impl MemoryStore {
    /// Create a new memory store
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            name: name.into(),
        }
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut data = self
            .data
            .write()
            .map_err(|_| ExporterError::Cache("Lock poisoned".to_string()))?;
        let before = data.len();
        data.retain(|_, entry| entry.expires_at > now);
        Ok(before - data.len())
    }

    /// Number of entries, including ones that expired but were not swept yet
    pub fn len(&self) -> Result<usize> {
        let data = self
            .data
            .read()
            .map_err(|_| ExporterError::Cache("Lock poisoned".to_string()))?;
        Ok(data.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Get store name
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait::async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let data = self
            .data
            .read()
            .map_err(|_| ExporterError::Cache("Lock poisoned".to_string()))?;
        Ok(data
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let swept = self.purge_expired()?;
        if swept > 0 {
            log::trace!("Swept {} expired entries from cache '{}'", swept, self.name);
        }

        let mut data = self
            .data
            .write()
            .map_err(|_| ExporterError::Cache("Lock poisoned".to_string()))?;
        data.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }
}

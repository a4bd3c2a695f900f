use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{CacheEntry, CacheError, CacheStore};

/// In-process response cache
#[derive(Debug)]
pub struct MemoryCacheStore {
    pub(crate) entries: RwLock<HashMap<String, Vec<CacheEntry>>>,
    pub(crate) ttl: Duration,
}

impl MemoryCacheStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Number of entries currently held for `key`, fresh or not
    #[cfg(test)]
    pub async fn entry_count(&self, key: &str) -> usize {
        self.entries.read().await.get(key).map_or(0, Vec::len)
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .and_then(|records| records.last())
            .filter(|entry| entry.is_fresh(self.ttl))
            .cloned())
    }

    async fn store(&self, key: &str, response_body: &[u8]) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        entries
            .entry(key.to_string())
            .or_default()
            .push(CacheEntry::new(key, response_body));
        Ok(())
    }

    async fn prune(&self) -> Result<u64, CacheError> {
        let mut entries = self.entries.write().await;
        let mut removed = 0u64;
        entries.retain(|_, records| {
            let before = records.len();
            records.retain(|entry| entry.is_fresh(self.ttl));
            removed += (before - records.len()) as u64;
            !records.is_empty()
        });
        Ok(removed)
    }
}

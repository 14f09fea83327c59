//! Process-local cache backend

use super::{CacheEntry, CacheStore};
use async_trait::async_trait;
use phyto_common::Result;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// In-memory cache
///
/// Expired entries are dropped when read and swept out on every write, so
/// keys that are never read again do not accumulate.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (CacheEntry, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut entries = self.entries.lock().await;

        match entries.get(key) {
            Some((entry, expires_at)) if *expires_at > Instant::now() => {
                debug!(key = %key, "Cache HIT");
                Ok(Some(entry.clone()))
            }
            Some(_) => {
                debug!(key = %key, "Cache entry expired");
                entries.remove(key);
                Ok(None)
            }
            None => {
                debug!(key = %key, "Cache MISS");
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        debug!(key = %key, ttl = ?ttl, "Cache SET");
        let entry = CacheEntry::new(key, value, ttl);
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        let before = entries.len();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        let swept = before - entries.len();
        if swept > 0 {
            debug!(swept = swept, "Swept expired cache entries");
        }

        entries.insert(key.to_string(), (entry, now + ttl));
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        let removed = (before - entries.len()) as u64;
        debug!(prefix = %prefix, removed = removed, "Cache DELETE prefix");
        Ok(removed)
    }
}

//! Result cache
//!
//! Key/value store with TTL holding serialized `MergedResult`s. Entries are
//! immutable: an update is always a full overwrite with a fresh result.
//!
//! # Backends
//! - `MemoryCache`: process-local, for single-instance deployments and tests
//! - `RedisCache`: shared across instances (feature `redis`)

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use memory::MemoryCache;
#[cfg(feature = "redis")]
pub use redis_store::RedisCache;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use phyto_common::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One cached value with its write metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    /// Serialized `MergedResult`
    pub value: String,
    /// Time to live in seconds
    pub ttl_secs: u64,
    pub written_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: String, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            value,
            ttl_secs: ttl.as_secs(),
            written_at: Utc::now(),
        }
    }
}

/// Key/value store with TTL semantics
///
/// Must be safe for any number of concurrent callers; `set` is an atomic
/// full overwrite.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch a live entry
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Store `value` under `key` for `ttl`
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Delete every key starting with `prefix`, returning the count removed
    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64>;
}

//! Redis cache backend
//!
//! Entries are stored as JSON `CacheEntry` envelopes with `SET EX`, so the
//! write timestamp survives the round trip. Prefix deletion walks the
//! keyspace with `SCAN` instead of `KEYS` to avoid blocking the server.

use super::{CacheEntry, CacheStore};
use async_trait::async_trait;
use phyto_common::{Error, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

const SCAN_BATCH: usize = 200;

/// Redis-backed result cache
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCache")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisCache {
    /// Connect to Redis at `redis_url`
    pub async fn connect(redis_url: &str) -> Result<Self> {
        info!("Connecting to Redis cache at {}", redis_url);
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::Backend(format!("Failed to create Redis client: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::Backend(format!("Failed to connect to Redis: {e}")))?;
        Ok(Self::from_connection(conn))
    }

    /// Wrap an existing connection manager
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Shared handle to the underlying connection
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

/// `SCAN MATCH` pattern for a literal key prefix
pub(crate) fn prefix_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| Error::Backend(format!("Redis GET failed: {e}")))?;

        match data {
            Some(json) => {
                debug!(key = %key, "Cache HIT");
                Ok(Some(serde_json::from_str(&json)?))
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
        let json = serde_json::to_string(&entry)?;

        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, json, ttl.as_secs().max(1))
            .await
            .map_err(|e| Error::Backend(format!("Redis SETEX failed: {e}")))
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64> {
        let pattern = prefix_pattern(prefix);
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| Error::Backend(format!("Redis SCAN failed: {e}")))?;

            if !keys.is_empty() {
                let count: u64 = conn
                    .del(&keys)
                    .await
                    .map_err(|e| Error::Backend(format!("Redis DEL failed: {e}")))?;
                removed += count;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(prefix = %prefix, removed = removed, "Cache DELETE prefix");
        Ok(removed)
    }
}

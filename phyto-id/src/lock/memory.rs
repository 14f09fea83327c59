//! Process-local lock backend

use super::{new_token, retry_until, LockHandle, LockManager};
use crate::error::LockError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// In-memory lock manager
///
/// Expired locks are reclaimed on the next acquire attempt.
#[derive(Debug)]
pub struct MemoryLockManager {
    locks: Mutex<HashMap<String, (String, Instant)>>,
    retry_interval: Duration,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::with_retry_interval(DEFAULT_RETRY_INTERVAL)
    }

    pub fn with_retry_interval(retry_interval: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            retry_interval: retry_interval.max(Duration::from_millis(1)),
        }
    }

    /// Whether `key` is currently held by anyone
    pub async fn is_held(&self, key: &str) -> bool {
        self.locks
            .lock()
            .await
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at > Instant::now())
    }

    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> bool {
        let mut locks = self.locks.lock().await;
        let now = Instant::now();

        match locks.get(key) {
            Some((_, expires_at)) if *expires_at > now => false,
            _ => {
                locks.insert(key.to_string(), (token.to_string(), now + ttl));
                true
            }
        }
    }
}

impl Default for MemoryLockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        blocking_timeout: Duration,
    ) -> Result<LockHandle, LockError> {
        let token = new_token();
        let token_ref = token.as_str();

        retry_until(key, blocking_timeout, self.retry_interval, || async move {
            Ok(self.try_acquire(key, token_ref, ttl).await)
        })
        .await?;

        debug!(key = %key, ttl = ?ttl, "Lock acquired");
        Ok(LockHandle::new(key, token, ttl, true))
    }

    async fn release(&self, handle: &LockHandle) -> Result<bool, LockError> {
        let mut locks = self.locks.lock().await;
        let owned = locks
            .get(&handle.key)
            .is_some_and(|(token, expires_at)| *token == handle.token && *expires_at > Instant::now());

        if owned {
            locks.remove(&handle.key);
            debug!(key = %handle.key, "Lock released");
        } else {
            debug!(key = %handle.key, "Lock already lost at release");
        }
        Ok(owned)
    }

    async fn renew(&self, handle: &LockHandle, ttl: Duration) -> Result<bool, LockError> {
        let mut locks = self.locks.lock().await;
        let now = Instant::now();

        match locks.get_mut(&handle.key) {
            Some((token, expires_at)) if *token == handle.token && *expires_at > now => {
                *expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

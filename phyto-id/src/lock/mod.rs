//! Distributed lock coordination
//!
//! Requests for the same fingerprint are serialized only through a
//! [`LockManager`], never through an in-process mutex, so the guarantee holds
//! across independent processes sharing one backend.
//!
//! # Backends
//! - `MemoryLockManager`: process-local, for single-instance deployments and tests
//! - `RedisLockManager`: `SET NX PX` with owner-checked release/renew scripts
//!
//! Long computations keep their lock alive with a [`LockRenewal`] guard.

mod memory;
#[cfg(feature = "redis")]
mod redis_store;
mod renewal;

pub use memory::MemoryLockManager;
#[cfg(feature = "redis")]
pub use redis_store::RedisLockManager;
pub use renewal::LockRenewal;

use crate::error::LockError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Held lock
///
/// Created on acquire, destroyed on release or natural expiry. Only the
/// holder of the owner token can release or renew.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub key: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub renewable: bool,
}

impl LockHandle {
    pub(crate) fn new(key: &str, token: String, ttl: Duration, renewable: bool) -> Self {
        Self {
            key: key.to_string(),
            token,
            expires_at: expiry_from_now(ttl),
            renewable,
        }
    }
}

/// Distributed mutual exclusion with TTL and renewal
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Acquire `key` for `ttl`, waiting up to `blocking_timeout`
    ///
    /// # Errors
    /// `LockError::Timeout` when the wait elapses, `LockError::Backend` on
    /// store failure.
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        blocking_timeout: Duration,
    ) -> Result<LockHandle, LockError>;

    /// Release a held lock; `false` if it was already lost or expired
    async fn release(&self, handle: &LockHandle) -> Result<bool, LockError>;

    /// Extend a held lock to `ttl` from now; `false` if it was lost
    async fn renew(&self, handle: &LockHandle, ttl: Duration) -> Result<bool, LockError>;
}

/// Fresh owner token
pub(crate) fn new_token() -> String {
    Uuid::new_v4().to_string()
}

pub(crate) fn expiry_from_now(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero())
}

/// Retry `attempt` every `retry_interval` until it succeeds or
/// `blocking_timeout` elapses
///
/// At least one attempt is always made, even with a zero timeout.
pub(crate) async fn retry_until<F, Fut>(
    key: &str,
    blocking_timeout: Duration,
    retry_interval: Duration,
    mut attempt: F,
) -> Result<(), LockError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, LockError>>,
{
    let started = Instant::now();
    let deadline = started + blocking_timeout;

    loop {
        if attempt().await? {
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(LockError::Timeout {
                key: key.to_string(),
                waited: now - started,
            });
        }

        let pause = retry_interval.min(deadline - now);
        tokio::time::sleep(pause).await;
    }
}

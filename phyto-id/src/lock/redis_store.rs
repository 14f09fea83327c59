//! Redis lock backend
//!
//! Acquire is `SET key token NX PX ttl`. Release and renew run Lua scripts
//! that compare the owner token first, so a holder whose lock expired and
//! was taken over can never release or extend the new owner's lock.

use super::{new_token, retry_until, LockHandle, LockManager};
use crate::error::LockError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Owner-checked lock scripts
pub(crate) mod scripts {
    use redis::Script;

    /// KEYS[1] = lock key, ARGV[1] = owner token
    pub const RELEASE: &str = r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
    "#;

    /// KEYS[1] = lock key, ARGV[1] = owner token, ARGV[2] = ttl in ms
    pub const RENEW: &str = r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('PEXPIRE', KEYS[1], ARGV[2])
        end
        return 0
    "#;

    pub fn release() -> Script {
        Script::new(RELEASE)
    }

    pub fn renew() -> Script {
        Script::new(RENEW)
    }
}

/// Redis-backed distributed lock manager
#[derive(Clone)]
pub struct RedisLockManager {
    conn: ConnectionManager,
    release_script: Script,
    renew_script: Script,
    retry_interval: Duration,
}

impl fmt::Debug for RedisLockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisLockManager")
            .field("connection", &"ConnectionManager")
            .field("retry_interval", &self.retry_interval)
            .finish()
    }
}

impl RedisLockManager {
    /// Connect to Redis at `redis_url`
    pub async fn connect(redis_url: &str) -> Result<Self, LockError> {
        info!("Connecting to Redis lock store at {}", redis_url);
        let client = redis::Client::open(redis_url)
            .map_err(|e| LockError::Backend(format!("Failed to create Redis client: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| LockError::Backend(format!("Failed to connect to Redis: {e}")))?;
        Ok(Self::from_connection(conn))
    }

    /// Wrap an existing connection manager
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            release_script: scripts::release(),
            renew_script: scripts::renew(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval.max(Duration::from_millis(1));
        self
    }

    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(format!("Redis SET NX failed: {e}")))?;
        Ok(reply.is_some())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        blocking_timeout: Duration,
    ) -> Result<LockHandle, LockError> {
        let token = new_token();
        let token_ref = token.as_str();

        retry_until(key, blocking_timeout, self.retry_interval, || async move {
            self.try_acquire(key, token_ref, ttl).await
        })
        .await?;

        debug!(key = %key, ttl = ?ttl, "Lock acquired");
        Ok(LockHandle::new(key, token, ttl, true))
    }

    async fn release(&self, handle: &LockHandle) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release_script
            .key(&handle.key)
            .arg(&handle.token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(format!("Redis lock release failed: {e}")))?;

        debug!(key = %handle.key, released = deleted == 1, "Lock release");
        Ok(deleted == 1)
    }

    async fn renew(&self, handle: &LockHandle, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .renew_script
            .key(&handle.key)
            .arg(&handle.token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(format!("Redis lock renew failed: {e}")))?;

        Ok(extended == 1)
    }
}

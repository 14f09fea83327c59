//! Breaker state backing stores
//!
//! Process-local state is simpler with slightly looser consistency across
//! instances; a shared store gives every instance the same view at the cost
//! of one round trip per transition. Choosing one is a deployment decision.

use super::BreakerState;
use async_trait::async_trait;
use phyto_common::Result;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Storage for per-provider breaker state
#[async_trait]
pub trait BreakerStateStore: Send + Sync {
    /// Load the stored state of `provider`, if any
    async fn load(&self, provider: &str) -> Result<Option<BreakerState>>;

    /// Overwrite the stored state of `state.provider`
    async fn save(&self, state: &BreakerState) -> Result<()>;
}

/// Process-local breaker state
#[derive(Debug, Default)]
pub struct MemoryBreakerStore {
    states: Mutex<HashMap<String, BreakerState>>,
}

impl MemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BreakerStateStore for MemoryBreakerStore {
    async fn load(&self, provider: &str) -> Result<Option<BreakerState>> {
        Ok(self.states.lock().await.get(provider).cloned())
    }

    async fn save(&self, state: &BreakerState) -> Result<()> {
        self.states
            .lock()
            .await
            .insert(state.provider.clone(), state.clone());
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub use redis_backed::RedisBreakerStore;

#[cfg(feature = "redis")]
mod redis_backed {
    use super::{BreakerState, BreakerStateStore};
    use async_trait::async_trait;
    use phyto_common::{Error, Result};
    use redis::aio::ConnectionManager;
    use redis::AsyncCommands;
    use std::fmt;

    /// Breaker state shared through Redis as JSON
    #[derive(Clone)]
    pub struct RedisBreakerStore {
        conn: ConnectionManager,
        key_prefix: String,
    }

    impl fmt::Debug for RedisBreakerStore {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("RedisBreakerStore")
                .field("key_prefix", &self.key_prefix)
                .finish()
        }
    }

    impl RedisBreakerStore {
        pub fn new(conn: ConnectionManager, key_prefix: impl Into<String>) -> Self {
            Self {
                conn,
                key_prefix: key_prefix.into(),
            }
        }

        pub(crate) fn key(&self, provider: &str) -> String {
            format!("{}:breaker:{}", self.key_prefix, provider)
        }
    }

    #[async_trait]
    impl BreakerStateStore for RedisBreakerStore {
        async fn load(&self, provider: &str) -> Result<Option<BreakerState>> {
            let mut conn = self.conn.clone();
            let data: Option<String> = conn
                .get(self.key(provider))
                .await
                .map_err(|e| Error::Backend(format!("Redis GET breaker state failed: {e}")))?;

            data.map(|json| serde_json::from_str(&json).map_err(Error::from))
                .transpose()
        }

        async fn save(&self, state: &BreakerState) -> Result<()> {
            let json = serde_json::to_string(state)?;
            let mut conn = self.conn.clone();
            conn.set::<_, _, ()>(self.key(&state.provider), json)
                .await
                .map_err(|e| Error::Backend(format!("Redis SET breaker state failed: {e}")))
        }
    }
}

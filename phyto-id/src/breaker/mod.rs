//! Per-provider circuit breaker
//!
//! Failure-isolating state machine wrapped around one provider's remote call:
//! - **CLOSED → OPEN** after `failure_threshold` consecutive failures
//! - **OPEN**: every call fails immediately with `BreakerError::Open`, no
//!   network attempt is made
//! - **OPEN → HALF_OPEN** once `cooldown` has elapsed
//! - **HALF_OPEN**: exactly one trial call; success → CLOSED (count reset),
//!   failure → OPEN with a fresh cool-down
//! - Results of calls admitted while CLOSED that settle after the breaker
//!   left CLOSED are ignored
//!
//! Each provider owns an independent breaker. State is an explicit,
//! serializable [`BreakerState`] read and written only through the
//! transition rules, with the backing storage injected as a
//! [`BreakerStateStore`].

mod state;
mod store;

pub use state::{Admission, BreakerState, CircuitState, Transition};
#[cfg(feature = "redis")]
pub use store::RedisBreakerStore;
pub use store::{BreakerStateStore, MemoryBreakerStore};

use chrono::Utc;
use phyto_common::events::{EventBus, IdentifyEvent};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default consecutive failures before opening
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default cool-down before a half-open trial
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Breaker tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

/// Error returned through a breaker
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// Circuit open; the operation was not attempted
    #[error("circuit open for {provider}, retry after {retry_after:?}")]
    Open {
        provider: String,
        retry_after: Duration,
    },

    /// The wrapped operation failed
    #[error("{0}")]
    Operation(E),
}

/// Circuit breaker for one provider
pub struct CircuitBreaker {
    provider: String,
    config: BreakerConfig,
    store: Arc<dyn BreakerStateStore>,
    /// Last known state; also serializes this instance's transitions
    local: Mutex<Option<BreakerState>>,
    events: Option<EventBus>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("provider", &self.provider)
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a breaker backed by process-local state
    pub fn new(provider: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_store(provider, config, Arc::new(MemoryBreakerStore::new()))
    }

    /// Create a breaker backed by an injected state store
    pub fn with_store(
        provider: impl Into<String>,
        config: BreakerConfig,
        store: Arc<dyn BreakerStateStore>,
    ) -> Self {
        Self {
            provider: provider.into(),
            config,
            store,
            local: Mutex::new(None),
            events: None,
        }
    }

    /// Publish state transitions on `events`
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Run `operation` through the breaker
    ///
    /// # Errors
    /// `BreakerError::Open` without invoking `operation` while the circuit is
    /// open (or a half-open trial is already running), otherwise the
    /// operation's own error wrapped in `BreakerError::Operation`.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let now = Utc::now();
        let admission = self.update(|state| state.admit(now)).await;

        if let Admission::Reject { retry_after } = admission {
            debug!(
                provider = %self.provider,
                retry_after_ms = retry_after.as_millis() as u64,
                "Circuit open, call rejected"
            );
            return Err(BreakerError::Open {
                provider: self.provider.clone(),
                retry_after,
            });
        }

        if admission == Admission::Trial {
            info!(provider = %self.provider, "Circuit half-open, running trial call");
        }

        match operation().await {
            Ok(value) => {
                self.update(|state| ((), state.on_success(admission))).await;
                Ok(value)
            }
            Err(e) => {
                let now = Utc::now();
                self.update(|state| ((), state.on_failure(now, admission))).await;
                Err(BreakerError::Operation(e))
            }
        }
    }

    /// Current state of this breaker
    pub async fn snapshot(&self) -> BreakerState {
        let local = self.local.lock().await;
        self.load(&local).await
    }

    /// Cool-down left before this provider may be tried again
    pub async fn remaining_cooldown(&self) -> Duration {
        self.snapshot().await.remaining_cooldown(Utc::now())
    }

    /// Load-modify-store under this instance's transition lock
    async fn update<R>(
        &self,
        apply: impl FnOnce(&mut BreakerState) -> (R, Option<Transition>),
    ) -> R {
        let mut local = self.local.lock().await;
        let mut state = self.load(&local).await;
        let before = state.clone();

        let (result, transition) = apply(&mut state);

        if state != before {
            if let Err(e) = self.store.save(&state).await {
                warn!(provider = %self.provider, error = %e, "Failed to save breaker state");
            }
        }
        *local = Some(state);

        if let Some(transition) = transition {
            self.report(transition);
        }
        result
    }

    async fn load(&self, local: &Option<BreakerState>) -> BreakerState {
        match self.store.load(&self.provider).await {
            Ok(Some(state)) => state.with_config(&self.config),
            Ok(None) => BreakerState::new(&self.provider, &self.config),
            Err(e) => {
                warn!(
                    provider = %self.provider,
                    error = %e,
                    "Breaker state store unavailable, using last known state"
                );
                local
                    .clone()
                    .unwrap_or_else(|| BreakerState::new(&self.provider, &self.config))
            }
        }
    }

    fn report(&self, transition: Transition) {
        match transition.to {
            CircuitState::Open => warn!(
                provider = %self.provider,
                from = %transition.from,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "Circuit opened"
            ),
            CircuitState::HalfOpen => info!(provider = %self.provider, "Circuit half-open"),
            CircuitState::Closed => info!(
                provider = %self.provider,
                from = %transition.from,
                "Circuit closed"
            ),
        }

        if let Some(events) = &self.events {
            events.emit_lossy(IdentifyEvent::BreakerTransition {
                provider: self.provider.clone(),
                from: transition.from.to_string(),
                to: transition.to.to_string(),
                timestamp: Utc::now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: threshold,
                cooldown,
            },
        )
    }

    async fn fail(breaker: &CircuitBreaker, calls: &AtomicUsize) -> Result<(), BreakerError<String>> {
        breaker
            .call(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("boom".to_string())
            })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker, calls: &AtomicUsize) -> Result<u32, BreakerError<String>> {
        breaker
            .call(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(7)
            })
            .await
    }

    #[tokio::test]
    async fn test_open_circuit_skips_operation() {
        let breaker = breaker(3, Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            assert!(matches!(fail(&breaker, &calls).await, Err(BreakerError::Operation(_))));
        }
        assert_eq!(breaker.snapshot().await.state, CircuitState::Open);

        let result = succeed(&breaker, &calls).await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3, "No invocation while open");
        assert!(breaker.remaining_cooldown().await > Duration::from_secs(59));
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let breaker = breaker(1, Duration::from_millis(50));
        let calls = AtomicUsize::new(0);

        fail(&breaker, &calls).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(succeed(&breaker, &calls).await.unwrap(), 7);
        let state = breaker.snapshot().await;
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker(1, Duration::from_millis(50));
        let calls = AtomicUsize::new(0);

        fail(&breaker, &calls).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(matches!(fail(&breaker, &calls).await, Err(BreakerError::Operation(_))));
        assert_eq!(breaker.snapshot().await.state, CircuitState::Open);
        assert!(matches!(succeed(&breaker, &calls).await, Err(BreakerError::Open { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_only_one_concurrent_trial() {
        let breaker = Arc::new(breaker(1, Duration::from_millis(30)));
        let calls = Arc::new(AtomicUsize::new(0));

        fail(&breaker, &calls).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let slow_trial = {
            let breaker = breaker.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                breaker
                    .call(|| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, String>(())
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let concurrent = succeed(&breaker, &calls).await;
        assert!(matches!(concurrent, Err(BreakerError::Open { .. })));

        slow_trial.await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(breaker.snapshot().await.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_breakers_are_independent() {
        let store: Arc<dyn BreakerStateStore> = Arc::new(MemoryBreakerStore::new());
        let config = BreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(60),
        };
        let a = CircuitBreaker::with_store("a", config, store.clone());
        let b = CircuitBreaker::with_store("b", config, store.clone());
        let calls = AtomicUsize::new(0);

        fail(&a, &calls).await.unwrap_err();
        assert_eq!(a.snapshot().await.state, CircuitState::Open);
        assert_eq!(b.snapshot().await.state, CircuitState::Closed);
        assert_eq!(succeed(&b, &calls).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let breaker = breaker(1, Duration::from_secs(60)).with_events(events);
        let calls = AtomicUsize::new(0);

        fail(&breaker, &calls).await.unwrap_err();

        match rx.recv().await.unwrap() {
            IdentifyEvent::BreakerTransition { provider, from, to, .. } => {
                assert_eq!(provider, "test");
                assert_eq!(from, "CLOSED");
                assert_eq!(to, "OPEN");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_success_does_not_close_opened_breaker() {
        let breaker = Arc::new(breaker(1, Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));

        let slow = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .call(|| async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, String>(())
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        fail(&breaker, &calls).await.unwrap_err();
        assert_eq!(breaker.snapshot().await.state, CircuitState::Open);

        slow.await.unwrap().unwrap();
        let state = breaker.snapshot().await;
        assert_eq!(state.state, CircuitState::Open, "Late success must not close");
        assert!(breaker.remaining_cooldown().await > Duration::from_secs(59));
        assert!(matches!(succeed(&breaker, &calls).await, Err(BreakerError::Open { .. })));
    }
}

//! Identification telemetry events
//!
//! Breaker trips, degraded paths and provider failures are operational
//! signals, not incidents. They are published on an [`EventBus`] so health
//! reporting can observe them without coupling to the identification core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Event emitted by the identification core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IdentifyEvent {
    /// A cached merged result was served
    CacheHit {
        fingerprint: String,
        timestamp: DateTime<Utc>,
    },

    /// One provider call failed or was short-circuited
    ProviderFailed {
        fingerprint: String,
        provider: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A circuit breaker changed state
    BreakerTransition {
        provider: String,
        from: String,
        to: String,
        timestamp: DateTime<Utc>,
    },

    /// Lock acquisition timed out and the result was computed without the lock
    LockFallback {
        fingerprint: String,
        timestamp: DateTime<Utc>,
    },

    /// A merged result was computed and cached
    Completed {
        fingerprint: String,
        degraded: bool,
        candidate_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// Every provider failed or was circuit-open
    AllProvidersUnavailable {
        fingerprint: String,
        retry_after_secs: u64,
        timestamp: DateTime<Utc>,
    },
}

impl IdentifyEvent {
    /// Short event type name for logging and filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            IdentifyEvent::CacheHit { .. } => "CacheHit",
            IdentifyEvent::ProviderFailed { .. } => "ProviderFailed",
            IdentifyEvent::BreakerTransition { .. } => "BreakerTransition",
            IdentifyEvent::LockFallback { .. } => "LockFallback",
            IdentifyEvent::Completed { .. } => "Completed",
            IdentifyEvent::AllProvidersUnavailable { .. } => "AllProvidersUnavailable",
        }
    }
}

/// Broadcast bus for [`IdentifyEvent`]s
///
/// Cloning shares the underlying channel. Slow subscribers lose the oldest
/// events once `capacity` is exceeded.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<IdentifyEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<IdentifyEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: IdentifyEvent,
    ) -> Result<usize, broadcast::error::SendError<IdentifyEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: IdentifyEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

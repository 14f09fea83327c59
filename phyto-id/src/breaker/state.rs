//! Serializable breaker state and its transition rules
//!
//! Kept free of I/O so the same rules apply whether the state lives in
//! process memory or in a shared store.

use super::BreakerConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls fail fast without a network attempt
    Open,
    /// One trial call decides between Closed and Open
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(s)
    }
}

/// Persistent state of one provider's breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerState {
    pub provider: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// When the breaker last opened
    pub opened_at: Option<DateTime<Utc>>,
    /// When the current half-open trial was admitted
    pub trial_started_at: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

/// Decision for one incoming call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed: call normally
    Proceed,
    /// Half-open trial: this call decides the next state
    Trial,
    /// Open: fail fast
    Reject { retry_after: Duration },
}

/// A state change worth reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

impl BreakerState {
    /// Fresh closed state
    pub fn new(provider: impl Into<String>, config: &BreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_started_at: None,
            failure_threshold: config.failure_threshold.max(1),
            cooldown_ms: config.cooldown.as_millis() as u64,
        }
    }

    /// Apply the locally configured threshold and cool-down
    pub fn with_config(mut self, config: &BreakerConfig) -> Self {
        self.failure_threshold = config.failure_threshold.max(1);
        self.cooldown_ms = config.cooldown.as_millis() as u64;
        self
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// State as observed at `now`
    ///
    /// An open breaker whose cool-down has elapsed reports `HalfOpen`.
    pub fn effective_state(&self, now: DateTime<Utc>) -> CircuitState {
        match self.state {
            CircuitState::Open if self.remaining_cooldown(now).is_zero() => CircuitState::HalfOpen,
            other => other,
        }
    }

    /// Cool-down left before the next trial may run
    pub fn remaining_cooldown(&self, now: DateTime<Utc>) -> Duration {
        let since = match self.state {
            CircuitState::Closed => return Duration::ZERO,
            CircuitState::Open => self.opened_at,
            CircuitState::HalfOpen => self.trial_started_at,
        };
        let Some(since) = since else {
            return Duration::ZERO;
        };

        let elapsed = (now - since).to_std().unwrap_or(Duration::ZERO);
        self.cooldown().saturating_sub(elapsed)
    }

    /// Decide whether a call may proceed, updating state for trials
    pub fn admit(&mut self, now: DateTime<Utc>) -> (Admission, Option<Transition>) {
        match self.state {
            CircuitState::Closed => (Admission::Proceed, None),
            CircuitState::Open => {
                let remaining = self.remaining_cooldown(now);
                if remaining.is_zero() {
                    self.state = CircuitState::HalfOpen;
                    self.trial_started_at = Some(now);
                    (
                        Admission::Trial,
                        Some(Transition {
                            from: CircuitState::Open,
                            to: CircuitState::HalfOpen,
                        }),
                    )
                } else {
                    (Admission::Reject { retry_after: remaining }, None)
                }
            }
            CircuitState::HalfOpen => {
                // A trial that never reported back (e.g. aborted) is replaced
                // once a full cool-down has passed since it started
                let remaining = self.remaining_cooldown(now);
                if remaining.is_zero() {
                    self.trial_started_at = Some(now);
                    (Admission::Trial, None)
                } else {
                    (Admission::Reject { retry_after: remaining }, None)
                }
            }
        }
    }

    /// Record a successful call admitted as `admission`
    ///
    /// Only a success seen while CLOSED, or the admitted half-open trial,
    /// changes state. A late result of a call admitted before the breaker
    /// opened leaves OPEN and HALF_OPEN untouched.
    pub fn on_success(&mut self, admission: Admission) -> Option<Transition> {
        match (self.state, admission) {
            (CircuitState::Closed, _) => {
                self.consecutive_failures = 0;
                None
            }
            (CircuitState::HalfOpen, Admission::Trial) => {
                self.close();
                Some(Transition {
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Closed,
                })
            }
            _ => None,
        }
    }

    /// Record a failed call admitted as `admission`
    pub fn on_failure(&mut self, now: DateTime<Utc>, admission: Admission) -> Option<Transition> {
        match (self.state, admission) {
            (CircuitState::Closed, _) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures < self.failure_threshold {
                    return None;
                }
                self.open(now);
                Some(Transition {
                    from: CircuitState::Closed,
                    to: CircuitState::Open,
                })
            }
            (CircuitState::HalfOpen, Admission::Trial) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.open(now);
                Some(Transition {
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Open,
                })
            }
            // Late result of a call admitted before the breaker opened
            _ => None,
        }
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.trial_started_at = None;
    }

    fn open(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_started_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, cooldown_secs: u64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_secs(cooldown_secs),
        }
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    #[test]
    fn test_opens_at_threshold() {
        let now = Utc::now();
        let mut state = BreakerState::new("a", &config(3, 60));

        assert_eq!(state.on_failure(now, Admission::Proceed), None);
        assert_eq!(state.on_failure(now, Admission::Proceed), None);
        let transition = state.on_failure(now, Admission::Proceed).unwrap();
        assert_eq!(transition.to, CircuitState::Open);
        assert_eq!(state.opened_at, Some(now));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let now = Utc::now();
        let mut state = BreakerState::new("a", &config(2, 60));

        state.on_failure(now, Admission::Proceed);
        assert_eq!(state.on_success(Admission::Proceed), None);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.on_failure(now, Admission::Proceed), None, "Count restarted after success");
    }

    #[test]
    fn test_open_rejects_until_cooldown() {
        let now = Utc::now();
        let mut state = BreakerState::new("a", &config(1, 60));
        state.on_failure(now, Admission::Proceed);

        let (admission, _) = state.admit(now + secs(10));
        assert_eq!(
            admission,
            Admission::Reject {
                retry_after: Duration::from_secs(50)
            }
        );
        assert_eq!(state.effective_state(now + secs(10)), CircuitState::Open);
        assert_eq!(state.effective_state(now + secs(60)), CircuitState::HalfOpen);
    }

    #[test]
    fn test_single_trial_after_cooldown() {
        let now = Utc::now();
        let mut state = BreakerState::new("a", &config(1, 60));
        state.on_failure(now, Admission::Proceed);

        let later = now + secs(61);
        let (first, transition) = state.admit(later);
        assert_eq!(first, Admission::Trial);
        assert_eq!(transition.unwrap().to, CircuitState::HalfOpen);

        let (second, _) = state.admit(later);
        assert!(matches!(second, Admission::Reject { .. }), "Only one trial at a time");
    }

    #[test]
    fn test_trial_success_closes() {
        let now = Utc::now();
        let mut state = BreakerState::new("a", &config(1, 60));
        state.on_failure(now, Admission::Proceed);
        state.admit(now + secs(61));

        let transition = state.on_success(Admission::Trial).unwrap();
        assert_eq!(transition.from, CircuitState::HalfOpen);
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn test_trial_failure_reopens_with_fresh_cooldown() {
        let now = Utc::now();
        let mut state = BreakerState::new("a", &config(5, 60));
        for _ in 0..5 {
            state.on_failure(now, Admission::Proceed);
        }

        let trial_time = now + secs(61);
        state.admit(trial_time);
        let transition = state.on_failure(trial_time, Admission::Trial).unwrap();
        assert_eq!(transition.to, CircuitState::Open);
        assert_eq!(state.opened_at, Some(trial_time));
        assert_eq!(state.remaining_cooldown(trial_time), Duration::from_secs(60));
    }

    #[test]
    fn test_abandoned_trial_is_replaced() {
        let now = Utc::now();
        let mut state = BreakerState::new("a", &config(1, 60));
        state.on_failure(now, Admission::Proceed);
        state.admit(now + secs(61));

        let (admission, _) = state.admit(now + secs(122));
        assert_eq!(admission, Admission::Trial);
    }

    #[test]
    fn test_state_serializes() {
        let state = BreakerState::new("plantnet", &config(5, 60));
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"CLOSED\""));

        let back: BreakerState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_late_success_does_not_close_open_breaker() {
        let now = Utc::now();
        let mut state = BreakerState::new("a", &config(1, 60));
        state.on_failure(now, Admission::Proceed);

        assert_eq!(state.on_success(Admission::Proceed), None);
        assert_eq!(state.state, CircuitState::Open);
        assert_eq!(state.opened_at, Some(now));
    }

    #[test]
    fn test_late_results_leave_half_open_trial_alone() {
        let now = Utc::now();
        let mut state = BreakerState::new("a", &config(1, 60));
        state.on_failure(now, Admission::Proceed);
        let trial_time = now + secs(61);
        state.admit(trial_time);

        assert_eq!(state.on_success(Admission::Proceed), None);
        assert_eq!(state.on_failure(trial_time, Admission::Proceed), None);
        assert_eq!(state.state, CircuitState::HalfOpen);
        assert_eq!(state.trial_started_at, Some(trial_time));

        let transition = state.on_success(Admission::Trial).unwrap();
        assert_eq!(transition.to, CircuitState::Closed);
    }
}

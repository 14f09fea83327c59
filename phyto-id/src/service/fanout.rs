//! Parallel provider fan-out
//!
//! Starts every provider call concurrently, waits for all of them up to a
//! bounded overall deadline, and collects successes and failures separately.
//!
//! # Error isolation
//! - Each call runs in its own task behind its provider's circuit breaker
//!   and timeout, so one slow or open provider never delays another
//! - Failures are recorded per slot and never propagated raw
//! - Local request pacing is awaited outside the breaker and timeout; a slot
//!   still queued at the deadline is `Incomplete`, never a breaker failure
//! - Slots still running at the deadline are aborted and recorded as
//!   `Incomplete`

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::error::{IdentifyError, IdentifyResult, ProviderError};
use crate::types::{
    FailureReason, IdentificationProvider, IdentificationRequest, ProviderFailure, ProviderResult,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One configured provider with its breaker and timeout
pub struct ProviderSlot {
    pub provider: Arc<dyn IdentificationProvider>,
    pub breaker: Arc<CircuitBreaker>,
    pub timeout: Duration,
}

impl std::fmt::Debug for ProviderSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSlot")
            .field("provider", &self.provider.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Settled fan-out
#[derive(Debug, Default)]
pub struct FanoutOutcome {
    pub successes: Vec<ProviderResult>,
    pub failures: Vec<ProviderFailure>,
    /// Successful providers that were asked for disease candidates, sorted
    pub disease_providers: Vec<String>,
}

type SlotResult = (Result<ProviderResult, BreakerError<ProviderError>>, Duration);

/// Bounded concurrent executor over provider slots
#[derive(Debug)]
pub struct ProviderFanout {
    slots: Vec<ProviderSlot>,
    permits: Arc<Semaphore>,
    grace: Duration,
}

impl ProviderFanout {
    /// Create an executor
    ///
    /// # Arguments
    /// * `slots` - Providers in configuration order
    /// * `max_concurrency` - Upper bound on simultaneous provider calls
    /// * `grace` - Slack added to the longest provider timeout
    pub fn new(slots: Vec<ProviderSlot>, max_concurrency: usize, grace: Duration) -> Self {
        Self {
            slots,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            grace,
        }
    }

    pub fn slots(&self) -> &[ProviderSlot] {
        &self.slots
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    /// Overall wait bound: the longest per-provider timeout, not the sum
    pub fn deadline(&self) -> Duration {
        self.slots
            .iter()
            .map(|slot| slot.timeout)
            .max()
            .unwrap_or_default()
            + self.grace
    }

    /// Call every provider concurrently
    ///
    /// # Errors
    /// `IdentifyError::Cancelled` when `cancel` fires; pending calls are
    /// aborted and their results discarded.
    pub async fn identify_all(
        &self,
        request: &IdentificationRequest,
        fingerprint: &str,
        cancel: &CancellationToken,
    ) -> IdentifyResult<FanoutOutcome> {
        let mut tasks = JoinSet::new();

        for (index, slot) in self.slots.iter().enumerate() {
            let provider = Arc::clone(&slot.provider);
            let breaker = Arc::clone(&slot.breaker);
            let permits = Arc::clone(&self.permits);
            let timeout = slot.timeout;
            let image = request.image_arc();
            let mut options = request.options().clone();
            if options.include_diseases && !provider.supports_diseases() {
                debug!(
                    provider = %provider.name(),
                    "Provider has no disease support, asking for species only"
                );
                options.include_diseases = false;
            }

            tasks.spawn(async move {
                provider.ready().await;
                let _permit = permits.acquire_owned().await.ok();
                let started = Instant::now();

                let result = breaker
                    .call(|| async move {
                        match tokio::time::timeout(timeout, provider.identify(&image, &options)).await {
                            Ok(result) => result,
                            Err(_) => Err(ProviderError::Timeout(format!(
                                "no response within {}ms",
                                timeout.as_millis()
                            ))),
                        }
                    })
                    .await;

                (index, (result, started.elapsed()))
            });
        }

        let mut settled: Vec<Option<SlotResult>> = (0..self.slots.len()).map(|_| None).collect();
        let deadline = tokio::time::sleep(self.deadline());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    info!(fingerprint = %fingerprint, "Identification cancelled, pending provider calls aborted");
                    return Err(IdentifyError::Cancelled);
                }
                _ = &mut deadline => {
                    if !tasks.is_empty() {
                        warn!(
                            fingerprint = %fingerprint,
                            pending = tasks.len(),
                            "Fan-out deadline reached, aborting pending provider calls"
                        );
                        tasks.abort_all();
                    }
                    break;
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok((index, slot_result))) => settled[index] = Some(slot_result),
                    Some(Err(e)) => warn!(fingerprint = %fingerprint, error = %e, "Provider task failed"),
                    None => break,
                },
            }
        }

        let mut outcome = FanoutOutcome::default();
        for (slot, settled) in self.slots.iter().zip(settled) {
            let name = slot.provider.name().to_string();
            match settled {
                Some((Ok(mut result), latency)) => {
                    debug!(
                        fingerprint = %fingerprint,
                        provider = %name,
                        candidates = result.candidates.len(),
                        latency_ms = latency.as_millis() as u64,
                        "Provider succeeded"
                    );
                    if request.options().include_diseases && slot.provider.supports_diseases() {
                        outcome.disease_providers.push(name.clone());
                    }
                    result.provider = name;
                    result.latency = latency;
                    outcome.successes.push(result);
                }
                Some((Err(BreakerError::Open { retry_after, .. }), _)) => {
                    outcome.failures.push(ProviderFailure {
                        provider: name,
                        reason: FailureReason::CircuitOpen,
                        message: "circuit open".to_string(),
                        retry_after_ms: Some(retry_after.as_millis() as u64),
                    });
                }
                Some((Err(BreakerError::Operation(e)), latency)) => {
                    // A failure that just opened the breaker carries its cool-down
                    let cooldown = slot.breaker.remaining_cooldown().await;
                    let retry_after = if cooldown.is_zero() {
                        e.retry_after()
                    } else {
                        Some(cooldown)
                    };

                    warn!(
                        fingerprint = %fingerprint,
                        provider = %name,
                        reason = %e.reason(),
                        error = %e,
                        latency_ms = latency.as_millis() as u64,
                        "Provider failed"
                    );
                    outcome.failures.push(ProviderFailure {
                        provider: name,
                        reason: e.reason(),
                        message: e.to_string(),
                        retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
                    });
                }
                None => {
                    outcome.failures.push(ProviderFailure {
                        provider: name,
                        reason: FailureReason::Incomplete,
                        message: format!("no result within {}ms", self.deadline().as_millis()),
                        retry_after_ms: None,
                    });
                }
            }
        }

        outcome.disease_providers.sort();
        Ok(outcome)
    }
}

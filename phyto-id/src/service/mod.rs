//! Combined Identification Service
//!
//! Orchestrates one identification end to end.
//!
//! # Flow
//! 1. Validate the request (no side effects on rejection)
//! 2. Fingerprint image + options; serve a cached result if present
//! 3. Acquire the distributed lock for the fingerprint
//! 4. Re-check the cache (a previous holder may have just finished)
//! 5. Fan out to every provider concurrently through its circuit breaker
//! 6. Merge, cache and release the lock
//!
//! # Degraded paths
//! - **Lock timeout:** poll the cache for a short window, then compute without
//!   the lock. Favors availability over strict single-writer coordination and
//!   may duplicate provider calls under sustained contention.
//! - **Partial outage:** merge whatever succeeded, flag `degraded`, record why
//!   each missing provider did not contribute.
//! - **Full outage:** `IdentifyError::AllProvidersUnavailable` with a
//!   non-zero retry-after hint.
//!
//! # Cancellation
//! The pipeline runs on a detached task. Dropping the returned future does not
//! stop it: the result is still cached for future callers. Cancelling the
//! token passed to [`CombinedIdentificationService::identify_with_cancel`]
//! aborts pending provider calls and nothing is cached.

mod builder;
mod fanout;
mod validation;

pub use builder::ServiceBuilder;
pub use fanout::{FanoutOutcome, ProviderFanout, ProviderSlot};
pub use validation::{validate_request, DEFAULT_MAX_IMAGE_BYTES, MAX_RESULTS_LIMIT};

use crate::breaker::BreakerState;
use crate::cache::CacheStore;
use crate::error::{IdentifyError, IdentifyResult, LockError};
use crate::fingerprint::Fingerprint;
use crate::lock::{LockHandle, LockManager, LockRenewal};
use crate::merger::ResultMerger;
use crate::types::{IdentificationRequest, IdentifyOptions, MergedResult, ProviderFailure};
use chrono::Utc;
use futures::future::join_all;
use phyto_common::events::{EventBus, IdentifyEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Orchestrator tuning
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Namespace for cache and lock keys
    pub key_prefix: String,
    /// Lifetime of cached merged results
    pub cache_ttl: Duration,
    /// Lock expiry without renewal
    pub lock_ttl: Duration,
    /// How long to wait for the lock
    pub lock_blocking_timeout: Duration,
    /// How long to poll the cache after a lock timeout
    pub cache_poll_window: Duration,
    pub cache_poll_interval: Duration,
    /// Lock renewal period while computing
    pub renew_interval: Duration,
    /// Maximum simultaneous provider calls per request
    pub max_concurrency: usize,
    /// Retry hint for providers that failed without a cool-down
    pub min_retry_after: Duration,
    /// Slack added to the longest provider timeout
    pub deadline_grace: Duration,
    pub max_image_bytes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            key_prefix: "phyto".to_string(),
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            lock_ttl: Duration::from_secs(30),
            lock_blocking_timeout: Duration::from_secs(10),
            cache_poll_window: Duration::from_secs(2),
            cache_poll_interval: Duration::from_millis(100),
            renew_interval: Duration::from_secs(10),
            max_concurrency: 8,
            min_retry_after: Duration::from_secs(1),
            deadline_grace: Duration::from_millis(250),
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }
}

/// Multi-provider plant identification with caching and stampede protection
///
/// Cloning is cheap and shares all state.
#[derive(Clone)]
pub struct CombinedIdentificationService {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServiceConfig,
    fanout: ProviderFanout,
    cache: Arc<dyn CacheStore>,
    locks: Arc<dyn LockManager>,
    merger: ResultMerger,
    events: EventBus,
}

impl std::fmt::Debug for CombinedIdentificationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CombinedIdentificationService")
            .field("config", &self.inner.config)
            .field("providers", &self.provider_names())
            .finish()
    }
}

impl CombinedIdentificationService {
    pub fn builder() -> ServiceBuilder {
        ServiceBuilder::new()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Telemetry bus; subscribe for breaker and degraded-path events
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Configured provider names in fan-out order
    pub fn provider_names(&self) -> Vec<String> {
        self.inner
            .fanout
            .slots()
            .iter()
            .map(|slot| slot.provider.name().to_string())
            .collect()
    }

    /// Identify the plant in `image`
    ///
    /// # Returns
    /// - `Ok(result)` with `degraded == false` when every provider contributed
    /// - `Ok(result)` with `degraded == true` and failure reasons otherwise
    ///
    /// # Errors
    /// - `IdentifyError::Validation` for bad input
    /// - `IdentifyError::AllProvidersUnavailable` when no provider succeeded
    pub async fn identify(
        &self,
        image: impl Into<Arc<[u8]>>,
        options: IdentifyOptions,
    ) -> IdentifyResult<MergedResult> {
        self.identify_with_cancel(image, options, CancellationToken::new())
            .await
    }

    /// Identify with explicit cooperative cancellation
    ///
    /// Cancelling `cancel` aborts pending provider calls and skips the cache
    /// write, returning `IdentifyError::Cancelled`.
    pub async fn identify_with_cancel(
        &self,
        image: impl Into<Arc<[u8]>>,
        options: IdentifyOptions,
        cancel: CancellationToken,
    ) -> IdentifyResult<MergedResult> {
        let image: Arc<[u8]> = image.into();
        validate_request(&image, &options, self.inner.config.max_image_bytes)?;

        let request = IdentificationRequest::new(image, options);
        let fingerprint = Fingerprint::compute(request.image(), request.options());

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.resolve(request, fingerprint, cancel).await });

        task.await
            .map_err(|e| IdentifyError::Internal(format!("identification task failed: {}", e)))?
    }

    /// Delete every cached result under the configured prefix
    pub async fn invalidate_all(&self) -> phyto_common::Result<u64> {
        let prefix = format!("{}:result:", self.inner.config.key_prefix);
        let removed = self.inner.cache.delete_by_prefix(&prefix).await?;
        info!(prefix = %prefix, removed = removed, "Cached results invalidated");
        Ok(removed)
    }

    /// Current breaker state of every provider
    pub async fn breaker_snapshots(&self) -> Vec<BreakerState> {
        join_all(
            self.inner
                .fanout
                .slots()
                .iter()
                .map(|slot| slot.breaker.snapshot()),
        )
        .await
    }
}

impl Inner {
    async fn resolve(
        &self,
        request: IdentificationRequest,
        fingerprint: Fingerprint,
        cancel: CancellationToken,
    ) -> IdentifyResult<MergedResult> {
        let prefix = &self.config.key_prefix;
        let cache_key = fingerprint.cache_key(prefix);
        let lock_key = fingerprint.lock_key(prefix);
        let fp = fingerprint.to_string();

        if let Some(hit) = self.cached(&cache_key, &fp).await {
            return Ok(hit);
        }

        let acquired = tokio::select! {
            _ = cancel.cancelled() => return Err(IdentifyError::Cancelled),
            acquired = self.locks.acquire(
                &lock_key,
                self.config.lock_ttl,
                self.config.lock_blocking_timeout,
            ) => acquired,
        };

        match acquired {
            Ok(handle) => self.compute_locked(handle, &request, &cache_key, &fp, &cancel).await,
            Err(LockError::Timeout { waited, .. }) => {
                warn!(
                    fingerprint = %fp,
                    waited_ms = waited.as_millis() as u64,
                    "Lock not acquired, waiting for concurrent result"
                );
                if let Some(hit) = self.poll_cache(&cache_key, &fp, &cancel).await? {
                    return Ok(hit);
                }
                self.compute_unlocked(&request, &cache_key, &fp, &cancel).await
            }
            Err(e @ LockError::Backend(_)) => {
                warn!(fingerprint = %fp, error = %e, "Lock backend unavailable");
                self.compute_unlocked(&request, &cache_key, &fp, &cancel).await
            }
        }
    }

    async fn compute_locked(
        &self,
        handle: LockHandle,
        request: &IdentificationRequest,
        cache_key: &str,
        fp: &str,
        cancel: &CancellationToken,
    ) -> IdentifyResult<MergedResult> {
        debug!(fingerprint = %fp, key = %handle.key, "Lock acquired");
        let renewal = LockRenewal::start(
            Arc::clone(&self.locks),
            handle.clone(),
            self.config.lock_ttl,
            self.config.renew_interval,
        );

        // Double-check: the previous holder may have cached the result
        let outcome = match self.cached(cache_key, fp).await {
            Some(hit) => Ok(hit),
            None => self.compute(request, cache_key, fp, cancel).await,
        };

        if renewal.is_lost() {
            warn!(fingerprint = %fp, "Lock lost during computation");
        }
        renewal.stop().await;

        match self.locks.release(&handle).await {
            Ok(true) => debug!(fingerprint = %fp, "Lock released"),
            Ok(false) => warn!(fingerprint = %fp, "Lock already expired at release"),
            Err(e) => warn!(fingerprint = %fp, error = %e, "Lock release failed"),
        }

        outcome
    }

    async fn compute_unlocked(
        &self,
        request: &IdentificationRequest,
        cache_key: &str,
        fp: &str,
        cancel: &CancellationToken,
    ) -> IdentifyResult<MergedResult> {
        warn!(fingerprint = %fp, "Computing without lock (degraded path)");
        self.events.emit_lossy(IdentifyEvent::LockFallback {
            fingerprint: fp.to_string(),
            timestamp: Utc::now(),
        });
        self.compute(request, cache_key, fp, cancel).await
    }

    /// Fan out, merge and cache
    async fn compute(
        &self,
        request: &IdentificationRequest,
        cache_key: &str,
        fp: &str,
        cancel: &CancellationToken,
    ) -> IdentifyResult<MergedResult> {
        let outcome = self.fanout.identify_all(request, fp, cancel).await?;

        for failure in &outcome.failures {
            self.events.emit_lossy(IdentifyEvent::ProviderFailed {
                fingerprint: fp.to_string(),
                provider: failure.provider.clone(),
                reason: failure.reason.to_string(),
                timestamp: Utc::now(),
            });
        }

        if outcome.successes.is_empty() {
            let retry_after = self.retry_after(&outcome.failures);
            warn!(
                fingerprint = %fp,
                retry_after_secs = retry_after.as_secs(),
                "All identification providers unavailable"
            );
            self.events.emit_lossy(IdentifyEvent::AllProvidersUnavailable {
                fingerprint: fp.to_string(),
                retry_after_secs: retry_after.as_secs(),
                timestamp: Utc::now(),
            });
            return Err(IdentifyError::AllProvidersUnavailable {
                retry_after,
                failures: outcome.failures,
            });
        }

        let disease_providers = outcome.disease_providers;
        let mut merged = self.merger.merge(
            fp,
            &outcome.successes,
            outcome.failures,
            self.fanout.count(),
            request.options().max_results,
        );
        merged.disease_providers = disease_providers;

        // Nobody is waiting for an explicitly cancelled request
        if cancel.is_cancelled() {
            return Err(IdentifyError::Cancelled);
        }

        self.store(cache_key, fp, &merged).await;

        info!(
            fingerprint = %fp,
            candidates = merged.candidates.len(),
            degraded = merged.degraded,
            providers = ?merged.contributing_providers,
            "Identification completed"
        );
        self.events.emit_lossy(IdentifyEvent::Completed {
            fingerprint: fp.to_string(),
            degraded: merged.degraded,
            candidate_count: merged.candidates.len(),
            timestamp: Utc::now(),
        });

        Ok(merged)
    }

    /// Shortest retry hint among the failures, in whole seconds, never zero
    fn retry_after(&self, failures: &[ProviderFailure]) -> Duration {
        let shortest = failures
            .iter()
            .map(|failure| {
                failure
                    .retry_after_ms
                    .map(Duration::from_millis)
                    .unwrap_or(self.config.min_retry_after)
            })
            .min()
            .unwrap_or(self.config.min_retry_after);

        let secs = shortest.as_millis().div_ceil(1000) as u64;
        Duration::from_secs(secs.max(1)).max(self.config.min_retry_after)
    }

    /// Read and decode a cached result; backend or decode errors count as a miss
    async fn cached(&self, cache_key: &str, fp: &str) -> Option<MergedResult> {
        let entry = match self.cache.get(cache_key).await {
            Ok(entry) => entry?,
            Err(e) => {
                warn!(fingerprint = %fp, error = %e, "Cache read failed, treating as miss");
                return None;
            }
        };

        match serde_json::from_str::<MergedResult>(&entry.value) {
            Ok(result) => {
                debug!(fingerprint = %fp, written_at = %entry.written_at, "Cache hit");
                self.events.emit_lossy(IdentifyEvent::CacheHit {
                    fingerprint: fp.to_string(),
                    timestamp: Utc::now(),
                });
                Some(result)
            }
            Err(e) => {
                warn!(fingerprint = %fp, error = %e, "Cached result unreadable, treating as miss");
                None
            }
        }
    }

    /// Wait for a concurrent holder to publish the result
    async fn poll_cache(
        &self,
        cache_key: &str,
        fp: &str,
        cancel: &CancellationToken,
    ) -> IdentifyResult<Option<MergedResult>> {
        let deadline = Instant::now() + self.config.cache_poll_window;
        let interval = self.config.cache_poll_interval.max(Duration::from_millis(1));

        loop {
            if let Some(hit) = self.cached(cache_key, fp).await {
                return Ok(Some(hit));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(IdentifyError::Cancelled),
                _ = tokio::time::sleep(interval.min(deadline - now)) => {}
            }
        }
    }

    async fn store(&self, cache_key: &str, fp: &str, merged: &MergedResult) {
        let value = match serde_json::to_string(merged) {
            Ok(value) => value,
            Err(e) => {
                warn!(fingerprint = %fp, error = %e, "Result not serializable, skipping cache");
                return;
            }
        };

        if let Err(e) = self.cache.set(cache_key, value, self.config.cache_ttl).await {
            warn!(fingerprint = %fp, error = %e, "Cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::error::ProviderError;
    use crate::types::{Candidate, FailureReason, IdentificationProvider, ProviderResult};
    use async_trait::async_trait;

    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];

    struct Fixed(&'static str, f32);

    #[async_trait]
    impl IdentificationProvider for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        async fn identify(
            &self,
            _image: &[u8],
            _options: &IdentifyOptions,
        ) -> Result<ProviderResult, ProviderError> {
            Ok(ProviderResult::new(self.0, vec![Candidate::species("Rosa canina", self.1)]))
        }
    }

    fn failure(retry_after_ms: Option<u64>) -> ProviderFailure {
        ProviderFailure {
            provider: "p".to_string(),
            reason: FailureReason::CircuitOpen,
            message: String::new(),
            retry_after_ms,
        }
    }

    fn service() -> CombinedIdentificationService {
        CombinedIdentificationService::builder()
            .provider(Arc::new(Fixed("a", 0.9)), Duration::from_secs(1))
            .provider(Arc::new(Fixed("b", 0.7)), Duration::from_secs(1))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_retry_after_rounds_up_and_never_zero() {
        let service = service();
        let inner = &service.inner;

        assert_eq!(
            inner.retry_after(&[failure(Some(1_500)), failure(Some(40_000))]),
            Duration::from_secs(2)
        );
        assert_eq!(inner.retry_after(&[failure(Some(0))]), Duration::from_secs(1));
        assert_eq!(inner.retry_after(&[failure(None)]), Duration::from_secs(1));
        assert_eq!(inner.retry_after(&[]), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_identify_merges_all_providers() {
        let service = service();
        let result = service.identify(JPEG.to_vec(), IdentifyOptions::default()).await.unwrap();

        assert!(!result.degraded);
        assert_eq!(result.contributing_providers, vec!["a", "b"]);
        assert_eq!(result.candidates.len(), 1);
        assert!((result.candidates[0].confidence - 0.8).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_invalidate_all_removes_results() {
        let cache = Arc::new(MemoryCache::new());
        let service = CombinedIdentificationService::builder()
            .provider(Arc::new(Fixed("a", 0.9)), Duration::from_secs(1))
            .cache(cache.clone())
            .build()
            .unwrap();

        service.identify(JPEG.to_vec(), IdentifyOptions::default()).await.unwrap();
        assert_eq!(cache.len().await, 1);

        assert_eq!(service.invalidate_all().await.unwrap(), 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_breaker_snapshots_cover_every_provider() {
        let snapshots = service().breaker_snapshots().await;
        let names: Vec<_> = snapshots.iter().map(|s| s.provider.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}

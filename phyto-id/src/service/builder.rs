//! Service assembly

use super::fanout::{ProviderFanout, ProviderSlot};
use super::{CombinedIdentificationService, Inner, ServiceConfig};
use crate::breaker::{BreakerConfig, BreakerStateStore, CircuitBreaker, MemoryBreakerStore};
use crate::cache::{CacheStore, MemoryCache};
use crate::lock::{LockManager, MemoryLockManager};
use crate::merger::{MergeConfig, ResultMerger};
use crate::types::IdentificationProvider;
use phyto_common::events::EventBus;
use phyto_common::{Error, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Builder for [`CombinedIdentificationService`]
///
/// Backends default to process-local implementations.
#[derive(Default)]
pub struct ServiceBuilder {
    config: ServiceConfig,
    providers: Vec<(Arc<dyn IdentificationProvider>, Duration)>,
    cache: Option<Arc<dyn CacheStore>>,
    locks: Option<Arc<dyn LockManager>>,
    breaker_config: BreakerConfig,
    breaker_store: Option<Arc<dyn BreakerStateStore>>,
    merge: MergeConfig,
    events: Option<EventBus>,
}

impl ServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a provider with its per-call timeout
    pub fn provider(mut self, provider: Arc<dyn IdentificationProvider>, timeout: Duration) -> Self {
        self.providers.push((provider, timeout));
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn locks(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// Share breaker state through `store` (e.g. across instances)
    pub fn breaker_store(mut self, store: Arc<dyn BreakerStateStore>) -> Self {
        self.breaker_store = Some(store);
        self
    }

    pub fn merge_config(mut self, merge: MergeConfig) -> Self {
        self.merge = merge;
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Assemble the service
    ///
    /// # Errors
    /// `Error::Config` when no provider is registered or two share a name.
    pub fn build(self) -> Result<CombinedIdentificationService> {
        if self.providers.is_empty() {
            return Err(Error::Config("at least one provider is required".to_string()));
        }

        let mut seen = HashSet::new();
        for (provider, _) in &self.providers {
            if !seen.insert(provider.name().to_string()) {
                return Err(Error::Config(format!(
                    "duplicate provider name '{}'",
                    provider.name()
                )));
            }
        }

        let events = self.events.unwrap_or_default();
        let breaker_store = self
            .breaker_store
            .unwrap_or_else(|| Arc::new(MemoryBreakerStore::new()));

        let slots = self
            .providers
            .into_iter()
            .map(|(provider, timeout)| {
                let breaker = CircuitBreaker::with_store(
                    provider.name(),
                    self.breaker_config,
                    Arc::clone(&breaker_store),
                )
                .with_events(events.clone());

                ProviderSlot {
                    provider,
                    breaker: Arc::new(breaker),
                    timeout,
                }
            })
            .collect();

        let fanout = ProviderFanout::new(
            slots,
            self.config.max_concurrency,
            self.config.deadline_grace,
        );

        Ok(CombinedIdentificationService {
            inner: Arc::new(Inner {
                fanout,
                cache: self.cache.unwrap_or_else(|| Arc::new(MemoryCache::new())),
                locks: self.locks.unwrap_or_else(|| Arc::new(MemoryLockManager::new())),
                merger: ResultMerger::new(self.merge),
                events,
                config: self.config,
            }),
        })
    }
}

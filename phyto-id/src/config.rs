//! Configuration for phyto-id
//!
//! Loaded from `phyto-id.toml` (see [`phyto_common::config::resolve_config_path`]
//! for the search order) with built-in defaults for every section. Provider
//! API keys resolve ENV → TOML so secrets can stay out of the file.

use crate::breaker::BreakerConfig;
use crate::cache::CacheStore;
use crate::lock::LockManager;
use crate::merger::{MergeConfig, DEFAULT_MAX_RESULTS};
use crate::providers::build_provider;
use crate::service::{CombinedIdentificationService, ServiceConfig, DEFAULT_MAX_IMAGE_BYTES, MAX_RESULTS_LIMIT};
use phyto_common::config::{env_value, load_toml_config, resolve_config_path, LoggingConfig};
use phyto_common::events::EventBus;
use phyto_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Config file name
pub const CONFIG_FILE_NAME: &str = "phyto-id.toml";

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "PHYTO_CONFIG";

/// Environment variable overriding `redis_url`
pub const REDIS_URL_ENV_VAR: &str = "PHYTO_REDIS_URL";

/// Supported provider APIs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Pl@ntNet (my-api.plantnet.org)
    PlantNet,
    /// plant.id by Kindwise
    PlantId,
}

/// One `[[providers]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    /// Base URL; the provider's public endpoint when absent
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
    /// Merge weight
    #[serde(default = "default_weight")]
    pub weight: f32,
    /// Outbound pacing; unlimited when absent
    #[serde(default)]
    pub requests_per_second: Option<f64>,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            name: name.into(),
            kind,
            endpoint: None,
            api_key: None,
            timeout_ms: default_provider_timeout_ms(),
            weight: default_weight(),
            requests_per_second: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// `PHYTO_<NAME>_API_KEY`, with non-alphanumerics mapped to `_`
    pub fn api_key_env_var(&self) -> String {
        let name: String = self
            .name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("PHYTO_{}_API_KEY", name)
    }
}

fn default_provider_timeout_ms() -> u64 {
    10_000
}

fn default_weight() -> f32 {
    1.0
}

/// `[cache]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub ttl_secs: u64,
    pub key_prefix: String,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            key_prefix: "phyto".to_string(),
        }
    }
}

/// `[lock]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSection {
    pub ttl_ms: u64,
    pub blocking_timeout_ms: u64,
    pub retry_interval_ms: u64,
    pub cache_poll_window_ms: u64,
    pub cache_poll_interval_ms: u64,
    pub renew_interval_ms: u64,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            blocking_timeout_ms: 10_000,
            retry_interval_ms: 50,
            cache_poll_window_ms: 2_000,
            cache_poll_interval_ms: 100,
            renew_interval_ms: 10_000,
        }
    }
}

/// `[breaker]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
        }
    }
}

/// `[merge]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeSection {
    pub max_results: usize,
    /// Synonym → accepted name
    pub synonyms: BTreeMap<String, String>,
}

impl Default for MergeSection {
    fn default() -> Self {
        Self {
            max_results: DEFAULT_MAX_RESULTS,
            synonyms: BTreeMap::new(),
        }
    }
}

/// `[fanout]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutSection {
    pub max_concurrency: usize,
    pub min_retry_after_secs: u64,
    pub max_image_bytes: usize,
}

impl Default for FanoutSection {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            min_retry_after_secs: 1,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }
}

/// Complete `phyto-id.toml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifyConfig {
    pub logging: LoggingConfig,
    /// Shared backend for cache, lock and breaker state; process-local when absent
    pub redis_url: Option<String>,
    pub cache: CacheSection,
    pub lock: LockSection,
    pub breaker: BreakerSection,
    pub merge: MergeSection,
    pub fanout: FanoutSection,
    pub providers: Vec<ProviderConfig>,
}

impl Default for IdentifyConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            redis_url: None,
            cache: CacheSection::default(),
            lock: LockSection::default(),
            breaker: BreakerSection::default(),
            merge: MergeSection::default(),
            fanout: FanoutSection::default(),
            providers: vec![
                ProviderConfig::new("plantnet", ProviderKind::PlantNet),
                ProviderConfig::new("plantid", ProviderKind::PlantId),
            ],
        }
    }
}

impl IdentifyConfig {
    /// Resolve, load, apply environment overrides and validate
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let path = resolve_config_path(cli_path, CONFIG_ENV_VAR, CONFIG_FILE_NAME);
        match &path {
            Some(p) => info!(path = %p.display(), "Loading configuration"),
            None => info!("No configuration file found, using defaults"),
        }

        let mut config: IdentifyConfig = load_toml_config(path.as_deref())?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment wins over TOML for secrets and the Redis URL
    pub fn apply_env_overrides(&mut self) {
        for provider in &mut self.providers {
            let var = provider.api_key_env_var();
            let Some(env_key) = env_value(&var) else {
                continue;
            };

            if provider.api_key.as_deref().is_some_and(is_valid_key) {
                warn!(
                    provider = %provider.name,
                    "API key found in both {} and TOML config. Using environment.",
                    var
                );
            }
            provider.api_key = Some(env_key);
        }

        if let Some(url) = env_value(REDIS_URL_ENV_VAR) {
            self.redis_url = Some(url);
        }
    }

    /// Check the loaded values
    ///
    /// # Errors
    /// `Error::Config` naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(Error::Config("at least one [[providers]] entry is required".to_string()));
        }

        let mut names = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(Error::Config("provider name must not be empty".to_string()));
            }
            if !names.insert(provider.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate provider name '{}'",
                    provider.name
                )));
            }
            if provider.timeout_ms == 0 {
                return Err(Error::Config(format!(
                    "provider '{}': timeout_ms must be positive",
                    provider.name
                )));
            }
            if !provider.weight.is_finite() || provider.weight < 0.0 {
                return Err(Error::Config(format!(
                    "provider '{}': weight must be a non-negative number",
                    provider.name
                )));
            }
            if !provider.api_key.as_deref().is_some_and(is_valid_key) {
                return Err(Error::Config(format!(
                    "provider '{}' has no API key. Set {} or api_key in {}",
                    provider.name,
                    provider.api_key_env_var(),
                    CONFIG_FILE_NAME
                )));
            }
        }

        if self.lock.ttl_ms == 0 {
            return Err(Error::Config("lock.ttl_ms must be positive".to_string()));
        }
        if self.lock.renew_interval_ms == 0 || self.lock.renew_interval_ms >= self.lock.ttl_ms {
            return Err(Error::Config(
                "lock.renew_interval_ms must be positive and below lock.ttl_ms".to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(Error::Config("breaker.failure_threshold must be positive".to_string()));
        }
        if self.merge.max_results == 0 || self.merge.max_results > MAX_RESULTS_LIMIT {
            return Err(Error::Config(format!(
                "merge.max_results must be between 1 and {}",
                MAX_RESULTS_LIMIT
            )));
        }
        if self.fanout.max_concurrency == 0 {
            return Err(Error::Config("fanout.max_concurrency must be positive".to_string()));
        }

        Ok(())
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            key_prefix: self.cache.key_prefix.clone(),
            cache_ttl: Duration::from_secs(self.cache.ttl_secs),
            lock_ttl: Duration::from_millis(self.lock.ttl_ms),
            lock_blocking_timeout: Duration::from_millis(self.lock.blocking_timeout_ms),
            cache_poll_window: Duration::from_millis(self.lock.cache_poll_window_ms),
            cache_poll_interval: Duration::from_millis(self.lock.cache_poll_interval_ms),
            renew_interval: Duration::from_millis(self.lock.renew_interval_ms),
            max_concurrency: self.fanout.max_concurrency,
            min_retry_after: Duration::from_secs(self.fanout.min_retry_after_secs),
            max_image_bytes: self.fanout.max_image_bytes,
            ..ServiceConfig::default()
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            cooldown: Duration::from_secs(self.breaker.cooldown_secs),
        }
    }

    /// Merge weights come from the provider entries
    pub fn merge_config(&self) -> MergeConfig {
        MergeConfig {
            max_results: self.merge.max_results,
            weights: self
                .providers
                .iter()
                .map(|p| (p.name.clone(), p.weight))
                .collect(),
            synonyms: self.merge.synonyms.clone(),
            ..MergeConfig::default()
        }
    }

    /// Assemble the service with HTTP providers and the configured backends
    pub async fn build_service(&self, events: EventBus) -> Result<CombinedIdentificationService> {
        let mut builder = CombinedIdentificationService::builder()
            .config(self.service_config())
            .breaker_config(self.breaker_config())
            .merge_config(self.merge_config())
            .events(events);

        for provider in &self.providers {
            builder = builder.provider(build_provider(provider)?, provider.timeout());
        }

        if let Some(url) = &self.redis_url {
            let (cache, locks, breakers) = self.redis_backends(url).await?;
            builder = builder.cache(cache).locks(locks).breaker_store(breakers);
            info!("Using Redis for cache, lock and breaker state");
        }

        builder.build()
    }

    #[cfg(feature = "redis")]
    async fn redis_backends(
        &self,
        url: &str,
    ) -> Result<(
        Arc<dyn CacheStore>,
        Arc<dyn LockManager>,
        Arc<dyn crate::breaker::BreakerStateStore>,
    )> {
        use crate::breaker::RedisBreakerStore;
        use crate::cache::RedisCache;
        use crate::lock::RedisLockManager;

        let cache = RedisCache::connect(url).await?;
        let locks = RedisLockManager::connect(url)
            .await
            .map_err(|e| Error::Backend(e.to_string()))?
            .with_retry_interval(Duration::from_millis(self.lock.retry_interval_ms));
        let breakers = RedisBreakerStore::new(cache.connection(), self.cache.key_prefix.clone());

        Ok((Arc::new(cache), Arc::new(locks), Arc::new(breakers)))
    }

    #[cfg(not(feature = "redis"))]
    async fn redis_backends(
        &self,
        _url: &str,
    ) -> Result<(
        Arc<dyn CacheStore>,
        Arc<dyn LockManager>,
        Arc<dyn crate::breaker::BreakerStateStore>,
    )> {
        Err(Error::Config(
            "redis_url is set but phyto-id was built without the `redis` feature".to_string(),
        ))
    }
}

/// Non-empty, non-whitespace
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

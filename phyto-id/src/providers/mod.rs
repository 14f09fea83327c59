//! Provider adapters
//!
//! One [`IdentificationProvider`] implementation per remote API. Adapters
//! only translate requests and responses; breaker and timeout handling live
//! in the orchestrator.

pub mod http;
pub mod plantid;
pub mod plantnet;

pub use plantid::PlantIdProvider;
pub use plantnet::PlantNetProvider;

use crate::config::{ProviderConfig, ProviderKind};
use crate::types::IdentificationProvider;
use self::http::HttpTransport;
use phyto_common::{Error, Result};
use std::sync::Arc;
use tracing::debug;

/// Construct the adapter described by one `[[providers]]` entry
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn IdentificationProvider>> {
    let api_key = config
        .api_key
        .clone()
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| Error::Config(format!("provider '{}' has no API key", config.name)))?;

    let transport = HttpTransport::new(config.timeout(), config.requests_per_second)
        .map_err(|e| Error::Config(format!("provider '{}': {}", config.name, e)))?;

    debug!(provider = %config.name, kind = ?config.kind, "Building provider");

    let provider: Arc<dyn IdentificationProvider> = match config.kind {
        ProviderKind::PlantNet => Arc::new(PlantNetProvider::new(
            config.name.clone(),
            config.endpoint.clone(),
            api_key,
            transport,
        )),
        ProviderKind::PlantId => Arc::new(PlantIdProvider::new(
            config.name.clone(),
            config.endpoint.clone(),
            api_key,
            transport,
        )),
    };

    Ok(provider)
}

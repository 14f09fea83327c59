//! Test Helper Utilities
//!
//! Shared utilities for testing phyto-id

#![allow(dead_code)]

pub mod mock_provider;

pub use mock_provider::{Behavior, ScriptedProvider};

use phyto_id::config::IdentifyConfig;
use phyto_id::service::ServiceConfig;
use std::time::Duration;

/// Initialize test logging once; `RUST_LOG` controls the level
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small buffer that passes magic-byte validation as JPEG
///
/// Different seeds give different fingerprints.
pub fn fake_jpeg(seed: u8) -> Vec<u8> {
    let mut image = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00];
    image.extend(std::iter::repeat(seed).take(64));
    image.extend_from_slice(&[0xFF, 0xD9]);
    image
}

/// Service settings with short waits for fast tests
pub fn fast_service_config() -> ServiceConfig {
    ServiceConfig {
        lock_ttl: Duration::from_secs(5),
        lock_blocking_timeout: Duration::from_secs(5),
        cache_poll_window: Duration::from_millis(100),
        cache_poll_interval: Duration::from_millis(10),
        renew_interval: Duration::from_secs(1),
        deadline_grace: Duration::from_millis(50),
        ..IdentifyConfig::default().service_config()
    }
}

//! # Phyto Common Library
//!
//! Shared code for the phyto identification crates:
//! - Common error and result types
//! - TOML configuration loading and config path resolution
//! - Logging configuration
//! - Identification telemetry events (`IdentifyEvent`, `EventBus`)

pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};

//! phyto-id library interface
//!
//! Resilient multi-provider plant identification: concurrent fan-out to
//! independent identification APIs, one circuit breaker per provider,
//! distributed-lock stampede protection, and a weighted merge of the
//! providers' candidates into one cached, ranked result.

pub mod breaker;
pub mod cache;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod lock;
pub mod merger;
pub mod providers;
pub mod service;
pub mod types;

pub use crate::error::{IdentifyError, IdentifyResult, ProviderError, ValidationError};
pub use crate::fingerprint::Fingerprint;
pub use crate::service::CombinedIdentificationService;
pub use crate::types::{
    Candidate, IdentificationProvider, IdentifyOptions, MergedCandidate, MergedResult, Organ,
    ProviderResult,
};

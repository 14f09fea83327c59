//! Core Types and the Provider Capability Trait
//!
//! Defines the data flowing through one identification:
//! - **Request:** `IdentificationRequest` (image + `IdentifyOptions`)
//! - **Per provider:** `ProviderResult` or `ProviderFailure`
//! - **Output:** `MergedResult` (ranked, deduplicated candidates)
//!
//! Every remote identification service is wrapped by one implementation of
//! [`IdentificationProvider`]. The orchestrator depends only on the trait, so
//! new providers need no fan-out or merge changes.

use crate::error::{ProviderError, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Request Types
// ============================================================================

/// Plant organ shown in the image
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Organ {
    /// Let the provider decide
    Auto,
    Leaf,
    Flower,
    Fruit,
    Bark,
}

impl Organ {
    /// Lowercase wire name used by provider APIs
    pub fn as_str(&self) -> &'static str {
        match self {
            Organ::Auto => "auto",
            Organ::Leaf => "leaf",
            Organ::Flower => "flower",
            Organ::Fruit => "fruit",
            Organ::Bark => "bark",
        }
    }
}

impl fmt::Display for Organ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Organ {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Organ::Auto),
            "leaf" => Ok(Organ::Leaf),
            "flower" => Ok(Organ::Flower),
            "fruit" => Ok(Organ::Fruit),
            "bark" => Ok(Organ::Bark),
            other => Err(ValidationError::InvalidOption(format!(
                "unknown organ '{}'",
                other
            ))),
        }
    }
}

/// Caller-supplied identification options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyOptions {
    /// Also ask providers for disease candidates
    pub include_diseases: bool,
    /// Organs visible in the image (empty = auto)
    pub organs: Vec<Organ>,
    /// Language for common names (ISO 639-1)
    pub language: String,
    /// Override of the configured result limit
    pub max_results: Option<usize>,
}

impl Default for IdentifyOptions {
    fn default() -> Self {
        Self {
            include_diseases: false,
            organs: Vec::new(),
            language: "en".to_string(),
            max_results: None,
        }
    }
}

impl IdentifyOptions {
    /// Canonical form used for hashing and provider calls
    ///
    /// Organs are sorted and deduplicated, `Auto` is dropped when a concrete
    /// organ is present, and the language is trimmed and lowercased.
    pub fn normalized(&self) -> Self {
        let mut organs = self.organs.clone();
        organs.sort();
        organs.dedup();
        if organs.len() > 1 {
            organs.retain(|o| *o != Organ::Auto);
        }

        let language = self.language.trim().to_ascii_lowercase();

        Self {
            include_diseases: self.include_diseases,
            organs,
            language: if language.is_empty() {
                "en".to_string()
            } else {
                language
            },
            max_results: self.max_results,
        }
    }

    /// First organ for providers that accept a single organ per image
    pub fn primary_organ(&self) -> Organ {
        self.organs.first().copied().unwrap_or(Organ::Auto)
    }
}

/// One identification request
///
/// Immutable once created; cloning shares the image buffer.
#[derive(Debug, Clone)]
pub struct IdentificationRequest {
    image: Arc<[u8]>,
    options: IdentifyOptions,
}

impl IdentificationRequest {
    /// Create a request; options are normalized on construction
    pub fn new(image: impl Into<Arc<[u8]>>, options: IdentifyOptions) -> Self {
        Self {
            image: image.into(),
            options: options.normalized(),
        }
    }

    /// Raw image bytes
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Shared handle to the image buffer
    pub fn image_arc(&self) -> Arc<[u8]> {
        Arc::clone(&self.image)
    }

    /// Normalized options
    pub fn options(&self) -> &IdentifyOptions {
        &self.options
    }
}

// ============================================================================
// Provider Output
// ============================================================================

/// Whether a candidate names a species or a plant disease
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateKind {
    Species,
    Disease,
}

/// One ranked candidate from a single provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Name as reported by the provider
    pub name: String,
    /// Provider confidence (0.0-1.0)
    pub confidence: f32,
    /// Species or disease
    pub kind: CandidateKind,
    /// Vernacular names in the requested language
    #[serde(default)]
    pub common_names: Vec<String>,
    /// Additional fields (e.g. "family", "genus", "gbif_id")
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Candidate {
    /// Create species candidate with clamped confidence (0.0-1.0)
    pub fn species(name: impl Into<String>, confidence: f32) -> Self {
        Self {
            name: name.into(),
            confidence: clamp_confidence(confidence),
            kind: CandidateKind::Species,
            common_names: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Create disease candidate with clamped confidence (0.0-1.0)
    pub fn disease(name: impl Into<String>, confidence: f32) -> Self {
        Self {
            kind: CandidateKind::Disease,
            ..Self::species(name, confidence)
        }
    }

    pub fn with_common_names(mut self, names: Vec<String>) -> Self {
        self.common_names = names;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Successful response of one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResult {
    /// Provider name
    pub provider: String,
    /// Candidates in provider order
    pub candidates: Vec<Candidate>,
    /// Wall-clock latency of the call
    pub latency: Duration,
}

impl ProviderResult {
    pub fn new(provider: impl Into<String>, candidates: Vec<Candidate>) -> Self {
        Self {
            provider: provider.into(),
            candidates,
            latency: Duration::ZERO,
        }
    }
}

/// Why a provider did not contribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Breaker open; no call was made
    CircuitOpen,
    Timeout,
    Network,
    RateLimited,
    MalformedResponse,
    /// Provider answered with an error status
    Api,
    /// Call did not settle before the fan-out deadline
    Incomplete,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::CircuitOpen => "circuit_open",
            FailureReason::Timeout => "timeout",
            FailureReason::Network => "network",
            FailureReason::RateLimited => "rate_limited",
            FailureReason::MalformedResponse => "malformed_response",
            FailureReason::Api => "api",
            FailureReason::Incomplete => "incomplete",
        };
        f.write_str(s)
    }
}

/// Recorded failure of one provider slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFailure {
    pub provider: String,
    pub reason: FailureReason,
    pub message: String,
    /// Provider- or breaker-supplied retry hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

// ============================================================================
// Merged Output
// ============================================================================

/// Deduplicated candidate combined across providers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedCandidate {
    /// Display name (from the strongest single report)
    pub name: String,
    /// Normalized name used for deduplication
    pub normalized_name: String,
    /// Weighted combined confidence (0.0-1.0)
    pub confidence: f32,
    /// Highest raw confidence from any single provider
    pub max_raw_confidence: f32,
    /// Contributing providers, sorted
    pub providers: Vec<String>,
    pub kind: CandidateKind,
    pub common_names: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Final identification outcome
///
/// Written once and cached. Readers receive copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedResult {
    /// Fingerprint of the request this result answers
    pub fingerprint: String,
    /// Ranked species candidates
    pub candidates: Vec<MergedCandidate>,
    /// Ranked disease candidates (empty unless requested)
    #[serde(default)]
    pub diseases: Vec<MergedCandidate>,
    /// Fewer than all configured providers contributed
    pub degraded: bool,
    /// Why the missing providers did not contribute
    #[serde(default)]
    pub failures: Vec<ProviderFailure>,
    /// Providers whose results were merged, sorted
    pub contributing_providers: Vec<String>,
    /// Per-provider latency in milliseconds
    #[serde(default)]
    pub provider_latency_ms: BTreeMap<String, u64>,
    /// Contributing providers that were asked for disease candidates
    ///
    /// Empty unless diseases were requested. Providers without disease
    /// support answer species only and are absent here.
    #[serde(default)]
    pub disease_providers: Vec<String>,
}

impl MergedResult {
    /// Best species candidate, if any
    pub fn top(&self) -> Option<&MergedCandidate> {
        self.candidates.first()
    }
}

// ============================================================================
// Provider Capability
// ============================================================================

/// Uniform capability of a remote identification service
///
/// Implementations hold no retry or breaker logic; the orchestrator wraps
/// every call in the provider's circuit breaker and timeout.
///
/// # Example
/// ```rust,ignore
/// pub struct StaticProvider;
///
/// #[async_trait::async_trait]
/// impl IdentificationProvider for StaticProvider {
///     fn name(&self) -> &str { "static" }
///
///     async fn identify(&self, _image: &[u8], _options: &IdentifyOptions)
///         -> Result<ProviderResult, ProviderError>
///     {
///         Ok(ProviderResult::new("static", vec![Candidate::species("Rosa", 0.9)]))
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait IdentificationProvider: Send + Sync {
    /// Provider name for provenance, weights and breaker identity
    fn name(&self) -> &str;

    /// Whether the provider can return disease candidates
    fn supports_diseases(&self) -> bool {
        false
    }

    /// Wait until a call fits the provider's local request quota
    ///
    /// Awaited before the breaker admits the call and before its timeout
    /// starts, so time queued behind local pacing is never a provider failure.
    async fn ready(&self) {}

    /// Identify the plant in `image`
    ///
    /// # Errors
    /// Returns a typed `ProviderError` for timeout, network failure,
    /// quota/rate-limit and malformed responses.
    async fn identify(
        &self,
        image: &[u8],
        options: &IdentifyOptions,
    ) -> Result<ProviderResult, ProviderError>;
}

fn clamp_confidence(confidence: f32) -> f32 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

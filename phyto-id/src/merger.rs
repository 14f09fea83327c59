//! Result Merger
//!
//! Combines successful provider results into one ranked, deduplicated list.
//!
//! # Algorithm
//! 1. Normalize each candidate name (trim, collapse whitespace, case-fold,
//!    resolve synonyms) so the same species from different providers is
//!    recognized as identical
//! 2. Combine confidences of a species with the per-provider weighted average
//!    over the providers that reported it
//! 3. Sort descending by combined confidence; ties go to the candidate with
//!    the highest single raw confidence, then to the normalized name
//! 4. Truncate to the configured maximum and flag the result `degraded` when
//!    fewer than all configured providers contributed
//!
//! Pure function over in-memory data: no I/O, deterministic for equal input.
//!
//! # Example
//! ```rust,ignore
//! let merger = ResultMerger::new(MergeConfig::default()
//!     .with_weight("plantnet", 0.6)
//!     .with_weight("plantid", 0.4));
//!
//! // plantnet: Rosa 0.9, plantid: rosa 0.7
//! // combined = (0.6 * 0.9 + 0.4 * 0.7) / (0.6 + 0.4) = 0.82
//! ```

use crate::types::{
    CandidateKind, MergedCandidate, MergedResult, ProviderFailure, ProviderResult,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Default result limit
pub const DEFAULT_MAX_RESULTS: usize = 10;

/// Merge tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Maximum merged candidates per kind
    pub max_results: usize,
    /// Per-provider trust weights
    pub weights: BTreeMap<String, f32>,
    /// Weight for providers missing from `weights`
    pub default_weight: f32,
    /// Synonym → accepted name
    pub synonyms: BTreeMap<String, String>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_results: DEFAULT_MAX_RESULTS,
            weights: BTreeMap::new(),
            default_weight: 1.0,
            synonyms: BTreeMap::new(),
        }
    }
}

impl MergeConfig {
    pub fn with_weight(mut self, provider: impl Into<String>, weight: f32) -> Self {
        self.weights.insert(provider.into(), weight);
        self
    }

    pub fn with_synonym(mut self, synonym: impl Into<String>, accepted: impl Into<String>) -> Self {
        self.synonyms.insert(synonym.into(), accepted.into());
        self
    }
}

/// Deduplicates and ranks candidates across providers
#[derive(Debug, Clone)]
pub struct ResultMerger {
    config: MergeConfig,
    /// Normalized synonym → normalized accepted name
    synonyms: BTreeMap<String, String>,
}

/// One provider's strongest report of one species
#[derive(Debug)]
struct Report<'a> {
    name: &'a str,
    confidence: f32,
    common_names: &'a [String],
    metadata: &'a BTreeMap<String, String>,
}

impl ResultMerger {
    pub fn new(config: MergeConfig) -> Self {
        let synonyms = config
            .synonyms
            .iter()
            .map(|(synonym, accepted)| (basic_normalize(synonym), basic_normalize(accepted)))
            .collect();

        Self { config, synonyms }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Weight of `provider`, never negative
    pub fn weight(&self, provider: &str) -> f32 {
        self.config
            .weights
            .get(provider)
            .copied()
            .unwrap_or(self.config.default_weight)
            .max(0.0)
    }

    /// Canonical comparison form of a species name
    pub fn normalize(&self, name: &str) -> String {
        let basic = basic_normalize(name);
        match self.synonyms.get(&basic) {
            Some(accepted) => accepted.clone(),
            None => basic,
        }
    }

    /// Merge successful provider results
    ///
    /// # Arguments
    /// * `fingerprint` - Request fingerprint recorded in the result
    /// * `successes` - Results of providers that answered
    /// * `failures` - Why the other providers did not contribute
    /// * `configured_providers` - Number of providers the request fanned out to
    /// * `max_results` - Per-request limit overriding the configured one
    pub fn merge(
        &self,
        fingerprint: &str,
        successes: &[ProviderResult],
        mut failures: Vec<ProviderFailure>,
        configured_providers: usize,
        max_results: Option<usize>,
    ) -> MergedResult {
        let limit = max_results.unwrap_or(self.config.max_results);

        let candidates = self.rank(successes, CandidateKind::Species, limit);
        let diseases = self.rank(successes, CandidateKind::Disease, limit);

        let contributing_providers: Vec<String> = successes
            .iter()
            .map(|r| r.provider.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let provider_latency_ms = successes
            .iter()
            .map(|r| (r.provider.clone(), r.latency.as_millis() as u64))
            .collect();

        failures.sort_by(|a, b| a.provider.cmp(&b.provider));
        let degraded = contributing_providers.len() < configured_providers || !failures.is_empty();

        debug!(
            fingerprint = %fingerprint,
            providers = contributing_providers.len(),
            candidates = candidates.len(),
            diseases = diseases.len(),
            degraded = degraded,
            "Merged provider results"
        );

        MergedResult {
            fingerprint: fingerprint.to_string(),
            candidates,
            diseases,
            degraded,
            failures,
            contributing_providers,
            provider_latency_ms,
            disease_providers: Vec::new(),
        }
    }

    fn rank(
        &self,
        successes: &[ProviderResult],
        kind: CandidateKind,
        limit: usize,
    ) -> Vec<MergedCandidate> {
        // normalized name → provider → strongest report
        let mut groups: BTreeMap<String, BTreeMap<&str, Report<'_>>> = BTreeMap::new();

        for result in successes {
            for candidate in result.candidates.iter().filter(|c| c.kind == kind) {
                let normalized = self.normalize(&candidate.name);
                if normalized.is_empty() {
                    continue;
                }

                let reports = groups.entry(normalized).or_default();
                let report = Report {
                    name: candidate.name.trim(),
                    confidence: candidate.confidence,
                    common_names: &candidate.common_names,
                    metadata: &candidate.metadata,
                };
                let stronger = reports
                    .get(result.provider.as_str())
                    .map_or(true, |existing| report.confidence > existing.confidence);
                if stronger {
                    reports.insert(result.provider.as_str(), report);
                }
            }
        }

        let mut merged: Vec<MergedCandidate> = groups
            .into_iter()
            .map(|(normalized_name, reports)| self.combine(normalized_name, kind, &reports))
            .collect();

        merged.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    b.max_raw_confidence
                        .partial_cmp(&a.max_raw_confidence)
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| a.normalized_name.cmp(&b.normalized_name))
        });
        merged.truncate(limit);
        merged
    }

    /// Weighted average over the reporting providers
    fn combine(
        &self,
        normalized_name: String,
        kind: CandidateKind,
        reports: &BTreeMap<&str, Report<'_>>,
    ) -> MergedCandidate {
        let mut weighted_sum = 0.0f32;
        let mut weight_total = 0.0f32;
        let mut plain_sum = 0.0f32;

        for (provider, report) in reports {
            let weight = self.weight(provider);
            weighted_sum += weight * report.confidence;
            weight_total += weight;
            plain_sum += report.confidence;
        }

        // All-zero weights fall back to the plain mean
        let confidence = if weight_total > 0.0 {
            weighted_sum / weight_total
        } else {
            plain_sum / reports.len().max(1) as f32
        };

        // Strongest single report names the candidate
        let strongest = reports
            .values()
            .fold(None::<&Report<'_>>, |best, report| match best {
                Some(b) if b.confidence >= report.confidence => Some(b),
                _ => Some(report),
            });

        // Most trusted report supplies the metadata
        let trusted = reports
            .iter()
            .fold(None::<(f32, &Report<'_>)>, |best, (provider, report)| {
                let weight = self.weight(provider);
                match best {
                    Some((w, r))
                        if w > weight || (w == weight && r.confidence >= report.confidence) =>
                    {
                        Some((w, r))
                    }
                    _ => Some((weight, report)),
                }
            })
            .map(|(_, r)| r);

        let mut common_names: Vec<String> = Vec::new();
        let mut seen = BTreeSet::new();
        for report in reports.values() {
            for name in report.common_names {
                let trimmed = name.trim();
                if !trimmed.is_empty() && seen.insert(trimmed.to_lowercase()) {
                    common_names.push(trimmed.to_string());
                }
            }
        }

        MergedCandidate {
            name: strongest.map(|r| r.name.to_string()).unwrap_or_else(|| normalized_name.clone()),
            confidence: confidence.clamp(0.0, 1.0),
            max_raw_confidence: strongest.map(|r| r.confidence).unwrap_or(0.0),
            providers: reports.keys().map(|p| p.to_string()).collect(),
            kind,
            common_names,
            metadata: trusted.map(|r| r.metadata.clone()).unwrap_or_default(),
            normalized_name,
        }
    }
}

impl Default for ResultMerger {
    fn default() -> Self {
        Self::new(MergeConfig::default())
    }
}

/// Trim, collapse internal whitespace and case-fold
fn basic_normalize(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Candidate, FailureReason};

    fn result(provider: &str, candidates: Vec<Candidate>) -> ProviderResult {
        ProviderResult::new(provider, candidates)
    }

    fn weighted() -> ResultMerger {
        ResultMerger::new(
            MergeConfig::default()
                .with_weight("a", 0.6)
                .with_weight("b", 0.4),
        )
    }

    #[test]
    fn test_same_species_merged_with_weights() {
        let merged = weighted().merge(
            "fp",
            &[
                result("a", vec![Candidate::species("Rosa", 0.9)]),
                result("b", vec![Candidate::species("rosa", 0.7)]),
            ],
            vec![],
            2,
            None,
        );

        assert_eq!(merged.candidates.len(), 1, "One entry, not two");
        let rosa = &merged.candidates[0];
        assert_eq!(rosa.name, "Rosa");
        assert_eq!(rosa.normalized_name, "rosa");
        assert!((rosa.confidence - 0.82).abs() < 1e-5, "got {}", rosa.confidence);
        assert_eq!(rosa.providers, vec!["a", "b"]);
        assert!(!merged.degraded);
    }

    #[test]
    fn test_normalization_whitespace_and_synonyms() {
        let merger = ResultMerger::new(
            MergeConfig::default().with_synonym("Rosa  Canina var. Dumalis", "rosa canina"),
        );

        assert_eq!(merger.normalize("  Rosa   canina "), "rosa canina");
        assert_eq!(merger.normalize("rosa canina var. dumalis"), "rosa canina");

        let merged = merger.merge(
            "fp",
            &[
                result("a", vec![Candidate::species("Rosa canina", 0.8)]),
                result("b", vec![Candidate::species("Rosa canina var. dumalis", 0.6)]),
            ],
            vec![],
            2,
            None,
        );
        assert_eq!(merged.candidates.len(), 1);
        assert!((merged.candidates[0].confidence - 0.7).abs() < 1e-5);
    }

    #[test]
    fn test_single_provider_keeps_raw_confidence() {
        let merged = weighted().merge(
            "fp",
            &[
                result("a", vec![Candidate::species("Rosa", 0.9)]),
                result("b", vec![Candidate::species("Malus", 0.5)]),
            ],
            vec![],
            2,
            None,
        );

        assert_eq!(merged.candidates[0].name, "Rosa");
        assert!((merged.candidates[0].confidence - 0.9).abs() < 1e-6);
        assert!((merged.candidates[1].confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_tie_breaks_on_highest_raw_confidence() {
        // Both combine to 0.5; Malus has the higher single report (0.75)
        let merger = ResultMerger::default();
        let merged = merger.merge(
            "fp",
            &[
                result(
                    "a",
                    vec![Candidate::species("Rosa", 0.5), Candidate::species("Malus", 0.75)],
                ),
                result(
                    "b",
                    vec![Candidate::species("Rosa", 0.5), Candidate::species("Malus", 0.25)],
                ),
            ],
            vec![],
            2,
            None,
        );

        let names: Vec<_> = merged.candidates.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Malus", "Rosa"]);
    }

    #[test]
    fn test_truncates_to_limit() {
        let candidates: Vec<_> = (0..15)
            .map(|i| Candidate::species(format!("Species {}", i), 0.05 * i as f32))
            .collect();
        let merger = ResultMerger::default();

        let merged = merger.merge("fp", &[result("a", candidates.clone())], vec![], 1, None);
        assert_eq!(merged.candidates.len(), DEFAULT_MAX_RESULTS);
        assert_eq!(merged.candidates[0].name, "Species 14");

        let merged = merger.merge("fp", &[result("a", candidates)], vec![], 1, Some(3));
        assert_eq!(merged.candidates.len(), 3);
    }

    #[test]
    fn test_degraded_when_provider_missing() {
        let failure = ProviderFailure {
            provider: "a".to_string(),
            reason: FailureReason::CircuitOpen,
            message: "circuit open".to_string(),
            retry_after_ms: Some(30_000),
        };
        let merged = weighted().merge(
            "fp",
            &[result("b", vec![Candidate::species("Rosa", 0.7)])],
            vec![failure.clone()],
            2,
            None,
        );

        assert!(merged.degraded);
        assert_eq!(merged.failures, vec![failure]);
        assert_eq!(merged.contributing_providers, vec!["b"]);
        assert!((merged.candidates[0].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_duplicate_within_provider_uses_strongest() {
        let merged = ResultMerger::default().merge(
            "fp",
            &[result(
                "a",
                vec![Candidate::species("Rosa", 0.3), Candidate::species("ROSA ", 0.8)],
            )],
            vec![],
            1,
            None,
        );
        assert_eq!(merged.candidates.len(), 1);
        assert!((merged.candidates[0].confidence - 0.8).abs() < 1e-6);
        assert_eq!(merged.candidates[0].name, "ROSA");
    }

    #[test]
    fn test_diseases_ranked_separately() {
        let merged = ResultMerger::default().merge(
            "fp",
            &[result(
                "a",
                vec![
                    Candidate::species("Rosa", 0.9),
                    Candidate::disease("Black spot", 0.4),
                ],
            )],
            vec![],
            1,
            None,
        );
        assert_eq!(merged.candidates.len(), 1);
        assert_eq!(merged.diseases.len(), 1);
        assert_eq!(merged.diseases[0].kind, CandidateKind::Disease);
    }

    #[test]
    fn test_metadata_from_most_trusted_and_names_unioned() {
        let merged = weighted().merge(
            "fp",
            &[
                result(
                    "a",
                    vec![Candidate::species("Rosa canina", 0.5)
                        .with_common_names(vec!["Dog rose".to_string()])
                        .with_metadata("family", "Rosaceae")],
                ),
                result(
                    "b",
                    vec![Candidate::species("Rosa canina", 0.9)
                        .with_common_names(vec!["dog rose".to_string(), "Briar".to_string()])
                        .with_metadata("family", "Rosaceae (b)")],
                ),
            ],
            vec![],
            2,
            None,
        );

        let candidate = &merged.candidates[0];
        assert_eq!(candidate.metadata.get("family").map(String::as_str), Some("Rosaceae"));
        assert_eq!(candidate.common_names, vec!["Dog rose", "Briar"]);
    }

    #[test]
    fn test_deterministic_regardless_of_provider_order() {
        let merger = weighted();
        let a = result("a", vec![Candidate::species("Rosa", 0.9), Candidate::species("Malus", 0.3)]);
        let b = result("b", vec![Candidate::species("rosa", 0.7), Candidate::species("Prunus", 0.3)]);

        let forward = merger.merge("fp", &[a.clone(), b.clone()], vec![], 2, None);
        let reverse = merger.merge("fp", &[b, a], vec![], 2, None);
        assert_eq!(
            serde_json::to_string(&forward).unwrap(),
            serde_json::to_string(&reverse).unwrap()
        );
    }
}

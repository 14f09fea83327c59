//! plant.id (Kindwise) identification adapter
//!
//! `POST {endpoint}/api/v3/identification` with a JSON body carrying the image
//! as a base64 data URI. Also reports disease suggestions when asked.

use super::http::{check_status, image_mime, HttpTransport};
use crate::error::ProviderError;
use crate::types::{Candidate, IdentificationProvider, IdentifyOptions, ProviderResult};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

pub const DEFAULT_ENDPOINT: &str = "https://plant.id";
const DETAILS: &str = "common_names,taxonomy,gbif_id";

#[derive(Debug, Serialize)]
struct IdentifyBody<'a> {
    images: Vec<String>,
    similar_images: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    health: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct IdentifyResponse {
    result: PlantIdResult,
}

#[derive(Debug, Deserialize)]
struct PlantIdResult {
    classification: Suggestions,
    #[serde(default)]
    disease: Option<Suggestions>,
}

#[derive(Debug, Deserialize)]
struct Suggestions {
    #[serde(default)]
    suggestions: Vec<Suggestion>,
}

#[derive(Debug, Deserialize)]
struct Suggestion {
    name: String,
    probability: f32,
    #[serde(default)]
    details: Option<SuggestionDetails>,
}

#[derive(Debug, Default, Deserialize)]
struct SuggestionDetails {
    #[serde(default)]
    common_names: Option<Vec<String>>,
    #[serde(default)]
    taxonomy: Option<Taxonomy>,
    #[serde(default)]
    gbif_id: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Taxonomy {
    #[serde(default)]
    family: Option<String>,
    #[serde(default)]
    genus: Option<String>,
}

/// Parse a plant.id identification response body into candidates
///
/// Disease suggestions are included only when `include_diseases` is set.
pub fn parse_response(body: &str, include_diseases: bool) -> Result<Vec<Candidate>, ProviderError> {
    let response: IdentifyResponse = serde_json::from_str(body)
        .map_err(|e| ProviderError::MalformedResponse(format!("plant.id: {}", e)))?;

    let mut candidates: Vec<Candidate> = response
        .result
        .classification
        .suggestions
        .into_iter()
        .map(species_candidate)
        .collect();

    if include_diseases {
        if let Some(disease) = response.result.disease {
            candidates.extend(
                disease
                    .suggestions
                    .into_iter()
                    .map(|s| Candidate::disease(s.name, s.probability)),
            );
        }
    }

    Ok(candidates)
}

fn species_candidate(suggestion: Suggestion) -> Candidate {
    let details = suggestion.details.unwrap_or_default();
    let mut candidate = Candidate::species(suggestion.name, suggestion.probability)
        .with_common_names(details.common_names.unwrap_or_default());

    if let Some(taxonomy) = details.taxonomy {
        if let Some(family) = taxonomy.family {
            candidate = candidate.with_metadata("family", family);
        }
        if let Some(genus) = taxonomy.genus {
            candidate = candidate.with_metadata("genus", genus);
        }
    }
    match details.gbif_id {
        Some(serde_json::Value::Null) | None => {}
        Some(serde_json::Value::String(id)) => candidate = candidate.with_metadata("gbif_id", id),
        Some(other) => candidate = candidate.with_metadata("gbif_id", other.to_string()),
    }
    candidate
}

/// plant.id adapter
#[derive(Debug)]
pub struct PlantIdProvider {
    name: String,
    endpoint: String,
    api_key: String,
    transport: HttpTransport,
}

impl PlantIdProvider {
    pub fn new(
        name: impl Into<String>,
        endpoint: Option<String>,
        api_key: impl Into<String>,
        transport: HttpTransport,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.into(),
            transport,
        }
    }
}

#[async_trait]
impl IdentificationProvider for PlantIdProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_diseases(&self) -> bool {
        true
    }

    async fn ready(&self) {
        self.transport.pace().await;
    }

    async fn identify(
        &self,
        image: &[u8],
        options: &IdentifyOptions,
    ) -> Result<ProviderResult, ProviderError> {
        let started = Instant::now();

        let url = format!("{}/api/v3/identification", self.endpoint);
        let body = IdentifyBody {
            images: vec![format!(
                "data:{};base64,{}",
                image_mime(image),
                STANDARD.encode(image)
            )],
            similar_images: false,
            health: options.include_diseases.then_some("all"),
        };

        debug!(provider = %self.name, url = %url, "Querying plant.id");

        let response = self
            .transport
            .client()
            .post(&url)
            .header("Api-Key", &self.api_key)
            .query(&[("details", DETAILS), ("language", options.language.as_str())])
            .json(&body)
            .send()
            .await?;

        let text = check_status(response).await?.text().await?;
        let candidates = parse_response(&text, options.include_diseases)?;

        Ok(ProviderResult {
            latency: started.elapsed(),
            ..ProviderResult::new(self.name.clone(), candidates)
        })
    }
}

//! Pl@ntNet identification adapter
//!
//! `POST {endpoint}/v2/identify/{project}` with the image as multipart form
//! data. Species only; Pl@ntNet has no disease endpoint.

use super::http::{check_status, image_mime, HttpTransport};
use crate::error::ProviderError;
use crate::types::{Candidate, IdentificationProvider, IdentifyOptions, Organ, ProviderResult};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_ENDPOINT: &str = "https://my-api.plantnet.org";
const PROJECT: &str = "all";
/// Results requested from the API
const NB_RESULTS: usize = 10;

#[derive(Debug, Deserialize)]
struct IdentifyResponse {
    #[serde(default)]
    results: Vec<PlantNetResult>,
}

#[derive(Debug, Deserialize)]
struct PlantNetResult {
    score: f32,
    species: PlantNetSpecies,
    #[serde(default)]
    gbif: Option<PlantNetGbif>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlantNetSpecies {
    scientific_name_without_author: String,
    #[serde(default)]
    scientific_name_authorship: Option<String>,
    #[serde(default)]
    genus: Option<PlantNetTaxon>,
    #[serde(default)]
    family: Option<PlantNetTaxon>,
    #[serde(default)]
    common_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlantNetTaxon {
    scientific_name_without_author: String,
}

#[derive(Debug, Deserialize)]
struct PlantNetGbif {
    id: serde_json::Value,
}

/// Parse a Pl@ntNet identify response body into candidates
pub fn parse_response(body: &str) -> Result<Vec<Candidate>, ProviderError> {
    let response: IdentifyResponse = serde_json::from_str(body)
        .map_err(|e| ProviderError::MalformedResponse(format!("Pl@ntNet: {}", e)))?;

    let candidates = response
        .results
        .into_iter()
        .map(|result| {
            let species = result.species;
            let mut candidate = Candidate::species(species.scientific_name_without_author, result.score)
                .with_common_names(species.common_names);

            if let Some(author) = species.scientific_name_authorship.filter(|a| !a.is_empty()) {
                candidate = candidate.with_metadata("authorship", author);
            }
            if let Some(genus) = species.genus {
                candidate = candidate.with_metadata("genus", genus.scientific_name_without_author);
            }
            if let Some(family) = species.family {
                candidate = candidate.with_metadata("family", family.scientific_name_without_author);
            }
            if let Some(gbif) = result.gbif {
                let id = match gbif.id {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                candidate = candidate.with_metadata("gbif_id", id);
            }
            candidate
        })
        .collect();

    Ok(candidates)
}

/// Pl@ntNet adapter
#[derive(Debug)]
pub struct PlantNetProvider {
    name: String,
    endpoint: String,
    api_key: String,
    transport: HttpTransport,
}

impl PlantNetProvider {
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

    fn form(&self, image: &[u8], options: &IdentifyOptions) -> Result<Form, ProviderError> {
        let part = Part::bytes(image.to_vec())
            .file_name("image")
            .mime_str(image_mime(image))
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        // One organ per image; the remaining ones cannot be attributed
        let organ = match options.primary_organ() {
            Organ::Auto => "auto",
            other => other.as_str(),
        };

        Ok(Form::new().part("images", part).text("organs", organ))
    }
}

#[async_trait]
impl IdentificationProvider for PlantNetProvider {
    fn name(&self) -> &str {
        &self.name
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

        let url = format!("{}/v2/identify/{}", self.endpoint, PROJECT);
        let nb_results = options.max_results.unwrap_or(NB_RESULTS).to_string();

        debug!(provider = %self.name, url = %url, "Querying Pl@ntNet");

        let response = self
            .transport
            .client()
            .post(&url)
            .query(&[
                ("api-key", self.api_key.as_str()),
                ("lang", options.language.as_str()),
                ("nb-results", nb_results.as_str()),
                ("include-related-images", "false"),
            ])
            .multipart(self.form(image, options)?)
            .send()
            .await?;

        // "Species not found" is a valid, empty answer
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(self.result(Vec::new(), started.elapsed()));
        }

        let body = check_status(response).await?.text().await?;
        let candidates = parse_response(&body)?;
        Ok(self.result(candidates, started.elapsed()))
    }
}

impl PlantNetProvider {
    fn result(&self, candidates: Vec<Candidate>, latency: Duration) -> ProviderResult {
        ProviderResult {
            latency,
            ..ProviderResult::new(self.name.clone(), candidates)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "query": { "project": "all", "organs": ["flower"] },
        "language": "en",
        "bestMatch": "Rosa canina L.",
        "results": [
            {
                "score": 0.87,
                "species": {
                    "scientificNameWithoutAuthor": "Rosa canina",
                    "scientificNameAuthorship": "L.",
                    "genus": { "scientificNameWithoutAuthor": "Rosa" },
                    "family": { "scientificNameWithoutAuthor": "Rosaceae" },
                    "commonNames": ["Dog rose", "Briar"]
                },
                "gbif": { "id": "8395064" }
            },
            {
                "score": 0.05,
                "species": {
                    "scientificNameWithoutAuthor": "Rosa rubiginosa",
                    "commonNames": []
                }
            }
        ],
        "remainingIdentificationRequests": 488
    }"#;

    #[test]
    fn test_parse_response() {
        let candidates = parse_response(SAMPLE).unwrap();
        assert_eq!(candidates.len(), 2);

        let first = &candidates[0];
        assert_eq!(first.name, "Rosa canina");
        assert!((first.confidence - 0.87).abs() < 1e-6);
        assert_eq!(first.common_names, vec!["Dog rose", "Briar"]);
        assert_eq!(first.metadata.get("family").map(String::as_str), Some("Rosaceae"));
        assert_eq!(first.metadata.get("gbif_id").map(String::as_str), Some("8395064"));
        assert!(candidates[1].metadata.is_empty());
    }

    #[test]
    fn test_numeric_gbif_id() {
        let body = r#"{"results":[{"score":0.5,"species":{"scientificNameWithoutAuthor":"Malus"},"gbif":{"id":3001}}]}"#;
        let candidates = parse_response(body).unwrap();
        assert_eq!(candidates[0].metadata.get("gbif_id").map(String::as_str), Some("3001"));
    }

    #[test]
    fn test_malformed_response() {
        let err = parse_response("<html>gateway</html>").unwrap_err();
        assert!(matches!(err, ProviderError::MalformedResponse(_)));
    }

    #[test]
    fn test_endpoint_trailing_slash_trimmed() {
        let transport = HttpTransport::new(Duration::from_secs(1), None).unwrap();
        let provider = PlantNetProvider::new(
            "plantnet",
            Some("http://localhost:8080/".to_string()),
            "key",
            transport,
        );
        assert_eq!(provider.endpoint, "http://localhost:8080");
        assert!(!provider.supports_diseases());
    }

    #[tokio::test]
    async fn test_ready_waits_for_paced_slot() {
        let transport = HttpTransport::new(Duration::from_secs(1), Some(20.0)).unwrap();
        let provider = PlantNetProvider::new("plantnet", None, "key", transport);

        provider.ready().await;
        let started = std::time::Instant::now();
        provider.ready().await;
        assert!(started.elapsed() >= Duration::from_millis(30), "Second call waits for quota");
    }
}

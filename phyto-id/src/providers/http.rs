//! Shared HTTP plumbing for provider adapters
//!
//! One `reqwest::Client` per adapter plus optional outbound pacing. Pacing
//! only spaces requests to respect a provider's published quota; retrying is
//! left to the breaker and orchestrator layers.

use crate::error::ProviderError;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("phyto-id/", env!("CARGO_PKG_VERSION"));

/// Longest error body kept in error messages
const MAX_ERROR_BODY: usize = 512;

/// HTTP client with optional request pacing
pub struct HttpTransport {
    client: reqwest::Client,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("paced", &self.limiter.is_some())
            .finish()
    }
}

impl HttpTransport {
    /// Build a transport
    ///
    /// # Arguments
    /// * `timeout` - Hard client-side timeout per request
    /// * `requests_per_second` - Outbound pacing; `None` or non-positive disables it
    pub fn new(timeout: Duration, requests_per_second: Option<f64>) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let limiter = requests_per_second
            .filter(|rps| rps.is_finite() && *rps > 0.0)
            .and_then(|rps| Quota::with_period(Duration::from_secs_f64(1.0 / rps)))
            .map(RateLimiter::direct);

        Ok(Self { client, limiter })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Wait for an outbound slot
    pub async fn pace(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }
}

/// Pass successful responses through, map the rest to `ProviderError`
pub(crate) async fn check_status(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    debug!(status = status.as_u16(), "Provider returned error status");
    Err(map_status(status, truncate(body), retry_after))
}

/// Classify an error status
pub(crate) fn map_status(
    status: StatusCode,
    body: String,
    retry_after: Option<Duration>,
) -> ProviderError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited {
            message: body,
            retry_after,
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ProviderError::Timeout(body),
        _ => ProviderError::Api {
            status: status.as_u16(),
            message: body,
        },
    }
}

/// `Retry-After` in delta-seconds form
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// MIME type of an image from its magic bytes
pub(crate) fn image_mime(image: &[u8]) -> &'static str {
    infer::get(image)
        .map(|kind| kind.mime_type())
        .unwrap_or("application/octet-stream")
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

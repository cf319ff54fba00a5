// Remote Scorer Service
// Optional black-box scorer reached over HTTP. Only derived features and a content
// hash ever leave the process.

use async_trait::async_trait;
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::env;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::models::{
    ContentKey, FeatureVector, RemoteMetadata, RemoteScoreRequest, RemoteScoreResponse,
};

/// Overrides the configured endpoint when set.
pub const REMOTE_URL_ENV: &str = "CLOSEAI_REMOTE_URL";

#[derive(Error, Debug)]
pub enum RemoteScorerError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("timed out after {0} ms")]
    Timeout(u64),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait RemoteScorer: Send + Sync {
    fn name(&self) -> &str;

    async fn score(&self, request: &RemoteScoreRequest) -> Result<RemoteScoreResponse, RemoteScorerError>;
}

/// SHA-256 hex digest of a content key.
pub fn content_hash(key: &ContentKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// Build the wire request for a unit. The key itself is hashed, never sent.
pub fn build_request(
    key: &ContentKey,
    features: &FeatureVector,
    metadata: Option<RemoteMetadata>,
) -> RemoteScoreRequest {
    RemoteScoreRequest {
        content_hash: content_hash(key),
        features: features.clone(),
        metadata,
    }
}

/// Resolve the endpoint, letting the environment override configuration.
pub fn resolve_url(configured: Option<&str>) -> Option<String> {
    env::var(REMOTE_URL_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| configured.map(str::to_string))
        .filter(|v| !v.trim().is_empty())
}

pub(crate) fn validate_response(
    response: RemoteScoreResponse,
) -> Result<RemoteScoreResponse, RemoteScorerError> {
    if !response.score.is_finite() || !(0.0..=1.0).contains(&response.score) {
        return Err(RemoteScorerError::InvalidResponse(format!(
            "score out of range: {}",
            response.score
        )));
    }
    let confidence = response
        .confidence
        .filter(|c| c.is_finite())
        .map(|c| c.clamp(0.0, 1.0));
    Ok(RemoteScoreResponse {
        score: response.score,
        confidence,
    })
}

pub struct HttpRemoteScorer {
    client: Client,
    url: String,
}

impl HttpRemoteScorer {
    pub fn new(url: &str, timeout_ms: u64) -> Result<Self, RemoteScorerError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms.max(1)))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RemoteScorer for HttpRemoteScorer {
    fn name(&self) -> &str {
        "http"
    }

    async fn score(&self, request: &RemoteScoreRequest) -> Result<RemoteScoreResponse, RemoteScorerError> {
        let start = Instant::now();

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteScorerError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let data: RemoteScoreResponse = response
            .json()
            .await
            .map_err(|e| RemoteScorerError::InvalidResponse(e.to_string()))?;

        tracing::debug!(
            "[REMOTE] scored hash={} latency_ms={}",
            &request.content_hash[..12.min(request.content_hash.len())],
            start.elapsed().as_millis()
        );

        validate_response(data)
    }
}

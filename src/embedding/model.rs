//! Model-backed embedding client for OpenAI-compatible endpoints.
//!
//! Batching, caching, and fallback degradation live in the engine; this
//! client owns the wire format, the retry policy, and vector hygiene. Every
//! vector it returns is dimension-checked and unit-normalized, so a success
//! here is directly insertable into the index. Any failure covers the whole
//! request and the engine degrades the affected items individually.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::fallback::unit_normalize;
use super::ModelSettings;

const RETRY_BASE_MS: u64 = 500;
const RETRY_EXP_CAP: u32 = 5;

/// Blocking embeddings client. Constructed once per process; the engine
/// drives it from `spawn_blocking`.
pub struct ModelEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: Option<usize>,
    max_retries: usize,
}

impl ModelEmbedder {
    /// Builds a client from the engine's model settings.
    pub fn new(settings: &ModelSettings) -> Result<Self> {
        anyhow::ensure!(
            !settings.api_key.trim().is_empty(),
            "missing embeddings API key"
        );
        anyhow::ensure!(
            !settings.model.trim().is_empty(),
            "missing embedding model name"
        );
        let mut headers = reqwest::header::HeaderMap::new();
        let auth = format!("Bearer {}", settings.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).context("invalid embeddings API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(settings.timeout)
            .default_headers(headers)
            .build()
            .context("failed to build embeddings HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", settings.base_url.trim_end_matches('/')),
            model: settings.model.clone(),
            dimensions: settings.dimensions,
            max_retries: settings.max_retries,
        })
    }

    /// Model identifier this client embeds with.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Issues a single tiny request to verify the endpoint and model are
    /// reachable before the engine commits to model-backed mode.
    pub fn warmup(&self) -> Result<()> {
        self.embed_batch(&["warmup"]).map(|_| ())
    }

    /// Sends one batch and returns unit-normalized vectors in input order.
    pub fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let response = self.send_with_retry(inputs)?;
        self.into_vectors(response, inputs.len())
    }

    fn send_with_retry(&self, inputs: &[&str]) -> Result<EmbeddingResponse> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: inputs,
            dimensions: self.dimensions,
        };
        let mut attempt = 0usize;
        loop {
            let outcome = match self.client.post(&self.endpoint).json(&request).send() {
                Ok(resp) if resp.status().is_success() => {
                    return resp.json().context("failed to parse embedding response");
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp
                        .text()
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    Attempt::Http(status, body)
                }
                Err(err) => Attempt::Transport(err),
            };
            if outcome.retryable() && attempt < self.max_retries {
                attempt += 1;
                thread::sleep(backoff(attempt));
                continue;
            }
            return Err(outcome.into_error());
        }
    }

    fn into_vectors(
        &self,
        mut response: EmbeddingResponse,
        expected: usize,
    ) -> Result<Vec<Vec<f32>>> {
        anyhow::ensure!(
            response.data.len() == expected,
            "endpoint returned {} embeddings for {} inputs",
            response.data.len(),
            expected
        );
        response.data.sort_by_key(|entry| entry.index);
        response
            .data
            .into_iter()
            .map(|entry| {
                let mut vector = entry.embedding;
                anyhow::ensure!(!vector.is_empty(), "endpoint returned an empty vector");
                if let Some(width) = self.dimensions {
                    anyhow::ensure!(
                        vector.len() == width,
                        "endpoint returned a {}-lane vector, expected {}",
                        vector.len(),
                        width
                    );
                }
                unit_normalize(&mut vector);
                Ok(vector)
            })
            .collect()
    }
}

enum Attempt {
    Http(StatusCode, String),
    Transport(reqwest::Error),
}

impl Attempt {
    fn retryable(&self) -> bool {
        match self {
            Attempt::Http(status, _) => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            Attempt::Transport(err) => err.is_timeout() || err.is_connect() || err.is_request(),
        }
    }

    fn into_error(self) -> anyhow::Error {
        match self {
            Attempt::Http(status, body) => {
                anyhow::anyhow!("embeddings request failed ({status}): {body}")
            }
            Attempt::Transport(err) => err.into(),
        }
    }
}

fn backoff(attempt: usize) -> Duration {
    let exp = (attempt as u32).min(RETRY_EXP_CAP);
    Duration::from_millis(RETRY_BASE_MS << exp)
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ModelSettings {
        ModelSettings {
            api_key: "test-key".to_string(),
            base_url: "http://localhost:9/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimensions: Some(3),
            timeout: Duration::from_millis(100),
            max_retries: 0,
        }
    }

    fn entry(index: usize, embedding: Vec<f32>) -> EmbeddingData {
        EmbeddingData { embedding, index }
    }

    #[test]
    fn missing_key_is_rejected_at_construction() {
        let mut bad = settings();
        bad.api_key = "  ".to_string();
        assert!(ModelEmbedder::new(&bad).is_err());
    }

    #[test]
    fn response_vectors_come_back_ordered_and_normalized() {
        let embedder = ModelEmbedder::new(&settings()).unwrap();
        let response = EmbeddingResponse {
            data: vec![
                entry(1, vec![0.0, 4.0, 0.0]),
                entry(0, vec![3.0, 0.0, 0.0]),
            ],
        };
        let vectors = embedder.into_vectors(response, 2).unwrap();
        assert_eq!(vectors[0], vec![1.0, 0.0, 0.0]);
        assert_eq!(vectors[1], vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn wrong_width_vector_is_an_error() {
        let embedder = ModelEmbedder::new(&settings()).unwrap();
        let response = EmbeddingResponse {
            data: vec![entry(0, vec![1.0, 2.0])],
        };
        assert!(embedder.into_vectors(response, 1).is_err());
    }

    #[test]
    fn short_response_is_an_error() {
        let embedder = ModelEmbedder::new(&settings()).unwrap();
        let response = EmbeddingResponse {
            data: vec![entry(0, vec![1.0, 0.0, 0.0])],
        };
        assert!(embedder.into_vectors(response, 2).is_err());
    }

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff(1), Duration::from_millis(1000));
        assert_eq!(backoff(2), Duration::from_millis(2000));
        assert_eq!(backoff(9), backoff(5));
    }
}

//! Embedding clients that turn chunk texts into vectors.
//!
//! The hashing client is deterministic and needs no runtime, which makes it the default for
//! local runs and tests. The Ollama client talks to `/api/embed` directly over reqwest.

use crate::config::{Config, EmbeddingProvider};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";

/// Errors raised by embedding providers.
#[derive(Debug, Error)]
pub enum EmbeddingClientError {
    /// Provider was unable to produce embeddings for the supplied input.
    #[error("Failed to generate embeddings: {0}")]
    GenerationFailed(String),
    /// Provider could not be reached.
    #[error("Embedding provider unavailable: {0}")]
    ProviderUnavailable(String),
    /// Provider response could not be decoded.
    #[error("Malformed provider response: {0}")]
    InvalidResponse(String),
    /// Provider returned a different number of vectors than texts submitted.
    #[error("Expected {expected} embeddings but received {actual}")]
    CountMismatch {
        /// Texts submitted.
        expected: usize,
        /// Vectors returned.
        actual: usize,
    },
}

/// Interface implemented by embedding backends.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Produce an embedding vector for each supplied chunk of text, in order.
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError>;
}

/// Deterministic embedding client that hashes bytes into a fixed-size unit vector.
pub struct HashEmbeddingClient {
    dimension: usize,
}

impl HashEmbeddingClient {
    /// Construct a client producing vectors of `dimension` components.
    pub const fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn encode(text: &str, dimension: usize) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; dimension];

        if text.is_empty() {
            return embedding;
        }

        for (idx, byte) in text.bytes().enumerate() {
            let position = idx % dimension;
            embedding[position] += f32::from(byte) / 255.0;
        }

        let norm = embedding
            .iter()
            .map(|value| value * value)
            .sum::<f32>()
            .sqrt();

        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }

        embedding
    }
}

#[async_trait]
impl EmbeddingClient for HashEmbeddingClient {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        tracing::debug!(
            dimension = self.dimension,
            batch = texts.len(),
            "Generating hash embeddings"
        );

        if self.dimension == 0 {
            return Err(EmbeddingClientError::GenerationFailed(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }

        if texts.is_empty() {
            return Err(EmbeddingClientError::GenerationFailed(
                "no texts provided".to_string(),
            ));
        }

        Ok(texts
            .iter()
            .map(|text| Self::encode(text, self.dimension))
            .collect())
    }
}

/// Embedding client backed by a local Ollama runtime.
pub struct OllamaEmbeddingClient {
    http: Client,
    base_url: String,
    model: String,
}

impl OllamaEmbeddingClient {
    /// Create a client for `model` served at `base_url`.
    pub fn new(base_url: String, model: String) -> Result<Self, EmbeddingClientError> {
        let http = Client::builder()
            .user_agent("rusty-ingest/embed")
            .build()
            .map_err(|error| EmbeddingClientError::ProviderUnavailable(error.to_string()))?;
        Ok(Self {
            http,
            base_url,
            model,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/embed", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingClient for OllamaEmbeddingClient {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        let expected = texts.len();
        let payload = json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .http
            .post(self.endpoint())
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                EmbeddingClientError::ProviderUnavailable(format!(
                    "failed to reach Ollama at {}: {error}",
                    self.base_url
                ))
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(EmbeddingClientError::ProviderUnavailable(format!(
                "Ollama endpoint {} returned 404",
                self.endpoint()
            )));
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingClientError::GenerationFailed(format!(
                "Ollama returned {status}: {body}"
            )));
        }

        let body: OllamaEmbedResponse = response.json().await.map_err(|error| {
            EmbeddingClientError::InvalidResponse(format!(
                "failed to decode Ollama response: {error}"
            ))
        })?;

        if body.embeddings.len() != expected {
            return Err(EmbeddingClientError::CountMismatch {
                expected,
                actual: body.embeddings.len(),
            });
        }
        Ok(body.embeddings)
    }
}

/// Build the embedding client selected by configuration.
pub fn build_embedding_client(
    config: &Config,
) -> Result<Arc<dyn EmbeddingClient>, EmbeddingClientError> {
    match config.embedding_provider {
        EmbeddingProvider::Hash => Ok(Arc::new(HashEmbeddingClient::new(
            config.embedding_dimension,
        ))),
        EmbeddingProvider::Ollama => {
            let base_url = config
                .ollama_url
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
            Ok(Arc::new(OllamaEmbeddingClient::new(
                base_url,
                config.embedding_model.clone(),
            )?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    #[tokio::test]
    async fn hash_client_is_deterministic_and_normalized() {
        let client = HashEmbeddingClient::new(8);
        let first = client
            .generate_embeddings(vec!["alpha".into(), "beta".into()])
            .await
            .expect("embeddings");
        let second = client
            .generate_embeddings(vec!["alpha".into()])
            .await
            .expect("embeddings");

        assert_eq!(first.len(), 2);
        assert_eq!(first[0], second[0]);
        let norm: f32 = first[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn hash_client_rejects_zero_dimension() {
        let client = HashEmbeddingClient::new(0);
        let err = client
            .generate_embeddings(vec!["alpha".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, EmbeddingClientError::GenerationFailed(_)));
    }

    #[tokio::test]
    async fn ollama_client_returns_embeddings_in_order() {
        let server = MockServer::start_async().await;
        let client = OllamaEmbeddingClient::new(server.base_url(), "nomic-embed-text".into())
            .expect("client");

        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/embed")
                    .json_body_partial(r#"{"model": "nomic-embed-text", "input": ["a", "b"]}"#);
                then.status(200).json_body(json!({
                    "embeddings": [[0.1, 0.2], [0.3, 0.4]]
                }));
            })
            .await;

        let vectors = client
            .generate_embeddings(vec!["a".into(), "b".into()])
            .await
            .expect("embeddings");

        mock.assert_async().await;
        assert_eq!(vectors, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
    }

    #[tokio::test]
    async fn ollama_client_flags_count_mismatch() {
        let server = MockServer::start_async().await;
        let client = OllamaEmbeddingClient::new(server.base_url(), "m".into()).expect("client");

        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed");
                then.status(200)
                    .json_body(json!({ "embeddings": [[0.1, 0.2]] }));
            })
            .await;

        let err = client
            .generate_embeddings(vec!["a".into(), "b".into()])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EmbeddingClientError::CountMismatch {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[tokio::test]
    async fn ollama_client_surfaces_server_errors() {
        let server = MockServer::start_async().await;
        let client = OllamaEmbeddingClient::new(server.base_url(), "m".into()).expect("client");

        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed");
                then.status(500).body("model not loaded");
            })
            .await;

        let err = client
            .generate_embeddings(vec!["a".into()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("model not loaded"));
    }
}

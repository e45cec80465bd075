//! Embedding client abstraction and the Ollama-backed adapter.
//!
//! The adapter issues HTTP requests directly to the runtime rather than pulling in a
//! provider SDK, mirroring the vector-store client.

use crate::config::get_config;
use crate::resilience::timeouts;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

/// Errors raised by embedding providers.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Provider was unreachable or returned an error response.
    #[error("Failed to generate embeddings: {0}")]
    GenerationFailed(String),
    /// Provider response could not be parsed.
    #[error("Malformed embedding response: {0}")]
    InvalidResponse(String),
    /// Returned vector dimension does not match configuration.
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension configured on the server.
        expected: usize,
        /// Dimension produced by the provider.
        actual: usize,
    },
}

/// Interface implemented by embedding backends.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Produce an embedding vector for a single text.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Produce an embedding vector for each supplied text.
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Ollama-backed embedding client speaking the `/api/embed` endpoint.
pub struct OllamaEmbeddingClient {
    pub(crate) http: Client,
    pub(crate) base_url: String,
    pub(crate) model: String,
    pub(crate) dimension: usize,
}

impl OllamaEmbeddingClient {
    /// Construct a client from the process configuration.
    pub fn new() -> Self {
        let config = get_config();
        let http = Client::builder()
            .user_agent("docquery/embed")
            .connect_timeout(timeouts::HTTP_CONNECT)
            .build()
            .expect("Failed to construct reqwest::Client for embeddings");
        Self {
            http,
            base_url: config.ollama_url.clone(),
            model: config.embedding_model.clone(),
            dimension: config.embedding_dimension,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/embed", self.base_url.trim_end_matches('/'))
    }
}

impl Default for OllamaEmbeddingClient {
    fn default() -> Self {
        Self::new()
    }
}

impl OllamaEmbeddingClient {
    async fn request_embeddings(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let payload = json!({
            "model": self.model,
            "input": inputs,
        });

        let response = self
            .http
            .post(self.endpoint())
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                EmbeddingError::GenerationFailed(format!(
                    "failed to reach Ollama at {}: {error}",
                    self.base_url
                ))
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(EmbeddingError::GenerationFailed(format!(
                "Ollama endpoint {} returned 404",
                self.endpoint()
            )));
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::GenerationFailed(format!(
                "Ollama returned {status}: {body}"
            )));
        }

        let body: EmbedResponse = response.json().await.map_err(|error| {
            EmbeddingError::InvalidResponse(format!("failed to decode embed response: {error}"))
        })?;

        if body.embeddings.len() != inputs.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                inputs.len(),
                body.embeddings.len()
            )));
        }

        for vector in &body.embeddings {
            if vector.len() != self.dimension {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: self.dimension,
                    actual: vector.len(),
                });
            }
        }

        Ok(body.embeddings)
    }
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingClient for OllamaEmbeddingClient {
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.request_embeddings(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::InvalidResponse("no vector returned".to_string()))
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request_embeddings(texts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    fn client_for(server: &MockServer, dimension: usize) -> OllamaEmbeddingClient {
        OllamaEmbeddingClient {
            http: Client::builder()
                .user_agent("docquery-test")
                .build()
                .expect("client"),
            base_url: server.base_url(),
            model: "nomic-embed-text".into(),
            dimension,
        }
    }

    #[tokio::test]
    async fn embed_many_returns_one_vector_per_input() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed");
                then.status(200).json_body(serde_json::json!({
                    "model": "nomic-embed-text",
                    "embeddings": [[0.1, 0.2], [0.3, 0.4]]
                }));
            })
            .await;

        let client = client_for(&server, 2);
        let vectors = client
            .embed_many(&["alpha".to_string(), "beta".to_string()])
            .await
            .expect("embeddings");

        mock.assert();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0], vec![0.1, 0.2]);
    }

    #[tokio::test]
    async fn embed_one_rejects_dimension_mismatch() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed");
                then.status(200).json_body(serde_json::json!({
                    "embeddings": [[0.1, 0.2, 0.3]]
                }));
            })
            .await;

        let client = client_for(&server, 2);
        let error = client.embed_one("alpha").await.expect_err("mismatch");
        assert!(matches!(
            error,
            EmbeddingError::DimensionMismatch { expected: 2, actual: 3 }
        ));
    }

    #[tokio::test]
    async fn embed_many_surfaces_error_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embed");
                then.status(500).body("boom");
            })
            .await;

        let client = client_for(&server, 2);
        let error = client
            .embed_many(&["alpha".to_string()])
            .await
            .expect_err("error response");
        assert!(matches!(error, EmbeddingError::GenerationFailed(message) if message.contains("500")));
    }
}

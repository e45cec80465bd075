//! Chat-completion client abstraction and the Ollama-backed adapter.

use crate::config::get_config;
use crate::resilience::timeouts;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced while generating chat completions.
#[derive(Debug, Error)]
pub enum CompletionError {
    /// Provider was unreachable or returned an error response.
    #[error("Failed to generate completion: {0}")]
    GenerationFailed(String),
    /// Provider response could not be parsed.
    #[error("Malformed completion response: {0}")]
    InvalidResponse(String),
}

/// Role tag for a chat message.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// System instruction framing the assistant's behavior.
    System,
    /// End-user turn.
    User,
}

/// One message in a chat prompt.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    /// Message role.
    pub role: ChatRole,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Build a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    /// Build a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// Interface implemented by chat-completion backends.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Generate a completion for the supplied prompt messages.
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, CompletionError>;
}

/// Ollama-backed chat client speaking the `/api/chat` endpoint.
pub struct OllamaCompletionClient {
    pub(crate) http: Client,
    pub(crate) base_url: String,
    pub(crate) model: String,
}

impl OllamaCompletionClient {
    /// Construct a client from the process configuration.
    pub fn new() -> Self {
        let config = get_config();
        let http = Client::builder()
            .user_agent("docquery/chat")
            .connect_timeout(timeouts::HTTP_CONNECT)
            .build()
            .expect("Failed to construct reqwest::Client for chat completions");
        Self {
            http,
            base_url: config.ollama_url.clone(),
            model: config.completion_model.clone(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/chat", self.base_url.trim_end_matches('/'))
    }
}

impl Default for OllamaCompletionClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
    done: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[async_trait]
impl CompletionClient for OllamaCompletionClient {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, CompletionError> {
        let payload = json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
            "options": {
                // Deterministic answers for repeatable retrieval QA.
                "temperature": 0.0,
            }
        });

        let response = self
            .http
            .post(self.endpoint())
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                CompletionError::GenerationFailed(format!(
                    "failed to reach Ollama at {}: {error}",
                    self.base_url
                ))
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(CompletionError::GenerationFailed(format!(
                "Ollama endpoint {} returned 404",
                self.endpoint()
            )));
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::GenerationFailed(format!(
                "Ollama returned {status}: {body}"
            )));
        }

        let body: ChatResponse = response.json().await.map_err(|error| {
            CompletionError::InvalidResponse(format!("failed to decode chat response: {error}"))
        })?;

        if !body.done {
            return Err(CompletionError::InvalidResponse(
                "chat response incomplete (streaming not supported)".into(),
            ));
        }

        Ok(body.message.content.trim().to_string())
    }
}

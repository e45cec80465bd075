//! Process-wide registry of long-lived external-service handles.
//!
//! The registry is constructed empty, initialized exactly once near process start, and then
//! shared read-only through an `Arc` by every request. All three sub-initializations run
//! concurrently and the first failure cancels the others; a registry that failed to
//! initialize must never serve traffic.

use crate::completion::{ChatMessage, CompletionClient, OllamaCompletionClient};
use crate::config::get_config;
use crate::embedding::{EmbeddingClient, OllamaEmbeddingClient};
use crate::errors::QueryError;
use crate::qdrant::QdrantService;
use crate::resilience::{self, RetryPolicy, timeouts};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Lifecycle of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryState {
    /// No initialization attempted yet.
    Uninitialized,
    /// Initialization in progress.
    Initializing,
    /// All handles connected and verified.
    Ready,
    /// Initialization failed; the process must not serve traffic.
    Failed,
}

/// Health classification for one component probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Probe succeeded within the deadline.
    Healthy,
    /// Probe failed.
    Unhealthy,
    /// Probe did not answer within the deadline.
    Timeout,
}

/// Result of probing a single component.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    /// Component identifier.
    pub service: String,
    /// Probe classification.
    pub status: HealthStatus,
    /// Probe latency in seconds, when the probe completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<f64>,
    /// Failure description, when unhealthy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// RFC3339 probe timestamp.
    pub timestamp: String,
}

/// Structured health report across all registry components.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryHealth {
    /// `healthy` only when every component is healthy.
    pub overall_status: HealthStatus,
    /// Per-component probe results keyed by component name.
    pub components: BTreeMap<String, ComponentHealth>,
    /// Whether all handles have been initialized.
    pub initialized: bool,
}

/// Holder of the expensive, long-lived service handles.
pub struct ResourceRegistry {
    state: Mutex<RegistryState>,
    index: OnceLock<Arc<QdrantService>>,
    embeddings: OnceLock<Arc<dyn EmbeddingClient>>,
    completion: OnceLock<Arc<dyn CompletionClient>>,
    pub(crate) index_retry: RetryPolicy,
    pub(crate) model_retry: RetryPolicy,
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceRegistry {
    /// Create an empty, uninitialized registry.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::Uninitialized),
            index: OnceLock::new(),
            embeddings: OnceLock::new(),
            completion: OnceLock::new(),
            index_retry: RetryPolicy::new(3, 2.0),
            model_retry: RetryPolicy::new(3, 1.5),
        }
    }

    /// Connect and verify all three handles.
    ///
    /// The sub-initializations run concurrently; the first failure propagates immediately
    /// and transitions the registry to [`RegistryState::Failed`].
    pub async fn initialize(&self) -> Result<(), QueryError> {
        tracing::info!("Initializing global resources");
        self.set_state(RegistryState::Initializing);

        let result = tokio::try_join!(
            self.initialize_index(),
            self.initialize_embeddings(),
            self.initialize_completion(),
        );

        match result {
            Ok(_) if self.is_ready() => {
                self.set_state(RegistryState::Ready);
                tracing::info!("All resources initialized successfully");
                Ok(())
            }
            Ok(_) => {
                self.set_state(RegistryState::Failed);
                Err(QueryError::resource(
                    "global_resources",
                    "one or more resources failed to initialize properly",
                ))
            }
            Err(error) => {
                self.set_state(RegistryState::Failed);
                tracing::error!(error = %error, "Resource initialization failed");
                Err(error)
            }
        }
    }

    async fn initialize_index(&self) -> Result<(), QueryError> {
        let config = get_config();
        let service = Arc::new(
            QdrantService::new().map_err(|error| QueryError::resource("index", error))?,
        );

        let bootstrap = Arc::clone(&service);
        self.index_retry
            .run("index_initialization", |_| true, move || {
                let service = Arc::clone(&bootstrap);
                async move {
                    resilience::with_timeout(
                        async {
                            service
                                .ensure_collection(
                                    &config.qdrant_collection_name,
                                    config.embedding_dimension as u64,
                                )
                                .await
                                .map_err(|error| {
                                    QueryError::vector_store("index_bootstrap", error)
                                })
                        },
                        timeouts::INDEX_OPERATION,
                        "index_initialization",
                    )
                    .await
                }
            })
            .await
            .map_err(|error| QueryError::resource("index", error))?;

        self.index.set(service).ok();
        tracing::info!("Index handle initialized");
        Ok(())
    }

    async fn initialize_embeddings(&self) -> Result<(), QueryError> {
        let client = Arc::new(OllamaEmbeddingClient::new());

        let probe = Arc::clone(&client);
        self.model_retry
            .run("embeddings_initialization", |_| true, move || {
                let client = Arc::clone(&probe);
                async move {
                    resilience::with_timeout(
                        async {
                            client
                                .embed_one("test embedding")
                                .await
                                .map(|_| ())
                                .map_err(|error| {
                                    QueryError::external_service("embeddings", error)
                                })
                        },
                        timeouts::EMBEDDING,
                        "embeddings_test",
                    )
                    .await
                }
            })
            .await
            .map_err(|error| QueryError::resource("embeddings", error))?;

        self.embeddings.set(client).ok();
        tracing::info!("Embedding handle initialized");
        Ok(())
    }

    async fn initialize_completion(&self) -> Result<(), QueryError> {
        let client = Arc::new(OllamaCompletionClient::new());

        let probe = Arc::clone(&client);
        self.model_retry
            .run("completion_initialization", |_| true, move || {
                let client = Arc::clone(&probe);
                async move {
                    resilience::with_timeout(
                        async {
                            client
                                .generate(&[ChatMessage::user("Hello")])
                                .await
                                .map(|_| ())
                                .map_err(|error| {
                                    QueryError::external_service("completion", error)
                                })
                        },
                        timeouts::LLM_GENERATION,
                        "completion_test",
                    )
                    .await
                }
            })
            .await
            .map_err(|error| QueryError::resource("completion", error))?;

        self.completion.set(client).ok();
        tracing::info!("Completion handle initialized");
        Ok(())
    }

    /// Build a pre-populated registry for in-crate tests.
    #[cfg(test)]
    pub(crate) fn with_handles(
        index: Arc<QdrantService>,
        embeddings: Arc<dyn EmbeddingClient>,
        completion: Arc<dyn CompletionClient>,
    ) -> Self {
        let registry = Self::new();
        registry.index.set(index).ok();
        registry.embeddings.set(embeddings).ok();
        registry.completion.set(completion).ok();
        registry.set_state(RegistryState::Ready);
        registry
    }

    /// Whether all three handles are available.
    pub fn is_ready(&self) -> bool {
        self.index.get().is_some()
            && self.embeddings.get().is_some()
            && self.completion.get().is_some()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RegistryState {
        *self.state.lock().expect("registry state lock poisoned")
    }

    fn set_state(&self, state: RegistryState) {
        *self.state.lock().expect("registry state lock poisoned") = state;
    }

    /// Access the vector-index handle.
    pub fn index(&self) -> Result<Arc<QdrantService>, QueryError> {
        self.index.get().cloned().ok_or_else(|| {
            QueryError::resource("index", "not initialized. Call initialize() first.")
        })
    }

    /// Access the embedding handle.
    pub fn embeddings(&self) -> Result<Arc<dyn EmbeddingClient>, QueryError> {
        self.embeddings.get().cloned().ok_or_else(|| {
            QueryError::resource("embeddings", "not initialized. Call initialize() first.")
        })
    }

    /// Access the completion handle.
    pub fn completion(&self) -> Result<Arc<dyn CompletionClient>, QueryError> {
        self.completion.get().cloned().ok_or_else(|| {
            QueryError::resource("completion", "not initialized. Call initialize() first.")
        })
    }

    /// Probe every component independently and report a structured status.
    pub async fn health_check(&self) -> RegistryHealth {
        let (index, embeddings, completion) = tokio::join!(
            self.probe_index(),
            self.probe_embeddings(),
            self.probe_completion(),
        );

        let mut components = BTreeMap::new();
        components.insert("index".to_string(), index);
        components.insert("embeddings".to_string(), embeddings);
        components.insert("completion".to_string(), completion);

        let overall = if components
            .values()
            .all(|component| component.status == HealthStatus::Healthy)
        {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        RegistryHealth {
            overall_status: overall,
            components,
            initialized: self.is_ready(),
        }
    }

    async fn probe_index(&self) -> ComponentHealth {
        match self.index() {
            Ok(service) => {
                let config = get_config();
                probe("index", async move {
                    service
                        .collection_exists(&config.qdrant_collection_name)
                        .await
                        .map(|_| ())
                        .map_err(|error| QueryError::external_service("index", error))
                })
                .await
            }
            Err(error) => unavailable("index", error),
        }
    }

    async fn probe_embeddings(&self) -> ComponentHealth {
        match self.embeddings() {
            Ok(client) => {
                probe("embeddings", async move {
                    client
                        .embed_one("health check")
                        .await
                        .map(|_| ())
                        .map_err(|error| QueryError::external_service("embeddings", error))
                })
                .await
            }
            Err(error) => unavailable("embeddings", error),
        }
    }

    async fn probe_completion(&self) -> ComponentHealth {
        match self.completion() {
            Ok(client) => {
                probe("completion", async move {
                    client
                        .generate(&[ChatMessage::user("health check")])
                        .await
                        .map(|_| ())
                        .map_err(|error| QueryError::external_service("completion", error))
                })
                .await
            }
            Err(error) => unavailable("completion", error),
        }
    }
}

async fn probe<F>(name: &str, check: F) -> ComponentHealth
where
    F: std::future::Future<Output = Result<(), QueryError>>,
{
    let started = Instant::now();
    match tokio::time::timeout(timeouts::HEALTH_PROBE, check).await {
        Ok(Ok(())) => ComponentHealth {
            service: name.to_string(),
            status: HealthStatus::Healthy,
            response_time: Some(started.elapsed().as_secs_f64()),
            error: None,
            timestamp: now_rfc3339(),
        },
        Ok(Err(error)) => ComponentHealth {
            service: name.to_string(),
            status: HealthStatus::Unhealthy,
            response_time: Some(started.elapsed().as_secs_f64()),
            error: Some(error.to_string()),
            timestamp: now_rfc3339(),
        },
        Err(_) => ComponentHealth {
            service: name.to_string(),
            status: HealthStatus::Timeout,
            response_time: None,
            error: Some("health check timed out".to_string()),
            timestamp: now_rfc3339(),
        },
    }
}

fn unavailable(name: &str, error: QueryError) -> ComponentHealth {
    ComponentHealth {
        service: name.to_string(),
        status: HealthStatus::Unhealthy,
        response_time: None,
        error: Some(error.to_string()),
        timestamp: now_rfc3339(),
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

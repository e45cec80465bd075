//! Error taxonomy shared by every pipeline stage.
//!
//! Each variant is a failure *kind* rather than a transport-level error; the HTTP layer maps
//! kinds onto status codes and the retry wrapper classifies them for backoff decisions.
//! Adapter-specific errors (Qdrant, embeddings, chat) are converted into these kinds at the
//! component boundary where the operation name is known.

use thiserror::Error;

/// Failure kinds surfaced by the question-answering pipeline.
#[derive(Debug, Error)]
pub enum QueryError {
    /// An operation exceeded its configured deadline.
    #[error("Operation '{operation}' timed out after {limit} seconds")]
    Timeout {
        /// Name of the operation that expired.
        operation: String,
        /// Deadline in seconds that was exceeded.
        limit: f64,
    },
    /// An external service call failed, including fallback exhaustion.
    #[error("External service '{service}' error: {detail}")]
    ExternalService {
        /// Service or operation identifier.
        service: String,
        /// Underlying failure description.
        detail: String,
    },
    /// A long-lived resource handle was missing or failed to initialize.
    #[error("Failed to initialize resource '{resource}': {detail}")]
    ResourceInitialization {
        /// Resource identifier (`index`, `embeddings`, `completion`, ...).
        resource: String,
        /// Underlying failure description.
        detail: String,
    },
    /// Document download, extraction, or validation failed.
    #[error("Document processing error in '{operation}': {detail}")]
    DocumentProcessing {
        /// Processing step that failed.
        operation: String,
        /// Underlying failure description.
        detail: String,
    },
    /// A vector-store operation failed.
    #[error("Vector store error in '{operation}': {detail}")]
    VectorStore {
        /// Store operation that failed.
        operation: String,
        /// Underlying failure description.
        detail: String,
    },
}

impl QueryError {
    /// Build a timeout error for the named operation.
    pub fn timeout(operation: impl Into<String>, limit: f64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            limit,
        }
    }

    /// Build an external-service error.
    pub fn external_service(service: impl Into<String>, detail: impl ToString) -> Self {
        Self::ExternalService {
            service: service.into(),
            detail: detail.to_string(),
        }
    }

    /// Build a resource-initialization error.
    pub fn resource(resource: impl Into<String>, detail: impl ToString) -> Self {
        Self::ResourceInitialization {
            resource: resource.into(),
            detail: detail.to_string(),
        }
    }

    /// Build a document-processing error.
    pub fn document(operation: impl Into<String>, detail: impl ToString) -> Self {
        Self::DocumentProcessing {
            operation: operation.into(),
            detail: detail.to_string(),
        }
    }

    /// Build a vector-store error.
    pub fn vector_store(operation: impl Into<String>, detail: impl ToString) -> Self {
        Self::VectorStore {
            operation: operation.into(),
            detail: detail.to_string(),
        }
    }

    /// Whether this failure came from a dependency that may recover on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::ExternalService { .. }
        )
    }
}

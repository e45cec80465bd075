//! Timeout, retry, and fallback wrappers applied to every external call.
//!
//! The wrappers are plain higher-order async functions that compose by nesting; the usual
//! stacking is timeout outside retry outside the raw operation. Each wrapper logs at the
//! point of degradation so no recovery happens silently.

use crate::errors::QueryError;
use std::future::Future;
use std::time::Duration;

/// Deadline budgets for external operations.
///
/// Connect budgets are deliberately shorter than the end-to-end operation budgets so a dead
/// dependency is detected quickly during startup while slow-but-alive calls get room to finish.
pub mod timeouts {
    use std::time::Duration;

    /// TCP/TLS connect budget for outbound HTTP clients.
    pub const HTTP_CONNECT: Duration = Duration::from_secs(10);
    /// Qdrant connectivity check during startup.
    pub const INDEX_CONNECT: Duration = Duration::from_secs(15);
    /// Qdrant collection bootstrap (describe + create).
    pub const INDEX_OPERATION: Duration = Duration::from_secs(45);
    /// Single chat-completion call.
    pub const LLM_GENERATION: Duration = Duration::from_secs(30);
    /// Single embedding call.
    pub const EMBEDDING: Duration = Duration::from_secs(20);
    /// Full document download, sized for large PDFs.
    pub const DOCUMENT_DOWNLOAD: Duration = Duration::from_secs(120);
    /// CPU-bound extraction and chunking work.
    pub const DOCUMENT_PROCESSING: Duration = Duration::from_secs(60);
    /// Embedding + upsert of one document's chunks.
    pub const VECTOR_STORE_CREATE: Duration = Duration::from_secs(90);
    /// Similarity search for one question.
    pub const VECTOR_STORE_SEARCH: Duration = Duration::from_secs(30);
    /// Per-component health probe.
    pub const HEALTH_PROBE: Duration = Duration::from_secs(10);
    /// Settle delay after creating a collection, covering eventual consistency.
    pub const INDEX_SETTLE: Duration = Duration::from_secs(10);
}

/// Race `op` against a deadline.
///
/// On expiry the inner future is dropped, cancelling it, and a
/// [`QueryError::Timeout`] carrying the operation name and limit is returned. Any other
/// failure propagates unchanged.
pub async fn with_timeout<T, F>(op: F, limit: Duration, name: &str) -> Result<T, QueryError>
where
    F: Future<Output = Result<T, QueryError>>,
{
    match tokio::time::timeout(limit, op).await {
        Ok(result) => result,
        Err(_) => {
            let limit = limit.as_secs_f64();
            tracing::error!(operation = name, limit, "Operation timed out");
            Err(QueryError::timeout(name, limit))
        }
    }
}

/// Retry schedule with exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Additional attempts permitted after the first failure.
    pub max_retries: u32,
    /// Base factor for the `factor * 2^attempt` backoff delay, in seconds.
    pub backoff_factor: f64,
}

impl RetryPolicy {
    /// Construct a policy from retry count and backoff factor.
    pub const fn new(max_retries: u32, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            backoff_factor,
        }
    }

    /// Invoke `op` until it succeeds or the retry budget is exhausted.
    ///
    /// Failures for which `retryable` returns `false` propagate immediately without
    /// waiting. The final failure re-raises the last error observed.
    pub async fn run<T, F, Fut>(
        &self,
        name: &str,
        retryable: impl Fn(&QueryError) -> bool,
        mut op: F,
    ) -> Result<T, QueryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueryError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt < self.max_retries && retryable(&error) => {
                    let wait = self.backoff_factor * f64::from(1u32 << attempt);
                    tracing::warn!(
                        operation = name,
                        attempt = attempt + 1,
                        wait_secs = wait,
                        error = %error,
                        "Attempt failed; retrying"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                    attempt += 1;
                }
                Err(error) => {
                    if attempt >= self.max_retries {
                        tracing::error!(
                            operation = name,
                            max_retries = self.max_retries,
                            error = %error,
                            "Retry budget exhausted"
                        );
                    }
                    return Err(error);
                }
            }
        }
    }
}

/// Invoke `primary`; on any failure invoke `fallback` with the same inputs.
///
/// A fallback failure is never swallowed: it surfaces as
/// [`QueryError::ExternalService`] carrying the operation name and the *primary* error's
/// message, so callers can distinguish degraded output from total failure.
pub async fn with_fallback<T, P, PF, F, FF>(
    name: &str,
    primary: P,
    fallback: F,
) -> Result<T, QueryError>
where
    P: FnOnce() -> PF,
    PF: Future<Output = Result<T, QueryError>>,
    F: FnOnce() -> FF,
    FF: Future<Output = Result<T, QueryError>>,
{
    match primary().await {
        Ok(value) => Ok(value),
        Err(primary_error) => {
            tracing::warn!(
                operation = name,
                error = %primary_error,
                "Primary operation failed; using fallback"
            );
            match fallback().await {
                Ok(value) => Ok(value),
                Err(fallback_error) => {
                    tracing::error!(
                        operation = name,
                        error = %fallback_error,
                        "Fallback also failed"
                    );
                    Err(QueryError::external_service(name, primary_error))
                }
            }
        }
    }
}

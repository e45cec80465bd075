//! Request pipeline coordination: acquire → chunk → index → answer.
//!
//! Stages run strictly in sequence for one request, each under its own deadline; the
//! answer stage's deadline scales with the question count to bound total wall time. The
//! coordinator validates inputs and registry readiness before any stage runs, records one
//! trace per request, and finalizes it on success and failure alike.

use crate::answer::AnswerGenerator;
use crate::chunking::{self, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use crate::config::get_config;
use crate::document::{DocumentFetcher, TextExtractor};
use crate::errors::QueryError;
use crate::indexer::Indexer;
use crate::orchestrator::QuestionOrchestrator;
use crate::resilience::{self, timeouts};
use crate::resources::ResourceRegistry;
use crate::telemetry::{PerformanceStats, RequestTrace, TraceStore};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Upper bound on questions accepted per request.
const MAX_QUESTIONS: usize = 10;

/// Coordinates the full question-answering pipeline for one process.
pub struct QueryPipeline {
    pub(crate) registry: Arc<ResourceRegistry>,
    pub(crate) fetcher: DocumentFetcher,
    pub(crate) indexer: Indexer,
    pub(crate) orchestrator: QuestionOrchestrator,
    pub(crate) traces: TraceStore,
    pub(crate) chunk_size: usize,
    pub(crate) chunk_overlap: usize,
    pub(crate) collection: String,
}

impl QueryPipeline {
    /// Build the pipeline over the shared registry and the given extraction collaborator.
    pub fn new(registry: Arc<ResourceRegistry>, extractor: Arc<dyn TextExtractor>) -> Self {
        let config = get_config();
        let generator = Arc::new(AnswerGenerator::new(Arc::clone(&registry)));
        Self {
            fetcher: DocumentFetcher::new(extractor),
            indexer: Indexer::new(Arc::clone(&registry)),
            orchestrator: QuestionOrchestrator::new(generator),
            traces: TraceStore::default(),
            chunk_size: config.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            chunk_overlap: config.chunk_overlap.unwrap_or(DEFAULT_CHUNK_OVERLAP),
            collection: config.qdrant_collection_name.clone(),
            registry,
        }
    }

    /// Answer `questions` about the document at `document_url`.
    ///
    /// Returns exactly one answer per question (possibly fallback strings), or fails with
    /// one of the pipeline error kinds when no per-unit recovery is possible. Readiness and
    /// input validation happen before any stage executes.
    pub async fn process_request(
        &self,
        document_url: &str,
        questions: &[String],
    ) -> Result<Vec<String>, QueryError> {
        if !self.registry.is_ready() {
            return Err(QueryError::resource(
                "global_resources",
                "resources not initialized; service unavailable",
            ));
        }
        if questions.is_empty() || questions.len() > MAX_QUESTIONS {
            return Err(QueryError::document(
                "question_validation",
                format!(
                    "question count must be between 1 and {MAX_QUESTIONS}, got {}",
                    questions.len()
                ),
            ));
        }

        let request_id = Uuid::new_v4();
        tracing::info!(
            %request_id,
            url = document_url,
            questions = questions.len(),
            "Processing request"
        );

        let mut trace = RequestTrace::new(request_id);
        let result = self.run_stages(document_url, questions, &mut trace).await;
        match &result {
            Ok(answers) => {
                tracing::info!(%request_id, answers = answers.len(), "Request completed")
            }
            Err(error) => tracing::error!(%request_id, error = %error, "Request failed"),
        }
        self.traces.finalize(trace);
        result
    }

    async fn run_stages(
        &self,
        document_url: &str,
        questions: &[String],
        trace: &mut RequestTrace,
    ) -> Result<Vec<String>, QueryError> {
        let pages = stage(
            trace,
            "document_processing",
            resilience::with_timeout(
                self.fetcher.acquire(document_url),
                timeouts::DOCUMENT_DOWNLOAD,
                "document_processing",
            ),
        )
        .await?;

        let started = Instant::now();
        let chunk_result =
            chunking::chunk_pages_offloaded(pages, self.chunk_size, self.chunk_overlap).await;
        let mut metadata = BTreeMap::new();
        if let Ok(chunks) = &chunk_result {
            metadata.insert("chunks".to_string(), chunks.len().to_string());
        }
        trace.record_with_metadata(
            "document_chunking",
            started.elapsed(),
            chunk_result.is_ok(),
            chunk_result.as_ref().err().map(ToString::to_string),
            metadata,
        );
        let chunks = chunk_result?;

        let store = stage(
            trace,
            "vector_store_creation",
            resilience::with_timeout(
                self.indexer.build(&self.collection, &chunks),
                timeouts::VECTOR_STORE_CREATE,
                "vector_store_creation",
            ),
        )
        .await?;

        let answer_budget = timeouts::LLM_GENERATION * questions.len() as u32;
        let answers = stage(
            trace,
            "answer_generation",
            resilience::with_timeout(
                async { Ok(self.orchestrator.answer_all(&store, questions).await) },
                answer_budget,
                "answer_generation",
            ),
        )
        .await?;

        debug_assert_eq!(answers.len(), questions.len());
        Ok(answers)
    }

    /// Aggregate performance statistics from completed requests.
    pub fn performance_stats(&self) -> PerformanceStats {
        self.traces.stats()
    }

    /// The shared resource registry backing this pipeline.
    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }
}

/// Run one stage, recording its duration and outcome on the trace.
async fn stage<T, F>(trace: &mut RequestTrace, name: &str, op: F) -> Result<T, QueryError>
where
    F: Future<Output = Result<T, QueryError>>,
{
    let started = Instant::now();
    let result = op.await;
    trace.record(
        name,
        started.elapsed(),
        result.is_ok(),
        result.as_ref().err().map(ToString::to_string),
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{ChatMessage, CompletionClient, CompletionError};
    use crate::document::PopplerExtractor;
    use crate::embedding::{EmbeddingClient, EmbeddingError};
    use crate::qdrant::QdrantService;
    use crate::resilience::RetryPolicy;
    use async_trait::async_trait;

    struct StaticEmbeddings;

    #[async_trait]
    impl EmbeddingClient for StaticEmbeddings {
        async fn embed_one(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Ok(vec![0.1, 0.2])
        }

        async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok(texts.iter().map(|_| vec![0.1, 0.2]).collect())
        }
    }

    struct StaticCompletion;

    #[async_trait]
    impl CompletionClient for StaticCompletion {
        async fn generate(&self, _messages: &[ChatMessage]) -> Result<String, CompletionError> {
            Ok("A perfectly reasonable answer.".into())
        }
    }

    fn pipeline_with(registry: Arc<ResourceRegistry>) -> QueryPipeline {
        let generator = Arc::new(AnswerGenerator::new(Arc::clone(&registry)));
        QueryPipeline {
            fetcher: DocumentFetcher {
                http: reqwest::Client::builder()
                    .user_agent("docquery-test")
                    .build()
                    .expect("client"),
                extractor: Arc::new(PopplerExtractor),
                retry: RetryPolicy::new(0, 0.001),
                max_bytes: 1024,
            },
            indexer: Indexer {
                registry: Arc::clone(&registry),
                vector_size: 2,
            },
            orchestrator: QuestionOrchestrator::new(generator),
            traces: TraceStore::default(),
            chunk_size: 1000,
            chunk_overlap: 200,
            collection: "docquery-test".to_string(),
            registry,
        }
    }

    fn ready_registry() -> Arc<ResourceRegistry> {
        let index = Arc::new(QdrantService {
            client: reqwest::Client::builder()
                .user_agent("docquery-test")
                .build()
                .expect("client"),
            base_url: "http://127.0.0.1:9".to_string(),
            api_key: None,
        });
        Arc::new(ResourceRegistry::with_handles(
            index,
            Arc::new(StaticEmbeddings),
            Arc::new(StaticCompletion),
        ))
    }

    #[tokio::test]
    async fn requests_fail_fast_when_the_registry_is_not_ready() {
        let pipeline = pipeline_with(Arc::new(ResourceRegistry::new()));
        let error = pipeline
            .process_request("https://example.org/doc.pdf", &["one?".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(error, QueryError::ResourceInitialization { .. }));
    }

    #[tokio::test]
    async fn oversized_question_lists_are_rejected_before_any_stage() {
        let pipeline = pipeline_with(ready_registry());
        let questions: Vec<String> = (0..11).map(|i| format!("q{i}?")).collect();
        let error = pipeline
            .process_request("https://example.org/doc.pdf", &questions)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            QueryError::DocumentProcessing { ref operation, .. } if operation == "question_validation"
        ));
        // Nothing was traced because no stage ran.
        assert_eq!(pipeline.performance_stats().total_requests, 0);
    }

    #[tokio::test]
    async fn empty_question_lists_are_rejected() {
        let pipeline = pipeline_with(ready_registry());
        let error = pipeline
            .process_request("https://example.org/doc.pdf", &[])
            .await
            .unwrap_err();
        assert!(matches!(error, QueryError::DocumentProcessing { .. }));
    }
}

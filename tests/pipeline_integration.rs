use std::path::Path;
use std::sync::Arc;

use docquery::config;
use docquery::document::TextExtractor;
use docquery::errors::QueryError;
use docquery::pipeline::QueryPipeline;
use docquery::resources::{HealthStatus, ResourceRegistry};
use httpmock::{Method::GET, Method::POST, Method::PUT, Mock, MockServer};
use regex::Regex;
use serde_json::json;
use tokio::sync::OnceCell;

static INIT: OnceCell<()> = OnceCell::const_new();
static MOCK_SERVER: OnceCell<&'static MockServer> = OnceCell::const_new();
static MOCK_HANDLES: OnceCell<Vec<Mock<'static>>> = OnceCell::const_new();

const MODEL_ANSWER: &str = "The policy covers accidental storm damage up to the insured sum.";

fn set_env(key: &str, value: &str) {
    // SAFETY: Tests run in a single process and establish deterministic configuration upfront.
    unsafe { std::env::set_var(key, value) }
}

/// Extractor returning a fixed page so the pipeline never needs a PDF toolchain.
struct StubExtractor;

impl TextExtractor for StubExtractor {
    fn extract(&self, _path: &Path) -> anyhow::Result<Vec<String>> {
        Ok(vec![
            "This insurance policy covers storm damage, fire damage, and water ingress. \
             Claims must be filed within thirty days of the loss event."
                .to_string(),
        ])
    }
}

/// Extractor that always fails, driving the document-acquisition fallback path.
struct BrokenExtractor;

impl TextExtractor for BrokenExtractor {
    fn extract(&self, _path: &Path) -> anyhow::Result<Vec<String>> {
        anyhow::bail!("malformed PDF stream")
    }
}

async fn init_harness() {
    INIT.get_or_init(|| async {
        let mock_server_owned = MockServer::start_async().await;
        let mock_server = Box::leak(Box::new(mock_server_owned));
        let base_url = mock_server.base_url();

        set_env("QDRANT_URL", &base_url);
        set_env("QDRANT_COLLECTION_NAME", "docquery-itest");
        set_env("OLLAMA_URL", &base_url);
        set_env("EMBEDDING_MODEL", "nomic-embed-text");
        set_env("EMBEDDING_DIMENSION", "2");
        set_env("COMPLETION_MODEL", "llama");

        MOCK_SERVER.set(mock_server).ok();
        let server = MOCK_SERVER.get().expect("mock server initialized");
        let collections_regex = Regex::new(r"^/collections/").unwrap();

        let mocks: Vec<Mock<'static>> = vec![
            server
                .mock_async(|when, then| {
                    when.method(GET).path("/itest-doc.pdf");
                    then.status(200)
                        .header("content-type", "application/pdf")
                        .body("%PDF-1.4 stub document body");
                })
                .await,
            server
                .mock_async({
                    let collections_regex = collections_regex.clone();
                    move |when, then| {
                        when.method(POST)
                            .path_matches(collections_regex.clone())
                            .path_contains("/points/query");
                        then.status(200).json_body(json!({
                            "status": "ok",
                            "time": 0.0,
                            "result": [
                                {
                                    "id": "chunk-1",
                                    "score": 0.87,
                                    "payload": {
                                        "text": "This insurance policy covers storm damage."
                                    }
                                }
                            ]
                        }));
                    }
                })
                .await,
            server
                .mock_async({
                    let collections_regex = collections_regex.clone();
                    move |when, then| {
                        when.method(PUT)
                            .path_matches(collections_regex.clone())
                            .path_contains("/points");
                        then.status(200).json_body(json!({
                            "status": "ok",
                            "time": 0.0,
                            "result": { "operation_id": 1, "status": "completed" }
                        }));
                    }
                })
                .await,
            server
                .mock_async({
                    let collections_regex = collections_regex.clone();
                    move |when, then| {
                        when.method(GET).path_matches(collections_regex.clone());
                        then.status(200).json_body(json!({
                            "status": "ok",
                            "time": 0.0,
                            "result": {}
                        }));
                    }
                })
                .await,
            server
                .mock_async(|when, then| {
                    when.method(POST).path("/api/embed");
                    then.status(200).json_body(json!({
                        "model": "nomic-embed-text",
                        "embeddings": [[0.6, 0.8]]
                    }));
                })
                .await,
            server
                .mock_async(|when, then| {
                    when.method(POST).path("/api/chat");
                    then.status(200).json_body(json!({
                        "message": { "role": "assistant", "content": MODEL_ANSWER },
                        "done": true
                    }));
                })
                .await,
        ];
        MOCK_HANDLES.set(mocks).ok();

        config::init_config();
    })
    .await;
}

async fn ready_pipeline(extractor: Arc<dyn TextExtractor>) -> QueryPipeline {
    let registry = Arc::new(ResourceRegistry::new());
    registry
        .initialize()
        .await
        .expect("registry initialization against mocks");
    QueryPipeline::new(registry, extractor)
}

fn document_url() -> String {
    format!(
        "{}/itest-doc.pdf",
        MOCK_SERVER.get().expect("mock server").base_url()
    )
}

#[tokio::test]
async fn happy_path_answers_every_question_in_order() {
    init_harness().await;
    let pipeline = ready_pipeline(Arc::new(StubExtractor)).await;

    let questions = vec![
        "What does the policy cover?".to_string(),
        "How long is the claim window?".to_string(),
        "Is fire damage included?".to_string(),
    ];
    let answers = pipeline
        .process_request(&document_url(), &questions)
        .await
        .expect("answers");

    assert_eq!(answers.len(), questions.len());
    for answer in &answers {
        assert_eq!(answer, MODEL_ANSWER);
        assert!(answer.chars().count() >= 10);
    }
}

#[tokio::test]
async fn failed_extraction_still_yields_one_answer_per_question() {
    init_harness().await;
    let pipeline = ready_pipeline(Arc::new(BrokenExtractor)).await;

    let questions = vec![
        "What does the policy cover?".to_string(),
        "Is water damage included?".to_string(),
    ];
    let answers = pipeline
        .process_request(&document_url(), &questions)
        .await
        .expect("degraded answers");

    // The placeholder page is indexed and answered like any other document.
    assert_eq!(answers.len(), questions.len());
    for answer in &answers {
        assert!(!answer.is_empty());
    }
}

#[tokio::test]
async fn eleven_questions_are_rejected_before_any_stage_runs() {
    init_harness().await;
    let pipeline = ready_pipeline(Arc::new(StubExtractor)).await;

    let questions: Vec<String> = (0..11).map(|i| format!("question {i}?")).collect();
    let error = pipeline
        .process_request(&document_url(), &questions)
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        QueryError::DocumentProcessing { ref operation, .. } if operation == "question_validation"
    ));
    assert_eq!(pipeline.performance_stats().total_requests, 0);
}

#[tokio::test]
async fn uninitialized_registry_rejects_requests_immediately() {
    init_harness().await;
    let registry = Arc::new(ResourceRegistry::new());
    let pipeline = QueryPipeline::new(registry, Arc::new(StubExtractor));

    let error = pipeline
        .process_request(&document_url(), &["one question?".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(error, QueryError::ResourceInitialization { .. }));
}

#[tokio::test]
async fn health_check_reports_every_component_healthy_against_mocks() {
    init_harness().await;
    let registry = Arc::new(ResourceRegistry::new());
    registry.initialize().await.expect("initialization");

    let health = registry.health_check().await;
    assert_eq!(health.overall_status, HealthStatus::Healthy);
    assert!(health.initialized);
    assert_eq!(health.components.len(), 3);
    for component in health.components.values() {
        assert_eq!(component.status, HealthStatus::Healthy);
        assert!(component.response_time.is_some());
    }
}

#[tokio::test]
async fn repeated_requests_accumulate_performance_statistics() {
    init_harness().await;
    let pipeline = ready_pipeline(Arc::new(StubExtractor)).await;

    for _ in 0..2 {
        pipeline
            .process_request(&document_url(), &["What is covered?".to_string()])
            .await
            .expect("answers");
    }

    let stats = pipeline.performance_stats();
    assert_eq!(stats.total_requests, 2);
    let stages = ["document_processing", "document_chunking", "vector_store_creation", "answer_generation"];
    for stage in stages {
        let stage_stats = stats
            .operation_stats
            .get(stage)
            .unwrap_or_else(|| panic!("missing stats for stage {stage}"));
        assert_eq!(stage_stats.count, 2);
        assert_eq!(stage_stats.failures, 0);
    }
}

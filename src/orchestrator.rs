//! Bounded parallel fan-out across the question list.
//!
//! One task is spawned per question, gated by a semaphore so pathological batches cannot
//! exhaust the runtime. Every task resolves to a value via the per-question fallback, so a
//! single failure can never cancel or fail its siblings, and the collected output is
//! re-ordered to match the input by the index each task carries.

use crate::answer::{ANSWER_FALLBACK_TEXT, AnswerGenerator};
use crate::indexer::SearchHandle;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Maximum questions answered concurrently, independent of the input-size cap.
const MAX_CONCURRENT_QUESTIONS: usize = 8;

/// Fans questions out across the answer generator.
pub struct QuestionOrchestrator {
    generator: Arc<AnswerGenerator>,
    pub(crate) max_concurrency: usize,
}

impl QuestionOrchestrator {
    /// Construct an orchestrator around the given generator.
    pub fn new(generator: Arc<AnswerGenerator>) -> Self {
        Self {
            generator,
            max_concurrency: MAX_CONCURRENT_QUESTIONS,
        }
    }

    /// Answer every question concurrently, preserving input order.
    ///
    /// This function is total: the output always has exactly one answer per question, with
    /// the apology string substituted for any slot whose task failed outright.
    pub async fn answer_all(&self, store: &SearchHandle, questions: &[String]) -> Vec<String> {
        if questions.is_empty() {
            tracing::warn!("No questions provided to the orchestrator");
            return Vec::new();
        }

        tracing::info!(count = questions.len(), "Processing questions in parallel");

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();
        for (index, question) in questions.iter().cloned().enumerate() {
            let generator = Arc::clone(&self.generator);
            let store = store.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let answer = generator.answer_with_fallback(&store, &question, index).await;
                (index, answer)
            });
        }

        let mut answers = vec![ANSWER_FALLBACK_TEXT.to_string(); questions.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, answer)) => answers[index] = answer,
                Err(error) => {
                    tracing::error!(error = %error, "Question task aborted; keeping fallback answer");
                }
            }
        }

        tracing::info!(count = answers.len(), "Completed question batch");
        answers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{ChatMessage, CompletionClient, CompletionError};
    use crate::embedding::{EmbeddingClient, EmbeddingError};
    use crate::indexer::Indexer;
    use crate::qdrant::QdrantService;
    use crate::resources::ResourceRegistry;
    use async_trait::async_trait;
    use httpmock::{Method::POST, MockServer};

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

    /// Echoes the question embedded in the prompt; fails on demand for poisoned questions.
    struct EchoCompletion;

    #[async_trait]
    impl CompletionClient for EchoCompletion {
        async fn generate(&self, messages: &[ChatMessage]) -> Result<String, CompletionError> {
            let prompt = &messages.last().expect("user message").content;
            let question = prompt
                .split("Question: ")
                .nth(1)
                .and_then(|rest| rest.split("\n\nAnswer:").next())
                .unwrap_or_default();
            if question.contains("poison") {
                return Err(CompletionError::GenerationFailed("poisoned".into()));
            }
            Ok(format!("Answer for [{question}] from the document."))
        }
    }

    async fn harness(server: &MockServer) -> (QuestionOrchestrator, SearchHandle) {
        server
            .mock_async(|when, then| {
                when.method(POST).path_contains("/points/query");
                then.status(200).json_body(serde_json::json!({
                    "status": "ok",
                    "time": 0.0,
                    "result": [
                        { "id": "c1", "score": 0.9, "payload": { "text": "relevant chunk" } }
                    ]
                }));
            })
            .await;

        let index = Arc::new(QdrantService {
            client: reqwest::Client::builder()
                .user_agent("docquery-test")
                .build()
                .expect("client"),
            base_url: server.base_url(),
            api_key: None,
        });
        let registry = Arc::new(ResourceRegistry::with_handles(
            index,
            Arc::new(StaticEmbeddings),
            Arc::new(EchoCompletion),
        ));
        let mut generator = AnswerGenerator::new(Arc::clone(&registry));
        generator.generation_retry = crate::resilience::RetryPolicy::new(1, 0.001);
        let store = Indexer {
            registry,
            vector_size: 2,
        }
        .attach("docs");
        (QuestionOrchestrator::new(Arc::new(generator)), store)
    }

    #[tokio::test]
    async fn answers_preserve_input_order() {
        let server = MockServer::start_async().await;
        let (orchestrator, store) = harness(&server).await;

        let questions: Vec<String> = (0..6).map(|i| format!("question number {i}?")).collect();
        let answers = orchestrator.answer_all(&store, &questions).await;

        assert_eq!(answers.len(), questions.len());
        for (i, answer) in answers.iter().enumerate() {
            assert!(
                answer.contains(&format!("question number {i}?")),
                "answer {i} does not match its question: {answer}"
            );
        }
    }

    #[tokio::test]
    async fn one_failing_question_does_not_affect_the_others() {
        let server = MockServer::start_async().await;
        let (orchestrator, store) = harness(&server).await;

        let questions = vec![
            "first question?".to_string(),
            "poison pill?".to_string(),
            "third question?".to_string(),
        ];
        let answers = orchestrator.answer_all(&store, &questions).await;

        assert_eq!(answers.len(), 3);
        assert!(answers[0].contains("first question?"));
        assert_eq!(answers[1], ANSWER_FALLBACK_TEXT);
        assert!(answers[2].contains("third question?"));
    }

    #[tokio::test]
    async fn empty_question_list_yields_empty_answer_list() {
        let server = MockServer::start_async().await;
        let (orchestrator, store) = harness(&server).await;
        let answers = orchestrator.answer_all(&store, &[]).await;
        assert!(answers.is_empty());
    }

    #[tokio::test]
    async fn concurrency_bound_still_completes_oversized_batches() {
        let server = MockServer::start_async().await;
        let (mut orchestrator, store) = harness(&server).await;
        orchestrator.max_concurrency = 2;

        let questions: Vec<String> = (0..10).map(|i| format!("batch item {i}?")).collect();
        let answers = orchestrator.answer_all(&store, &questions).await;
        assert_eq!(answers.len(), 10);
        for (i, answer) in answers.iter().enumerate() {
            assert!(answer.contains(&format!("batch item {i}?")));
        }
    }
}

//! Retrieval-augmented answer generation for a single question.
//!
//! Each question runs retrieve → assemble → generate, every sub-step under its own
//! deadline. Retrieval that returns nothing degrades to a placeholder context, generation
//! failures degrade to an apology string, and suspiciously short answers are logged but
//! still returned. A question therefore always terminates in an answer.

use crate::completion::ChatMessage;
use crate::errors::QueryError;
use crate::indexer::SearchHandle;
use crate::qdrant::ScoredPoint;
use crate::resilience::{self, RetryPolicy, timeouts};
use crate::resources::ResourceRegistry;
use std::sync::Arc;

/// Number of chunks retrieved per question.
const TOP_K: usize = 3;
/// Character budget for the assembled context.
const MAX_CONTEXT_CHARS: usize = 4000;
/// Minimum leftover budget worth filling with a truncated chunk.
const MIN_TRUNCATION_CHARS: usize = 100;
/// Character cap applied to the question before prompting.
const MAX_QUESTION_CHARS: usize = 500;
/// Answers shorter than this are logged as suspicious.
const MIN_ANSWER_CHARS: usize = 10;

/// Apology returned when a question cannot be answered at all.
pub const ANSWER_FALLBACK_TEXT: &str = "I'm sorry, I couldn't generate an answer for this \
question due to a technical issue. Please try rephrasing your question or try again later.";
/// Placeholder context used when retrieval yields nothing usable.
pub const SEARCH_FALLBACK_TEXT: &str = "I couldn't search the document for relevant \
information. Please ensure the document was processed correctly and try again.";

const SYSTEM_PROMPT: &str = "You are an expert document query assistant. Based on the \
provided context from relevant documents, answer the question in 1 paragraph. If the \
context doesn't contain enough information to answer the question, say so clearly.";

/// Generates answers for individual questions using retrieval plus a completion model.
pub struct AnswerGenerator {
    registry: Arc<ResourceRegistry>,
    pub(crate) generation_retry: RetryPolicy,
}

impl AnswerGenerator {
    /// Construct a generator over the shared registry.
    pub fn new(registry: Arc<ResourceRegistry>) -> Self {
        Self {
            registry,
            generation_retry: RetryPolicy::new(2, 1.0),
        }
    }

    /// Answer one question, resolving to the apology string when every retry fails.
    ///
    /// This is the entry point the fan-out uses; it never returns an error, so one
    /// question's failure cannot poison its siblings.
    pub async fn answer_with_fallback(
        &self,
        store: &SearchHandle,
        question: &str,
        index: usize,
    ) -> String {
        let name = format!("question_{index}");
        resilience::with_fallback(
            &name,
            || async {
                self.generation_retry
                    .run(
                        &name,
                        |error| matches!(error, QueryError::ExternalService { .. }),
                        || {
                            resilience::with_timeout(
                                self.answer_question(store, question, index),
                                timeouts::LLM_GENERATION,
                                &name,
                            )
                        },
                    )
                    .await
            },
            || async { Ok(ANSWER_FALLBACK_TEXT.to_string()) },
        )
        .await
        .unwrap_or_else(|_| ANSWER_FALLBACK_TEXT.to_string())
    }

    /// Answer one question or fail with a pipeline error kind.
    pub async fn answer_question(
        &self,
        store: &SearchHandle,
        question: &str,
        index: usize,
    ) -> Result<String, QueryError> {
        if question.trim().is_empty() {
            return Err(QueryError::document(
                "question_validation",
                "empty or invalid question provided",
            ));
        }

        tracing::debug!(index, question = truncate_chars(question, 50), "Processing question");

        let context = resilience::with_timeout(
            self.retrieve_context(store, question),
            timeouts::VECTOR_STORE_SEARCH,
            "document_retrieval",
        )
        .await?;

        let answer = self.generate_answer(&context, question).await?;
        tracing::debug!(index, "Question answered");
        Ok(answer)
    }

    /// Retrieve the top chunks for the question and assemble a bounded context.
    async fn retrieve_context(
        &self,
        store: &SearchHandle,
        question: &str,
    ) -> Result<String, QueryError> {
        let hits = store.search(question, TOP_K).await?;
        if hits.is_empty() {
            tracing::warn!("No chunks retrieved from the vector store");
            return Ok(SEARCH_FALLBACK_TEXT.to_string());
        }
        Ok(assemble_context(&hits))
    }

    /// Build the prompt and invoke the completion model.
    async fn generate_answer(
        &self,
        context: &str,
        question: &str,
    ) -> Result<String, QueryError> {
        if context.trim().is_empty() {
            tracing::warn!("Empty context provided for answer generation");
            return Ok(ANSWER_FALLBACK_TEXT.to_string());
        }
        if question.trim().is_empty() {
            return Err(QueryError::document(
                "answer_generation",
                "empty question provided",
            ));
        }

        let completion = self.registry.completion()?;
        let messages = [
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Context:\n{}\n\nQuestion: {}\n\nAnswer:",
                truncate_chars(context, MAX_CONTEXT_CHARS),
                truncate_chars(question, MAX_QUESTION_CHARS),
            )),
        ];

        let answer = self
            .generation_retry
            .run(
                "answer_generation",
                |error| matches!(error, QueryError::ExternalService { .. }),
                || {
                    let completion = Arc::clone(&completion);
                    let messages = &messages;
                    resilience::with_timeout(
                        async move {
                            completion
                                .generate(messages)
                                .await
                                .map_err(|error| QueryError::external_service("llm", error))
                        },
                        timeouts::LLM_GENERATION,
                        "answer_generation",
                    )
                },
            )
            .await?;

        if answer.is_empty() {
            tracing::warn!("Empty answer generated; using fallback");
            return Ok(ANSWER_FALLBACK_TEXT.to_string());
        }
        if answer.chars().count() < MIN_ANSWER_CHARS {
            tracing::warn!(answer = %answer, "Suspiciously short answer");
        }

        Ok(answer)
    }
}

/// Concatenate retrieved chunks under the context budget.
///
/// Chunks are labeled with their ordinal; a chunk that would overflow the budget is
/// truncated with an ellipsis when at least [`MIN_TRUNCATION_CHARS`] of budget remain,
/// otherwise assembly stops.
pub(crate) fn assemble_context(hits: &[ScoredPoint]) -> String {
    let mut parts = Vec::new();
    let mut total = 0usize;

    for (ordinal, hit) in hits.iter().enumerate() {
        let Some(text) = hit.text.as_deref() else {
            continue;
        };
        let content = text.trim();
        if content.is_empty() {
            continue;
        }

        let length = content.chars().count();
        if total + length > MAX_CONTEXT_CHARS {
            let remaining = MAX_CONTEXT_CHARS - total;
            if remaining > MIN_TRUNCATION_CHARS {
                let truncated = truncate_chars(content, remaining);
                parts.push(format!("Document {}:\n{truncated}...", ordinal + 1));
            }
            break;
        }

        parts.push(format!("Document {}:\n{content}", ordinal + 1));
        total += length;
    }

    if parts.is_empty() {
        tracing::warn!("No meaningful content in retrieved chunks");
        return SEARCH_FALLBACK_TEXT.to_string();
    }

    parts.join("\n\n")
}

/// The first `n` characters of `text`, on a char boundary.
fn truncate_chars(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((offset, _)) => &text[..offset],
        None => text,
    }
}

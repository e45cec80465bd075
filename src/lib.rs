#![deny(missing_docs)]

//! Core library for the Docquery question-answering service.

/// HTTP routing and REST handlers.
pub mod api;
/// Retrieval-augmented answer generation for individual questions.
pub mod answer;
/// Recursive character chunking of extracted document pages.
pub mod chunking;
/// Chat-completion client abstraction and adapters.
pub mod completion;
/// Environment-driven configuration management.
pub mod config;
/// Document download and text extraction.
pub mod document;
/// Embedding client abstraction and adapters.
pub mod embedding;
/// Error taxonomy shared across the pipeline.
pub mod errors;
/// Chunk embedding and vector-store population.
pub mod indexer;
/// Structured logging and tracing setup.
pub mod logging;
/// Bounded per-question parallel fan-out.
pub mod orchestrator;
/// Request pipeline coordination across stages.
pub mod pipeline;
/// Qdrant vector store integration.
pub mod qdrant;
/// Timeout, retry, and fallback wrappers for external calls.
pub mod resilience;
/// Process-wide registry of long-lived service handles.
pub mod resources;
/// Per-request operation tracing and aggregate statistics.
pub mod telemetry;

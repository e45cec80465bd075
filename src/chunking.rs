//! Recursive character chunking of extracted pages.
//!
//! Splitting prefers paragraph boundaries, then line boundaries, then spaces, and finally
//! hard character cuts, so every produced chunk fits the configured character budget.
//! Consecutive chunks from the same page overlap by a fixed number of characters to keep
//! boundary context visible to retrieval. Chunking is CPU-bound and runs on the blocking
//! pool, wrapped in a deadline.

use crate::document::PageText;
use crate::errors::QueryError;
use crate::resilience::{self, timeouts};
use std::collections::BTreeMap;

/// Default chunk budget in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;
/// Default overlap between consecutive chunks in characters.
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Split preference order; absent separators fall through to the next level.
const SEPARATORS: [&str; 3] = ["\n\n", "\n", " "];

/// A bounded text window derived from one page, the unit of retrieval.
#[derive(Debug, Clone)]
pub struct DocumentChunk {
    /// Chunk text, at most `chunk_size` characters.
    pub content: String,
    /// Characters shared with the preceding chunk from the same page.
    pub overlap_with_previous: usize,
    /// Origin metadata inherited from the source page.
    pub metadata: BTreeMap<String, String>,
}

/// Chunk the given pages on the blocking pool under the processing deadline.
pub async fn chunk_pages_offloaded(
    pages: Vec<PageText>,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Result<Vec<DocumentChunk>, QueryError> {
    resilience::with_timeout(
        async {
            tokio::task::spawn_blocking(move || chunk_pages(&pages, chunk_size, chunk_overlap))
                .await
                .map_err(|error| QueryError::document("document_chunking", error))?
        },
        timeouts::DOCUMENT_PROCESSING,
        "document_chunking",
    )
    .await
}

/// Chunk pages into overlapping character windows.
///
/// Fails when the input is empty or contains no text at all; otherwise always yields at
/// least one chunk. A warning is emitted when the mean chunk size is implausibly small,
/// which indicates a degenerate split.
pub fn chunk_pages(
    pages: &[PageText],
    chunk_size: usize,
    chunk_overlap: usize,
) -> Result<Vec<DocumentChunk>, QueryError> {
    if chunk_size == 0 {
        return Err(QueryError::document(
            "document_chunking",
            "chunk size must be greater than zero",
        ));
    }
    let total_input: usize = pages.iter().map(|page| page.content.chars().count()).sum();
    if pages.is_empty() || total_input == 0 {
        return Err(QueryError::document(
            "document_chunking",
            "no content to chunk",
        ));
    }

    let overlap = chunk_overlap.min(chunk_size.saturating_sub(1));
    let budget = chunk_size - overlap;

    let mut chunks = Vec::new();
    for page in pages {
        let pieces = split_text(&page.content, budget, &SEPARATORS);
        let mut previous: Option<String> = None;
        for piece in pieces {
            let (content, used) = match &previous {
                Some(prev) if overlap > 0 => {
                    let tail = tail_chars(prev, overlap);
                    (format!("{tail}{piece}"), tail.chars().count())
                }
                _ => (piece, 0),
            };
            chunks.push(DocumentChunk {
                content: content.clone(),
                overlap_with_previous: used,
                metadata: page.metadata.clone(),
            });
            previous = Some(content);
        }
    }

    if chunks.is_empty() {
        return Err(QueryError::document(
            "document_chunking",
            "splitting produced no chunks",
        ));
    }

    let mean = chunks
        .iter()
        .map(|chunk| chunk.content.chars().count())
        .sum::<usize>()
        / chunks.len();
    if chunks.len() > 1 && mean < chunk_size / 20 {
        tracing::warn!(
            chunks = chunks.len(),
            mean_chars = mean,
            chunk_size,
            "Mean chunk size is implausibly small; the split may be degenerate"
        );
    }

    tracing::debug!(
        pages = pages.len(),
        chunks = chunks.len(),
        chunk_size,
        overlap,
        "Document chunked"
    );
    Ok(chunks)
}

/// Recursively split `text` into pieces of at most `limit` characters.
fn split_text(text: &str, limit: usize, separators: &[&str]) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let Some(position) = separators.iter().position(|sep| text.contains(sep)) else {
        return hard_cut(text, limit);
    };
    let separator = separators[position];
    let deeper = &separators[position + 1..];
    let separator_len = separator.chars().count();

    let mut pieces = Vec::new();
    let mut buffer = String::new();
    let mut buffer_len = 0usize;

    let flush = |buffer: &mut String, buffer_len: &mut usize, pieces: &mut Vec<String>| {
        if !buffer.trim().is_empty() {
            pieces.push(std::mem::take(buffer));
        } else {
            buffer.clear();
        }
        *buffer_len = 0;
    };

    for part in text.split(separator) {
        let part_len = part.chars().count();

        if part_len > limit {
            flush(&mut buffer, &mut buffer_len, &mut pieces);
            pieces.extend(split_text(part, limit, deeper));
            continue;
        }

        let candidate = if buffer.is_empty() {
            part_len
        } else {
            buffer_len + separator_len + part_len
        };

        if candidate <= limit {
            if !buffer.is_empty() {
                buffer.push_str(separator);
                buffer_len += separator_len;
            }
            buffer.push_str(part);
            buffer_len += part_len;
        } else {
            flush(&mut buffer, &mut buffer_len, &mut pieces);
            buffer.push_str(part);
            buffer_len = part_len;
        }
    }
    flush(&mut buffer, &mut buffer_len, &mut pieces);

    pieces
}

/// Cut `text` into fixed-size character windows, respecting char boundaries.
fn hard_cut(text: &str, limit: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::with_capacity(limit);
    for ch in text.chars() {
        current.push(ch);
        if current.chars().count() == limit {
            pieces.push(std::mem::take(&mut current));
        }
    }
    if !current.trim().is_empty() {
        pieces.push(current);
    }
    pieces
}

/// The last `n` characters of `text`, on a char boundary.
fn tail_chars(text: &str, n: usize) -> &str {
    let total = text.chars().count();
    if total <= n {
        return text;
    }
    let skip = total - n;
    match text.char_indices().nth(skip) {
        Some((offset, _)) => &text[offset..],
        None => "",
    }
}

//! Embedding and vector-store population for document chunks.
//!
//! Each request indexes its own document set; `build` bootstraps the target collection and
//! writes the chunks, while `attach` returns a search-only handle over an existing
//! collection. Embedding runs in small batches sized to the provider's practical limits,
//! and upserts are chunked by the store client. All failures surface as vector-store
//! errors.

use crate::chunking::DocumentChunk;
use crate::config::get_config;
use crate::errors::QueryError;
use crate::qdrant::{ChunkPayload, PointInsert, ScoredPoint};
use crate::resources::ResourceRegistry;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

/// Number of chunks embedded per provider call.
const EMBED_BATCH_SIZE: usize = 10;

/// Indexes chunk lists into the vector store.
pub struct Indexer {
    pub(crate) registry: Arc<ResourceRegistry>,
    pub(crate) vector_size: u64,
}

impl Indexer {
    /// Construct an indexer over the shared registry.
    pub fn new(registry: Arc<ResourceRegistry>) -> Self {
        let vector_size = get_config().embedding_dimension as u64;
        Self {
            registry,
            vector_size,
        }
    }

    /// Embed and index the chunks into `collection`, returning a handle for retrieval.
    pub async fn build(
        &self,
        collection: &str,
        chunks: &[DocumentChunk],
    ) -> Result<SearchHandle, QueryError> {
        let index = self.registry.index()?;
        let embeddings = self.registry.embeddings()?;

        index
            .ensure_collection(collection, self.vector_size)
            .await
            .map_err(|error| QueryError::vector_store("create_vector_store", error))?;

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.content.clone()).collect();
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH_SIZE) {
            let embedded = embeddings
                .embed_many(batch)
                .await
                .map_err(|error| QueryError::vector_store("embed_chunks", error))?;
            vectors.extend(embedded);
        }

        debug_assert_eq!(chunks.len(), vectors.len());

        let points: Vec<PointInsert> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| {
                let digest = chunk_digest(&chunk.content);
                let mut metadata = chunk.metadata.clone();
                metadata.insert("chunk_hash".to_string(), digest.clone());
                PointInsert {
                    id: point_id(&digest),
                    payload: ChunkPayload {
                        text: chunk.content.clone(),
                        metadata,
                    },
                    vector,
                }
            })
            .collect();

        let written = index
            .upsert_points(collection, points)
            .await
            .map_err(|error| QueryError::vector_store("upsert_points", error))?;

        tracing::info!(collection, chunks = written, "Document indexed");
        Ok(self.attach(collection))
    }

    /// Return a search-only handle over an existing collection.
    pub fn attach(&self, collection: &str) -> SearchHandle {
        SearchHandle {
            registry: Arc::clone(&self.registry),
            collection: collection.to_string(),
        }
    }
}

/// Search-only view of one indexed collection.
#[derive(Clone)]
pub struct SearchHandle {
    registry: Arc<ResourceRegistry>,
    collection: String,
}

impl SearchHandle {
    /// Name of the collection this handle searches.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Embed `query` and return the top `k` scored chunks.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredPoint>, QueryError> {
        let embeddings = self.registry.embeddings()?;
        let index = self.registry.index()?;

        let vector = embeddings
            .embed_one(query)
            .await
            .map_err(|error| QueryError::vector_store("search_embedding", error))?;

        index
            .search_points(&self.collection, vector, k)
            .await
            .map_err(|error| QueryError::vector_store("similarity_search", error))
    }
}

/// Hex sha256 digest of the chunk text.
fn chunk_digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Deterministic UUID derived from the chunk digest; Qdrant requires UUID or integer ids.
fn point_id(digest: &str) -> String {
    let bytes = hex::decode(digest).unwrap_or_default();
    let mut head = [0u8; 16];
    for (slot, byte) in head.iter_mut().zip(bytes.iter()) {
        *slot = *byte;
    }
    Uuid::from_bytes(head).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ids_are_stable_for_identical_content() {
        let a = point_id(&chunk_digest("the same chunk"));
        let b = point_id(&chunk_digest("the same chunk"));
        let c = point_id(&chunk_digest("a different chunk"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn digests_are_hex_encoded_sha256() {
        let digest = chunk_digest("abc");
        assert_eq!(digest.len(), 64);
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}

//! Vector index storing chunk embeddings with their scope tags.
//!
//! Every backend derives chunk ids deterministically from `(document_id, ordinal)`, so
//! re-ingesting a document overwrites its chunks in place and prunes any that the new
//! chunking no longer produces.

pub mod filters;
mod memory;
pub mod payload;
mod qdrant;
pub mod types;

pub use memory::{MemoryIndex, cosine_similarity};
pub use payload::{chunk_id, compute_chunk_hash, point_id};
pub use qdrant::QdrantIndex;
pub use types::{
    ChunkInput, ChunkRecord, ChunkScope, IndexError, IndexStats, QueryHit, ScopeFilter,
    UpsertSummary,
};

use crate::config::{Config, VectorBackend};
use async_trait::async_trait;
use std::sync::Arc;

/// Storage contract for chunk embeddings.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Store a document's chunks, replacing whatever was stored for it before.
    ///
    /// `chunks` and `embeddings` must have equal length. Entries with blank text or an empty
    /// vector are dropped; if nothing remains the call fails with [`IndexError::EmptyInput`].
    async fn upsert(
        &self,
        document_id: &str,
        chunks: Vec<ChunkInput>,
        embeddings: Vec<Vec<f32>>,
        scope: &ChunkScope,
    ) -> Result<UpsertSummary, IndexError>;

    /// Return up to `top_k` chunks ranked by cosine similarity.
    ///
    /// Ties are broken by ascending chunk ordinal, then document id.
    async fn query(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: &ScopeFilter,
    ) -> Result<Vec<QueryHit>, IndexError>;

    /// Remove every chunk of a document, returning how many were removed.
    async fn delete_by_document(&self, document_id: &str) -> Result<usize, IndexError>;

    /// Aggregate counters.
    async fn stats(&self) -> Result<IndexStats, IndexError>;
}

/// Build the vector index selected by configuration.
pub fn build_vector_index(config: &Config) -> Result<Arc<dyn VectorIndex>, IndexError> {
    match config.vector_backend {
        VectorBackend::Memory => Ok(Arc::new(MemoryIndex::new())),
        VectorBackend::Qdrant => {
            let url = config
                .qdrant_url
                .as_deref()
                .ok_or_else(|| IndexError::InvalidUrl("QDRANT_URL is not set".into()))?;
            Ok(Arc::new(QdrantIndex::new(
                url,
                config.qdrant_api_key.clone(),
                config.qdrant_collection_name.clone(),
            )?))
        }
    }
}

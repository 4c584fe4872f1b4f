//! Process-local vector index.

use super::payload::{prepare_records, record_metadata};
use super::types::{
    ChunkInput, ChunkRecord, ChunkScope, IndexError, IndexStats, QueryHit, ScopeFilter,
    UpsertSummary, rank_hits,
};
use super::VectorIndex;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

type DocumentChunks = BTreeMap<usize, ChunkRecord>;

/// In-memory [`VectorIndex`] with exact cosine scoring.
#[derive(Default)]
pub struct MemoryIndex {
    documents: RwLock<BTreeMap<String, DocumentChunks>>,
}

impl MemoryIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Chunk ids currently stored for a document, in ordinal order.
    pub async fn chunk_ids(&self, document_id: &str) -> Vec<String> {
        self.documents
            .read()
            .await
            .get(document_id)
            .map(|chunks| chunks.values().map(|r| r.chunk_id.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn upsert(
        &self,
        document_id: &str,
        chunks: Vec<ChunkInput>,
        embeddings: Vec<Vec<f32>>,
        scope: &ChunkScope,
    ) -> Result<UpsertSummary, IndexError> {
        let (records, skipped) = prepare_records(document_id, chunks, embeddings, scope)?;

        let mut documents = self.documents.write().await;
        let existing_dimension = documents
            .iter()
            .filter(|(id, _)| id.as_str() != document_id)
            .flat_map(|(_, chunks)| chunks.values())
            .map(|record| record.embedding.len())
            .next();
        if let Some(expected) = existing_dimension {
            let actual = records[0].embedding.len();
            if expected != actual {
                return Err(IndexError::DimensionMismatch { expected, actual });
            }
        }

        let replacement: DocumentChunks = records
            .into_iter()
            .map(|record| (record.ordinal, record))
            .collect();
        let stored = replacement.len();
        let pruned = documents.get(document_id).map_or(0, |previous| {
            previous
                .keys()
                .filter(|ordinal| !replacement.contains_key(ordinal))
                .count()
        });
        documents.insert(document_id.to_string(), replacement);

        tracing::debug!(document_id, stored, skipped, pruned, "Upserted chunks");
        Ok(UpsertSummary {
            stored,
            skipped,
            pruned,
        })
    }

    async fn query(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: &ScopeFilter,
    ) -> Result<Vec<QueryHit>, IndexError> {
        if top_k == 0 || filter.is_unsatisfiable() {
            return Ok(Vec::new());
        }
        let documents = self.documents.read().await;
        let mut hits = Vec::new();
        for (document_id, chunks) in documents.iter() {
            for record in chunks.values() {
                if !filter.matches(document_id, &record.scope) {
                    continue;
                }
                if record.embedding.len() != embedding.len() {
                    return Err(IndexError::DimensionMismatch {
                        expected: record.embedding.len(),
                        actual: embedding.len(),
                    });
                }
                hits.push(QueryHit {
                    content: record.text.clone(),
                    score: cosine_similarity(embedding, &record.embedding),
                    document_id: document_id.clone(),
                    chunk_ordinal: record.ordinal,
                    chunk_id: record.chunk_id.clone(),
                    metadata: record_metadata(record),
                });
            }
        }
        rank_hits(&mut hits);
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize, IndexError> {
        let removed = self
            .documents
            .write()
            .await
            .remove(document_id)
            .map_or(0, |chunks| chunks.len());
        tracing::debug!(document_id, removed, "Deleted document chunks");
        Ok(removed)
    }

    async fn stats(&self) -> Result<IndexStats, IndexError> {
        let documents = self.documents.read().await;
        Ok(IndexStats {
            total_chunks: documents.values().map(BTreeMap::len).sum(),
            distinct_documents: documents.len(),
        })
    }
}

/// Cosine similarity; zero-norm vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

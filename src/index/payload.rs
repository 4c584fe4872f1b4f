//! Chunk identity, hashing and payload construction.

use super::types::{ChunkInput, ChunkRecord, ChunkScope, IndexError};
use crate::status::now_rfc3339;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Deterministic identifier of a chunk.
pub fn chunk_id(document_id: &str, ordinal: usize) -> String {
    format!("{document_id}_chunk_{ordinal}")
}

/// Qdrant point id derived from a chunk id; stable across re-ingestion.
pub fn point_id(chunk_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, chunk_id.as_bytes())
}

/// Compute a deterministic SHA-256 hash for the chunk text.
pub fn compute_chunk_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)
}

/// Validate an upsert batch and turn it into storable records.
///
/// Returns the records plus the number of entries dropped for blank text or empty vectors.
pub(crate) fn prepare_records(
    document_id: &str,
    chunks: Vec<ChunkInput>,
    embeddings: Vec<Vec<f32>>,
    scope: &ChunkScope,
) -> Result<(Vec<ChunkRecord>, usize), IndexError> {
    if chunks.len() != embeddings.len() {
        return Err(IndexError::CountMismatch {
            chunks: chunks.len(),
            embeddings: embeddings.len(),
        });
    }

    let total = chunks.len();
    let now = now_rfc3339();
    let mut dimension: Option<usize> = None;
    let mut records = Vec::with_capacity(total);
    for (chunk, embedding) in chunks.into_iter().zip(embeddings) {
        if chunk.text.trim().is_empty() || embedding.is_empty() {
            continue;
        }
        match dimension {
            Some(expected) if expected != embedding.len() => {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    actual: embedding.len(),
                });
            }
            Some(_) => {}
            None => dimension = Some(embedding.len()),
        }
        records.push(ChunkRecord {
            chunk_id: chunk_id(document_id, chunk.ordinal),
            document_id: document_id.to_string(),
            ordinal: chunk.ordinal,
            content_hash: compute_chunk_hash(&chunk.text),
            text: chunk.text,
            embedding,
            scope: scope.clone(),
            created_at: now.clone(),
        });
    }

    if records.is_empty() {
        return Err(IndexError::EmptyInput);
    }
    let skipped = total - records.len();
    Ok((records, skipped))
}

/// Payload fields other than the chunk text, exposed as query hit metadata.
pub(crate) fn record_metadata(record: &ChunkRecord) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert(
        "content_hash".into(),
        Value::String(record.content_hash.clone()),
    );
    metadata.insert("timestamp".into(), Value::String(record.created_at.clone()));
    if let Some(user) = &record.scope.user_id {
        metadata.insert("user_id".into(), Value::String(user.clone()));
    }
    if let Some(tenant) = &record.scope.tenant_id {
        metadata.insert("tenant_id".into(), Value::String(tenant.clone()));
    }
    metadata
}

/// Build the payload object stored alongside each indexed chunk.
pub(crate) fn build_payload(record: &ChunkRecord) -> Value {
    let mut payload = record_metadata(record);
    payload.insert(
        "document_id".into(),
        Value::String(record.document_id.clone()),
    );
    payload.insert("chunk_id".into(), Value::String(record.chunk_id.clone()));
    payload.insert("chunk_ordinal".into(), Value::from(record.ordinal));
    payload.insert("text".into(), Value::String(record.text.clone()));
    Value::Object(payload)
}

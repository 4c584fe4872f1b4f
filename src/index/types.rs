//! Shared types used by the vector index backends.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors returned by vector index backends.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Chunk and embedding sequences differ in length.
    #[error("received {chunks} chunks but {embeddings} embeddings")]
    CountMismatch {
        /// Number of chunks supplied.
        chunks: usize,
        /// Number of embeddings supplied.
        embeddings: usize,
    },
    /// Nothing was left to store after dropping blank chunks and empty vectors.
    #[error("no storable chunks after filtering")]
    EmptyInput,
    /// A vector does not match the dimensionality of its peers or of the index.
    #[error("vector dimension {actual} does not match expected {expected}")]
    DimensionMismatch {
        /// Dimension established by the index or the first vector.
        expected: usize,
        /// Offending dimension.
        actual: usize,
    },
    /// Base URL failed to parse or normalize.
    #[error("Invalid Qdrant URL: {0}")]
    InvalidUrl(String),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Qdrant responded with an unexpected status code.
    #[error("Unexpected Qdrant response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned from Qdrant.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
}

/// One chunk handed to [`super::VectorIndex::upsert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInput {
    /// Position of the chunk in the document's chunk sequence.
    pub ordinal: usize,
    /// Chunk text.
    pub text: String,
}

impl ChunkInput {
    /// Build a chunk input.
    pub fn new(ordinal: usize, text: impl Into<String>) -> Self {
        Self {
            ordinal,
            text: text.into(),
        }
    }
}

/// Ownership tags stored with every chunk of a document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkScope {
    /// Submitting user, if known.
    pub user_id: Option<String>,
    /// Tenant the document belongs to, if known.
    pub tenant_id: Option<String>,
}

/// Restrictions applied to similarity queries. All present constraints must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeFilter {
    /// Only chunks of these documents. Ids are trimmed and blank ids ignored; a list with no
    /// usable id matches nothing.
    pub document_ids: Option<Vec<String>>,
    /// Only chunks tagged with this user.
    pub user_id: Option<String>,
    /// Only chunks tagged with this tenant.
    pub tenant_id: Option<String>,
}

impl ScopeFilter {
    /// Requested document ids, trimmed, with blank entries dropped.
    pub fn cleaned_document_ids(&self) -> Option<Vec<&str>> {
        self.document_ids
            .as_ref()
            .map(|ids| ids.iter().filter_map(|id| non_blank(id)).collect())
    }

    /// Requested user, unless blank.
    pub fn cleaned_user_id(&self) -> Option<&str> {
        self.user_id.as_deref().and_then(non_blank)
    }

    /// Requested tenant, unless blank.
    pub fn cleaned_tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref().and_then(non_blank)
    }

    /// Whether the filter can never match: a document id list with no usable entry.
    pub fn is_unsatisfiable(&self) -> bool {
        self.cleaned_document_ids()
            .is_some_and(|ids| ids.is_empty())
    }

    pub(crate) fn matches(&self, document_id: &str, scope: &ChunkScope) -> bool {
        if let Some(ids) = &self.document_ids
            && !ids
                .iter()
                .filter_map(|id| non_blank(id))
                .any(|id| id == document_id)
        {
            return false;
        }
        if let Some(user) = self.cleaned_user_id()
            && scope.user_id.as_deref() != Some(user)
        {
            return false;
        }
        if let Some(tenant) = self.cleaned_tenant_id()
            && scope.tenant_id.as_deref() != Some(tenant)
        {
            return false;
        }
        true
    }
}

fn non_blank(input: &str) -> Option<&str> {
    let trimmed = input.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Ranked query result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryHit {
    /// Chunk text.
    pub content: String,
    /// Cosine similarity to the query vector.
    pub score: f32,
    /// Document the chunk belongs to.
    pub document_id: String,
    /// Position of the chunk in its document.
    pub chunk_ordinal: usize,
    /// Deterministic chunk identifier.
    pub chunk_id: String,
    /// Remaining stored payload (hash, scope tags, timestamp).
    pub metadata: Map<String, Value>,
}

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    /// Chunks written.
    pub stored: usize,
    /// Chunks dropped for blank text or empty vectors.
    pub skipped: usize,
    /// Stale chunks of the same document removed.
    pub pruned: usize,
}

/// Aggregate index counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    /// Stored chunks across all documents.
    pub total_chunks: usize,
    /// Documents with at least one stored chunk.
    pub distinct_documents: usize,
}

/// Validated chunk ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    /// `"{document_id}_chunk_{ordinal}"`.
    pub chunk_id: String,
    /// Owning document.
    pub document_id: String,
    /// Position in the document.
    pub ordinal: usize,
    /// Chunk text.
    pub text: String,
    /// Embedding vector.
    pub embedding: Vec<f32>,
    /// SHA-256 hex digest of the text.
    pub content_hash: String,
    /// Ownership tags.
    pub scope: ChunkScope,
    /// RFC3339 write time.
    pub created_at: String,
}

pub(crate) fn rank_hits(hits: &mut [QueryHit]) {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk_ordinal.cmp(&b.chunk_ordinal))
            .then_with(|| a.document_id.cmp(&b.document_id))
    });
}

#[derive(Deserialize)]
pub(crate) struct QueryResponse {
    pub(crate) result: QueryResponseResult,
}

#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum QueryResponseResult {
    Points(Vec<QueryPoint>),
    Object {
        #[serde(default)]
        points: Vec<QueryPoint>,
    },
}

#[derive(Deserialize)]
pub(crate) struct QueryPoint {
    pub(crate) score: f32,
    #[serde(default)]
    pub(crate) payload: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
pub(crate) struct ScrollResponse {
    pub(crate) result: ScrollResult,
}

#[derive(Deserialize)]
pub(crate) struct ScrollResult {
    #[serde(default)]
    pub(crate) points: Vec<ScrollPoint>,
    #[serde(default)]
    pub(crate) next_page_offset: Option<Value>,
}

#[derive(Deserialize)]
pub(crate) struct ScrollPoint {
    #[serde(default)]
    pub(crate) payload: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
pub(crate) struct CountResponse {
    pub(crate) result: CountResult,
}

#[derive(Deserialize)]
pub(crate) struct CountResult {
    pub(crate) count: usize,
}

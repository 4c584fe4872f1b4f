//! Per-document stage tracking and the extraction error audit log.
//!
//! Every document carries two independent stage-tracks (vector and metadata) that share a
//! single attempt counter. The orchestrator is the only writer once a document has been
//! registered; readers see whatever the last atomic update left behind.

mod memory;

pub use memory::MemoryStatusStore;

use crate::processing::DocumentMetadata;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

/// Progress of one stage-track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Registered but not yet started.
    Pending,
    /// Work for this track is in flight.
    Processing,
    /// The track's data has been stored.
    Completed,
    /// The most recent attempt failed on this track.
    Failed,
}

impl StageStatus {
    /// Whether the track reached an end state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Lowercase label used in logs and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two stage-tracks of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Chunking, embedding and index storage.
    Vector,
    /// Structured extraction and metadata persistence.
    Metadata,
}

/// Pipeline step at which an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// Pulling text out of the raw bytes.
    TextExtraction,
    /// Splitting text into chunks.
    Chunking,
    /// Generating chunk embeddings.
    Embedding,
    /// Writing chunks to the vector index.
    VectorIndex,
    /// Running the structured extraction collaborator.
    StructuredExtraction,
    /// Normalizing and storing the metadata record.
    MetadataPersistence,
}

impl FailureStage {
    /// Stage-track this step belongs to.
    pub fn track(self) -> Stage {
        match self {
            Self::TextExtraction | Self::Chunking | Self::Embedding | Self::VectorIndex => {
                Stage::Vector
            }
            Self::StructuredExtraction | Self::MetadataPersistence => Stage::Metadata,
        }
    }

    /// Label stored with audit records.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TextExtraction => "text_extraction",
            Self::Chunking => "chunking",
            Self::Embedding => "embedding",
            Self::VectorIndex => "vector_index",
            Self::StructuredExtraction => "structured_extraction",
            Self::MetadataPersistence => "metadata_persistence",
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored progress record for a document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentStatus {
    /// Identifier supplied at submission.
    pub document_id: String,
    /// Original filename.
    pub filename: String,
    /// State of the vector track.
    pub vector_stage: StageStatus,
    /// State of the metadata track.
    pub metadata_stage: StageStatus,
    /// Attempts started so far.
    pub attempt_count: u32,
    /// Error text from the last vector-track failure.
    pub vector_error: Option<String>,
    /// Error text from the last metadata-track failure.
    pub metadata_error: Option<String>,
    /// RFC3339 timestamp of registration.
    pub created_at: String,
    /// RFC3339 timestamp of the last mutation.
    pub updated_at: String,
}

impl DocumentStatus {
    /// Fresh `pending/pending/0` record.
    pub fn pending(document_id: &str, filename: &str) -> Self {
        let now = now_rfc3339();
        Self {
            document_id: document_id.to_string(),
            filename: filename.to_string(),
            vector_stage: StageStatus::Pending,
            metadata_stage: StageStatus::Pending,
            attempt_count: 0,
            vector_error: None,
            metadata_error: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Whether both tracks reached an end state.
    pub fn is_terminal(&self) -> bool {
        self.vector_stage.is_terminal() && self.metadata_stage.is_terminal()
    }

    /// Whether both tracks completed.
    pub fn is_completed(&self) -> bool {
        self.vector_stage == StageStatus::Completed
            && self.metadata_stage == StageStatus::Completed
    }
}

/// Audit entry appended once per failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionErrorRecord {
    /// Random identifier of the entry.
    pub id: Uuid,
    /// Document the failure belongs to.
    pub document_id: String,
    /// Step that failed.
    pub stage: FailureStage,
    /// Human-readable error message.
    pub message: String,
    /// Structured context such as error kind and attempt number.
    pub details: serde_json::Value,
    /// RFC3339 timestamp of the failure.
    pub timestamp: String,
    /// Set once an operator acknowledged the failure.
    pub resolved: bool,
}

impl ExtractionErrorRecord {
    /// Build an unresolved record stamped with the current time.
    pub fn new(
        document_id: &str,
        stage: FailureStage,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id: document_id.to_string(),
            stage,
            message: message.into(),
            details,
            timestamp: now_rfc3339(),
            resolved: false,
        }
    }
}

/// Errors surfaced by status store implementations.
#[derive(Debug, Error)]
pub enum StatusStoreError {
    /// The document was never registered or has been removed.
    #[error("document '{0}' is not registered")]
    UnknownDocument(String),
    /// The backing store failed.
    #[error("status store backend failed: {0}")]
    Backend(String),
}

/// Persistence contract for document progress, errors and metadata.
///
/// Each operation is atomic with respect to a single document.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Create a `pending/pending/0` record. Existing records are reset only when both tracks
    /// are terminal, so a re-submission never clobbers a run that is still in flight.
    async fn register(&self, document_id: &str, filename: &str) -> Result<(), StatusStoreError>;

    /// Fetch the record for a document.
    async fn get(&self, document_id: &str) -> Result<Option<DocumentStatus>, StatusStoreError>;

    /// Increment the shared attempt counter and return the new value.
    async fn increment_attempt(&self, document_id: &str) -> Result<u32, StatusStoreError>;

    /// Move one track to `status`, recording `error` text for failures.
    async fn set_stage(
        &self,
        document_id: &str,
        stage: Stage,
        status: StageStatus,
        error: Option<String>,
    ) -> Result<(), StatusStoreError>;

    /// Append an audit record.
    async fn append_error(&self, record: ExtractionErrorRecord) -> Result<(), StatusStoreError>;

    /// Audit records of one document, oldest first.
    async fn errors_for(
        &self,
        document_id: &str,
    ) -> Result<Vec<ExtractionErrorRecord>, StatusStoreError>;

    /// Audit records across documents, newest first, optionally filtered by resolution.
    async fn list_errors(
        &self,
        resolved: Option<bool>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ExtractionErrorRecord>, StatusStoreError>;

    /// Mark an audit record resolved. Returns `false` when the id is unknown.
    async fn resolve_error(&self, id: Uuid) -> Result<bool, StatusStoreError>;

    /// Replace the metadata record of a document in one write.
    async fn save_metadata(&self, metadata: DocumentMetadata) -> Result<(), StatusStoreError>;

    /// Fetch the stored metadata record.
    async fn get_metadata(
        &self,
        document_id: &str,
    ) -> Result<Option<DocumentMetadata>, StatusStoreError>;

    /// Drop status, metadata and audit records. Returns `false` when nothing was stored.
    async fn remove(&self, document_id: &str) -> Result<bool, StatusStoreError>;
}

pub(crate) fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

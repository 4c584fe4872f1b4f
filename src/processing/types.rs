//! Core data types and error definitions for the processing pipeline.

use crate::{
    embedding::EmbeddingClientError,
    extraction::{StructuredExtractionError, TextExtractionError},
    index::IndexError,
    status::{FailureStage, StatusStoreError},
};
use anyhow::Error as TokenizerError;
use std::time::Duration;
use thiserror::Error;

/// Errors produced while turning raw text into token windows.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// Chunking was configured with an impossible token budget.
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
    /// Overlap must leave room for the window to advance.
    #[error("overlap of {overlap} tokens must be smaller than the {max_tokens}-token window")]
    InvalidOverlap {
        /// Requested overlap.
        overlap: usize,
        /// Requested window size.
        max_tokens: usize,
    },
    /// Tokenizer resources were unavailable or rejected the input.
    #[error("tokenizer '{encoding}' failed: {source}")]
    Tokenizer {
        /// Encoding or model we attempted to use.
        encoding: String,
        /// Underlying error raised by the tokenizer library.
        #[source]
        source: TokenizerError,
    },
    /// A token window edge fell inside a multi-byte character.
    #[error("token window splits a character at byte {offset}")]
    SplitCharacter {
        /// Byte offset of the window start.
        offset: usize,
    },
}

/// Storage-side failures surfaced by the pipeline.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Vector index rejected or failed a write.
    #[error(transparent)]
    Index(#[from] IndexError),
    /// Status store failed to persist state.
    #[error(transparent)]
    Status(#[from] StatusStoreError),
}

/// Failure of a single pipeline attempt.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Text could not be extracted from the raw bytes.
    #[error("Text extraction failed: {0}")]
    ExtractionFailed(#[from] TextExtractionError),
    /// Embedding provider failed or returned a malformed batch.
    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(#[from] EmbeddingClientError),
    /// The document produced no chunks that could be stored.
    #[error("No usable chunks: {0}")]
    ChunkingDegenerate(String),
    /// Pipeline settings can never produce chunks; retrying cannot help.
    #[error("Invalid pipeline settings: {0}")]
    InvalidSettings(String),
    /// Structured extraction collaborator failed.
    #[error("Structured extraction failed: {0}")]
    StructuredExtractionFailed(#[from] StructuredExtractionError),
    /// Index or status persistence failed.
    #[error("Storage failed: {0}")]
    StorageFailed(#[from] StorageError),
    /// A collaborator call exceeded its time budget.
    #[error("{operation} timed out after {}s", after.as_secs())]
    Timeout {
        /// Collaborator operation that was running.
        operation: &'static str,
        /// Budget that elapsed.
        after: Duration,
    },
    /// A collaborator call was cancelled by pool shutdown.
    #[error("{operation} was cancelled")]
    Cancelled {
        /// Collaborator operation that was running.
        operation: &'static str,
    },
}

impl PipelineError {
    /// Stable identifier of the error kind, stored with audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExtractionFailed(_) => "extraction_failed",
            Self::EmbeddingFailed(_) => "embedding_failed",
            Self::ChunkingDegenerate(_) => "chunking_degenerate",
            Self::InvalidSettings(_) => "invalid_settings",
            Self::StructuredExtractionFailed(_) => "structured_extraction_failed",
            Self::StorageFailed(_) => "storage_failed",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled { .. } | Self::InvalidSettings(_))
    }
}

impl From<IndexError> for PipelineError {
    fn from(error: IndexError) -> Self {
        Self::StorageFailed(StorageError::Index(error))
    }
}

impl From<StatusStoreError> for PipelineError {
    fn from(error: StatusStoreError) -> Self {
        Self::StorageFailed(StorageError::Status(error))
    }
}

impl From<ChunkingError> for PipelineError {
    fn from(error: ChunkingError) -> Self {
        match error {
            ChunkingError::InvalidChunkSize | ChunkingError::InvalidOverlap { .. } => {
                Self::InvalidSettings(error.to_string())
            }
            other => Self::ChunkingDegenerate(other.to_string()),
        }
    }
}

/// A pipeline error tagged with the stage it interrupted.
#[derive(Debug)]
pub struct StageFailure {
    /// Stage that was running when the error occurred.
    pub stage: FailureStage,
    /// Underlying error.
    pub error: PipelineError,
}

impl StageFailure {
    pub(crate) fn new(stage: FailureStage, error: impl Into<PipelineError>) -> Self {
        Self {
            stage,
            error: error.into(),
        }
    }
}

/// Tuning knobs for a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Token budget of a chunk.
    pub max_tokens: usize,
    /// Tokens shared by adjacent chunks.
    pub overlap_tokens: usize,
    /// Chunk texts per embedding call.
    pub embedding_batch_size: usize,
    /// Attempts before a job is abandoned.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
    /// Time budget of each collaborator call.
    pub call_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            overlap_tokens: 200,
            embedding_batch_size: 32,
            max_attempts: 3,
            retry_delay: Duration::from_secs(5),
            call_timeout: Duration::from_secs(120),
        }
    }
}

/// Terminal state of a job after the retry wrapper returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Both stage-tracks completed.
    Completed {
        /// Attempts used, including the successful one.
        attempts: u32,
        /// Chunks stored in the vector index.
        chunks: usize,
    },
    /// Attempts ran out or the failure cannot be retried; the document is left failed.
    Abandoned {
        /// Attempts used.
        attempts: u32,
        /// Stage of the final failure.
        stage: FailureStage,
        /// Message of the final failure.
        error: String,
    },
    /// The run was cancelled before reaching a natural end.
    Cancelled {
        /// Attempts started before cancellation.
        attempts: u32,
    },
}

impl PipelineOutcome {
    /// Whether both stage-tracks completed.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

//! Document processing pipeline: chunking, normalization, and the per-document orchestrator.

pub mod chunking;
mod guard;
pub mod normalize;
mod orchestrator;
pub mod types;

pub use chunking::{ChunkingEngine, TiktokenTokenizer, Tokenizer, WordTokenizer};
pub use guard::CallGuard;
pub use normalize::{
    ContractStatus, ContractTag, DocumentMetadata, METADATA_FIELDS, MetadataNormalizer,
    RateLookup, StaticRateTable,
};
pub use orchestrator::{Collaborators, PipelineOrchestrator};
pub use types::{
    ChunkingError, PipelineError, PipelineOutcome, PipelineSettings, StageFailure, StorageError,
};

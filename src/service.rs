//! Ingestion service owning the queue, the worker pool and every collaborator handle.

use crate::{
    config::Config,
    embedding::{EmbeddingClient, EmbeddingClientError, HashEmbeddingClient, build_embedding_client},
    events::{BroadcastEventSink, EventSink, EventSubscription},
    extraction::{
        PlainTextExtractor, SentinelExtractor, StructuredExtractionError, StructuredExtractor,
        TextExtractor, build_structured_extractor,
    },
    index::{IndexError, IndexStats, MemoryIndex, QueryHit, ScopeFilter, VectorIndex, build_vector_index},
    metrics::{MetricsSnapshot, PipelineMetrics},
    processing::{
        ChunkingEngine, Collaborators, DocumentMetadata, MetadataNormalizer, PipelineOrchestrator,
        PipelineSettings,
    },
    queue::{ClaimRegistry, IngestJob, IngestionQueue, PoolStatus, QueueError, WorkerPool},
    status::{ExtractionErrorRecord, MemoryStatusStore, StageStatus, StatusStore, StatusStoreError},
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

const DEFAULT_WORKERS: usize = 3;
const DEFAULT_EVENT_CAPACITY: usize = 256;
const DEFAULT_DIMENSION: usize = 768;

/// Errors returned by [`IngestService`] operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request was malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    /// The queue refused the job.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// Status persistence failed.
    #[error(transparent)]
    Status(#[from] StatusStoreError),
    /// Vector index operation failed.
    #[error(transparent)]
    Index(#[from] IndexError),
    /// Query text could not be embedded.
    #[error(transparent)]
    Embedding(#[from] EmbeddingClientError),
    /// Structured extraction provider could not be built.
    #[error(transparent)]
    Extraction(#[from] StructuredExtractionError),
}

/// Everything needed to assemble an [`IngestService`].
pub struct PipelineComponents {
    /// Raw bytes to text.
    pub text_extractor: Arc<dyn TextExtractor>,
    /// Chunk and query embeddings.
    pub embedder: Arc<dyn EmbeddingClient>,
    /// Chunk storage.
    pub index: Arc<dyn VectorIndex>,
    /// Business field extraction.
    pub structured_extractor: Arc<dyn StructuredExtractor>,
    /// Progress, audit and metadata records.
    pub status_store: Arc<dyn StatusStore>,
    /// Live event fan-out.
    pub events: Arc<BroadcastEventSink>,
    /// Chunking engine used by the orchestrator.
    pub chunker: ChunkingEngine,
    /// Metadata normalizer used by the orchestrator.
    pub normalizer: MetadataNormalizer,
    /// Pipeline tuning.
    pub settings: PipelineSettings,
    /// Size of the worker pool.
    pub worker_count: usize,
}

impl PipelineComponents {
    /// In-process components: UTF-8 text, hash embeddings, memory index and status store,
    /// and an extractor that reports every field absent.
    pub fn in_memory() -> Self {
        Self {
            text_extractor: Arc::new(PlainTextExtractor),
            embedder: Arc::new(HashEmbeddingClient::new(DEFAULT_DIMENSION)),
            index: Arc::new(MemoryIndex::new()),
            structured_extractor: Arc::new(SentinelExtractor),
            status_store: Arc::new(MemoryStatusStore::new()),
            events: Arc::new(BroadcastEventSink::new(DEFAULT_EVENT_CAPACITY)),
            chunker: ChunkingEngine::from_encoding("cl100k_base"),
            normalizer: MetadataNormalizer::default(),
            settings: PipelineSettings::default(),
            worker_count: DEFAULT_WORKERS,
        }
    }

    /// Components selected by configuration.
    pub fn from_config(config: &Config) -> Result<Self, ServiceError> {
        tracing::info!("Initializing pipeline collaborators");
        let embedder = build_embedding_client(config)?;
        let structured_extractor = build_structured_extractor(config)?;
        let index = build_vector_index(config)?;
        tracing::info!(
            embedding_provider = ?config.embedding_provider,
            extraction_provider = ?config.extraction_provider,
            vector_backend = ?config.vector_backend,
            "Pipeline collaborators initialized"
        );

        Ok(Self {
            text_extractor: Arc::new(PlainTextExtractor),
            embedder,
            index,
            structured_extractor,
            status_store: Arc::new(MemoryStatusStore::new()),
            events: Arc::new(BroadcastEventSink::new(config.event_channel_capacity)),
            chunker: ChunkingEngine::from_encoding(&config.tokenizer_encoding),
            normalizer: MetadataNormalizer::default(),
            settings: config.pipeline_settings(),
            worker_count: config.worker_count,
        })
    }
}

/// Snapshot of one document as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// Document id.
    pub document_id: String,
    /// Original filename.
    pub filename: String,
    /// Vector track progress.
    pub vector_stage: StageStatus,
    /// Metadata track progress.
    pub metadata_stage: StageStatus,
    /// Attempts started so far.
    pub attempt_count: u32,
    /// Messages of audit records not yet resolved, oldest first.
    pub errors: Vec<String>,
}

/// What [`IngestService::delete_by_document`] removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeleteSummary {
    /// Chunks removed from the vector index.
    pub chunks_removed: usize,
    /// Whether status, metadata or audit records existed.
    pub records_removed: bool,
}

/// Query payload: free text embedded with the configured client, or a ready vector.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryInput {
    /// Text to embed.
    Text(String),
    /// Precomputed query vector.
    Embedding(Vec<f32>),
}

/// Entry point for submitting documents and observing their progress.
///
/// Construct it once near process start, call [`IngestService::start`], and share it
/// through an `Arc`.
pub struct IngestService {
    queue: Arc<IngestionQueue>,
    pool: WorkerPool,
    orchestrator: Arc<PipelineOrchestrator>,
    embedder: Arc<dyn EmbeddingClient>,
    index: Arc<dyn VectorIndex>,
    status_store: Arc<dyn StatusStore>,
    events: Arc<BroadcastEventSink>,
    metrics: Arc<PipelineMetrics>,
}

impl IngestService {
    /// Wire the queue, pool and orchestrator around `components`. Workers are not started.
    pub fn new(components: PipelineComponents) -> Self {
        let PipelineComponents {
            text_extractor,
            embedder,
            index,
            structured_extractor,
            status_store,
            events,
            chunker,
            normalizer,
            settings,
            worker_count,
        } = components;

        let metrics = Arc::new(PipelineMetrics::new());
        let collaborators = Collaborators {
            text_extractor,
            embedder: Arc::clone(&embedder),
            index: Arc::clone(&index),
            structured_extractor,
            status_store: Arc::clone(&status_store),
            events: Arc::clone(&events) as Arc<dyn EventSink>,
        };
        let orchestrator = Arc::new(
            PipelineOrchestrator::new(collaborators, settings)
                .with_chunker(chunker)
                .with_normalizer(normalizer)
                .with_metrics(Arc::clone(&metrics)),
        );
        let queue = Arc::new(IngestionQueue::new());
        let pool = WorkerPool::new(
            worker_count,
            Arc::clone(&queue),
            Arc::clone(&orchestrator),
            Arc::new(ClaimRegistry::new()),
        );

        Self {
            queue,
            pool,
            orchestrator,
            embedder,
            index,
            status_store,
            events,
            metrics,
        }
    }

    /// Start the worker pool.
    pub async fn start(&self) {
        self.pool.start().await;
    }

    /// Stop the worker pool after in-flight jobs finish. Queued jobs stay queued.
    pub async fn stop(&self) {
        self.pool.stop().await;
    }

    /// Stop the worker pool, cancelling in-flight collaborator calls.
    pub async fn abort(&self) {
        self.pool.abort().await;
    }

    /// Stop accepting submissions. Queued documents are still processed; once the backlog
    /// drains, idle workers have nothing left to wait for.
    pub fn close(&self) {
        self.queue.close();
        tracing::info!(queue_depth = self.queue.size(), "Ingestion queue closed");
    }

    /// Register a document as `pending/pending/0` and queue it for processing.
    pub async fn enqueue(
        &self,
        document_id: &str,
        bytes: Vec<u8>,
        filename: &str,
        user_id: Option<String>,
        tenant_id: Option<String>,
    ) -> Result<(), ServiceError> {
        if document_id.trim().is_empty() {
            return Err(ServiceError::InvalidRequest(
                "document_id must not be empty".into(),
            ));
        }
        if self.queue.is_closed() {
            return Err(QueueError::Closed.into());
        }

        self.status_store.register(document_id, filename).await?;
        let job = IngestJob::new(document_id, bytes, filename)
            .with_user(user_id)
            .with_tenant(tenant_id);
        self.queue.enqueue(job)?;
        tracing::info!(document_id, filename, "Document queued");
        Ok(())
    }

    /// Progress of a document, or `None` when it was never submitted or has been deleted.
    pub async fn get_status(&self, document_id: &str) -> Result<Option<StatusReport>, ServiceError> {
        let Some(status) = self.status_store.get(document_id).await? else {
            return Ok(None);
        };
        let errors = self
            .status_store
            .errors_for(document_id)
            .await?
            .into_iter()
            .filter(|record| !record.resolved)
            .map(|record| record.message)
            .collect();

        Ok(Some(StatusReport {
            document_id: status.document_id,
            filename: status.filename,
            vector_stage: status.vector_stage,
            metadata_stage: status.metadata_stage,
            attempt_count: status.attempt_count,
            errors,
        }))
    }

    /// Pool and queue counters.
    pub fn get_queue_status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Receive events published from now on, optionally only those of one owner.
    pub fn subscribe(&self, owner: Option<String>) -> EventSubscription {
        self.events.subscribe(owner)
    }

    /// Remove a document's chunks, status, metadata and audit records. Idempotent.
    pub async fn delete_by_document(&self, document_id: &str) -> Result<DeleteSummary, ServiceError> {
        let chunks_removed = self.index.delete_by_document(document_id).await?;
        let records_removed = self.status_store.remove(document_id).await?;
        tracing::info!(document_id, chunks_removed, records_removed, "Document deleted");
        Ok(DeleteSummary {
            chunks_removed,
            records_removed,
        })
    }

    /// Rank stored chunks against `input`.
    pub async fn query(
        &self,
        input: QueryInput,
        top_k: usize,
        filter: &ScopeFilter,
    ) -> Result<Vec<QueryHit>, ServiceError> {
        let embedding = match input {
            QueryInput::Embedding(vector) => vector,
            QueryInput::Text(text) => {
                if text.trim().is_empty() {
                    return Err(ServiceError::InvalidRequest("query text is empty".into()));
                }
                self.embedder
                    .generate_embeddings(vec![text])
                    .await?
                    .pop()
                    .ok_or(EmbeddingClientError::CountMismatch {
                        expected: 1,
                        actual: 0,
                    })?
            }
        };
        if embedding.is_empty() {
            return Err(ServiceError::InvalidRequest(
                "query embedding is empty".into(),
            ));
        }

        let hits = self.index.query(&embedding, top_k, filter).await?;
        tracing::debug!(top_k, hits = hits.len(), "Query served");
        Ok(hits)
    }

    /// Stored metadata record of a document.
    pub async fn get_metadata(
        &self,
        document_id: &str,
    ) -> Result<Option<DocumentMetadata>, ServiceError> {
        Ok(self.status_store.get_metadata(document_id).await?)
    }

    /// Audit records across documents, newest first.
    pub async fn list_errors(
        &self,
        resolved: Option<bool>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ExtractionErrorRecord>, ServiceError> {
        Ok(self.status_store.list_errors(resolved, limit, offset).await?)
    }

    /// Mark an audit record resolved. Returns `false` for unknown ids.
    pub async fn resolve_error(&self, id: Uuid) -> Result<bool, ServiceError> {
        Ok(self.status_store.resolve_error(id).await?)
    }

    /// Pipeline counters.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Vector index counters.
    pub async fn index_stats(&self) -> Result<IndexStats, ServiceError> {
        Ok(self.index.stats().await?)
    }

    /// Orchestrator shared by the workers.
    pub fn orchestrator(&self) -> &Arc<PipelineOrchestrator> {
        &self.orchestrator
    }
}

//! Runs one document through every pipeline stage, retrying the whole job on failure.

use super::{
    chunking::ChunkingEngine,
    guard::CallGuard,
    normalize::MetadataNormalizer,
    types::{PipelineError, PipelineOutcome, PipelineSettings, StageFailure},
};
use crate::{
    embedding::{EmbeddingClient, EmbeddingClientError},
    events::{EventSink, PipelineEvent},
    extraction::{SourceDocument, StructuredExtractor, TextExtractor},
    index::{ChunkInput, ChunkScope, VectorIndex},
    metrics::PipelineMetrics,
    queue::IngestJob,
    status::{ExtractionErrorRecord, FailureStage, Stage, StageStatus, StatusStore},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

const DEFAULT_ENCODING: &str = "cl100k_base";

/// External services the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    /// Raw bytes to text.
    pub text_extractor: Arc<dyn TextExtractor>,
    /// Chunk texts to vectors.
    pub embedder: Arc<dyn EmbeddingClient>,
    /// Chunk storage and similarity search.
    pub index: Arc<dyn VectorIndex>,
    /// Text to business fields.
    pub structured_extractor: Arc<dyn StructuredExtractor>,
    /// Progress, audit and metadata persistence.
    pub status_store: Arc<dyn StatusStore>,
    /// Live progress notifications.
    pub events: Arc<dyn EventSink>,
}

/// Drives the per-document state machine.
///
/// Every attempt walks the vector track (extract, chunk, embed, index) and then the metadata
/// track (structured extraction, normalization, persistence). A failed attempt appends one
/// audit record, marks every track it did not finish as failed and restarts the whole job
/// after a fixed delay until the attempt budget is spent.
pub struct PipelineOrchestrator {
    collaborators: Collaborators,
    chunker: ChunkingEngine,
    normalizer: MetadataNormalizer,
    settings: PipelineSettings,
    metrics: Arc<PipelineMetrics>,
}

impl PipelineOrchestrator {
    /// Create an orchestrator that chunks with the `cl100k_base` encoding and normalizes with
    /// the default rate table.
    pub fn new(collaborators: Collaborators, settings: PipelineSettings) -> Self {
        Self {
            collaborators,
            chunker: ChunkingEngine::from_encoding(DEFAULT_ENCODING),
            normalizer: MetadataNormalizer::default(),
            settings,
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    /// Replace the chunking engine.
    pub fn with_chunker(mut self, chunker: ChunkingEngine) -> Self {
        self.chunker = chunker;
        self
    }

    /// Replace the metadata normalizer.
    pub fn with_normalizer(mut self, normalizer: MetadataNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Share an existing metrics accumulator.
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Settings this orchestrator runs with.
    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Counters updated by every run.
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Process `job` until it completes, exhausts its attempts, hits a failure that cannot be
    /// retried, or `cancel` fires.
    pub async fn run(&self, job: &IngestJob, cancel: &CancellationToken) -> PipelineOutcome {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempts = 0;

        loop {
            if cancel.is_cancelled() {
                return PipelineOutcome::Cancelled { attempts };
            }
            attempts += 1;

            let guard = CallGuard::new(self.settings.call_timeout, cancel);
            let span = tracing::info_span!(
                "pipeline_attempt",
                document_id = %job.document_id,
                attempt = attempts,
                max_attempts
            );
            let failure = match self.run_attempt(job, &guard).instrument(span).await {
                Ok(chunks) => {
                    self.metrics.record_completed();
                    tracing::info!(
                        document_id = %job.document_id,
                        attempts,
                        chunks,
                        "Document processed"
                    );
                    return PipelineOutcome::Completed { attempts, chunks };
                }
                Err(failure) => failure,
            };

            let cancelled = cancel.is_cancelled()
                || matches!(failure.error, PipelineError::Cancelled { .. });
            let retryable = failure.error.is_retryable();
            let will_retry = !cancelled && retryable && attempts < max_attempts;
            self.record_failure(job, attempts, &failure).await;
            self.metrics.record_failed_attempt(will_retry);

            if cancelled {
                tracing::warn!(document_id = %job.document_id, attempts, "Pipeline cancelled");
                return PipelineOutcome::Cancelled { attempts };
            }
            if !will_retry {
                self.metrics.record_abandoned();
                tracing::error!(
                    document_id = %job.document_id,
                    attempts,
                    retryable,
                    stage = failure.stage.as_str(),
                    error = %failure.error,
                    "Abandoning document"
                );
                return PipelineOutcome::Abandoned {
                    attempts,
                    stage: failure.stage,
                    error: failure.error.to_string(),
                };
            }

            tracing::info!(
                document_id = %job.document_id,
                attempt = attempts,
                delay_secs = self.settings.retry_delay.as_secs(),
                "Retrying document"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return PipelineOutcome::Cancelled { attempts },
                _ = tokio::time::sleep(self.settings.retry_delay) => {}
            }
        }
    }

    async fn run_attempt(&self, job: &IngestJob, guard: &CallGuard) -> Result<usize, StageFailure> {
        let Collaborators {
            text_extractor,
            embedder: _,
            index,
            structured_extractor,
            status_store,
            events: _,
        } = &self.collaborators;
        let document_id = job.document_id.as_str();
        let owner = job.user_id.as_deref();

        let count = guard
            .run("status_store", status_store.increment_attempt(document_id))
            .await
            .map_err(|error| StageFailure::new(FailureStage::TextExtraction, error))?;
        self.set_stage(guard, document_id, Stage::Vector, StageStatus::Processing)
            .await
            .map_err(|error| StageFailure::new(FailureStage::TextExtraction, error))?;
        tracing::info!(document_id, attempt_count = count, "Vector stage started");
        self.emit(PipelineEvent::progress(document_id, owner, "processing"))
            .await;

        let text = guard
            .run(
                "text_extraction",
                text_extractor.extract(&job.bytes, &job.filename),
            )
            .await
            .map_err(|error| StageFailure::new(FailureStage::TextExtraction, error))?;

        let chunks = self
            .chunk(&text)
            .map_err(|error| StageFailure::new(FailureStage::Chunking, error))?;
        let (chunks, embeddings) = self
            .embed(guard, chunks)
            .await
            .map_err(|error| StageFailure::new(FailureStage::Embedding, error))?;

        let scope = ChunkScope {
            user_id: job.user_id.clone(),
            tenant_id: job.tenant_id.clone(),
        };
        let summary = guard
            .run(
                "vector_index",
                index.upsert(document_id, chunks, embeddings, &scope),
            )
            .await
            .map_err(|error| StageFailure::new(FailureStage::VectorIndex, error))?;
        self.set_stage(guard, document_id, Stage::Vector, StageStatus::Completed)
            .await
            .map_err(|error| StageFailure::new(FailureStage::VectorIndex, error))?;
        self.metrics.record_chunks(summary.stored as u64);
        tracing::info!(
            document_id,
            stored = summary.stored,
            skipped = summary.skipped,
            pruned = summary.pruned,
            "Vector stage completed"
        );
        self.emit(PipelineEvent::vector_complete(document_id, owner))
            .await;
        self.emit(PipelineEvent::progress(document_id, owner, "vector_completed"))
            .await;

        self.set_stage(guard, document_id, Stage::Metadata, StageStatus::Processing)
            .await
            .map_err(|error| StageFailure::new(FailureStage::StructuredExtraction, error))?;
        let source = SourceDocument {
            filename: &job.filename,
            bytes: &job.bytes,
        };
        let fields = guard
            .run(
                "structured_extraction",
                structured_extractor.extract(&text, Some(source)),
            )
            .await
            .map_err(|error| StageFailure::new(FailureStage::StructuredExtraction, error))?;

        let metadata = self
            .normalizer
            .normalize(document_id, fields, text.chars().count());
        guard
            .run("status_store", status_store.save_metadata(metadata.clone()))
            .await
            .map_err(|error| StageFailure::new(FailureStage::MetadataPersistence, error))?;
        self.set_stage(guard, document_id, Stage::Metadata, StageStatus::Completed)
            .await
            .map_err(|error| StageFailure::new(FailureStage::MetadataPersistence, error))?;
        tracing::info!(
            document_id,
            contract_status = metadata.contract_status.as_str(),
            contract_tag = metadata.contract_tag.as_str(),
            "Metadata stage completed"
        );
        self.emit(PipelineEvent::metadata_extracted(
            document_id,
            owner,
            metadata.clone(),
        ))
        .await;
        self.emit(PipelineEvent::metadata_completed(document_id, owner, metadata))
            .await;

        Ok(summary.stored)
    }

    /// Split text into ordered chunk inputs, dropping blank windows but keeping ordinals.
    fn chunk(&self, text: &str) -> Result<Vec<ChunkInput>, PipelineError> {
        let windows = self.chunker.split(
            text,
            self.settings.max_tokens,
            self.settings.overlap_tokens,
        )?;
        let total = windows.len();
        let chunks: Vec<ChunkInput> = windows
            .into_iter()
            .enumerate()
            .filter(|(_, window)| !window.trim().is_empty())
            .map(|(ordinal, window)| ChunkInput::new(ordinal, window))
            .collect();
        tracing::debug!(windows = total, kept = chunks.len(), "Text chunked");

        if chunks.is_empty() {
            return Err(PipelineError::ChunkingDegenerate(
                "document produced no non-empty chunks".into(),
            ));
        }
        Ok(chunks)
    }

    /// Embed chunks in batches and drop the ones that came back without a vector.
    async fn embed(
        &self,
        guard: &CallGuard,
        chunks: Vec<ChunkInput>,
    ) -> Result<(Vec<ChunkInput>, Vec<Vec<f32>>), PipelineError> {
        let batch_size = self.settings.embedding_batch_size.max(1);
        let mut embeddings = Vec::with_capacity(chunks.len());

        for batch in chunks.chunks(batch_size) {
            let texts: Vec<String> = batch.iter().map(|chunk| chunk.text.clone()).collect();
            let vectors = guard
                .run(
                    "embedding",
                    self.collaborators.embedder.generate_embeddings(texts),
                )
                .await?;
            if vectors.len() != batch.len() {
                return Err(EmbeddingClientError::CountMismatch {
                    expected: batch.len(),
                    actual: vectors.len(),
                }
                .into());
            }
            embeddings.extend(vectors);
        }

        let (chunks, embeddings): (Vec<_>, Vec<_>) = chunks
            .into_iter()
            .zip(embeddings)
            .filter(|(_, vector)| !vector.is_empty())
            .unzip();
        if chunks.is_empty() {
            return Err(PipelineError::ChunkingDegenerate(
                "every chunk embedding came back empty".into(),
            ));
        }
        Ok((chunks, embeddings))
    }

    async fn set_stage(
        &self,
        guard: &CallGuard,
        document_id: &str,
        stage: Stage,
        status: StageStatus,
    ) -> Result<(), PipelineError> {
        guard
            .run(
                "status_store",
                self.collaborators
                    .status_store
                    .set_stage(document_id, stage, status, None),
            )
            .await
    }

    /// Persist the outcome of a failed attempt. Store errors here are logged, not raised.
    async fn record_failure(&self, job: &IngestJob, attempt: u32, failure: &StageFailure) {
        let store = &self.collaborators.status_store;
        let document_id = job.document_id.as_str();
        let message = failure.error.to_string();
        tracing::warn!(
            document_id,
            attempt,
            stage = failure.stage.as_str(),
            kind = failure.error.kind(),
            error = %message,
            "Pipeline attempt failed"
        );

        let tracks: &[Stage] = match failure.stage.track() {
            Stage::Vector => &[Stage::Vector, Stage::Metadata],
            Stage::Metadata => &[Stage::Metadata],
        };
        for track in tracks {
            if let Err(error) = store
                .set_stage(document_id, *track, StageStatus::Failed, Some(message.clone()))
                .await
            {
                tracing::error!(document_id, error = %error, "Failed to mark stage as failed");
            }
        }

        let details = serde_json::json!({
            "kind": failure.error.kind(),
            "attempt": attempt,
            "filename": job.filename,
        });
        let record = ExtractionErrorRecord::new(document_id, failure.stage, &message, details);
        if let Err(error) = store.append_error(record).await {
            tracing::error!(document_id, error = %error, "Failed to append extraction error");
        }

        self.emit(PipelineEvent::failed(
            document_id,
            job.user_id.as_deref(),
            &message,
        ))
        .await;
    }

    async fn emit(&self, event: PipelineEvent) {
        let kind = event.kind;
        if let Err(error) = self.collaborators.events.publish(event).await {
            tracing::warn!(event = ?kind, error = %error, "Event delivery failed");
        }
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use rustyingest::{
    embedding::{EmbeddingClient, EmbeddingClientError, HashEmbeddingClient},
    events::{BroadcastEventSink, EventKind},
    extraction::{
        FieldMap, PlainTextExtractor, SentinelExtractor, SourceDocument, StructuredExtractionError,
        StructuredExtractor,
    },
    index::{ChunkInput, ChunkScope, MemoryIndex, ScopeFilter, VectorIndex},
    processing::{
        ChunkingEngine, Collaborators, ContractStatus, ContractTag, PipelineOrchestrator,
        PipelineOutcome, PipelineSettings, WordTokenizer,
    },
    queue::IngestJob,
    service::{IngestService, PipelineComponents, QueryInput, StatusReport},
    status::{FailureStage, MemoryStatusStore, StageStatus, StatusStore},
};
use tokio_util::sync::CancellationToken;

const DIMENSION: usize = 32;

fn settings() -> PipelineSettings {
    PipelineSettings {
        max_tokens: 16,
        overlap_tokens: 4,
        embedding_batch_size: 2,
        ..PipelineSettings::default()
    }
}

fn words(prefix: &str, count: usize) -> Vec<u8> {
    (0..count)
        .map(|index| format!("{prefix}{index}"))
        .collect::<Vec<_>>()
        .join(" ")
        .into_bytes()
}

struct FailingEmbedder {
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingClient for FailingEmbedder {
    async fn generate_embeddings(
        &self,
        _texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(EmbeddingClientError::ProviderUnavailable(
            "connection refused".into(),
        ))
    }
}

/// Fails the first `failures` calls, then hashes.
struct FlakyEmbedder {
    failures: usize,
    calls: AtomicUsize,
    inner: HashEmbeddingClient,
}

#[async_trait]
impl EmbeddingClient for FlakyEmbedder {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(EmbeddingClientError::GenerationFailed("busy".into()));
        }
        self.inner.generate_embeddings(texts).await
    }
}

/// Records how many calls overlap in time.
#[derive(Default)]
struct ConcurrencyTracker {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl EmbeddingClient for ConcurrencyTracker {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(texts.iter().map(|_| vec![1.0; DIMENSION]).collect())
    }
}

struct ScriptedExtractor(FieldMap);

#[async_trait]
impl StructuredExtractor for ScriptedExtractor {
    async fn extract(
        &self,
        _text: &str,
        _source: Option<SourceDocument<'_>>,
    ) -> Result<FieldMap, StructuredExtractionError> {
        Ok(self.0.clone())
    }
}

struct FailingExtractor;

#[async_trait]
impl StructuredExtractor for FailingExtractor {
    async fn extract(
        &self,
        _text: &str,
        _source: Option<SourceDocument<'_>>,
    ) -> Result<FieldMap, StructuredExtractionError> {
        Err(StructuredExtractionError::GenerationFailed(
            "model overloaded".into(),
        ))
    }
}

struct Harness {
    store: Arc<MemoryStatusStore>,
    index: Arc<MemoryIndex>,
    orchestrator: PipelineOrchestrator,
}

fn harness(
    embedder: Arc<dyn EmbeddingClient>,
    extractor: Arc<dyn StructuredExtractor>,
) -> Harness {
    let store = Arc::new(MemoryStatusStore::new());
    let index = Arc::new(MemoryIndex::new());
    let collaborators = Collaborators {
        text_extractor: Arc::new(PlainTextExtractor),
        embedder,
        index: index.clone(),
        structured_extractor: extractor,
        status_store: store.clone(),
        events: Arc::new(BroadcastEventSink::new(64)),
    };
    let orchestrator = PipelineOrchestrator::new(collaborators, settings())
        .with_chunker(ChunkingEngine::new(Arc::new(WordTokenizer::new())));
    Harness {
        store,
        index,
        orchestrator,
    }
}

fn components() -> PipelineComponents {
    PipelineComponents {
        embedder: Arc::new(HashEmbeddingClient::new(DIMENSION)),
        chunker: ChunkingEngine::new(Arc::new(WordTokenizer::new())),
        settings: settings(),
        ..PipelineComponents::in_memory()
    }
}

async fn wait_settled(service: &IngestService, document_ids: &[&str]) -> Vec<StatusReport> {
    for _ in 0..2_000 {
        let pool = service.get_queue_status();
        let mut reports = Vec::new();
        for document_id in document_ids {
            if let Some(report) = service.get_status(document_id).await.unwrap() {
                reports.push(report);
            }
        }
        let settled = pool.queue_depth == 0
            && pool.busy_workers == 0
            && reports.len() == document_ids.len()
            && reports.iter().all(|report| {
                report.attempt_count > 0
                    && report.vector_stage.is_terminal()
                    && report.metadata_stage.is_terminal()
            });
        if settled {
            return reports;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("documents did not settle: {document_ids:?}");
}

#[tokio::test(start_paused = true)]
async fn embedding_outage_fails_three_attempts_with_three_audit_records() {
    let embedder = Arc::new(FailingEmbedder {
        calls: AtomicUsize::new(0),
    });
    let harness = harness(embedder.clone(), Arc::new(SentinelExtractor));
    harness.store.register("doc-1", "a.txt").await.unwrap();
    let job = IngestJob::new("doc-1", words("w", 40), "a.txt");

    let started = tokio::time::Instant::now();
    let outcome = harness
        .orchestrator
        .run(&job, &CancellationToken::new())
        .await;

    assert!(matches!(
        outcome,
        PipelineOutcome::Abandoned {
            attempts: 3,
            stage: FailureStage::Embedding,
            ..
        }
    ));
    // Two fixed delays separate the three attempts.
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);

    let status = harness.store.get("doc-1").await.unwrap().unwrap();
    assert_eq!(status.vector_stage, StageStatus::Failed);
    assert_eq!(status.metadata_stage, StageStatus::Failed);
    assert_eq!(status.attempt_count, 3);
    assert!(
        status
            .vector_error
            .as_deref()
            .is_some_and(|error| error.contains("connection refused"))
    );

    let errors = harness.store.errors_for("doc-1").await.unwrap();
    assert_eq!(errors.len(), 3);
    assert!(errors.iter().all(|record| record.stage == FailureStage::Embedding));
    let attempts: Vec<_> = errors
        .iter()
        .map(|record| record.details["attempt"].clone())
        .collect();
    assert_eq!(attempts, vec![json!(1), json!(2), json!(3)]);
    assert!(harness.index.chunk_ids("doc-1").await.is_empty());

    let metrics = harness.orchestrator.metrics().snapshot();
    assert_eq!(metrics.attempts_failed, 3);
    assert_eq!(metrics.retries, 2);
    assert_eq!(metrics.documents_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn transient_embedding_failure_recovers_on_retry() {
    let embedder = Arc::new(FlakyEmbedder {
        failures: 1,
        calls: AtomicUsize::new(0),
        inner: HashEmbeddingClient::new(DIMENSION),
    });
    let harness = harness(embedder, Arc::new(SentinelExtractor));
    harness.store.register("doc-1", "a.txt").await.unwrap();
    let job = IngestJob::new("doc-1", words("w", 20), "a.txt");

    let outcome = harness
        .orchestrator
        .run(&job, &CancellationToken::new())
        .await;

    assert_eq!(
        outcome,
        PipelineOutcome::Completed {
            attempts: 2,
            chunks: 2
        }
    );
    let status = harness.store.get("doc-1").await.unwrap().unwrap();
    assert!(status.is_completed());
    assert_eq!(status.attempt_count, 2);
    assert_eq!(status.vector_error, None);
    assert_eq!(harness.store.errors_for("doc-1").await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn metadata_failure_keeps_vector_track_completed() {
    let harness = harness(
        Arc::new(HashEmbeddingClient::new(DIMENSION)),
        Arc::new(FailingExtractor),
    );
    harness.store.register("doc-1", "a.txt").await.unwrap();
    let job = IngestJob::new("doc-1", words("w", 30), "a.txt");

    let outcome = harness
        .orchestrator
        .run(&job, &CancellationToken::new())
        .await;

    assert!(matches!(
        outcome,
        PipelineOutcome::Abandoned {
            stage: FailureStage::StructuredExtraction,
            ..
        }
    ));
    let status = harness.store.get("doc-1").await.unwrap().unwrap();
    assert_eq!(status.vector_stage, StageStatus::Completed);
    assert_eq!(status.metadata_stage, StageStatus::Failed);
    assert_eq!(status.vector_error, None);
    assert!(status.metadata_error.is_some());
    assert_eq!(harness.store.errors_for("doc-1").await.unwrap().len(), 3);
    assert!(harness.store.get_metadata("doc-1").await.unwrap().is_none());
    assert_eq!(harness.index.chunk_ids("doc-1").await.len(), 3);
}

#[tokio::test]
async fn absent_vendor_is_draft_whatever_the_dates() {
    let fields: FieldMap = [
        ("vendor_name", "NA"),
        ("start_date", "2020-01-01"),
        ("end_date", "2999-12-31"),
        ("contract_status", "Active"),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value.to_string()))
    .collect();
    let harness = harness(
        Arc::new(HashEmbeddingClient::new(DIMENSION)),
        Arc::new(ScriptedExtractor(fields)),
    );
    harness.store.register("doc-1", "a.txt").await.unwrap();
    let job = IngestJob::new("doc-1", words("w", 10), "a.txt");

    let outcome = harness
        .orchestrator
        .run(&job, &CancellationToken::new())
        .await;
    assert!(outcome.is_completed());

    let metadata = harness.store.get_metadata("doc-1").await.unwrap().unwrap();
    assert_eq!(metadata.contract_status, ContractStatus::Draft);
    assert_eq!(metadata.contract_tag, ContractTag::NotApplicable);
    assert_eq!(metadata.field("start_date"), Some("01-01-2020"));
    assert_eq!(metadata.field("contract_name"), Some("NA"));
}

#[tokio::test]
async fn reprocessing_overwrites_and_prunes_chunks() {
    let harness = harness(
        Arc::new(HashEmbeddingClient::new(DIMENSION)),
        Arc::new(SentinelExtractor),
    );
    harness.store.register("doc-1", "a.txt").await.unwrap();
    let token = CancellationToken::new();

    let long = IngestJob::new("doc-1", words("w", 40), "a.txt");
    harness.orchestrator.run(&long, &token).await;
    let first = harness.index.chunk_ids("doc-1").await;
    harness.orchestrator.run(&long, &token).await;
    assert_eq!(harness.index.chunk_ids("doc-1").await, first);

    let short = IngestJob::new("doc-1", words("w", 10), "a.txt");
    harness.orchestrator.run(&short, &token).await;
    assert_eq!(harness.index.chunk_ids("doc-1").await, vec!["doc-1_chunk_0"]);
    assert_eq!(harness.index.stats().await.unwrap().total_chunks, 1);
}

#[tokio::test]
async fn document_filter_never_leaks_other_documents() {
    let index = Arc::new(MemoryIndex::new());
    let scope = ChunkScope::default();
    for document in 0..100 {
        let document_id = format!("other-{document}");
        index
            .upsert(
                &document_id,
                vec![ChunkInput::new(0, format!("text of {document_id}"))],
                vec![vec![1.0, 0.0, 0.0]],
                &scope,
            )
            .await
            .unwrap();
    }
    index
        .upsert(
            "doc-1",
            vec![ChunkInput::new(0, "far away text")],
            vec![vec![0.0, 0.0, 1.0]],
            &scope,
        )
        .await
        .unwrap();
    let service = IngestService::new(PipelineComponents {
        index: index.clone(),
        ..components()
    });

    let filter = ScopeFilter {
        document_ids: Some(vec!["doc-1".into()]),
        ..ScopeFilter::default()
    };
    let hits = service
        .query(QueryInput::Embedding(vec![1.0, 0.0, 0.0]), 50, &filter)
        .await
        .unwrap();

    assert_eq!(hits.len(), 1);
    assert!(hits.iter().all(|hit| hit.document_id == "doc-1"));
    assert_eq!(service.index_stats().await.unwrap().distinct_documents, 101);
}

#[tokio::test]
async fn pool_processes_many_documents_concurrently() {
    let service = IngestService::new(components());
    service.start().await;
    let ids = ["a", "b", "c", "d", "e"];
    for id in ids {
        service
            .enqueue(id, words(id, 20), &format!("{id}.txt"), None, None)
            .await
            .unwrap();
    }

    let reports = wait_settled(&service, &ids).await;
    assert!(reports.iter().all(|report| {
        report.vector_stage == StageStatus::Completed
            && report.metadata_stage == StageStatus::Completed
            && report.attempt_count == 1
            && report.errors.is_empty()
    }));

    let pool = service.get_queue_status();
    assert!(pool.running);
    assert_eq!(pool.total_workers, 3);
    assert_eq!(pool.active_workers, 3);
    assert_eq!(pool.busy_workers, 0);
    assert_eq!(service.index_stats().await.unwrap().distinct_documents, 5);
    assert_eq!(service.metrics_snapshot().documents_completed, 5);

    service.stop().await;
    let pool = service.get_queue_status();
    assert!(!pool.running);
    assert_eq!(pool.active_workers, 0);
}

#[tokio::test(start_paused = true)]
async fn stop_waits_for_retry_backoff_and_leaves_backlog_queued() {
    let store = Arc::new(MemoryStatusStore::new());
    let service = IngestService::new(PipelineComponents {
        embedder: Arc::new(FlakyEmbedder {
            failures: 1,
            calls: AtomicUsize::new(0),
            inner: HashEmbeddingClient::new(DIMENSION),
        }),
        status_store: store.clone(),
        worker_count: 1,
        ..components()
    });
    service.start().await;
    service
        .enqueue("doc-1", words("w", 20), "a.txt", None, None)
        .await
        .unwrap();

    // The first attempt has failed and the worker is inside the retry delay.
    for _ in 0..200 {
        let status = store.get("doc-1").await.unwrap().unwrap();
        if status.attempt_count == 1 && status.vector_stage == StageStatus::Failed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let status = store.get("doc-1").await.unwrap().unwrap();
    assert_eq!(status.vector_stage, StageStatus::Failed);

    service
        .enqueue("doc-2", words("v", 20), "b.txt", None, None)
        .await
        .unwrap();
    let stopping = tokio::time::Instant::now();
    service.stop().await;
    assert!(stopping.elapsed() >= Duration::from_secs(4));

    let first = service.get_status("doc-1").await.unwrap().unwrap();
    assert_eq!(first.vector_stage, StageStatus::Completed);
    assert_eq!(first.metadata_stage, StageStatus::Completed);
    assert_eq!(first.attempt_count, 2);

    let second = service.get_status("doc-2").await.unwrap().unwrap();
    assert_eq!(second.vector_stage, StageStatus::Pending);
    assert_eq!(second.metadata_stage, StageStatus::Pending);
    assert_eq!(second.attempt_count, 0);

    let pool = service.get_queue_status();
    assert!(!pool.running);
    assert_eq!(pool.queue_depth, 1);
    assert_eq!(pool.busy_workers, 0);
}

#[tokio::test]
async fn duplicate_document_ids_never_run_concurrently() {
    let tracker = Arc::new(ConcurrencyTracker::default());
    let service = IngestService::new(PipelineComponents {
        embedder: tracker.clone(),
        settings: PipelineSettings {
            embedding_batch_size: 64,
            ..settings()
        },
        ..components()
    });
    service
        .enqueue("same", words("x", 10), "x.txt", None, None)
        .await
        .unwrap();
    service
        .enqueue("same", words("y", 10), "y.txt", None, None)
        .await
        .unwrap();
    service.start().await;

    wait_settled(&service, &["same"]).await;
    assert_eq!(tracker.peak.load(Ordering::SeqCst), 1);
    assert_eq!(service.metrics_snapshot().documents_completed, 2);
    service.stop().await;
}

#[tokio::test]
async fn subscribers_see_stage_events_in_order() {
    let service = IngestService::new(components());
    let mut alice = service.subscribe(Some("alice".into()));
    let mut everyone = service.subscribe(None);
    service.start().await;

    service
        .enqueue("bob-doc", words("b", 5), "b.txt", Some("bob".into()), None)
        .await
        .unwrap();
    service
        .enqueue("alice-doc", words("a", 5), "a.txt", Some("alice".into()), None)
        .await
        .unwrap();

    let mut seen = Vec::new();
    while seen.len() < 5 {
        let event = tokio::time::timeout(Duration::from_secs(5), alice.recv())
            .await
            .expect("event in time")
            .expect("sink alive");
        assert_eq!(event.document_id, "alice-doc");
        seen.push((event.kind, event.status));
    }
    assert_eq!(
        seen,
        vec![
            (EventKind::FileProcessingUpdate, Some("processing".to_string())),
            (EventKind::VectorProcessingComplete, None),
            (EventKind::FileProcessingUpdate, Some("vector_completed".to_string())),
            (EventKind::MetadataExtracted, None),
            (EventKind::FileProcessingUpdate, Some("metadata_completed".to_string())),
        ]
    );

    let first = tokio::time::timeout(Duration::from_secs(5), everyone.recv())
        .await
        .expect("event in time")
        .expect("sink alive");
    assert_eq!(first.kind, EventKind::FileProcessingUpdate);
    service.stop().await;
}

#[tokio::test]
async fn delete_is_idempotent_and_removes_every_trace() {
    let service = IngestService::new(components());
    service.start().await;
    service
        .enqueue("doc-1", words("w", 30), "a.txt", None, None)
        .await
        .unwrap();
    wait_settled(&service, &["doc-1"]).await;
    assert!(service.get_metadata("doc-1").await.unwrap().is_some());

    let first = service.delete_by_document("doc-1").await.unwrap();
    assert_eq!(first.chunks_removed, 3);
    assert!(first.records_removed);

    let second = service.delete_by_document("doc-1").await.unwrap();
    assert_eq!(second.chunks_removed, 0);
    assert!(!second.records_removed);

    assert!(service.get_status("doc-1").await.unwrap().is_none());
    assert!(service.get_metadata("doc-1").await.unwrap().is_none());
    let hits = service
        .query(QueryInput::Text("w1 w2".into()), 10, &ScopeFilter::default())
        .await
        .unwrap();
    assert!(hits.is_empty());
    service.stop().await;
}

#[tokio::test(start_paused = true)]
async fn resolved_errors_leave_the_status_report() {
    let service = IngestService::new(PipelineComponents {
        embedder: Arc::new(FailingEmbedder {
            calls: AtomicUsize::new(0),
        }),
        ..components()
    });
    service.start().await;
    service
        .enqueue("doc-1", words("w", 10), "a.txt", None, None)
        .await
        .unwrap();

    let reports = wait_settled(&service, &["doc-1"]).await;
    assert_eq!(reports[0].attempt_count, 3);
    assert_eq!(reports[0].errors.len(), 3);

    let unresolved = service.list_errors(Some(false), 10, 0).await.unwrap();
    assert_eq!(unresolved.len(), 3);
    assert!(service.resolve_error(unresolved[0].id).await.unwrap());

    let report = service.get_status("doc-1").await.unwrap().unwrap();
    assert_eq!(report.errors.len(), 2);
    assert_eq!(service.list_errors(Some(true), 10, 0).await.unwrap().len(), 1);
    assert_eq!(service.metrics_snapshot().documents_failed, 1);
    service.stop().await;
}

#[tokio::test]
async fn abort_cancels_in_flight_calls() {
    struct Stalled;

    #[async_trait]
    impl EmbeddingClient for Stalled {
        async fn generate_embeddings(
            &self,
            _texts: Vec<String>,
        ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
            std::future::pending().await
        }
    }

    let store = Arc::new(MemoryStatusStore::new());
    let service = IngestService::new(PipelineComponents {
        embedder: Arc::new(Stalled),
        status_store: store.clone(),
        ..components()
    });
    service.start().await;
    service
        .enqueue("doc-1", words("w", 10), "a.txt", None, None)
        .await
        .unwrap();

    for _ in 0..200 {
        let status = store.get("doc-1").await.unwrap().unwrap();
        if status.vector_stage == StageStatus::Processing {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::timeout(Duration::from_secs(5), service.abort())
        .await
        .expect("abort returns promptly");

    let status = store.get("doc-1").await.unwrap().unwrap();
    assert_eq!(status.attempt_count, 1);
    assert_eq!(status.vector_stage, StageStatus::Failed);
    let errors = store.errors_for("doc-1").await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].details["kind"], "cancelled");
}

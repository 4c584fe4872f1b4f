//! Fixed-size worker pool draining the ingestion queue.

use super::{ClaimRegistry, IngestionQueue};
use crate::processing::{PipelineOrchestrator, PipelineOutcome};
use serde::Serialize;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Point-in-time view of the pool and its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Whether workers are accepting jobs.
    pub running: bool,
    /// Jobs waiting in the queue.
    pub queue_depth: usize,
    /// Worker loops currently alive.
    pub active_workers: usize,
    /// Workers currently processing a job.
    pub busy_workers: usize,
    /// Configured pool size.
    pub total_workers: usize,
}

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    busy: AtomicUsize,
}

struct Tokens {
    /// Observed between jobs and while idle.
    shutdown: CancellationToken,
    /// Passed into pipeline runs; cancels collaborator calls in flight.
    jobs: CancellationToken,
}

impl Tokens {
    fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            jobs: CancellationToken::new(),
        }
    }
}

/// Runs `worker_count` loops, each pulling one job at a time through the orchestrator.
pub struct WorkerPool {
    worker_count: usize,
    queue: Arc<IngestionQueue>,
    orchestrator: Arc<PipelineOrchestrator>,
    claims: Arc<ClaimRegistry>,
    counters: Arc<Counters>,
    running: AtomicBool,
    tokens: Mutex<Tokens>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a stopped pool.
    pub fn new(
        worker_count: usize,
        queue: Arc<IngestionQueue>,
        orchestrator: Arc<PipelineOrchestrator>,
        claims: Arc<ClaimRegistry>,
    ) -> Self {
        Self {
            worker_count: worker_count.max(1),
            queue,
            orchestrator,
            claims,
            counters: Arc::new(Counters::default()),
            running: AtomicBool::new(false),
            tokens: Mutex::new(Tokens::new()),
            handles: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker loops. Calling `start` on a running pool does nothing.
    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (shutdown, jobs) = {
            let mut tokens = self.lock_tokens();
            *tokens = Tokens::new();
            (tokens.shutdown.clone(), tokens.jobs.clone())
        };

        for worker_id in 0..self.worker_count {
            let worker = Worker {
                id: worker_id,
                queue: Arc::clone(&self.queue),
                orchestrator: Arc::clone(&self.orchestrator),
                claims: Arc::clone(&self.claims),
                counters: Arc::clone(&self.counters),
                shutdown: shutdown.clone(),
                jobs: jobs.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }
        tracing::info!(workers = self.worker_count, "Worker pool started");
    }

    /// Stop accepting jobs and wait for in-flight jobs to reach a terminal state.
    pub async fn stop(&self) {
        self.shutdown(false).await;
    }

    /// Stop accepting jobs and cancel the collaborator calls of in-flight jobs.
    pub async fn abort(&self) {
        self.shutdown(true).await;
    }

    /// Current pool and queue counters.
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            running: self.running.load(Ordering::SeqCst),
            queue_depth: self.queue.size(),
            active_workers: self.counters.active.load(Ordering::SeqCst),
            busy_workers: self.counters.busy.load(Ordering::SeqCst),
            total_workers: self.worker_count,
        }
    }

    async fn shutdown(&self, cancel_jobs: bool) {
        let mut handles = self.handles.lock().await;
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let tokens = self.lock_tokens();
            tokens.shutdown.cancel();
            if cancel_jobs {
                tokens.jobs.cancel();
            }
        }
        tracing::info!(
            cancel_jobs,
            busy = self.counters.busy.load(Ordering::SeqCst),
            "Stopping worker pool"
        );

        for result in futures_util::future::join_all(handles.drain(..)).await {
            if let Err(error) = result {
                tracing::error!(error = %error, "Worker task ended abnormally");
            }
        }
        tracing::info!("Worker pool stopped");
    }

    fn lock_tokens(&self) -> std::sync::MutexGuard<'_, Tokens> {
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct Worker {
    id: usize,
    queue: Arc<IngestionQueue>,
    orchestrator: Arc<PipelineOrchestrator>,
    claims: Arc<ClaimRegistry>,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
    jobs: CancellationToken,
}

impl Worker {
    async fn run(self) {
        self.counters.active.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(worker = self.id, "Worker started");

        loop {
            let job = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                job = self.queue.dequeue() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            self.counters.busy.fetch_add(1, Ordering::SeqCst);
            let claim = self.claims.claim(&job.document_id).await;
            tracing::info!(
                worker = self.id,
                document_id = %job.document_id,
                filename = %job.filename,
                "Processing job"
            );
            let outcome = self.orchestrator.run(&job, &self.jobs).await;
            drop(claim);
            self.counters.busy.fetch_sub(1, Ordering::SeqCst);

            match outcome {
                PipelineOutcome::Completed { attempts, chunks } => tracing::info!(
                    worker = self.id,
                    document_id = %job.document_id,
                    attempts,
                    chunks,
                    "Job completed"
                ),
                PipelineOutcome::Abandoned { attempts, stage, .. } => tracing::warn!(
                    worker = self.id,
                    document_id = %job.document_id,
                    attempts,
                    stage = stage.as_str(),
                    "Job abandoned"
                ),
                PipelineOutcome::Cancelled { attempts } => tracing::warn!(
                    worker = self.id,
                    document_id = %job.document_id,
                    attempts,
                    "Job cancelled"
                ),
            }
        }

        self.counters.active.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(worker = self.id, "Worker exited");
    }
}

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing pipeline activity.
#[derive(Default)]
pub struct PipelineMetrics {
    documents_completed: AtomicU64,
    documents_failed: AtomicU64,
    attempts_failed: AtomicU64,
    retries: AtomicU64,
    chunks_indexed: AtomicU64,
}

impl PipelineMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a vector-stage commit and the number of chunks stored for it.
    pub fn record_chunks(&self, chunk_count: u64) {
        self.chunks_indexed.fetch_add(chunk_count, Ordering::Relaxed);
    }

    /// Record a document whose pipeline finished successfully.
    pub fn record_completed(&self) {
        self.documents_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a document abandoned after exhausting its attempts.
    pub fn record_abandoned(&self) {
        self.documents_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed attempt, and whether another attempt will follow it.
    pub fn record_failed_attempt(&self, will_retry: bool) {
        self.attempts_failed.fetch_add(1, Ordering::Relaxed);
        if will_retry {
            self.retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            documents_completed: self.documents_completed.load(Ordering::Relaxed),
            documents_failed: self.documents_failed.load(Ordering::Relaxed),
            attempts_failed: self.attempts_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            chunks_indexed: self.chunks_indexed.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of pipeline counters used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Documents whose both stage-tracks completed.
    pub documents_completed: u64,
    /// Documents abandoned after retry exhaustion.
    pub documents_failed: u64,
    /// Attempts that ended in a stage failure.
    pub attempts_failed: u64,
    /// Failed attempts that were followed by another attempt.
    pub retries: u64,
    /// Total chunks written to the vector index (re-writes included).
    pub chunks_indexed: u64,
}

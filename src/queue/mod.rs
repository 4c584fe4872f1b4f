//! Job submission queue and the worker pool that drains it.

mod claims;
mod pool;

pub use claims::{ClaimRegistry, DocumentClaim};
pub use pool::{PoolStatus, WorkerPool};

use crate::status::now_rfc3339;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as SyncMutex;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};

/// A submitted document waiting to be processed.
#[derive(Debug, Clone)]
pub struct IngestJob {
    /// Caller-assigned document identifier.
    pub document_id: String,
    /// Raw upload bytes, owned by the job until it is dropped.
    pub bytes: Vec<u8>,
    /// Original filename.
    pub filename: String,
    /// RFC3339 UTC submission time.
    pub submitted_at: String,
    /// Submitting user, if known.
    pub user_id: Option<String>,
    /// Owning tenant, if known.
    pub tenant_id: Option<String>,
}

impl IngestJob {
    /// Build a job stamped with the current time.
    pub fn new(document_id: impl Into<String>, bytes: Vec<u8>, filename: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            bytes,
            filename: filename.into(),
            submitted_at: now_rfc3339(),
            user_id: None,
            tenant_id: None,
        }
    }

    /// Attach a submitting user.
    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    /// Attach an owning tenant.
    pub fn with_tenant(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }
}

/// Errors raised by the ingestion queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue no longer accepts jobs.
    #[error("ingestion queue is closed")]
    Closed,
}

/// Unbounded FIFO of [`IngestJob`]s shared by producers and workers.
pub struct IngestionQueue {
    sender: SyncMutex<Option<mpsc::UnboundedSender<IngestJob>>>,
    receiver: Mutex<mpsc::UnboundedReceiver<IngestJob>>,
    size: AtomicUsize,
}

impl Default for IngestionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestionQueue {
    /// Create an empty, open queue.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender: SyncMutex::new(Some(sender)),
            receiver: Mutex::new(receiver),
            size: AtomicUsize::new(0),
        }
    }

    /// Append a job without blocking.
    pub fn enqueue(&self, job: IngestJob) -> Result<(), QueueError> {
        let document_id = job.document_id.clone();
        {
            let sender = self.lock_sender();
            let sender = sender.as_ref().ok_or(QueueError::Closed)?;
            self.size.fetch_add(1, Ordering::SeqCst);
            if sender.send(job).is_err() {
                self.size.fetch_sub(1, Ordering::SeqCst);
                return Err(QueueError::Closed);
            }
        }
        tracing::debug!(document_id = %document_id, depth = self.size(), "Job enqueued");
        Ok(())
    }

    /// Wait for the next job. Returns `None` once the queue is closed and drained.
    ///
    /// Waiters are served in arrival order.
    pub async fn dequeue(&self) -> Option<IngestJob> {
        let mut receiver = self.receiver.lock().await;
        let job = receiver.recv().await?;
        self.size.fetch_sub(1, Ordering::SeqCst);
        Some(job)
    }

    /// Jobs waiting to be claimed.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    /// Reject further submissions; queued jobs remain available to workers, after which
    /// [`IngestionQueue::dequeue`] returns `None`.
    pub fn close(&self) {
        self.lock_sender().take();
    }

    /// Whether [`IngestionQueue::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.lock_sender().is_none()
    }

    fn lock_sender(&self) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<IngestJob>>> {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

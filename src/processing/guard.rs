//! Timeout and cancellation wrapper for collaborator calls.

use super::types::PipelineError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Bounds every collaborator call of one attempt by a time budget and a cancellation token.
///
/// The guard holds a child of the worker's token, so aborting the pool cancels the call in
/// flight while a call timing out leaves the worker free to carry on.
pub struct CallGuard {
    timeout: Duration,
    cancel: CancellationToken,
}

impl CallGuard {
    /// Create a guard whose token is a child of `parent`.
    pub fn new(timeout: Duration, parent: &CancellationToken) -> Self {
        Self {
            timeout,
            cancel: parent.child_token(),
        }
    }

    /// Run `call`, mapping expiry to [`PipelineError::Timeout`] and cancellation to
    /// [`PipelineError::Cancelled`].
    pub async fn run<T, E, F>(&self, operation: &'static str, call: F) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<PipelineError>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::warn!(operation, "Collaborator call cancelled");
                Err(PipelineError::Cancelled { operation })
            }
            result = tokio::time::timeout(self.timeout, call) => match result {
                Ok(inner) => inner.map_err(Into::into),
                Err(_) => {
                    tracing::warn!(operation, timeout_secs = self.timeout.as_secs(), "Collaborator call timed out");
                    Err(PipelineError::Timeout {
                        operation,
                        after: self.timeout,
                    })
                }
            },
        }
    }
}

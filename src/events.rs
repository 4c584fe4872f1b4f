//! Live progress events published while documents move through the pipeline.
//!
//! Delivery is best effort: events are fanned out over a broadcast channel, are never
//! replayed to late subscribers, and a slow subscriber that falls behind skips ahead.

use crate::processing::DocumentMetadata;
use crate::status::now_rfc3339;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

/// Event categories pushed to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Any stage transition of a document.
    FileProcessingUpdate,
    /// Structured metadata was stored.
    MetadataExtracted,
    /// Chunks were stored in the vector index.
    VectorProcessingComplete,
}

/// Message pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineEvent {
    /// Event category.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Document the event refers to.
    pub document_id: String,
    /// RFC3339 publication time.
    pub timestamp: String,
    /// Progress label for `file_processing_update` events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Normalized metadata, attached once extraction completes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<DocumentMetadata>,
    /// Error text for failed attempts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Submitting user, used for owner-filtered subscriptions.
    #[serde(skip)]
    pub owner: Option<String>,
}

impl PipelineEvent {
    fn new(kind: EventKind, document_id: &str, owner: Option<&str>) -> Self {
        Self {
            kind,
            document_id: document_id.to_string(),
            timestamp: now_rfc3339(),
            status: None,
            metadata: None,
            error: None,
            owner: owner.map(str::to_string),
        }
    }

    /// `file_processing_update` carrying a progress label.
    pub fn progress(document_id: &str, owner: Option<&str>, status: &str) -> Self {
        Self {
            status: Some(status.to_string()),
            ..Self::new(EventKind::FileProcessingUpdate, document_id, owner)
        }
    }

    /// `file_processing_update` reporting a failed attempt.
    pub fn failed(document_id: &str, owner: Option<&str>, error: &str) -> Self {
        Self {
            status: Some("failed".into()),
            error: Some(error.to_string()),
            ..Self::new(EventKind::FileProcessingUpdate, document_id, owner)
        }
    }

    /// `file_processing_update` carrying the freshly stored metadata.
    pub fn metadata_completed(
        document_id: &str,
        owner: Option<&str>,
        metadata: DocumentMetadata,
    ) -> Self {
        Self {
            status: Some("metadata_completed".into()),
            metadata: Some(metadata),
            ..Self::new(EventKind::FileProcessingUpdate, document_id, owner)
        }
    }

    /// `metadata_extracted` notification.
    pub fn metadata_extracted(
        document_id: &str,
        owner: Option<&str>,
        metadata: DocumentMetadata,
    ) -> Self {
        Self {
            metadata: Some(metadata),
            ..Self::new(EventKind::MetadataExtracted, document_id, owner)
        }
    }

    /// `vector_processing_complete` notification.
    pub fn vector_complete(document_id: &str, owner: Option<&str>) -> Self {
        Self::new(EventKind::VectorProcessingComplete, document_id, owner)
    }
}

/// Errors raised by event sinks.
#[derive(Debug, Error)]
pub enum EventSinkError {
    /// The transport refused the event.
    #[error("event delivery failed: {0}")]
    Delivery(String),
}

/// Destination for pipeline events. Callers log failures and carry on.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish one event.
    async fn publish(&self, event: PipelineEvent) -> Result<(), EventSinkError>;
}

/// In-process fan-out over a tokio broadcast channel.
pub struct BroadcastEventSink {
    sender: broadcast::Sender<PipelineEvent>,
}

impl BroadcastEventSink {
    /// Create a sink buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events published from now on, optionally restricted to one owner.
    pub fn subscribe(&self, owner: Option<String>) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
            owner,
        }
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn publish(&self, event: PipelineEvent) -> Result<(), EventSinkError> {
        // A send error only means nobody is listening right now.
        if self.sender.send(event).is_err() {
            tracing::trace!("Dropped event without subscribers");
        }
        Ok(())
    }
}

/// Receiving half of a broadcast subscription.
pub struct EventSubscription {
    receiver: broadcast::Receiver<PipelineEvent>,
    owner: Option<String>,
}

impl EventSubscription {
    /// Wait for the next matching event. Returns `None` once the sink is gone.
    pub async fn recv(&mut self) -> Option<PipelineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged; skipping ahead");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn accepts(&self, event: &PipelineEvent) -> bool {
        match &self.owner {
            Some(owner) => event.owner.as_deref() == Some(owner.as_str()),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let sink = BroadcastEventSink::new(4);
        sink.publish(PipelineEvent::vector_complete("doc-1", None))
            .await
            .expect("publish");
    }

    #[tokio::test]
    async fn owner_filter_hides_other_users() {
        let sink = BroadcastEventSink::new(8);
        let mut alice = sink.subscribe(Some("alice".into()));
        let mut everyone = sink.subscribe(None);

        sink.publish(PipelineEvent::progress("doc-b", Some("bob"), "processing"))
            .await
            .unwrap();
        sink.publish(PipelineEvent::progress("doc-a", Some("alice"), "processing"))
            .await
            .unwrap();

        assert_eq!(alice.recv().await.unwrap().document_id, "doc-a");
        assert_eq!(everyone.recv().await.unwrap().document_id, "doc-b");
        assert_eq!(everyone.recv().await.unwrap().document_id, "doc-a");
    }

    #[tokio::test]
    async fn late_subscribers_miss_earlier_events() {
        let sink = BroadcastEventSink::new(8);
        let _keepalive = sink.subscribe(None);
        sink.publish(PipelineEvent::progress("doc-1", None, "processing"))
            .await
            .unwrap();

        let mut late = sink.subscribe(None);
        sink.publish(PipelineEvent::failed("doc-1", None, "boom"))
            .await
            .unwrap();

        let event = late.recv().await.unwrap();
        assert_eq!(event.status.as_deref(), Some("failed"));
    }

    #[test]
    fn serializes_with_wire_field_names() {
        let event = PipelineEvent::failed("doc-1", Some("alice"), "boom");
        let value: Value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], "file_processing_update");
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error"], "boom");
        assert!(value.get("metadata").is_none());
        assert!(value.get("owner").is_none());
    }
}

use super::{
    DocumentStatus, ExtractionErrorRecord, Stage, StageStatus, StatusStore, StatusStoreError,
    now_rfc3339,
};
use crate::processing::DocumentMetadata;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    documents: HashMap<String, DocumentStatus>,
    metadata: HashMap<String, DocumentMetadata>,
    errors: Vec<ExtractionErrorRecord>,
}

/// Process-local [`StatusStore`] guarded by a single async lock.
#[derive(Default)]
pub struct MemoryStatusStore {
    tables: RwLock<Tables>,
}

impl MemoryStatusStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn register(&self, document_id: &str, filename: &str) -> Result<(), StatusStoreError> {
        let mut tables = self.tables.write().await;
        match tables.documents.get_mut(document_id) {
            Some(existing) if existing.is_terminal() => {
                let created_at = existing.created_at.clone();
                *existing = DocumentStatus::pending(document_id, filename);
                existing.created_at = created_at;
            }
            Some(_) => {}
            None => {
                tables.documents.insert(
                    document_id.to_string(),
                    DocumentStatus::pending(document_id, filename),
                );
            }
        }
        Ok(())
    }

    async fn get(&self, document_id: &str) -> Result<Option<DocumentStatus>, StatusStoreError> {
        Ok(self.tables.read().await.documents.get(document_id).cloned())
    }

    async fn increment_attempt(&self, document_id: &str) -> Result<u32, StatusStoreError> {
        let mut tables = self.tables.write().await;
        let status = tables
            .documents
            .get_mut(document_id)
            .ok_or_else(|| StatusStoreError::UnknownDocument(document_id.to_string()))?;
        status.attempt_count += 1;
        status.updated_at = now_rfc3339();
        Ok(status.attempt_count)
    }

    async fn set_stage(
        &self,
        document_id: &str,
        stage: Stage,
        status: StageStatus,
        error: Option<String>,
    ) -> Result<(), StatusStoreError> {
        let mut tables = self.tables.write().await;
        let record = tables
            .documents
            .get_mut(document_id)
            .ok_or_else(|| StatusStoreError::UnknownDocument(document_id.to_string()))?;
        let (slot, error_slot) = match stage {
            Stage::Vector => (&mut record.vector_stage, &mut record.vector_error),
            Stage::Metadata => (&mut record.metadata_stage, &mut record.metadata_error),
        };
        *slot = status;
        match status {
            StageStatus::Failed => *error_slot = error,
            StageStatus::Completed => *error_slot = None,
            StageStatus::Pending | StageStatus::Processing => {}
        }
        record.updated_at = now_rfc3339();
        Ok(())
    }

    async fn append_error(&self, record: ExtractionErrorRecord) -> Result<(), StatusStoreError> {
        self.tables.write().await.errors.push(record);
        Ok(())
    }

    async fn errors_for(
        &self,
        document_id: &str,
    ) -> Result<Vec<ExtractionErrorRecord>, StatusStoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .errors
            .iter()
            .filter(|record| record.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn list_errors(
        &self,
        resolved: Option<bool>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ExtractionErrorRecord>, StatusStoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .errors
            .iter()
            .rev()
            .filter(|record| resolved.is_none_or(|flag| record.resolved == flag))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn resolve_error(&self, id: Uuid) -> Result<bool, StatusStoreError> {
        let mut tables = self.tables.write().await;
        match tables.errors.iter_mut().find(|record| record.id == id) {
            Some(record) => {
                record.resolved = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn save_metadata(&self, metadata: DocumentMetadata) -> Result<(), StatusStoreError> {
        let mut tables = self.tables.write().await;
        if !tables.documents.contains_key(&metadata.document_id) {
            return Err(StatusStoreError::UnknownDocument(metadata.document_id));
        }
        tables
            .metadata
            .insert(metadata.document_id.clone(), metadata);
        Ok(())
    }

    async fn get_metadata(
        &self,
        document_id: &str,
    ) -> Result<Option<DocumentMetadata>, StatusStoreError> {
        Ok(self.tables.read().await.metadata.get(document_id).cloned())
    }

    async fn remove(&self, document_id: &str) -> Result<bool, StatusStoreError> {
        let mut tables = self.tables.write().await;
        let had_status = tables.documents.remove(document_id).is_some();
        let had_metadata = tables.metadata.remove(document_id).is_some();
        let before = tables.errors.len();
        tables
            .errors
            .retain(|record| record.document_id != document_id);
        Ok(had_status || had_metadata || tables.errors.len() != before)
    }
}

//! Qdrant-backed vector index over the REST API.

use super::VectorIndex;
use super::filters::{build_scope_filter, document_filter, stale_points_filter};
use super::payload::{build_payload, point_id, prepare_records};
use super::types::{
    ChunkInput, ChunkScope, CountResponse, IndexError, IndexStats, QueryHit, QueryResponse,
    QueryResponseResult, ScopeFilter, ScrollResponse, UpsertSummary, rank_hits,
};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use tokio::sync::OnceCell;

/// Lightweight HTTP client storing chunks in one Qdrant collection.
pub struct QdrantIndex {
    pub(crate) client: Client,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
    pub(crate) collection: String,
    collection_ready: OnceCell<()>,
}

impl QdrantIndex {
    /// Construct a client for `collection` at `url`.
    pub fn new(url: &str, api_key: Option<String>, collection: String) -> Result<Self, IndexError> {
        let client = Client::builder().user_agent("rusty-ingest/0.1").build()?;
        let base_url = normalize_base_url(url).map_err(IndexError::InvalidUrl)?;
        tracing::debug!(
            url = %base_url,
            collection = %collection,
            has_api_key = api_key.as_deref().is_some_and(|value| !value.is_empty()),
            "Initialized Qdrant HTTP client"
        );
        Ok(Self {
            client,
            base_url,
            api_key,
            collection,
            collection_ready: OnceCell::new(),
        })
    }

    async fn ensure_collection(&self, vector_size: usize) -> Result<(), IndexError> {
        self.collection_ready
            .get_or_try_init(|| async {
                if self.collection_exists().await? {
                    return Ok(());
                }
                self.create_collection(vector_size).await?;
                self.ensure_payload_indexes().await;
                Ok::<(), IndexError>(())
            })
            .await
            .map(|_| ())
    }

    async fn collection_exists(&self) -> Result<bool, IndexError> {
        let response = self
            .request(Method::GET, &format!("collections/{}", self.collection))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                let error = IndexError::UnexpectedStatus { status, body };
                tracing::error!(collection = %self.collection, error = %error, "Collection existence check failed");
                Err(error)
            }
        }
    }

    async fn create_collection(&self, vector_size: usize) -> Result<(), IndexError> {
        let body = json!({
            "vectors": {
                "size": vector_size,
                "distance": "Cosine"
            }
        });
        let response = self
            .request(Method::PUT, &format!("collections/{}", self.collection))
            .json(&body)
            .send()
            .await?;
        self.ensure_success(response).await?;
        tracing::info!(collection = %self.collection, vector_size, "Created collection");
        Ok(())
    }

    async fn ensure_payload_indexes(&self) {
        for field in ["document_id", "user_id", "tenant_id"] {
            let body = json!({
                "field_name": field,
                "field_schema": "keyword",
            });
            let result = self
                .request(Method::PUT, &format!("collections/{}/index", self.collection))
                .json(&body)
                .send()
                .await;
            match result {
                Ok(response)
                    if response.status().is_success()
                        || response.status() == StatusCode::CONFLICT =>
                {
                    tracing::debug!(collection = %self.collection, field, "Payload index ensured");
                }
                Ok(response) => {
                    tracing::warn!(collection = %self.collection, field, status = %response.status(), "Failed to ensure payload index");
                }
                Err(error) => {
                    tracing::warn!(collection = %self.collection, field, error = %error, "Failed to ensure payload index");
                }
            }
        }
    }

    async fn count(&self, filter: Option<Value>) -> Result<usize, IndexError> {
        let mut body = json!({ "exact": true });
        if let (Some(filter), Some(obj)) = (filter, body.as_object_mut()) {
            obj.insert("filter".into(), filter);
        }
        let response = self
            .request(
                Method::POST,
                &format!("collections/{}/points/count", self.collection),
            )
            .json(&body)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(0);
        }
        let response = self.ensure_success(response).await?;
        let CountResponse { result } = response.json().await?;
        Ok(result.count)
    }

    async fn delete_points(&self, filter: Value) -> Result<(), IndexError> {
        let response = self
            .request(
                Method::POST,
                &format!("collections/{}/points/delete", self.collection),
            )
            .query(&[("wait", true)])
            .json(&json!({ "filter": filter }))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        self.ensure_success(response).await?;
        Ok(())
    }

    async fn distinct_documents(&self) -> Result<usize, IndexError> {
        let mut offset: Option<Value> = None;
        let mut documents = BTreeSet::new();

        loop {
            let mut body = json!({
                "with_payload": ["document_id"],
                "with_vector": false,
                "limit": 512,
            });
            if let (Some(next), Some(obj)) = (offset.take(), body.as_object_mut()) {
                obj.insert("offset".into(), next);
            }

            let response = self
                .request(
                    Method::POST,
                    &format!("collections/{}/points/scroll", self.collection),
                )
                .json(&body)
                .send()
                .await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(0);
            }
            let response = self.ensure_success(response).await?;

            let ScrollResponse { result } = response.json().await?;
            for point in result.points {
                if let Some(Value::String(document_id)) = point
                    .payload
                    .as_ref()
                    .and_then(|payload| payload.get("document_id"))
                {
                    documents.insert(document_id.clone());
                }
            }

            match result.next_page_offset {
                Some(Value::Null) | None => break,
                Some(next) => offset = Some(next),
            }
        }

        Ok(documents.len())
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format_endpoint(&self.base_url, path);
        let mut req = self.client.request(method, url);
        if let Some(api_key) = &self.api_key
            && !api_key.is_empty()
        {
            req = req.header("api-key", api_key);
        }
        req
    }

    async fn ensure_success(
        &self,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, IndexError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = IndexError::UnexpectedStatus { status, body };
            tracing::error!(collection = %self.collection, error = %error, "Qdrant request failed");
            Err(error)
        }
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn upsert(
        &self,
        document_id: &str,
        chunks: Vec<ChunkInput>,
        embeddings: Vec<Vec<f32>>,
        scope: &ChunkScope,
    ) -> Result<UpsertSummary, IndexError> {
        let (records, skipped) = prepare_records(document_id, chunks, embeddings, scope)?;
        self.ensure_collection(records[0].embedding.len()).await?;

        let ids: Vec<String> = records
            .iter()
            .map(|record| point_id(&record.chunk_id).to_string())
            .collect();
        let points: Vec<Value> = records
            .iter()
            .zip(&ids)
            .map(|(record, id)| {
                json!({
                    "id": id,
                    "vector": record.embedding,
                    "payload": build_payload(record),
                })
            })
            .collect();

        let stored = points.len();
        let response = self
            .request(
                Method::PUT,
                &format!("collections/{}/points", self.collection),
            )
            .query(&[("wait", true)])
            .json(&json!({ "points": points }))
            .send()
            .await?;
        self.ensure_success(response).await?;

        let written = self.count(Some(document_filter(document_id))).await?;
        self.delete_points(stale_points_filter(document_id, &ids))
            .await?;
        let pruned = written.saturating_sub(stored);

        tracing::debug!(
            collection = %self.collection,
            document_id,
            stored,
            skipped,
            pruned,
            "Points upserted"
        );
        Ok(UpsertSummary {
            stored,
            skipped,
            pruned,
        })
    }

    async fn query(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: &ScopeFilter,
    ) -> Result<Vec<QueryHit>, IndexError> {
        if top_k == 0 || filter.is_unsatisfiable() {
            return Ok(Vec::new());
        }
        let mut body = json!({
            "query": embedding,
            "limit": top_k,
            "with_payload": true,
        });
        if let (Some(filter), Some(obj)) = (build_scope_filter(filter), body.as_object_mut()) {
            obj.insert("filter".into(), filter);
        }

        let response = self
            .request(
                Method::POST,
                &format!("collections/{}/points/query", self.collection),
            )
            .json(&body)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = self.ensure_success(response).await?;

        let payload: QueryResponse = response.json().await?;
        let points = match payload.result {
            QueryResponseResult::Points(points) => points,
            QueryResponseResult::Object { points } => points,
        };
        let mut hits: Vec<QueryHit> = points
            .into_iter()
            .filter_map(|point| hit_from_payload(point.score, point.payload?))
            .collect();
        rank_hits(&mut hits);
        Ok(hits)
    }

    async fn delete_by_document(&self, document_id: &str) -> Result<usize, IndexError> {
        let removed = self.count(Some(document_filter(document_id))).await?;
        if removed > 0 {
            self.delete_points(document_filter(document_id)).await?;
        }
        tracing::debug!(collection = %self.collection, document_id, removed, "Deleted document points");
        Ok(removed)
    }

    async fn stats(&self) -> Result<IndexStats, IndexError> {
        Ok(IndexStats {
            total_chunks: self.count(None).await?,
            distinct_documents: self.distinct_documents().await?,
        })
    }
}

fn hit_from_payload(score: f32, mut payload: Map<String, Value>) -> Option<QueryHit> {
    let content = take_string(&mut payload, "text")?;
    let document_id = take_string(&mut payload, "document_id")?;
    let chunk_id = take_string(&mut payload, "chunk_id")?;
    let chunk_ordinal = payload
        .remove("chunk_ordinal")
        .and_then(|value| value.as_u64())
        .and_then(|value| usize::try_from(value).ok())?;
    Some(QueryHit {
        content,
        score,
        document_id,
        chunk_ordinal,
        chunk_id,
        metadata: payload,
    })
}

fn take_string(payload: &mut Map<String, Value>, key: &str) -> Option<String> {
    match payload.remove(key) {
        Some(Value::String(text)) => Some(text),
        _ => None,
    }
}

fn normalize_base_url(url: &str) -> Result<String, String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|err| err.to_string())?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

fn format_endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

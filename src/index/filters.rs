//! Filter helpers for Qdrant queries and deletions.

use serde_json::{Value, json};

use super::types::ScopeFilter;

/// Compose the Qdrant filter payload for a scope filter.
pub fn build_scope_filter(filter: &ScopeFilter) -> Option<Value> {
    let mut must: Vec<Value> = Vec::new();

    if let Some(ids) = filter.cleaned_document_ids() {
        must.push(json!({
            "key": "document_id",
            "match": { "any": ids }
        }));
    }

    if let Some(user_id) = filter.cleaned_user_id() {
        must.push(json!({
            "key": "user_id",
            "match": { "value": user_id }
        }));
    }

    if let Some(tenant_id) = filter.cleaned_tenant_id() {
        must.push(json!({
            "key": "tenant_id",
            "match": { "value": tenant_id }
        }));
    }

    if must.is_empty() {
        None
    } else {
        Some(json!({ "must": must }))
    }
}

/// Filter selecting every point of one document.
pub fn document_filter(document_id: &str) -> Value {
    json!({
        "must": [
            {
                "key": "document_id",
                "match": { "value": document_id }
            }
        ]
    })
}

/// Filter selecting points of a document whose ids are not in `keep`.
pub fn stale_points_filter(document_id: &str, keep: &[String]) -> Value {
    json!({
        "must": [
            {
                "key": "document_id",
                "match": { "value": document_id }
            }
        ],
        "must_not": [
            { "has_id": keep }
        ]
    })
}

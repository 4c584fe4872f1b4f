//! Structured extraction through a local Ollama runtime in JSON mode.

use super::{ABSENT, FieldMap, SourceDocument, StructuredExtractionError, StructuredExtractor};
use crate::processing::METADATA_FIELDS;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};

/// Extractor that prompts an Ollama model for a flat JSON object of contract fields.
pub struct OllamaStructuredExtractor {
    http: Client,
    base_url: String,
    model: String,
    text_limit: usize,
}

impl OllamaStructuredExtractor {
    /// Create an extractor for `model`, sending at most `text_limit` characters of text.
    pub fn new(
        base_url: String,
        model: String,
        text_limit: usize,
    ) -> Result<Self, StructuredExtractionError> {
        let http = Client::builder()
            .user_agent("rusty-ingest/extract")
            .build()
            .map_err(|error| StructuredExtractionError::ProviderUnavailable(error.to_string()))?;
        Ok(Self {
            http,
            base_url,
            model,
            text_limit,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url.trim_end_matches('/'))
    }

    fn build_prompt(&self, text: &str) -> String {
        let keys = METADATA_FIELDS
            .iter()
            .map(|name| format!("\"{name}\""))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "Extract contract details from the text below. Respond with one JSON object \
             whose keys are {keys}. Use \"DD-MM-YYYY\" for dates and \"NA\" for anything \
             missing.\n\nContract text:\n{}",
            truncate_chars(text, self.text_limit)
        )
    }
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
    done: bool,
}

#[async_trait]
impl StructuredExtractor for OllamaStructuredExtractor {
    async fn extract(
        &self,
        text: &str,
        source: Option<SourceDocument<'_>>,
    ) -> Result<FieldMap, StructuredExtractionError> {
        if let Some(source) = source {
            tracing::debug!(filename = source.filename, "Extracting structured fields");
        }
        let payload = json!({
            "model": self.model,
            "prompt": self.build_prompt(text),
            "format": "json",
            "stream": false,
            "options": {
                "temperature": 0.1,
            }
        });

        let response = self
            .http
            .post(self.endpoint())
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                StructuredExtractionError::ProviderUnavailable(format!(
                    "failed to reach Ollama at {}: {error}",
                    self.base_url
                ))
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(StructuredExtractionError::ProviderUnavailable(format!(
                "Ollama endpoint {} returned 404",
                self.endpoint()
            )));
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StructuredExtractionError::GenerationFailed(format!(
                "Ollama returned {status}: {body}"
            )));
        }

        let body: OllamaResponse = response.json().await.map_err(|error| {
            StructuredExtractionError::InvalidResponse(format!(
                "failed to decode Ollama response: {error}"
            ))
        })?;

        if !body.done {
            return Err(StructuredExtractionError::InvalidResponse(
                "Ollama response incomplete (streaming not supported)".into(),
            ));
        }

        parse_field_map(&body.response)
    }
}

fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Parse a model reply into a field map, tolerating code fences and surrounding prose.
pub(crate) fn parse_field_map(reply: &str) -> Result<FieldMap, StructuredExtractionError> {
    let trimmed = reply.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let unfenced = unfenced.strip_suffix("```").unwrap_or(unfenced).trim();

    let object = serde_json::from_str::<Map<String, Value>>(unfenced)
        .ok()
        .or_else(|| {
            let start = reply.find('{')?;
            let end = reply.rfind('}')?;
            (start < end)
                .then(|| serde_json::from_str::<Map<String, Value>>(&reply[start..=end]).ok())
                .flatten()
        })
        .ok_or_else(|| {
            StructuredExtractionError::InvalidResponse(format!(
                "reply is not a JSON object: {}",
                truncate_chars(trimmed, 200)
            ))
        })?;

    Ok(object
        .into_iter()
        .map(|(key, value)| (key, coerce_value(value)))
        .collect())
}

fn coerce_value(value: Value) -> String {
    match value {
        Value::Null => ABSENT.to_string(),
        Value::String(text) if text.trim().is_empty() => ABSENT.to_string(),
        Value::String(text) => text,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    #[test]
    fn parses_fenced_json() {
        let fields = parse_field_map("```json\n{\"vendor_name\": \"Acme\"}\n```").unwrap();
        assert_eq!(fields["vendor_name"], "Acme");
    }

    #[test]
    fn parses_json_embedded_in_prose() {
        let reply = "Sure! Here it is: {\"currency\": \"EUR\", \"liability_cap\": null} Thanks.";
        let fields = parse_field_map(reply).unwrap();
        assert_eq!(fields["currency"], "EUR");
        assert_eq!(fields["liability_cap"], ABSENT);
    }

    #[test]
    fn coerces_non_string_values() {
        let fields =
            parse_field_map(r#"{"contract_value_local": 5000, "auto_renewal": true, "x": ""}"#)
                .unwrap();
        assert_eq!(fields["contract_value_local"], "5000");
        assert_eq!(fields["auto_renewal"], "true");
        assert_eq!(fields["x"], ABSENT);
    }

    #[test]
    fn rejects_replies_without_an_object() {
        let err = parse_field_map("no structured data here").unwrap_err();
        assert!(matches!(err, StructuredExtractionError::InvalidResponse(_)));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }

    #[tokio::test]
    async fn requests_json_mode_and_parses_reply() {
        let server = MockServer::start_async().await;
        let extractor =
            OllamaStructuredExtractor::new(server.base_url(), "llama3.1".into(), 100).unwrap();

        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/generate")
                    .json_body_partial(r#"{"model": "llama3.1", "format": "json", "stream": false}"#);
                then.status(200).json_body(json!({
                    "response": "{\"vendor_name\": \"Acme Corp\", \"currency\": \"USD\"}",
                    "done": true
                }));
            })
            .await;

        let fields = extractor
            .extract("This agreement is made with Acme Corp.", None)
            .await
            .expect("fields");

        mock.assert_async().await;
        assert_eq!(fields["vendor_name"], "Acme Corp");
        assert_eq!(fields["currency"], "USD");
    }

    #[tokio::test]
    async fn surfaces_provider_errors() {
        let server = MockServer::start_async().await;
        let extractor =
            OllamaStructuredExtractor::new(server.base_url(), "llama3.1".into(), 100).unwrap();

        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(503).body("overloaded");
            })
            .await;

        let err = extractor.extract("text", None).await.unwrap_err();
        assert!(matches!(err, StructuredExtractionError::GenerationFailed(_)));
    }
}

//! Text and structured-field extraction collaborators.
//!
//! Text extraction turns raw upload bytes into plain text; structured extraction turns that
//! text into a flat map of business fields. Real document-format parsing lives behind the
//! [`TextExtractor`] seam; the bundled implementation only decodes UTF-8 text.

mod ollama;

pub use ollama::OllamaStructuredExtractor;

use crate::config::{Config, ExtractionProvider};
use crate::processing::METADATA_FIELDS;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";

/// Sentinel stored for fields the extractor could not find.
pub const ABSENT: &str = "NA";

/// Flat field name to value map produced by structured extraction.
pub type FieldMap = BTreeMap<String, String>;

/// Raw upload handed to structured extractors that want to look past the plain text.
#[derive(Debug, Clone, Copy)]
pub struct SourceDocument<'a> {
    /// Original filename.
    pub filename: &'a str,
    /// Raw upload bytes.
    pub bytes: &'a [u8],
}

/// Errors raised while extracting text from raw bytes.
#[derive(Debug, Error)]
pub enum TextExtractionError {
    /// Bytes were not valid UTF-8.
    #[error("'{filename}' is not valid UTF-8: {source}")]
    InvalidEncoding {
        /// File being decoded.
        filename: String,
        /// Decoder error.
        #[source]
        source: std::str::Utf8Error,
    },
}

/// Errors surfaced while extracting structured fields.
#[derive(Debug, Error)]
pub enum StructuredExtractionError {
    /// Provider was unreachable.
    #[error("Extraction provider unavailable: {0}")]
    ProviderUnavailable(String),
    /// Provider returned an error response.
    #[error("Failed to extract fields: {0}")]
    GenerationFailed(String),
    /// Provider response could not be parsed into fields.
    #[error("Malformed provider response: {0}")]
    InvalidResponse(String),
}

/// Turns raw upload bytes into plain text.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Extract the full text of `bytes`, using `filename` as a format hint.
    async fn extract(&self, bytes: &[u8], filename: &str) -> Result<String, TextExtractionError>;
}

/// Turns document text into a [`FieldMap`].
#[async_trait]
pub trait StructuredExtractor: Send + Sync {
    /// Extract business fields. Fields that cannot be found are reported as [`ABSENT`].
    async fn extract(
        &self,
        text: &str,
        source: Option<SourceDocument<'_>>,
    ) -> Result<FieldMap, StructuredExtractionError>;
}

/// Decodes uploads as UTF-8 text, dropping a leading byte-order mark.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextExtractor;

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract(&self, bytes: &[u8], filename: &str) -> Result<String, TextExtractionError> {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        let text = std::str::from_utf8(bytes).map_err(|source| {
            TextExtractionError::InvalidEncoding {
                filename: filename.to_string(),
                source,
            }
        })?;
        Ok(text.to_string())
    }
}

/// Extractor used when no provider is configured: every field is absent.
#[derive(Debug, Default, Clone, Copy)]
pub struct SentinelExtractor;

#[async_trait]
impl StructuredExtractor for SentinelExtractor {
    async fn extract(
        &self,
        _text: &str,
        _source: Option<SourceDocument<'_>>,
    ) -> Result<FieldMap, StructuredExtractionError> {
        Ok(METADATA_FIELDS
            .iter()
            .map(|name| ((*name).to_string(), ABSENT.to_string()))
            .collect())
    }
}

/// Build the structured extractor selected by configuration.
pub fn build_structured_extractor(
    config: &Config,
) -> Result<Arc<dyn StructuredExtractor>, StructuredExtractionError> {
    match config.extraction_provider {
        ExtractionProvider::None => Ok(Arc::new(SentinelExtractor)),
        ExtractionProvider::Ollama => {
            let base_url = config
                .ollama_url
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());
            Ok(Arc::new(OllamaStructuredExtractor::new(
                base_url,
                config.extraction_model.clone(),
                config.extraction_text_limit,
            )?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_text_strips_bom() {
        let text = PlainTextExtractor
            .extract(b"\xEF\xBB\xBFhello world", "a.txt")
            .await
            .expect("text");
        assert_eq!(text, "hello world");
    }

    #[tokio::test]
    async fn plain_text_rejects_invalid_utf8() {
        let err = PlainTextExtractor
            .extract(&[0x66, 0xFF, 0x6F], "broken.bin")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TextExtractionError::InvalidEncoding { ref filename, .. } if filename == "broken.bin"
        ));
    }

    #[tokio::test]
    async fn sentinel_reports_every_field_absent() {
        let fields = SentinelExtractor.extract("anything", None).await.unwrap();
        assert_eq!(fields.len(), METADATA_FIELDS.len());
        assert!(fields.values().all(|value| value == ABSENT));
    }
}

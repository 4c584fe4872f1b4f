use std::env;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

use crate::processing::PipelineSettings;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of concurrent pipeline workers.
    pub worker_count: usize,
    /// Token budget of a single chunk.
    pub chunk_max_tokens: usize,
    /// Tokens shared between adjacent chunks.
    pub chunk_overlap_tokens: usize,
    /// Name of the tiktoken encoding used for token windows.
    pub tokenizer_encoding: String,
    /// Attempts per job before it is abandoned.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
    /// Upper bound on any single collaborator call.
    pub call_timeout: Duration,
    /// Embedding provider used to generate vector representations.
    pub embedding_provider: EmbeddingProvider,
    /// Embedding model identifier passed to the provider.
    pub embedding_model: String,
    /// Dimensionality of the produced vectors.
    pub embedding_dimension: usize,
    /// Maximum number of chunk texts per embedding call.
    pub embedding_batch_size: usize,
    /// Base URL of the Ollama runtime, when one is used.
    pub ollama_url: Option<String>,
    /// Backend used for structured metadata extraction.
    pub extraction_provider: ExtractionProvider,
    /// Model used by the structured extraction backend.
    pub extraction_model: String,
    /// Maximum number of characters of document text sent for extraction.
    pub extraction_text_limit: usize,
    /// Storage backend of the vector index.
    pub vector_backend: VectorBackend,
    /// Base URL of the Qdrant instance that stores embeddings.
    pub qdrant_url: Option<String>,
    /// Name of the Qdrant collection used for chunk storage.
    pub qdrant_collection_name: String,
    /// Optional API key required to access Qdrant.
    pub qdrant_api_key: Option<String>,
    /// Buffer size of the live event channel.
    pub event_channel_capacity: usize,
}

/// Supported embedding backends for the processing pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmbeddingProvider {
    /// Deterministic local hashing embedder.
    Hash,
    /// Local Ollama runtime.
    Ollama,
}

/// Supported structured extraction backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtractionProvider {
    /// No extraction backend; every field is reported absent.
    None,
    /// Local Ollama runtime in JSON mode.
    Ollama,
}

/// Supported vector index backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VectorBackend {
    /// Process-local index.
    Memory,
    /// Qdrant over its REST API.
    Qdrant,
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        let vector_backend = parse_or("VECTOR_BACKEND", VectorBackend::Memory)?;
        let qdrant_url = load_env_optional("QDRANT_URL");
        if vector_backend == VectorBackend::Qdrant && qdrant_url.is_none() {
            return Err(ConfigError::MissingVariable("QDRANT_URL".into()));
        }

        let config = Self {
            worker_count: parse_or("INGEST_WORKERS", 3)?,
            chunk_max_tokens: parse_or("CHUNK_MAX_TOKENS", 1024)?,
            chunk_overlap_tokens: parse_or("CHUNK_OVERLAP_TOKENS", 200)?,
            tokenizer_encoding: load_env_optional("TOKENIZER_ENCODING")
                .unwrap_or_else(|| "cl100k_base".into()),
            max_attempts: parse_or("PIPELINE_MAX_ATTEMPTS", 3)?,
            retry_delay: Duration::from_secs(parse_or("PIPELINE_RETRY_DELAY_SECS", 5)?),
            call_timeout: Duration::from_secs(parse_or("COLLABORATOR_TIMEOUT_SECS", 120)?),
            embedding_provider: parse_or("EMBEDDING_PROVIDER", EmbeddingProvider::Hash)?,
            embedding_model: load_env_optional("EMBEDDING_MODEL")
                .unwrap_or_else(|| "nomic-embed-text".into()),
            embedding_dimension: parse_or("EMBEDDING_DIMENSION", 768)?,
            embedding_batch_size: parse_or("EMBEDDING_BATCH_SIZE", 32)?,
            ollama_url: load_env_optional("OLLAMA_URL"),
            extraction_provider: parse_or("EXTRACTION_PROVIDER", ExtractionProvider::None)?,
            extraction_model: load_env_optional("EXTRACTION_MODEL")
                .unwrap_or_else(|| "llama3.1".into()),
            extraction_text_limit: parse_or("EXTRACTION_TEXT_LIMIT", 10_000)?,
            vector_backend,
            qdrant_url,
            qdrant_collection_name: load_env_optional("QDRANT_COLLECTION_NAME")
                .unwrap_or_else(|| "documents".into()),
            qdrant_api_key: load_env_optional("QDRANT_API_KEY"),
            event_channel_capacity: parse_or("EVENT_CHANNEL_CAPACITY", 256)?,
        };

        if config.worker_count == 0 {
            return Err(ConfigError::InvalidValue("INGEST_WORKERS".into()));
        }
        if config.chunk_max_tokens == 0 || config.chunk_overlap_tokens >= config.chunk_max_tokens
        {
            return Err(ConfigError::InvalidValue("CHUNK_OVERLAP_TOKENS".into()));
        }
        if config.max_attempts == 0 {
            return Err(ConfigError::InvalidValue("PIPELINE_MAX_ATTEMPTS".into()));
        }
        Ok(config)
    }

    /// Pipeline tuning derived from this configuration.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            max_tokens: self.chunk_max_tokens,
            overlap_tokens: self.chunk_overlap_tokens,
            embedding_batch_size: self.embedding_batch_size.max(1),
            max_attempts: self.max_attempts,
            retry_delay: self.retry_delay,
            call_timeout: self.call_timeout,
        }
    }
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match load_env_optional(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

impl FromStr for EmbeddingProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hash" => Ok(Self::Hash),
            "ollama" => Ok(Self::Ollama),
            _ => Err(()),
        }
    }
}

impl FromStr for ExtractionProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "ollama" => Ok(Self::Ollama),
            _ => Err(()),
        }
    }
}

impl FromStr for VectorBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "qdrant" => Ok(Self::Qdrant),
            _ => Err(()),
        }
    }
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, if [`init_config`] has run.
pub fn get_config() -> Option<&'static Config> {
    CONFIG.get()
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() -> Result<&'static Config, ConfigError> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    tracing::debug!(
        workers = config.worker_count,
        max_tokens = config.chunk_max_tokens,
        overlap = config.chunk_overlap_tokens,
        embedding_provider = ?config.embedding_provider,
        extraction_provider = ?config.extraction_provider,
        vector_backend = ?config.vector_backend,
        "Loaded configuration"
    );
    Ok(CONFIG.get_or_init(|| config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn providers_parse_case_insensitively() {
        assert_eq!("Ollama".parse(), Ok(EmbeddingProvider::Ollama));
        assert_eq!("HASH".parse(), Ok(EmbeddingProvider::Hash));
        assert_eq!("qdrant".parse(), Ok(VectorBackend::Qdrant));
        assert_eq!("none".parse(), Ok(ExtractionProvider::None));
        assert!("gemini".parse::<EmbeddingProvider>().is_err());
    }

    #[test]
    fn parse_or_falls_back_to_default_when_unset() {
        let value: usize = parse_or("RUSTY_INGEST_TEST_UNSET_VARIABLE", 7).expect("default");
        assert_eq!(value, 7);
    }
}

//! Engine configuration.
//!
//! Loaded from TOML, then optionally overridden from the environment:
//!
//! ```toml
//! db_path = "settings.lorebook"   # omit for an in-memory store
//! index = "exact"                 # or "hnsw"
//! chunk_size = 1000
//! chunk_overlap = 200
//! default_top_k = 3
//! context_max_chars = 4000
//! embed_batch_size = 32
//!
//! [embedding]
//! provider = "remote"             # or "local"
//! flavor = "openai"               # "ollama", "huggingface"
//! url = "https://api.openai.com/v1"
//! model = "text-embedding-3-small"
//! cache_capacity = 1024
//! ```

use lorebook::{ChunkConfig, IndexKind, LorebookError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_DB_PATH: &str = "LOREBOOK_DB_PATH";
pub const ENV_EMBEDDING_URL: &str = "LOREBOOK_EMBEDDING_URL";
pub const ENV_EMBEDDING_API_KEY: &str = "LOREBOOK_EMBEDDING_API_KEY";
pub const ENV_EMBEDDING_MODEL: &str = "LOREBOOK_EMBEDDING_MODEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    /// [`HashingEmbedder`](crate::embedder::HashingEmbedder), no network.
    #[default]
    Local,
    /// HTTP embedding service (`remote` cargo feature).
    Remote,
}

/// Wire protocol spoken by a remote embedding service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RemoteFlavor {
    /// `POST {url}/embeddings` (OpenAI and compatible gateways).
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    /// `POST {url}/api/embed`.
    #[serde(rename = "ollama")]
    Ollama,
    /// `POST {url}/pipeline/feature-extraction/{model}`.
    #[serde(rename = "huggingface")]
    HuggingFace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    /// Output dimension of the local embedder, and of remote models missing
    /// from the known-model table.
    pub dimension: usize,
    pub url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub flavor: RemoteFlavor,
    pub timeout_secs: u64,
    /// Cached vectors; 0 disables the cache.
    pub cache_capacity: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Local,
            dimension: 384,
            url: None,
            model: None,
            api_key: None,
            flavor: RemoteFlavor::OpenAi,
            timeout_secs: 30,
            cache_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// `None` opens an in-memory store.
    pub db_path: Option<PathBuf>,
    pub index: IndexKind,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub default_top_k: usize,
    pub context_max_chars: usize,
    /// Document chunks sent to the embedder per request.
    pub embed_batch_size: usize,
    pub embedding: EmbeddingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            index: IndexKind::Exact,
            chunk_size: lorebook::DEFAULT_CHUNK_SIZE,
            chunk_overlap: lorebook::DEFAULT_CHUNK_OVERLAP,
            default_top_k: 3,
            context_max_chars: 4000,
            embed_batch_size: 32,
            embedding: EmbeddingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| LorebookError::InvalidConfiguration(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Apply `LOREBOOK_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from any lookup (environment, a test map, ...).
    /// Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(path) = get(ENV_DB_PATH) {
            self.db_path = Some(PathBuf::from(path));
        }
        if let Some(url) = get(ENV_EMBEDDING_URL) {
            self.embedding.url = Some(url);
        }
        if let Some(key) = get(ENV_EMBEDDING_API_KEY) {
            self.embedding.api_key = Some(key);
        }
        if let Some(model) = get(ENV_EMBEDDING_MODEL) {
            self.embedding.model = Some(model);
        }
    }

    /// Chunking parameters as a validated [`ChunkConfig`].
    pub fn chunking(&self) -> Result<ChunkConfig> {
        ChunkConfig::new(self.chunk_size, self.chunk_overlap)
    }

    pub fn validate(&self) -> Result<()> {
        self.chunking()?;
        if self.default_top_k == 0 {
            return Err(LorebookError::InvalidConfiguration(
                "default_top_k must be at least 1".to_string(),
            ));
        }
        if self.embed_batch_size == 0 {
            return Err(LorebookError::InvalidConfiguration(
                "embed_batch_size must be at least 1".to_string(),
            ));
        }
        let embedding = &self.embedding;
        if embedding.dimension == 0 {
            return Err(LorebookError::InvalidConfiguration(
                "embedding.dimension must be greater than zero".to_string(),
            ));
        }
        if embedding.provider == EmbeddingProvider::Remote {
            if embedding.url.as_deref().is_none_or_blank() {
                return Err(LorebookError::InvalidConfiguration(
                    "remote embedding provider needs embedding.url".to_string(),
                ));
            }
            if embedding.model.as_deref().is_none_or_blank() {
                return Err(LorebookError::InvalidConfiguration(
                    "remote embedding provider needs embedding.model".to_string(),
                ));
            }
        }
        Ok(())
    }
}

trait BlankExt {
    fn is_none_or_blank(&self) -> bool;
}

impl BlankExt for Option<&str> {
    fn is_none_or_blank(&self) -> bool {
        self.map_or(true, |s| s.trim().is_empty())
    }
}

//! HTTP embedding providers.
//!
//! Speaks three wire protocols (see [`RemoteFlavor`]). Every failure
//! (transport, non-2xx status, unexpected body) is reported as
//! [`LorebookError::EmbeddingUnavailable`]; a zero vector is never
//! substituted for a failed call.

use crate::config::{EmbeddingConfig, RemoteFlavor};
use crate::embedder::Embedder;
use lorebook::{LorebookError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Output dimensions of well-known models.
const KNOWN_MODELS: &[(&str, usize)] = &[
    ("text-embedding-v1", 1536),
    ("text-embedding-v2", 1536),
    ("sentence-transformers/paraphrase-multilingual-MiniLM-L12-v2", 384),
    ("paraphrase-multilingual-MiniLM-L12-v2", 384),
    ("sentence-transformers/distiluse-base-multilingual-cased", 512),
    ("distiluse-base-multilingual-cased", 512),
    ("text-embedding-ada-002", 1536),
    ("text-embedding-3-small", 1536),
    ("text-embedding-3-large", 3072),
    ("nomic-embed-text", 768),
    ("all-minilm", 384),
];

/// Dimension for `model` if it is in the known-model table.
pub fn known_dimension(model: &str) -> Option<usize> {
    KNOWN_MODELS
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, dim)| *dim)
}

fn unavailable(e: impl std::fmt::Display) -> LorebookError {
    LorebookError::EmbeddingUnavailable(e.to_string())
}

#[derive(Debug, Clone)]
pub struct RemoteEmbedder {
    base_url: String,
    model: String,
    api_key: Option<String>,
    flavor: RemoteFlavor,
    dimension: usize,
    client: reqwest::blocking::Client,
}

impl RemoteEmbedder {
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let url = config.url.as_deref().unwrap_or_default();
        let model = config.model.as_deref().unwrap_or_default();
        if url.trim().is_empty() || model.trim().is_empty() {
            return Err(LorebookError::InvalidConfiguration(
                "remote embedder needs both a url and a model".to_string(),
            ));
        }
        let dimension = known_dimension(model).unwrap_or(config.dimension);
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LorebookError::InvalidConfiguration(e.to_string()))?;
        Ok(Self {
            base_url: url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: config.api_key.clone(),
            flavor: config.flavor,
            dimension,
            client,
        })
    }

    fn endpoint(&self) -> String {
        match self.flavor {
            RemoteFlavor::OpenAi => format!("{}/embeddings", self.base_url),
            RemoteFlavor::Ollama => format!("{}/api/embed", self.base_url),
            RemoteFlavor::HuggingFace => format!(
                "{}/pipeline/feature-extraction/{}",
                self.base_url, self.model
            ),
        }
    }

    fn post<B: Serialize>(&self, body: &B) -> Result<reqwest::blocking::Response> {
        let url = self.endpoint();
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().map_err(unavailable)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            warn!(%status, url = %url, "embedding request failed");
            return Err(LorebookError::EmbeddingUnavailable(format!(
                "embedding request failed: {status} {text}"
            )));
        }
        Ok(response)
    }

    fn request(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let vectors = match self.flavor {
            RemoteFlavor::OpenAi => {
                let body = OpenAiRequest {
                    model: &self.model,
                    input: inputs,
                };
                let payload: OpenAiResponse = self.post(&body)?.json().map_err(unavailable)?;
                let mut data = payload.data;
                data.sort_by_key(|d| d.index);
                data.into_iter().map(|d| d.embedding).collect()
            }
            RemoteFlavor::Ollama => {
                let body = OllamaRequest {
                    model: &self.model,
                    input: inputs,
                };
                let payload: OllamaResponse = self.post(&body)?.json().map_err(unavailable)?;
                match (payload.embeddings, payload.embedding) {
                    (Some(many), _) => many,
                    (None, Some(one)) => vec![one],
                    (None, None) => {
                        return Err(unavailable("embedding response missing vectors"));
                    }
                }
            }
            RemoteFlavor::HuggingFace => {
                let body = HuggingFaceRequest { inputs };
                self.post(&body)?.json().map_err(unavailable)?
            }
        };

        if vectors.len() != inputs.len() {
            return Err(LorebookError::EmbeddingUnavailable(format!(
                "embedding service returned {} vectors for {} inputs",
                vectors.len(),
                inputs.len()
            )));
        }
        debug!(count = vectors.len(), model = %self.model, "embedded batch");
        Ok(vectors)
    }
}

impl Embedder for RemoteEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.request(&[text.to_string()])?
            .pop()
            .ok_or_else(|| unavailable("embedding response missing vectors"))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts)
    }
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OllamaResponse {
    embeddings: Option<Vec<Vec<f32>>>,
    embedding: Option<Vec<f32>>,
}

#[derive(Serialize)]
struct HuggingFaceRequest<'a> {
    inputs: &'a [String],
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingProvider;

    fn config(flavor: RemoteFlavor, url: &str, model: &str) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: EmbeddingProvider::Remote,
            url: Some(url.to_string()),
            model: Some(model.to_string()),
            flavor,
            timeout_secs: 1,
            ..EmbeddingConfig::default()
        }
    }

    #[test]
    fn known_models_have_dimensions() {
        assert_eq!(known_dimension("text-embedding-3-small"), Some(1536));
        assert_eq!(known_dimension("text-embedding-3-large"), Some(3072));
        assert_eq!(
            known_dimension("sentence-transformers/paraphrase-multilingual-MiniLM-L12-v2"),
            Some(384)
        );
        assert_eq!(known_dimension("my-custom-model"), None);
    }

    #[test]
    fn unknown_model_uses_configured_dimension() {
        let mut c = config(RemoteFlavor::Ollama, "http://localhost:11434", "custom");
        c.dimension = 256;
        assert_eq!(RemoteEmbedder::from_config(&c).unwrap().dimension(), 256);
    }

    #[test]
    fn endpoints_follow_flavor() {
        let openai = RemoteEmbedder::from_config(&config(
            RemoteFlavor::OpenAi,
            "https://api.example.com/v1/",
            "text-embedding-3-small",
        ))
        .unwrap();
        assert_eq!(openai.endpoint(), "https://api.example.com/v1/embeddings");

        let ollama = RemoteEmbedder::from_config(&config(
            RemoteFlavor::Ollama,
            "http://localhost:11434",
            "nomic-embed-text",
        ))
        .unwrap();
        assert_eq!(ollama.endpoint(), "http://localhost:11434/api/embed");

        let hf = RemoteEmbedder::from_config(&config(
            RemoteFlavor::HuggingFace,
            "https://api-inference.huggingface.co",
            "sentence-transformers/distiluse-base-multilingual-cased",
        ))
        .unwrap();
        assert_eq!(
            hf.endpoint(),
            "https://api-inference.huggingface.co/pipeline/feature-extraction/sentence-transformers/distiluse-base-multilingual-cased"
        );
        assert_eq!(hf.dimension(), 512);
    }

    #[test]
    fn unreachable_service_is_retryable_unavailable() {
        // Port 9 (discard) on localhost is closed in test environments.
        let embedder =
            RemoteEmbedder::from_config(&config(RemoteFlavor::Ollama, "http://127.0.0.1:9", "m"))
                .unwrap();
        let err = embedder.embed("hello").unwrap_err();
        assert!(matches!(err, LorebookError::EmbeddingUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn missing_url_is_invalid_configuration() {
        let mut c = config(RemoteFlavor::OpenAi, "", "text-embedding-3-small");
        c.url = None;
        assert!(matches!(
            RemoteEmbedder::from_config(&c),
            Err(LorebookError::InvalidConfiguration(_))
        ));
    }
}

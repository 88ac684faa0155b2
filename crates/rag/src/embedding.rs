use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::{debug, error, warn};

use ragcache_core::{sha256_hex, HashEmbedder, HashEmbedderConfig};
use ragcache_index::Embedding;

use crate::config::EmbeddingSettings;
use crate::error::{RagError, Result};
use crate::kv::KvStore;

/// Turns text into fixed-dimension vectors. The same model id must always
/// produce vectors of `dimension()` components.
pub trait EmbeddingProvider: Send + Sync {
    fn model_id(&self) -> &str;
    fn dimension(&self) -> usize;
    fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>>;
}

#[derive(Clone)]
pub enum EmbeddingBackend {
    Hash(HashEmbedder),
    OpenAi(OpenAiEmbeddingClient),
}

#[derive(Clone)]
pub struct EmbeddingClient {
    backend: EmbeddingBackend,
    model_id: String,
}

impl EmbeddingClient {
    pub fn from_settings(settings: &EmbeddingSettings) -> Result<Self> {
        match settings.provider.to_lowercase().as_str() {
            "openai" => {
                let dimensions = settings
                    .dimensions
                    .or_else(|| known_dimensions(&settings.model))
                    .ok_or_else(|| {
                        RagError::Config(format!(
                            "unknown dimension for embedding model {}; set EMBEDDING_DIMENSIONS",
                            settings.model
                        ))
                    })?;
                Ok(Self {
                    model_id: settings.model.clone(),
                    backend: EmbeddingBackend::OpenAi(OpenAiEmbeddingClient::new(
                        &settings.model,
                        dimensions,
                    )?),
                })
            }
            "hash" => Ok(Self::hash(HashEmbedderConfig {
                dimensions: settings.dimensions.unwrap_or(64),
                seed: settings.seed,
            })),
            other => Err(RagError::Config(format!(
                "unknown embedding provider {other}"
            ))),
        }
    }

    pub fn hash(config: HashEmbedderConfig) -> Self {
        let embedder = HashEmbedder::new(config);
        Self {
            model_id: embedder.model_id(),
            backend: EmbeddingBackend::Hash(embedder),
        }
    }
}

impl EmbeddingProvider for EmbeddingClient {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        match &self.backend {
            EmbeddingBackend::Hash(embedder) => embedder.dimensions(),
            EmbeddingBackend::OpenAi(client) => client.dimensions,
        }
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        match &self.backend {
            EmbeddingBackend::Hash(embedder) => {
                Ok(texts.iter().map(|text| embedder.embed_text(text)).collect())
            }
            EmbeddingBackend::OpenAi(client) => client.embed_batch(texts),
        }
    }
}

pub fn known_dimensions(model: &str) -> Option<usize> {
    match model {
        "text-embedding-3-small" | "text-embedding-ada-002" => Some(1536),
        "text-embedding-3-large" => Some(3072),
        _ => None,
    }
}

#[derive(Clone)]
pub struct OpenAiEmbeddingClient {
    http: Client,
    model: String,
    dimensions: usize,
    api_key: String,
    base_url: String,
}

impl OpenAiEmbeddingClient {
    pub fn new(model: &str, dimensions: usize) -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY").map_err(|_| {
            RagError::Config("OPENAI_API_KEY is required for openai embeddings".to_string())
        })?;
        let http = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| RagError::EmbeddingProvider(e.to_string()))?;
        Ok(Self {
            http,
            model: model.to_string(),
            dimensions,
            api_key,
            base_url: env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
        })
    }

    pub fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Embedding>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let mut payload = serde_json::json!({
            "model": self.model,
            "input": inputs,
        });
        if self.model.starts_with("text-embedding-3") {
            payload["dimensions"] = serde_json::json!(self.dimensions);
        }
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .map_err(|e| RagError::EmbeddingProvider(format!("openai request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(RagError::EmbeddingProvider(format!(
                "openai embeddings request failed: {}",
                response.status()
            )));
        }
        let mut parsed: OpenAiEmbeddingResponse = response
            .json()
            .map_err(|e| RagError::EmbeddingProvider(format!("invalid openai response: {e}")))?;
        if parsed.data.len() != inputs.len() {
            return Err(RagError::EmbeddingProvider(format!(
                "openai returned {} embeddings for {} inputs",
                parsed.data.len(),
                inputs.len()
            )));
        }
        parsed.data.sort_by_key(|data| data.index);
        Ok(parsed.data.into_iter().map(|data| data.embedding).collect())
    }
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// Content-addressed cache in front of an [`EmbeddingProvider`].
///
/// Entries are keyed by model id and the SHA-256 of the text. They are never
/// invalidated: the same model and text always yield the same vector.
pub struct EmbeddingCache {
    provider: Arc<dyn EmbeddingProvider>,
    kv: Arc<dyn KvStore>,
    ttl: Option<Duration>,
}

impl EmbeddingCache {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        kv: Arc<dyn KvStore>,
        ttl: Option<Duration>,
    ) -> Self {
        Self { provider, kv, ttl }
    }

    pub fn model_id(&self) -> &str {
        self.provider.model_id()
    }

    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    pub fn cache_key(&self, text: &str) -> String {
        format!("embedding:{}:{}", self.provider.model_id(), sha256_hex(text))
    }

    pub fn embed_one(&self, text: &str) -> Result<Embedding> {
        let mut out = self.embed_many(&[text.to_string()])?;
        out.pop()
            .ok_or_else(|| RagError::EmbeddingProvider("provider returned no embedding".into()))
    }

    /// Embeds `texts` in order. Cached texts are served from the store; all the
    /// others go to the provider in a single batch and are written back in one
    /// all-or-nothing store call.
    pub fn embed_many(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let dimension = self.provider.dimension();
        let keys: Vec<String> = texts.iter().map(|t| self.cache_key(t)).collect();
        let mut slots: Vec<Option<Embedding>> = keys
            .iter()
            .map(|key| self.lookup(key, dimension))
            .collect();

        let mut pending: Vec<usize> = Vec::new();
        let mut first_by_key: HashMap<&str, usize> = HashMap::new();
        for (idx, slot) in slots.iter().enumerate() {
            if slot.is_none() && !first_by_key.contains_key(keys[idx].as_str()) {
                first_by_key.insert(keys[idx].as_str(), idx);
                pending.push(idx);
            }
        }
        debug!(
            total = texts.len(),
            cached = texts.len() - slots.iter().filter(|s| s.is_none()).count(),
            requested = pending.len(),
            "embedding batch"
        );

        if !pending.is_empty() {
            let inputs: Vec<String> = pending.iter().map(|&idx| texts[idx].clone()).collect();
            let fresh = self.provider.embed(&inputs)?;
            if fresh.len() != inputs.len() {
                return Err(RagError::EmbeddingProvider(format!(
                    "provider returned {} embeddings for {} inputs",
                    fresh.len(),
                    inputs.len()
                )));
            }
            if let Some(bad) = fresh.iter().find(|e| e.len() != dimension) {
                return Err(RagError::DimensionMismatch {
                    expected: dimension,
                    actual: bad.len(),
                });
            }
            let entries: Vec<(String, Vec<u8>)> = pending
                .iter()
                .zip(&fresh)
                .map(|(&idx, embedding)| (keys[idx].clone(), encode_embedding(embedding)))
                .collect();
            if let Err(err) = self.kv.set_many(&entries, self.ttl) {
                error!(error = %err, "failed to cache embeddings");
            }
            let by_key: HashMap<&str, &Embedding> = pending
                .iter()
                .zip(&fresh)
                .map(|(&idx, embedding)| (keys[idx].as_str(), embedding))
                .collect();
            for (idx, slot) in slots.iter_mut().enumerate() {
                if slot.is_none() {
                    *slot = by_key.get(keys[idx].as_str()).map(|e| (*e).clone());
                }
            }
        }

        slots
            .into_iter()
            .map(|slot| {
                slot.ok_or_else(|| RagError::EmbeddingProvider("missing embedding".to_string()))
            })
            .collect()
    }

    fn lookup(&self, key: &str, dimension: usize) -> Option<Embedding> {
        match self.kv.get(key) {
            Ok(Some(bytes)) => match decode_embedding(&bytes) {
                Some(embedding) if embedding.len() == dimension => Some(embedding),
                _ => {
                    warn!(key, "ignoring malformed cached embedding");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(key, error = %err, "embedding cache read failed");
                None
            }
        }
    }
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    bytemuck::cast_slice::<f32, u8>(embedding).to_vec()
}

fn decode_embedding(bytes: &[u8]) -> Option<Embedding> {
    if bytes.len() % std::mem::size_of::<f32>() != 0 {
        return None;
    }
    Some(bytemuck::pod_collect_to_vec::<u8, f32>(bytes))
}

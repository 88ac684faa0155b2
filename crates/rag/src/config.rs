use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use ragcache_core::{DEFAULT_MAX_TOKENS, MIN_MAX_TOKENS};
use ragcache_llm::LlmProvider;

use crate::error::{RagError, Result};
use crate::history::DEFAULT_HISTORY_LIMIT;

pub const DEFAULT_FALLBACK_MESSAGE: &str =
    "Lo siento, no puedo responder en este momento. Inténtalo de nuevo más tarde.";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// `hash` or `openai`.
    pub provider: String,
    pub model: String,
    pub dimensions: Option<usize>,
    /// Only used by the hash provider.
    pub seed: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: "hash".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimensions: None,
            seed: 1337,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    /// `local` or `openai`.
    pub provider: String,
    pub model: Option<String>,
    pub temperature: f32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            model: None,
            temperature: 0.0,
        }
    }
}

impl GenerationSettings {
    pub fn provider(&self) -> Result<LlmProvider> {
        LlmProvider::from_str(&self.provider).ok_or_else(|| {
            RagError::Config(format!("unknown generation provider {}", self.provider))
        })
    }

    pub fn model(&self) -> Result<String> {
        Ok(match &self.model {
            Some(model) => model.clone(),
            None => self.provider()?.default_model().to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub persistence_dir: PathBuf,
    /// Defaults to `cache.sqlite` inside `persistence_dir`.
    pub kv_path: Option<PathBuf>,
    pub chunk_max_tokens: usize,
    pub search_top_k: usize,
    pub max_context_chunks: usize,
    pub query_cache_ttl_secs: u64,
    pub embedding_cache_ttl_secs: u64,
    pub history_max_messages: usize,
    pub chat_id: String,
    pub answer_language: String,
    pub fallback_message: String,
    pub embedding: EmbeddingSettings,
    pub generation: GenerationSettings,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            persistence_dir: PathBuf::from("vector_db"),
            kv_path: None,
            chunk_max_tokens: DEFAULT_MAX_TOKENS,
            search_top_k: 50,
            max_context_chunks: 10,
            query_cache_ttl_secs: 3600,
            embedding_cache_ttl_secs: 86_400,
            history_max_messages: DEFAULT_HISTORY_LIMIT,
            chat_id: "default_user".to_string(),
            answer_language: "Spanish".to_string(),
            fallback_message: DEFAULT_FALLBACK_MESSAGE.to_string(),
            embedding: EmbeddingSettings::default(),
            generation: GenerationSettings::default(),
        }
    }
}

impl RagConfig {
    /// Reads a TOML file and applies environment overrides on top. A missing
    /// file means defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = fs::read_to_string(path)?;
            toml::from_str(&contents)
                .map_err(|e| RagError::Config(format!("invalid config {}: {e}", path.display())))?
        } else {
            Self::default()
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Applies overrides from `lookup`, then validates the result.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("RAG_PERSISTENCE_DIR") {
            self.persistence_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("RAG_KV_PATH") {
            self.kv_path = Some(PathBuf::from(path));
        }
        if let Some(value) = lookup("RAG_CHUNK_TOKENS") {
            self.chunk_max_tokens = parse_var("RAG_CHUNK_TOKENS", &value)?;
        }
        if let Some(value) = lookup("RAG_TOP_K") {
            self.search_top_k = parse_var("RAG_TOP_K", &value)?;
        }
        if let Some(value) = lookup("RAG_QUERY_CACHE_TTL") {
            self.query_cache_ttl_secs = parse_var("RAG_QUERY_CACHE_TTL", &value)?;
        }
        if let Some(provider) = lookup("EMBEDDING_PROVIDER") {
            self.embedding.provider = provider;
        }
        if let Some(model) = lookup("EMBEDDING_MODEL") {
            self.embedding.model = model;
        }
        if let Some(value) = lookup("EMBEDDING_DIMENSIONS") {
            self.embedding.dimensions = Some(parse_var("EMBEDDING_DIMENSIONS", &value)?);
        }
        if let Some(provider) = lookup("LLM_PROVIDER") {
            self.generation.provider = provider;
        }
        if let Some(model) = lookup("LLM_MODEL") {
            self.generation.model = Some(model);
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_max_tokens < MIN_MAX_TOKENS {
            return Err(RagError::Config(format!(
                "chunk_max_tokens must be at least {MIN_MAX_TOKENS}"
            )));
        }
        if self.search_top_k == 0 {
            return Err(RagError::Config("search_top_k must be positive".into()));
        }
        if self.max_context_chunks == 0 {
            return Err(RagError::Config("max_context_chunks must be positive".into()));
        }
        if self.embedding.dimensions == Some(0) {
            return Err(RagError::Config("embedding dimensions must be positive".into()));
        }
        match self.embedding.provider.to_lowercase().as_str() {
            "hash" | "openai" => {}
            other => {
                return Err(RagError::Config(format!(
                    "unknown embedding provider {other}"
                )))
            }
        }
        self.generation.provider()?;
        Ok(())
    }

    pub fn kv_path(&self) -> PathBuf {
        self.kv_path
            .clone()
            .unwrap_or_else(|| self.persistence_dir.join("cache.sqlite"))
    }

    pub fn query_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.query_cache_ttl_secs)
    }

    pub fn embedding_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.embedding_cache_ttl_secs)
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RagError::Config(format!("{name} has an invalid value: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = RagConfig::default();
        config.validate().unwrap();
        assert_eq!(config.kv_path(), PathBuf::from("vector_db/cache.sqlite"));
        assert_eq!(config.search_top_k, 50);
        assert_eq!(config.chunk_max_tokens, 200);
        assert_eq!(config.generation.model().unwrap(), "local");
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = RagConfig::default();
        config
            .apply_env_from(lookup(&[
                ("RAG_PERSISTENCE_DIR", "/tmp/idx"),
                ("RAG_TOP_K", "7"),
                ("EMBEDDING_DIMENSIONS", "32"),
                ("LLM_PROVIDER", "openai"),
            ]))
            .unwrap();
        assert_eq!(config.persistence_dir, PathBuf::from("/tmp/idx"));
        assert_eq!(config.search_top_k, 7);
        assert_eq!(config.embedding.dimensions, Some(32));
        assert_eq!(config.generation.model().unwrap(), "gpt-3.5-turbo");
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let mut config = RagConfig::default();
        let err = config
            .apply_env_from(lookup(&[("RAG_CHUNK_TOKENS", "lots")]))
            .unwrap_err();
        assert!(matches!(err, RagError::Config(_)));

        let mut config = RagConfig::default();
        let err = config
            .apply_env_from(lookup(&[("RAG_TOP_K", "0")]))
            .unwrap_err();
        assert!(matches!(err, RagError::Config(_)));

        let mut config = RagConfig::default();
        let err = config
            .apply_env_from(lookup(&[("EMBEDDING_PROVIDER", "cohere")]))
            .unwrap_err();
        assert!(matches!(err, RagError::Config(_)));
    }

    #[test]
    fn chunk_windows_must_fit_a_whole_character() {
        for tokens in ["0", "3"] {
            let mut config = RagConfig::default();
            let err = config
                .apply_env_from(lookup(&[("RAG_CHUNK_TOKENS", tokens)]))
                .unwrap_err();
            assert!(matches!(err, RagError::Config(_)));
        }
        let mut config = RagConfig::default();
        config
            .apply_env_from(lookup(&[("RAG_CHUNK_TOKENS", "4")]))
            .unwrap();
        assert_eq!(config.chunk_max_tokens, MIN_MAX_TOKENS);
    }

    #[test]
    fn toml_file_fills_missing_fields_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ragcache.toml");
        let body = r#"
persistence_dir = "data"
answer_language = "English"

[embedding]
dimensions = 16
"#;
        fs::write(&path, body).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        let config: RagConfig = toml::from_str(&contents).unwrap();
        assert_eq!(config.persistence_dir, PathBuf::from("data"));
        assert_eq!(config.answer_language, "English");
        assert_eq!(config.embedding.dimensions, Some(16));
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.max_context_chunks, 10);
    }
}

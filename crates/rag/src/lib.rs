//! Retrieval-augmented answering with layered caches.
//!
//! [`RagChain`] is the entry point. It owns the vector index and keeps three
//! caches consistent: embeddings are content-addressed and never go stale, the
//! index is persisted on every add, and cached query contexts are stamped with
//! a version token that every ingest rotates.

pub mod chain;
pub mod config;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod history;
pub mod kv;
pub mod query_cache;
pub mod ranker;
pub mod routing;
pub mod version;

pub use chain::{
    AnswerSource, IndexStatus, IngestReport, QueryAnswer, RagChain, LLM_ERROR_FALLBACK,
    LLM_FALLBACK,
};
pub use config::{EmbeddingSettings, GenerationSettings, RagConfig};
pub use embedding::{
    known_dimensions, EmbeddingBackend, EmbeddingCache, EmbeddingClient, EmbeddingProvider,
    OpenAiEmbeddingClient,
};
pub use error::{RagError, Result};
pub use generation::GenerationProvider;
pub use history::{ChatHistory, KvChatHistory};
pub use kv::{KvStore, MemoryKv, SqliteKv};
pub use query_cache::QueryCache;
pub use ranker::{rank, RankedResult, SectionFilter, NO_DOCUMENT};
pub use routing::route_section;
pub use version::{VersionToken, DEFAULT_VERSION, VERSION_KEY};

pub use ragcache_index::{ChunkMetadata, Embedding, SearchHit};
pub use ragcache_llm::{ChatMessage, LlmClient, LlmProvider};

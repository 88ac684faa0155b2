use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use ragcache_core::Chunker;
use ragcache_index::{ChunkMetadata, VectorIndex};
use ragcache_llm::{ChatMessage, LlmClient};

use crate::config::RagConfig;
use crate::embedding::{EmbeddingCache, EmbeddingClient, EmbeddingProvider};
use crate::error::{RagError, Result};
use crate::generation::GenerationProvider;
use crate::history::{ChatHistory, KvChatHistory};
use crate::kv::{KvStore, SqliteKv};
use crate::query_cache::QueryCache;
use crate::ranker::{rank, RankedResult, SectionFilter};
use crate::version::VersionToken;

/// `doc_id` of answers generated without retrieved context.
pub const LLM_FALLBACK: &str = "llm_fallback";
/// `doc_id` of answers produced after the retrieval pipeline failed.
pub const LLM_ERROR_FALLBACK: &str = "llm_error_fallback";

const DIMENSION_CHECK_TEXT: &str = "test";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerSource {
    Cache,
    VectorDb,
    Llm,
    LlmError,
}

impl AnswerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnswerSource::Cache => "cache",
            AnswerSource::VectorDb => "vector_db",
            AnswerSource::Llm => "llm",
            AnswerSource::LlmError => "llm_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryAnswer {
    pub answer: String,
    pub doc_id: String,
    pub source: AnswerSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub doc_id: String,
    pub section: String,
    pub chunks: usize,
    pub chunk_ids: Vec<u64>,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStatus {
    pub document_count: usize,
    pub index_trained: bool,
    pub ready: bool,
    pub dimension: usize,
    pub version: String,
}

/// Ingestion and question answering over one persistent index.
///
/// All operations take `&self`. Searches share a read lock on the index; an
/// ingest takes the write lock only once its chunks are embedded, then rotates
/// the version so every cached context computed earlier stops matching.
pub struct RagChain {
    config: RagConfig,
    chunker: Chunker,
    embeddings: EmbeddingCache,
    index: RwLock<VectorIndex>,
    query_cache: QueryCache,
    version: VersionToken,
    generator: Arc<dyn GenerationProvider>,
    history: Option<Arc<dyn ChatHistory>>,
}

impl RagChain {
    pub fn open(
        config: RagConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: Arc<dyn GenerationProvider>,
        kv: Arc<dyn KvStore>,
        history: Option<Arc<dyn ChatHistory>>,
    ) -> Result<Self> {
        config.validate()?;
        let chunker =
            Chunker::for_embedding_model(&config.embedding.model, config.chunk_max_tokens)?;
        let index = VectorIndex::open_or_create(embedder.dimension(), &config.persistence_dir)?;
        let embeddings = EmbeddingCache::new(
            embedder,
            kv.clone(),
            Some(config.embedding_cache_ttl()),
        );

        let sample = embeddings.embed_one(DIMENSION_CHECK_TEXT)?;
        if sample.len() != index.dimension() {
            return Err(RagError::DimensionMismatch {
                expected: index.dimension(),
                actual: sample.len(),
            });
        }

        let version = VersionToken::load(kv.clone())?;
        info!(
            dir = %config.persistence_dir.display(),
            model = embeddings.model_id(),
            dimension = index.dimension(),
            documents = index.len(),
            version = %version.current(),
            "opened rag chain"
        );
        Ok(Self {
            chunker,
            embeddings,
            index: RwLock::new(index),
            query_cache: QueryCache::new(kv),
            version,
            generator,
            history,
            config,
        })
    }

    /// Builds providers and stores from `config`: SQLite at `config.kv_path()`
    /// plus the configured embedding and generation clients.
    pub fn from_config(config: RagConfig) -> Result<Self> {
        config.validate()?;
        let embedder = EmbeddingClient::from_settings(&config.embedding)?;
        let generator = LlmClient::new(config.generation.provider()?, config.generation.model()?)
            .map_err(|err| RagError::Config(format!("{err:#}")))?
            .with_temperature(config.generation.temperature);
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open(config.kv_path())?);
        let history: Arc<dyn ChatHistory> =
            Arc::new(KvChatHistory::new(kv.clone(), config.history_max_messages));
        Self::open(
            config,
            Arc::new(embedder),
            Arc::new(generator),
            kv,
            Some(history),
        )
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub fn current_version(&self) -> String {
        self.version.current()
    }

    /// Chunks, embeds and indexes `text`, then invalidates every cached context.
    /// `section` is stored trimmed, the same way [`SectionFilter::parse`] reads it.
    ///
    /// Nothing is written when chunking or embedding fails. The index write is
    /// atomic, so a failure there leaves the index as it was.
    pub fn ingest(&self, text: &str, doc_id: &str, section: &str) -> Result<IngestReport> {
        if text.trim().is_empty() {
            return Err(RagError::EmptyInput("text must not be blank"));
        }
        if doc_id.trim().is_empty() {
            return Err(RagError::EmptyInput("doc_id must not be blank"));
        }
        let section = section.trim();
        let chunks = self.chunker.split(text)?;
        let texts: Vec<String> = chunks.into_iter().map(|chunk| chunk.text).collect();
        let embeddings = self.embeddings.embed_many(&texts)?;
        let metadata = ChunkMetadata::new(doc_id, section);
        let chunk_ids = self.index.write().add(&texts, &embeddings, &metadata)?;
        let version = self.version.rotate()?;
        info!(doc_id, section, chunks = texts.len(), "ingested document");
        Ok(IngestReport {
            doc_id: doc_id.to_string(),
            section: section.to_string(),
            chunks: texts.len(),
            chunk_ids,
            version,
        })
    }

    /// Always answers. Retrieval problems of any kind degrade to generation
    /// without context.
    pub fn query(&self, question: &str, section: &SectionFilter, use_cache: bool) -> QueryAnswer {
        match self.answer_with_retrieval(question, section, use_cache) {
            Ok(answer) => answer,
            Err(err) => {
                warn!(error = %err, "retrieval failed, answering without context");
                let answer = match self.generate(question, question) {
                    Ok(answer) => answer,
                    Err(err) => {
                        warn!(error = %err, "fallback generation failed");
                        self.config.fallback_message.clone()
                    }
                };
                QueryAnswer {
                    answer,
                    doc_id: LLM_ERROR_FALLBACK.to_string(),
                    source: AnswerSource::LlmError,
                }
            }
        }
    }

    pub fn status(&self) -> IndexStatus {
        let index = self.index.read();
        IndexStatus {
            document_count: index.len(),
            index_trained: index.is_trained(),
            ready: !index.is_empty(),
            dimension: index.dimension(),
            version: self.version.current(),
        }
    }

    /// Clears the stored conversation for the configured chat id.
    pub fn reset_history(&self) -> Result<()> {
        match &self.history {
            Some(history) => history.reset(&self.config.chat_id),
            None => Ok(()),
        }
    }

    pub fn shutdown(&self) -> Result<()> {
        self.index.read().flush()?;
        debug!("rag chain flushed");
        Ok(())
    }

    fn answer_with_retrieval(
        &self,
        question: &str,
        section: &SectionFilter,
        use_cache: bool,
    ) -> Result<QueryAnswer> {
        let version = self.version.current();
        let section_key = section.as_str();

        if use_cache {
            if let Some(cached) = self.query_cache.get(question, section_key, &version) {
                info!(doc_id = %cached.doc_id, source = "cache", "answering from cached context");
                return self.answer_from(question, cached, AnswerSource::Cache);
            }
        }

        if self.index.read().is_empty() {
            debug!("index is empty, answering without context");
            return self.answer_without_context(question);
        }

        let embedding = self.embeddings.embed_one(question)?;
        let hits = self
            .index
            .read()
            .search(&embedding, self.config.search_top_k)?;
        let ranked = rank(&hits, section);
        if ranked.is_none() {
            debug!(hits = hits.len(), section = section_key, "no document matched");
            return self.answer_without_context(question);
        }

        // `use_cache` only skips the read; fresh contexts are always stored.
        if let Err(err) = self.query_cache.put(
            question,
            section_key,
            &version,
            &ranked,
            self.config.query_cache_ttl(),
        ) {
            warn!(error = %err, "failed to cache query context");
        }
        info!(
            doc_id = %ranked.doc_id,
            source = "vector_db",
            score = ranked.score,
            "ranked context"
        );
        self.answer_from(question, ranked, AnswerSource::VectorDb)
    }

    fn answer_from(
        &self,
        question: &str,
        ranked: RankedResult,
        source: AnswerSource,
    ) -> Result<QueryAnswer> {
        let prompt = self.context_prompt(question, &ranked);
        let answer = self.generate(question, &prompt)?;
        Ok(QueryAnswer {
            answer,
            doc_id: ranked.doc_id,
            source,
        })
    }

    fn answer_without_context(&self, question: &str) -> Result<QueryAnswer> {
        let answer = self.generate(question, question)?;
        Ok(QueryAnswer {
            answer,
            doc_id: LLM_FALLBACK.to_string(),
            source: AnswerSource::Llm,
        })
    }

    fn context_prompt(&self, question: &str, ranked: &RankedResult) -> String {
        let context = ranked
            .chunks
            .iter()
            .take(self.config.max_context_chunks)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Answer in {} based on this context:\nDocument: {}\nContext: {}\n\n\
             Question: {}\nAnswer:",
            self.config.answer_language, ranked.doc_id, context, question
        )
    }

    /// Runs the generator with the stored conversation, then records the turn.
    /// History problems are logged and never fail the call.
    fn generate(&self, question: &str, prompt: &str) -> Result<String> {
        let chat_id = self.config.chat_id.as_str();
        let history = match &self.history {
            Some(history) => history.load(chat_id).unwrap_or_else(|err| {
                warn!(chat_id, error = %err, "failed to load chat history");
                Vec::new()
            }),
            None => Vec::new(),
        };
        let answer = self.generator.complete(&history, prompt)?;
        if let Some(history) = &self.history {
            let turn = [ChatMessage::user(question), ChatMessage::assistant(answer.as_str())];
            if let Err(err) = history.append(chat_id, &turn) {
                warn!(chat_id, error = %err, "failed to record chat history");
            }
        }
        Ok(answer)
    }
}

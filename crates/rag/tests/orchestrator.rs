use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use ragcache_rag::{
    AnswerSource, ChatHistory, ChatMessage, Embedding, EmbeddingCache, EmbeddingProvider,
    GenerationProvider,
    KvChatHistory, KvStore, MemoryKv, RagChain, RagConfig, RagError, SectionFilter, SqliteKv,
    LLM_ERROR_FALLBACK, LLM_FALLBACK,
};
use tempfile::tempdir;

/// Looks vectors up by exact text so distances are chosen by the test.
struct TableEmbedder {
    dimension: usize,
    table: HashMap<String, Embedding>,
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl TableEmbedder {
    fn new(entries: &[(&str, Embedding)]) -> Self {
        let mut table: HashMap<String, Embedding> = entries
            .iter()
            .map(|(text, vector)| (text.to_string(), vector.clone()))
            .collect();
        table.insert("test".to_string(), vec![5.0, 5.0]);
        Self {
            dimension: 2,
            table,
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EmbeddingProvider for TableEmbedder {
    fn model_id(&self) -> &str {
        "table"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, texts: &[String]) -> ragcache_rag::Result<Vec<Embedding>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(RagError::EmbeddingProvider("embedding service down".into()));
        }
        texts
            .iter()
            .map(|text| {
                self.table
                    .get(text)
                    .cloned()
                    .ok_or_else(|| RagError::EmbeddingProvider(format!("no vector for {text}")))
            })
            .collect()
    }
}

#[derive(Default)]
struct RecordingGenerator {
    prompts: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl RecordingGenerator {
    fn last_prompt(&self) -> String {
        self.prompts.lock().last().cloned().unwrap_or_default()
    }
}

impl GenerationProvider for RecordingGenerator {
    fn complete(&self, _history: &[ChatMessage], prompt: &str) -> ragcache_rag::Result<String> {
        self.prompts.lock().push(prompt.to_string());
        if self.fail.load(Ordering::SeqCst) {
            return Err(RagError::GenerationProvider("model unavailable".into()));
        }
        Ok(format!("generated answer #{}", self.prompts.lock().len()))
    }
}

/// A vector at squared distance `1/score - 1` from the origin, so its
/// similarity to the origin query is exactly `score`.
fn at_score(score: f32) -> Embedding {
    vec![(1.0 / score - 1.0).sqrt(), 0.0]
}

fn standard_table() -> TableEmbedder {
    TableEmbedder::new(&[
        ("question", vec![0.0, 0.0]),
        ("other question", vec![0.0, 0.0]),
        ("alpha revenue figures", at_score(0.6)),
        ("alpha hiring plans", at_score(0.5)),
        ("beta revenue figures", at_score(0.7)),
        ("gamma appendix", at_score(0.9)),
    ])
}

fn config_in(dir: &Path) -> RagConfig {
    RagConfig {
        persistence_dir: dir.to_path_buf(),
        fallback_message: "sorry".to_string(),
        ..RagConfig::default()
    }
}

struct Harness {
    chain: RagChain,
    embedder: Arc<TableEmbedder>,
    generator: Arc<RecordingGenerator>,
}

fn open_with(dir: &Path, kv: Arc<dyn KvStore>, embedder: Arc<TableEmbedder>) -> Harness {
    let generator = Arc::new(RecordingGenerator::default());
    let chain = RagChain::open(
        config_in(dir),
        embedder.clone(),
        generator.clone(),
        kv,
        None,
    )
    .unwrap();
    Harness {
        chain,
        embedder,
        generator,
    }
}

fn open(dir: &Path) -> Harness {
    open_with(dir, Arc::new(MemoryKv::new()), Arc::new(standard_table()))
}

fn ingest_alpha_and_beta(chain: &RagChain) {
    chain
        .ingest("alpha revenue figures", "A", "summary")
        .unwrap();
    chain.ingest("alpha hiring plans", "A", "summary").unwrap();
    chain.ingest("beta revenue figures", "B", "summary").unwrap();
}

#[test]
fn summed_scores_pick_the_better_covered_document() {
    let dir = tempdir().unwrap();
    let h = open(dir.path());
    ingest_alpha_and_beta(&h.chain);

    let answer = h.chain.query("question", &SectionFilter::All, true);
    assert_eq!(answer.source, AnswerSource::VectorDb);
    assert_eq!(answer.doc_id, "A");
    let prompt = h.generator.last_prompt();
    assert!(prompt.contains("Document: A\n"));
    assert!(prompt.contains("Context: alpha revenue figures\nalpha hiring plans\n"));
    assert!(!prompt.contains("beta"));
}

#[test]
fn empty_index_answers_without_embedding_the_query() {
    let dir = tempdir().unwrap();
    let h = open(dir.path());
    let calls_after_open = h.embedder.calls();

    let answer = h.chain.query("question", &SectionFilter::All, true);
    assert_eq!(answer.source, AnswerSource::Llm);
    assert_eq!(answer.doc_id, LLM_FALLBACK);
    assert!(!answer.answer.is_empty());
    assert_eq!(h.embedder.calls(), calls_after_open);
    assert_eq!(h.generator.last_prompt(), "question");
}

#[test]
fn section_filter_that_excludes_everything_falls_back() {
    let dir = tempdir().unwrap();
    let h = open(dir.path());
    ingest_alpha_and_beta(&h.chain);

    let answer = h
        .chain
        .query("question", &SectionFilter::parse("annex"), true);
    assert_eq!(answer.source, AnswerSource::Llm);
    assert_eq!(answer.doc_id, LLM_FALLBACK);
}

#[test]
fn section_filter_selects_matching_chunks() {
    let dir = tempdir().unwrap();
    let h = open(dir.path());
    ingest_alpha_and_beta(&h.chain);
    h.chain.ingest("gamma appendix", "G", "annex").unwrap();

    let all = h.chain.query("question", &SectionFilter::All, false);
    assert_eq!(all.doc_id, "A");
    let annex = h
        .chain
        .query("question", &SectionFilter::parse("annex"), false);
    assert_eq!(annex.doc_id, "G");
}

#[test]
fn embedding_failure_degrades_to_plain_generation() {
    let dir = tempdir().unwrap();
    let h = open(dir.path());
    ingest_alpha_and_beta(&h.chain);
    h.embedder.fail.store(true, Ordering::SeqCst);

    let answer = h.chain.query("other question", &SectionFilter::All, true);
    assert_eq!(answer.source, AnswerSource::LlmError);
    assert_eq!(answer.doc_id, LLM_ERROR_FALLBACK);
    assert!(!answer.answer.is_empty());
    assert_eq!(h.generator.last_prompt(), "other question");
}

#[test]
fn failing_generation_still_returns_an_answer() {
    let dir = tempdir().unwrap();
    let h = open(dir.path());
    ingest_alpha_and_beta(&h.chain);
    h.generator.fail.store(true, Ordering::SeqCst);

    let answer = h.chain.query("question", &SectionFilter::All, true);
    assert_eq!(answer.source, AnswerSource::LlmError);
    assert_eq!(answer.answer, "sorry");
}

#[test]
fn repeated_query_is_served_from_cache_and_still_generates() {
    let dir = tempdir().unwrap();
    let h = open(dir.path());
    ingest_alpha_and_beta(&h.chain);

    let first = h.chain.query("question", &SectionFilter::All, true);
    assert_eq!(first.source, AnswerSource::VectorDb);
    let calls = h.embedder.calls();
    let prompts = h.generator.prompts.lock().len();

    let second = h.chain.query("question", &SectionFilter::All, true);
    assert_eq!(second.source, AnswerSource::Cache);
    assert_eq!(second.doc_id, "A");
    assert_eq!(h.embedder.calls(), calls);
    assert_eq!(h.generator.prompts.lock().len(), prompts + 1);
    assert_ne!(first.answer, second.answer);
}

#[test]
fn bypassing_the_cache_always_searches() {
    let dir = tempdir().unwrap();
    let h = open(dir.path());
    ingest_alpha_and_beta(&h.chain);

    h.chain.query("question", &SectionFilter::All, true);
    let answer = h.chain.query("question", &SectionFilter::All, false);
    assert_eq!(answer.source, AnswerSource::VectorDb);
}

#[test]
fn uncached_query_still_stores_its_context() {
    let dir = tempdir().unwrap();
    let h = open(dir.path());
    ingest_alpha_and_beta(&h.chain);

    let first = h.chain.query("question", &SectionFilter::All, false);
    assert_eq!(first.source, AnswerSource::VectorDb);
    let second = h.chain.query("question", &SectionFilter::All, true);
    assert_eq!(second.source, AnswerSource::Cache);
    assert_eq!(second.doc_id, "A");
}

#[test]
fn cached_context_is_served_while_the_embedder_is_down() {
    let dir = tempdir().unwrap();
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let embedder = Arc::new(standard_table());
    let h = open_with(dir.path(), kv.clone(), embedder.clone());
    ingest_alpha_and_beta(&h.chain);
    assert_eq!(
        h.chain.query("question", &SectionFilter::All, true).source,
        AnswerSource::VectorDb
    );

    // Drop the stored vector so only the query cache can avoid the provider.
    let embeddings = EmbeddingCache::new(embedder.clone(), kv.clone(), None);
    kv.delete(&embeddings.cache_key("question")).unwrap();
    h.embedder.fail.store(true, Ordering::SeqCst);
    let calls = h.embedder.calls();

    let answer = h.chain.query("question", &SectionFilter::All, true);
    assert_eq!(answer.source, AnswerSource::Cache);
    assert_eq!(answer.doc_id, "A");
    assert_eq!(h.embedder.calls(), calls);

    let bypass = h.chain.query("question", &SectionFilter::All, false);
    assert_eq!(bypass.source, AnswerSource::LlmError);
}

#[test]
fn empty_index_answers_while_the_embedder_is_down() {
    let dir = tempdir().unwrap();
    let h = open(dir.path());
    h.embedder.fail.store(true, Ordering::SeqCst);

    let answer = h.chain.query("question", &SectionFilter::All, true);
    assert_eq!(answer.source, AnswerSource::Llm);
    assert_eq!(answer.doc_id, LLM_FALLBACK);
    assert_eq!(h.generator.last_prompt(), "question");
}

#[test]
fn sections_are_trimmed_at_ingest() {
    let dir = tempdir().unwrap();
    let h = open(dir.path());
    let report = h
        .chain
        .ingest("gamma appendix", "G", "  annex ")
        .unwrap();
    assert_eq!(report.section, "annex");

    let answer = h
        .chain
        .query("question", &SectionFilter::parse("annex"), true);
    assert_eq!(answer.source, AnswerSource::VectorDb);
    assert_eq!(answer.doc_id, "G");
}

#[test]
fn ingest_invalidates_cached_contexts() {
    let dir = tempdir().unwrap();
    let h = open(dir.path());
    ingest_alpha_and_beta(&h.chain);

    assert_eq!(
        h.chain.query("question", &SectionFilter::All, true).source,
        AnswerSource::VectorDb
    );
    assert_eq!(
        h.chain.query("question", &SectionFilter::All, true).source,
        AnswerSource::Cache
    );
    let before = h.chain.current_version();
    h.chain.ingest("gamma appendix", "G", "annex").unwrap();
    assert_ne!(h.chain.current_version(), before);

    let after = h.chain.query("question", &SectionFilter::All, true);
    assert_eq!(after.source, AnswerSource::VectorDb);
}

#[test]
fn blank_input_is_rejected_before_any_work() {
    let dir = tempdir().unwrap();
    let h = open(dir.path());
    let calls = h.embedder.calls();
    let version = h.chain.current_version();

    assert!(matches!(
        h.chain.ingest("   \n", "A", "summary"),
        Err(RagError::EmptyInput(_))
    ));
    assert!(matches!(
        h.chain.ingest("alpha revenue figures", " ", "summary"),
        Err(RagError::EmptyInput(_))
    ));
    assert_eq!(h.embedder.calls(), calls);
    assert_eq!(h.chain.current_version(), version);
    assert_eq!(h.chain.status().document_count, 0);
}

#[test]
fn failed_embedding_leaves_index_and_version_untouched() {
    let dir = tempdir().unwrap();
    let h = open(dir.path());
    let version = h.chain.current_version();
    h.embedder.fail.store(true, Ordering::SeqCst);

    let err = h
        .chain
        .ingest("alpha revenue figures", "A", "summary")
        .unwrap_err();
    assert!(matches!(err, RagError::EmbeddingProvider(_)));
    assert_eq!(h.chain.status().document_count, 0);
    assert_eq!(h.chain.current_version(), version);
}

#[test]
fn reingesting_the_same_text_reuses_cached_embeddings() {
    let dir = tempdir().unwrap();
    let h = open(dir.path());
    h.chain
        .ingest("alpha revenue figures", "A", "summary")
        .unwrap();
    let calls = h.embedder.calls();
    let report = h
        .chain
        .ingest("alpha revenue figures", "A2", "summary")
        .unwrap();
    assert_eq!(h.embedder.calls(), calls);
    assert_eq!(report.chunk_ids, vec![1]);
    assert_eq!(h.chain.status().document_count, 2);
}

#[test]
fn state_survives_restart() {
    let dir = tempdir().unwrap();
    let kv_path = dir.path().join("cache.sqlite");
    let version;
    {
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open(&kv_path).unwrap());
        let h = open_with(dir.path(), kv, Arc::new(standard_table()));
        ingest_alpha_and_beta(&h.chain);
        assert_eq!(
            h.chain.query("question", &SectionFilter::All, true).source,
            AnswerSource::VectorDb
        );
        version = h.chain.current_version();
        h.chain.shutdown().unwrap();
    }

    let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open(&kv_path).unwrap());
    let h = open_with(dir.path(), kv, Arc::new(standard_table()));
    let status = h.chain.status();
    assert_eq!(status.document_count, 3);
    assert!(status.ready);
    assert_eq!(status.version, version);

    let answer = h.chain.query("question", &SectionFilter::All, true);
    assert_eq!(answer.source, AnswerSource::Cache);
    assert_eq!(answer.doc_id, "A");
    // Every text was embedded before the restart.
    assert_eq!(h.embedder.calls(), 0);
}

#[test]
fn reopening_with_another_dimension_fails() {
    let dir = tempdir().unwrap();
    {
        let h = open(dir.path());
        ingest_alpha_and_beta(&h.chain);
    }
    let mut wider = standard_table();
    wider.dimension = 3;
    let generator = Arc::new(RecordingGenerator::default());
    let result = RagChain::open(
        config_in(dir.path()),
        Arc::new(wider),
        generator,
        Arc::new(MemoryKv::new()),
        None,
    );
    assert!(matches!(
        result,
        Err(RagError::DimensionMismatch {
            expected: 2,
            actual: 3
        })
    ));
}

#[test]
fn provider_that_lies_about_its_dimension_is_caught_at_open() {
    let dir = tempdir().unwrap();
    let mut liar = standard_table();
    liar.dimension = 4;
    let result = RagChain::open(
        config_in(dir.path()),
        Arc::new(liar),
        Arc::new(RecordingGenerator::default()),
        Arc::new(MemoryKv::new()),
        None,
    );
    assert!(matches!(
        result,
        Err(RagError::DimensionMismatch {
            expected: 4,
            actual: 2
        })
    ));
}

#[test]
fn conversation_history_records_each_turn() {
    let dir = tempdir().unwrap();
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let history = Arc::new(KvChatHistory::new(kv.clone(), 20));
    let chain = RagChain::open(
        config_in(dir.path()),
        Arc::new(standard_table()),
        Arc::new(RecordingGenerator::default()),
        kv,
        Some(history.clone()),
    )
    .unwrap();
    chain.query("question", &SectionFilter::All, true);
    chain.query("other question", &SectionFilter::All, true);

    let turns = history.load("default_user").unwrap();
    assert_eq!(turns.len(), 4);
    assert_eq!(turns[0].content, "question");
    assert_eq!(turns[2].content, "other question");
}

#[test]
fn queries_run_concurrently_with_ingestion() {
    let dir = tempdir().unwrap();
    let h = open(dir.path());
    ingest_alpha_and_beta(&h.chain);

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..10 {
                    let answer = h.chain.query("question", &SectionFilter::All, true);
                    assert!(!answer.answer.is_empty());
                    assert_ne!(answer.source, AnswerSource::LlmError);
                }
            });
        }
        scope.spawn(|| {
            h.chain.ingest("gamma appendix", "G", "annex").unwrap();
        });
    });
    assert_eq!(h.chain.status().document_count, 4);
}

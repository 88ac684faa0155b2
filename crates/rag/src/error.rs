use ragcache_core::CoreError;
use ragcache_index::IndexError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("empty input: {0}")]
    EmptyInput(&'static str),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding provider error: {0}")]
    EmbeddingProvider(String),
    #[error("generation provider error: {0}")]
    GenerationProvider(String),
    #[error("index corruption: {0}")]
    IndexCorruption(String),
    #[error("index error: {0}")]
    Index(IndexError),
    #[error("config error: {0}")]
    Config(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, RagError>;

impl From<IndexError> for RagError {
    fn from(value: IndexError) -> Self {
        match value {
            IndexError::DimensionMismatch { expected, actual } => {
                RagError::DimensionMismatch { expected, actual }
            }
            IndexError::Corruption(reason) => RagError::IndexCorruption(reason),
            other => RagError::Index(other),
        }
    }
}

impl From<CoreError> for RagError {
    fn from(value: CoreError) -> Self {
        match value {
            CoreError::EmptyInput(what) => RagError::EmptyInput(what),
            err @ CoreError::WindowTooSmall { .. } => RagError::Config(err.to_string()),
            CoreError::Tokenizer(reason) => RagError::Tokenizer(reason),
        }
    }
}

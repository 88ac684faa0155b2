use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("embedding dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("{chunks} chunks but {embeddings} embeddings")]
    LengthMismatch { chunks: usize, embeddings: usize },
    #[error("index dimension must be positive")]
    ZeroDimension,
    #[error("persisted index is corrupt: {0}")]
    Corruption(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;

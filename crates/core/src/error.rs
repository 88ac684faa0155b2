use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("empty input: {0}")]
    EmptyInput(&'static str),
    #[error("chunk window of {max_tokens} tokens is below the minimum of {min}")]
    WindowTooSmall { max_tokens: usize, min: usize },
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

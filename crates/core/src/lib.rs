mod chunk;
mod digest;
mod embedding;
mod error;
mod tokenizer;

pub use chunk::{Chunk, Chunker, DEFAULT_MAX_TOKENS, MIN_MAX_TOKENS};
pub use digest::sha256_hex;
pub use embedding::{HashEmbedder, HashEmbedderConfig};
pub use error::{CoreError, Result};
pub use tokenizer::TokenizerKind;

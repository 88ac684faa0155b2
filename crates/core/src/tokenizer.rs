use tiktoken_rs::CoreBPE;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenizerKind {
    #[default]
    Cl100k,
    O200k,
    P50k,
}

impl TokenizerKind {
    /// Tokenizer family used by an embedding model, so chunk boundaries line up
    /// with how the provider bills and truncates input.
    pub fn for_embedding_model(model: &str) -> Self {
        let lower = model.to_lowercase();
        if lower.starts_with("text-embedding-3") || lower.starts_with("text-embedding-ada") {
            return TokenizerKind::Cl100k;
        }
        if lower.starts_with("gpt-4o") || lower.starts_with("o1") {
            return TokenizerKind::O200k;
        }
        if lower.starts_with("text-davinci") || lower.starts_with("code-") {
            return TokenizerKind::P50k;
        }
        TokenizerKind::Cl100k
    }

    pub fn build(&self) -> Result<CoreBPE> {
        let built = match self {
            TokenizerKind::Cl100k => tiktoken_rs::cl100k_base(),
            TokenizerKind::O200k => tiktoken_rs::o200k_base(),
            TokenizerKind::P50k => tiktoken_rs::p50k_base(),
        };
        built.map_err(|e| CoreError::Tokenizer(e.to_string()))
    }
}

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;
use tracing::info;

use crate::error::{CoreError, Result};
use crate::tokenizer::TokenizerKind;

pub const DEFAULT_MAX_TOKENS: usize = 200;

/// Smallest window that always fits one whole character. A byte-level BPE
/// never spends more than one token per UTF-8 byte.
pub const MIN_MAX_TOKENS: usize = 4;

/// A token-aligned span of a source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub token_count: usize,
}

/// Splits text into fixed, non-overlapping token windows.
#[derive(Clone)]
pub struct Chunker {
    tokenizer: Arc<CoreBPE>,
    max_tokens: usize,
}

impl Chunker {
    pub fn new(kind: &TokenizerKind, max_tokens: usize) -> Result<Self> {
        check_window(max_tokens)?;
        Ok(Self {
            tokenizer: Arc::new(kind.build()?),
            max_tokens,
        })
    }

    pub fn for_embedding_model(model: &str, max_tokens: usize) -> Result<Self> {
        Self::new(&TokenizerKind::for_embedding_model(model), max_tokens)
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.tokenizer.encode_ordinary(text).len()
    }

    pub fn split(&self, text: &str) -> Result<Vec<Chunk>> {
        self.split_with(text, self.max_tokens)
    }

    /// Windows of at most `max_tokens` tokens; the last one may be shorter.
    ///
    /// A window whose tokens end inside a multi-byte character cannot be decoded on
    /// its own, so its end moves back to the previous character boundary and the
    /// remaining tokens open the next window.
    pub fn split_with(&self, text: &str, max_tokens: usize) -> Result<Vec<Chunk>> {
        if text.trim().is_empty() {
            return Err(CoreError::EmptyInput("text must not be blank"));
        }
        check_window(max_tokens)?;
        let tokens = self.tokenizer.encode_ordinary(text);
        let mut chunks = Vec::with_capacity(tokens.len() / max_tokens + 1);
        let mut start = 0usize;
        while start < tokens.len() {
            let limit = (start + max_tokens).min(tokens.len());
            let (end, decoded) = self.decode_window(&tokens, start, limit)?;
            chunks.push(Chunk {
                text: decoded,
                token_count: end - start,
            });
            start = end;
        }
        info!(chunks = chunks.len(), max_tokens, "token-split document");
        Ok(chunks)
    }

    fn decode_window(
        &self,
        tokens: &[usize],
        start: usize,
        limit: usize,
    ) -> Result<(usize, String)> {
        let mut end = limit;
        while end > start {
            if let Ok(text) = self.tokenizer.decode(tokens[start..end].to_vec()) {
                return Ok((end, text));
            }
            end -= 1;
        }
        Err(CoreError::Tokenizer(format!(
            "tokens {start}..{limit} do not decode to valid utf-8"
        )))
    }
}

fn check_window(max_tokens: usize) -> Result<()> {
    if max_tokens < MIN_MAX_TOKENS {
        return Err(CoreError::WindowTooSmall {
            max_tokens,
            min: MIN_MAX_TOKENS,
        });
    }
    Ok(())
}

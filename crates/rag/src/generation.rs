use ragcache_llm::{ChatMessage, LlmClient, LlmRequest};
use tracing::debug;

use crate::error::{RagError, Result};

/// Produces an answer for a prompt, given the prior conversation.
pub trait GenerationProvider: Send + Sync {
    fn complete(&self, history: &[ChatMessage], prompt: &str) -> Result<String>;
}

impl GenerationProvider for LlmClient {
    fn complete(&self, history: &[ChatMessage], prompt: &str) -> Result<String> {
        let request = LlmRequest {
            system: None,
            history: history.to_vec(),
            user: prompt.to_string(),
        };
        let response = self
            .chat_blocking(&request)
            .map_err(|err| RagError::GenerationProvider(format!("{err:#}")))?;
        debug!(
            provider = self.provider().as_str(),
            model = self.model(),
            tokens = response.total_tokens(),
            "generation finished"
        );
        if response.content.trim().is_empty() {
            return Err(RagError::GenerationProvider(
                "model returned an empty answer".to_string(),
            ));
        }
        Ok(response.content)
    }
}

use std::sync::Arc;

use ragcache_llm::ChatMessage;

use crate::error::Result;
use crate::kv::KvStore;

pub const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Per-conversation message log handed to the generation step.
pub trait ChatHistory: Send + Sync {
    fn load(&self, chat_id: &str) -> Result<Vec<ChatMessage>>;
    fn append(&self, chat_id: &str, messages: &[ChatMessage]) -> Result<()>;
    fn reset(&self, chat_id: &str) -> Result<()>;
}

/// Keeps the most recent `limit` messages as one JSON array per chat.
pub struct KvChatHistory {
    kv: Arc<dyn KvStore>,
    limit: usize,
}

impl KvChatHistory {
    pub fn new(kv: Arc<dyn KvStore>, limit: usize) -> Self {
        Self {
            kv,
            limit: limit.max(1),
        }
    }

    fn key(chat_id: &str) -> String {
        format!("chat_memory:{chat_id}")
    }
}

impl ChatHistory for KvChatHistory {
    fn load(&self, chat_id: &str) -> Result<Vec<ChatMessage>> {
        match self.kv.get(&Self::key(chat_id))? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    fn append(&self, chat_id: &str, messages: &[ChatMessage]) -> Result<()> {
        let mut all = self.load(chat_id).unwrap_or_default();
        all.extend_from_slice(messages);
        if all.len() > self.limit {
            all.drain(..all.len() - self.limit);
        }
        let bytes = serde_json::to_vec(&all)?;
        self.kv.set(&Self::key(chat_id), &bytes, None)
    }

    fn reset(&self, chat_id: &str) -> Result<()> {
        self.kv.delete(&Self::key(chat_id))
    }
}

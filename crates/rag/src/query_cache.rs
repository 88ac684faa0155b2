use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use ragcache_core::sha256_hex;

use crate::error::Result;
use crate::kv::KvStore;
use crate::ranker::RankedResult;

#[derive(Serialize, Deserialize)]
struct CachedContext {
    version: String,
    result: RankedResult,
}

/// Retrieval results keyed by query, section filter and index version.
pub struct QueryCache {
    kv: Arc<dyn KvStore>,
}

impl QueryCache {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn cache_key(query: &str, section: &str, version: &str) -> String {
        format!(
            "context:{}",
            sha256_hex(format!("{query}:{section}:{version}"))
        )
    }

    /// Read failures and undecodable entries count as misses.
    pub fn get(&self, query: &str, section: &str, version: &str) -> Option<RankedResult> {
        let key = Self::cache_key(query, section, version);
        let bytes = match self.kv.get(&key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                warn!(error = %err, "query cache read failed");
                return None;
            }
        };
        match serde_json::from_slice::<CachedContext>(&bytes) {
            Ok(entry) if entry.version == version => {
                debug!(key, "query cache hit");
                Some(entry.result)
            }
            Ok(_) => None,
            Err(err) => {
                warn!(key, error = %err, "dropping undecodable cached context");
                None
            }
        }
    }

    pub fn put(
        &self,
        query: &str,
        section: &str,
        version: &str,
        result: &RankedResult,
        ttl: Duration,
    ) -> Result<()> {
        let entry = CachedContext {
            version: version.to_string(),
            result: result.clone(),
        };
        let bytes = serde_json::to_vec(&entry)?;
        self.kv
            .set(&Self::cache_key(query, section, version), &bytes, Some(ttl))
    }
}

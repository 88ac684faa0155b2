use std::sync::Arc;

use parking_lot::RwLock;
use rand::RngCore;
use tracing::info;

use crate::error::Result;
use crate::kv::KvStore;

pub const VERSION_KEY: &str = "vector_version";
pub const DEFAULT_VERSION: &str = "v1";

/// Global generation marker for the index contents. Every cached query context
/// is stamped with it; rotating it makes all earlier contexts unreachable.
pub struct VersionToken {
    kv: Arc<dyn KvStore>,
    current: RwLock<String>,
}

impl VersionToken {
    /// Reads the persisted token, falling back to [`DEFAULT_VERSION`].
    pub fn load(kv: Arc<dyn KvStore>) -> Result<Self> {
        let current = match kv.get(VERSION_KEY)? {
            Some(bytes) => match String::from_utf8(bytes) {
                Ok(value) if !value.is_empty() => value,
                _ => DEFAULT_VERSION.to_string(),
            },
            None => DEFAULT_VERSION.to_string(),
        };
        Ok(Self {
            kv,
            current: RwLock::new(current),
        })
    }

    pub fn current(&self) -> String {
        self.current.read().clone()
    }

    /// Replaces the token with a fresh random value and persists it. The new
    /// token is live in-process even when the write fails, so this process
    /// never serves contexts computed before the rotation.
    pub fn rotate(&self) -> Result<String> {
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        let next = hex::encode(raw);
        *self.current.write() = next.clone();
        self.kv.set(VERSION_KEY, next.as_bytes(), None)?;
        info!(version = %next, "rotated index version");
        Ok(next)
    }
}

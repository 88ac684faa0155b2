use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of `input`, used for every content-addressed cache key.
pub fn sha256_hex(input: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_ref());
    hex::encode(hasher.finalize())
}

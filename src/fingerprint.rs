use sha2::{Digest, Sha256};

const FINGERPRINT_LEN: usize = 16;

/// Truncated SHA-256 of normalized page text, hex encoded.
pub fn fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(FINGERPRINT_LEN);
    digest
}

/// True when a stored fingerprint exists and equals the fresh one.
pub fn is_unchanged(stored: Option<&str>, fresh: &str) -> bool {
    stored.is_some_and(|s| s == fresh)
}

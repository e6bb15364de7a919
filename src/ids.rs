//! Opaque identifier parsing and content hashing shared by every repository.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{RepositoryError, Result};

/// Parse a caller-supplied identifier into its canonical form.
///
/// Malformed input fails fast with a validation error, before any I/O is
/// attempted, per the storage-primitives contract.
pub fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim())
        .map_err(|e| RepositoryError::validation(format!("invalid id {raw:?}: {e}")))
}

/// Generate a new opaque identifier.
pub fn new_id() -> Uuid {
    Uuid::new_v4()
}

/// Compute the SHA-256 hex digest of UTF-8 content, used to populate
/// `content_hash` whenever a `content` field is written.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// True when `hash` looks like a 64-char lowercase-hex SHA-256 digest.
pub fn is_valid_content_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_id_rejects_garbage() {
        assert!(parse_id("not-a-uuid").is_err());
    }

    #[test]
    fn parse_id_accepts_uuid() {
        let id = new_id();
        assert_eq!(parse_id(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn content_hash_is_64_hex_chars() {
        let h = content_hash("hello world");
        assert!(is_valid_content_hash(&h));
    }

    #[test]
    fn content_hash_is_deterministic() {
        assert_eq!(content_hash("same"), content_hash("same"));
        assert_ne!(content_hash("a"), content_hash("b"));
    }
}

//! One-way hashing of hardware and domain identities.

use sha2::{Digest, Sha256};

/// Hashes an identity (hardware id or domain) for context binding.
///
/// Returns lowercase hex SHA-256 so the raw identity never lands in a cache.
#[must_use]
pub fn context_binding_hash(identity: &str) -> String {
    hex::encode(Sha256::digest(identity.as_bytes()))
}

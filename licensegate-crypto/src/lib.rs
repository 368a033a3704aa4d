//! Signature verification layer for licensegate.
//!
//! Provides:
//! - RSA-SHA256 (PKCS#1 v1.5) verification with a pinned public key
//! - Canonical JSON so signer and verifier agree on the signed bytes
//! - One-way hashing for hardware/domain context binding
//!
//! Nothing here signs. The private key stays with the license server.

mod binding;
mod canonical;
mod error;
mod verifier;

pub use binding::context_binding_hash;
pub use canonical::canonicalize_json;
pub use error::{CryptoError, CryptoResult};
pub use verifier::{
    split_signature, SignatureVerifier, MIN_KEY_BITS, RECOMMENDED_KEY_BITS, SIGNATURE_FIELD,
};

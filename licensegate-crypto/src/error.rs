//! Error types for the verification layer.

use thiserror::Error;

/// Result type for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors that can occur while loading keys or verifying signatures.
///
/// A signature that is well-formed but does not match is not an error;
/// verification reports it as `Ok(false)`.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Data or signature was empty.
    #[error("empty input: {0}")]
    EmptyInput(&'static str),

    /// Signature is not valid base64.
    #[error("signature is not valid base64: {0}")]
    InvalidBase64(String),

    /// Public key could not be parsed as an RSA key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Public key modulus is below the accepted minimum.
    #[error("public key too small: {bits} bits (minimum {min})")]
    KeyTooSmall { bits: usize, min: usize },

    /// Input is not a JSON object.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// Response carries no `signature` field.
    #[error("response has no signature field")]
    MissingSignature,

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

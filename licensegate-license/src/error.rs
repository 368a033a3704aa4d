//! Error types for the licensing module.

use crate::state::EntitlementStatus;
use licensegate_crypto::CryptoError;
use thiserror::Error;

/// Licensing-specific errors.
#[derive(Debug, Error)]
pub enum LicenseError {
    /// Empty or malformed input (missing license key, unparsable JSON,
    /// missing public key). Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Signature did not match the pinned public key.
    #[error("signature verification failed: {0}")]
    Signature(String),

    /// Transport fault (connect, timeout, DNS, 5xx).
    #[error("network error: {0}")]
    Network(String),

    /// Server asked us to back off.
    #[error("rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Server rejected the request at the application level.
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Resolved state lacks a required capability.
    #[error("capability '{capability}' not available (state: {state})")]
    MissingCapability {
        capability: String,
        state: EntitlementStatus,
    },

    /// Cache backend error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LicenseError {
    /// Returns true for transport faults worth another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimited { .. })
    }

    /// Returns true for a cryptographic mismatch.
    #[must_use]
    pub fn is_signature(&self) -> bool {
        matches!(self, Self::Signature(_))
    }
}

impl From<CryptoError> for LicenseError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Serialization(e) => Self::Serialization(e),
            other => Self::Validation(other.to_string()),
        }
    }
}

/// Result type for license operations.
pub type LicenseResult<T> = Result<T, LicenseError>;

//! RSA-SHA256 signature verification over canonical JSON.
//!
//! The license server signs the canonical form of each response (with the
//! `signature` field removed) using RSASSA-PKCS1-v1_5 with SHA-256. This
//! module only ever verifies; it holds no private key material.

use crate::canonical::canonicalize_json;
use crate::error::{CryptoError, CryptoResult};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use serde_json::Value;
use sha2::Sha256;
use tracing::warn;

/// Smallest modulus accepted for a verification key.
pub const MIN_KEY_BITS: usize = 2048;

/// Keys below this size are accepted with a warning.
pub const RECOMMENDED_KEY_BITS: usize = 4096;

/// Name of the field carrying the base64 signature in server responses.
pub const SIGNATURE_FIELD: &str = "signature";

/// Verifies server signatures with a pinned RSA public key.
#[derive(Clone)]
pub struct SignatureVerifier {
    key: VerifyingKey<Sha256>,
    bits: usize,
}

impl SignatureVerifier {
    /// Builds a verifier from a PEM-encoded key.
    ///
    /// Accepts both SPKI (`BEGIN PUBLIC KEY`) and PKCS#1
    /// (`BEGIN RSA PUBLIC KEY`) encodings.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is empty, malformed, not RSA, or smaller
    /// than [`MIN_KEY_BITS`].
    pub fn from_pem(pem: &str) -> CryptoResult<Self> {
        let pem = pem.trim();
        if pem.is_empty() {
            return Err(CryptoError::EmptyInput("public key"));
        }

        let key = if pem.starts_with("-----BEGIN RSA PUBLIC KEY-----") {
            RsaPublicKey::from_pkcs1_pem(pem)
                .map_err(|e| CryptoError::InvalidPublicKey(format!("malformed PKCS#1 key: {e}")))?
        } else if pem.starts_with("-----BEGIN PUBLIC KEY-----") {
            RsaPublicKey::from_public_key_pem(pem).map_err(|e| {
                CryptoError::InvalidPublicKey(format!("not an RSA public key: {e}"))
            })?
        } else {
            return Err(CryptoError::InvalidPublicKey(
                "expected a PEM public key block".to_string(),
            ));
        };

        Self::from_rsa_key(key)
    }

    /// Builds a verifier from a DER-encoded key (SPKI or PKCS#1).
    ///
    /// # Errors
    ///
    /// Same conditions as [`SignatureVerifier::from_pem`].
    pub fn from_der(der: &[u8]) -> CryptoResult<Self> {
        if der.is_empty() {
            return Err(CryptoError::EmptyInput("public key"));
        }

        let key = RsaPublicKey::from_public_key_der(der)
            .or_else(|_| RsaPublicKey::from_pkcs1_der(der))
            .map_err(|e| CryptoError::InvalidPublicKey(format!("not an RSA public key: {e}")))?;

        Self::from_rsa_key(key)
    }

    /// Builds a verifier from an already parsed key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyTooSmall`] below [`MIN_KEY_BITS`].
    pub fn from_rsa_key(key: RsaPublicKey) -> CryptoResult<Self> {
        let bits = key.n().bits();
        if bits < MIN_KEY_BITS {
            return Err(CryptoError::KeyTooSmall {
                bits,
                min: MIN_KEY_BITS,
            });
        }
        if bits < RECOMMENDED_KEY_BITS {
            warn!(bits, "RSA verification key is below {RECOMMENDED_KEY_BITS} bits");
        }

        Ok(Self {
            key: VerifyingKey::new(key),
            bits,
        })
    }

    /// Returns the modulus size of the pinned key.
    #[must_use]
    pub fn key_bits(&self) -> usize {
        self.bits
    }

    /// Verifies a base64 signature over `data`.
    ///
    /// Returns `Ok(false)` for a signature that does not match.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` or `signature` is empty, or the signature
    /// is not valid base64.
    pub fn verify(&self, data: &[u8], signature: &str) -> CryptoResult<bool> {
        if data.is_empty() {
            return Err(CryptoError::EmptyInput("data"));
        }
        let signature = signature.trim();
        if signature.is_empty() {
            return Err(CryptoError::EmptyInput("signature"));
        }

        let sig_bytes = BASE64
            .decode(signature)
            .map_err(|e| CryptoError::InvalidBase64(e.to_string()))?;

        let Ok(sig) = Signature::try_from(sig_bytes.as_slice()) else {
            return Ok(false);
        };

        Ok(self.key.verify(data, &sig).is_ok())
    }

    /// Parses a JSON response, strips its `signature` field and verifies the
    /// canonical form of the remainder.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a JSON object or has no
    /// signature field.
    pub fn verify_json_response(&self, json: &str) -> CryptoResult<bool> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| CryptoError::InvalidJson(e.to_string()))?;
        self.verify_value(&value)
    }

    /// Like [`SignatureVerifier::verify_json_response`] for a parsed value.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` is not an object or has no signature field.
    pub fn verify_value(&self, value: &Value) -> CryptoResult<bool> {
        let (body, signature) = split_signature(value)?;
        self.verify(canonicalize_json(&body).as_bytes(), &signature)
    }
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("algorithm", &"RSA-SHA256")
            .field("bits", &self.bits)
            .finish()
    }
}

/// Splits a response into its unsigned body and the base64 signature.
///
/// # Errors
///
/// Returns an error if `value` is not an object or carries no string
/// `signature` field.
pub fn split_signature(value: &Value) -> CryptoResult<(Value, String)> {
    let Value::Object(map) = value else {
        return Err(CryptoError::InvalidJson("expected a JSON object".to_string()));
    };

    let mut body = map.clone();
    match body.remove(SIGNATURE_FIELD) {
        Some(Value::String(sig)) => Ok((Value::Object(body), sig)),
        _ => Err(CryptoError::MissingSignature),
    }
}

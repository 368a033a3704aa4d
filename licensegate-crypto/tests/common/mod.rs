//! Shared test helpers: a deterministic RSA key pair and a signer standing
//! in for the license server.

#![allow(dead_code)]

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use licensegate_crypto::canonicalize_json;
use rand::{rngs::StdRng, SeedableRng};
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::Value;
use sha2::Sha256;
use std::sync::OnceLock;

/// Returns a 2048-bit key pair generated once per test binary.
pub fn test_private_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        RsaPrivateKey::new(&mut rng, 2048).unwrap()
    })
}

/// A second, unrelated key pair.
pub fn other_private_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = StdRng::seed_from_u64(0xbad5eed);
        RsaPrivateKey::new(&mut rng, 2048).unwrap()
    })
}

/// SPKI PEM of the test public key.
pub fn test_public_pem() -> String {
    RsaPublicKey::from(test_private_key())
        .to_public_key_pem(LineEnding::LF)
        .unwrap()
}

/// Signs raw bytes, returning base64.
pub fn sign_bytes(key: &RsaPrivateKey, data: &[u8]) -> String {
    let signing_key = SigningKey::<Sha256>::new(key.clone());
    BASE64.encode(signing_key.sign(data).to_bytes())
}

/// Signs the canonical form of `body` and returns it with a `signature` field.
pub fn sign_response(key: &RsaPrivateKey, body: &Value) -> Value {
    let signature = sign_bytes(key, canonicalize_json(body).as_bytes());
    let mut signed = body.clone();
    signed
        .as_object_mut()
        .unwrap()
        .insert("signature".to_string(), Value::String(signature));
    signed
}

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use licensegate_cli::{
    binding_hash, canonicalize, load_verifier, read_json, verify_response, KindArg,
};
use licensegate_license::{ManualClock, ResponseKind};
use rand::{rngs::StdRng, SeedableRng};
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{json, Value};
use sha2::Sha256;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tempfile::TempDir;

const NOW: i64 = 1_800_000_000;

fn server_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = StdRng::seed_from_u64(7);
        RsaPrivateKey::new(&mut rng, 2048).unwrap()
    })
}

fn sign(body: Value) -> Value {
    let signing_key = SigningKey::<Sha256>::new(server_key().clone());
    let signature = BASE64.encode(signing_key.sign(canonicalize(&body).as_bytes()).to_bytes());
    let mut signed = body;
    signed["signature"] = json!(signature);
    signed
}

fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

fn key_file(dir: &TempDir) -> PathBuf {
    let pem = RsaPublicKey::from(server_key())
        .to_public_key_pem(LineEnding::LF)
        .unwrap();
    write(dir, "server.pem", &pem)
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(NOW))
}

fn response() -> Value {
    json!({
        "valid": true,
        "license": {"status": "active", "expires_at": NOW + 86_400 * 10},
        "timestamp": NOW
    })
}

// ── verify ──────────────────────────────────────────────────────

#[test]
fn verify_accepts_signed_response() {
    let dir = tempfile::tempdir().unwrap();
    let verifier = load_verifier(&key_file(&dir)).unwrap();
    let path = write(&dir, "response.json", &sign(response()).to_string());

    let state = verify_response(
        verifier,
        ResponseKind::Validation,
        &read_json(&path).unwrap(),
        clock(),
    )
    .unwrap();
    assert!(state.is_active());
    assert_eq!(state.days_until_expiration_at(NOW), Some(10));
}

#[test]
fn verify_rejects_tampered_response() {
    let dir = tempfile::tempdir().unwrap();
    let verifier = load_verifier(&key_file(&dir)).unwrap();
    let mut signed = sign(response());
    signed["license"]["expires_at"] = json!(NOW + 86_400 * 1_000);

    let err = verify_response(verifier, ResponseKind::Validation, &signed, clock()).unwrap_err();
    assert!(format!("{err:#}").contains("signature"));
}

#[test]
fn verify_refuses_unsigned_response() {
    let dir = tempfile::tempdir().unwrap();
    let verifier = load_verifier(&key_file(&dir)).unwrap();

    let err = verify_response(verifier, ResponseKind::Validation, &response(), clock()).unwrap_err();
    assert!(err.to_string().contains("signature"));
}

#[test]
fn verify_feature_check_kind() {
    let dir = tempfile::tempdir().unwrap();
    let verifier = load_verifier(&key_file(&dir)).unwrap();
    let signed = sign(json!({"feature": "export", "enabled": true, "valid": true}));

    let state =
        verify_response(verifier, KindArg::FeatureCheck.into(), &signed, clock()).unwrap();
    assert!(state.has_capability("export"));
}

#[test]
fn load_verifier_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.pem");
    let err = load_verifier(&missing).unwrap_err();
    assert!(err.to_string().contains("nope.pem"));

    let garbage = write(&dir, "bad.pem", "not a key");
    assert!(load_verifier(&garbage).is_err());
}

// ── canonicalize / hash ─────────────────────────────────────────

#[test]
fn canonicalize_sorts_keys() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(&dir, "in.json", r#"{ "b": 1, "a": { "d": [true, null], "c": "x" } }"#);

    assert_eq!(
        canonicalize(&read_json(&path).unwrap()),
        r#"{"a":{"c":"x","d":[true,null]},"b":1}"#
    );
}

#[test]
fn read_json_rejects_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(&dir, "in.json", "{oops");
    assert!(read_json(&path).unwrap_err().to_string().contains("not valid JSON"));
}

#[test]
fn binding_hash_is_sha256_hex() {
    assert_eq!(
        binding_hash("abc").unwrap(),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    assert_eq!(binding_hash(" abc ").unwrap(), binding_hash("abc").unwrap());
    assert!(binding_hash("  ").is_err());
}

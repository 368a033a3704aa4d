use licensegate_crypto::CryptoError;

#[test]
fn error_display_empty_input() {
    let err = CryptoError::EmptyInput("signature");
    let msg = format!("{err}");
    assert!(msg.contains("empty input"));
    assert!(msg.contains("signature"));
}

#[test]
fn error_display_invalid_base64() {
    let err = CryptoError::InvalidBase64("bad symbol".into());
    assert!(format!("{err}").contains("base64"));
}

#[test]
fn error_display_key_too_small() {
    let err = CryptoError::KeyTooSmall {
        bits: 1024,
        min: 2048,
    };
    let msg = format!("{err}");
    assert!(msg.contains("1024"));
    assert!(msg.contains("2048"));
}

#[test]
fn error_display_missing_signature() {
    let err = CryptoError::MissingSignature;
    assert!(format!("{err}").contains("no signature"));
}

#[test]
fn error_from_serde_json() {
    let serde_err: Result<serde_json::Value, _> = serde_json::from_str("not json");
    let crypto_err: CryptoError = serde_err.unwrap_err().into();
    assert!(format!("{crypto_err}").contains("serialization"));
}

#[test]
fn error_is_debug() {
    let err = CryptoError::InvalidPublicKey("test".into());
    let _ = format!("{err:?}");
}

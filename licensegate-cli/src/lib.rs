//! Offline inspection commands behind the `licensegate` binary.

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use licensegate_crypto::{canonicalize_json, context_binding_hash, SIGNATURE_FIELD};
use licensegate_license::{
    Clock, EntitlementConfig, EntitlementState, ResponseKind, SignatureVerifier, StateResolver,
};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Response kinds selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Validation,
    FeatureCheck,
    Activation,
}

impl From<KindArg> for ResponseKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Validation => Self::Validation,
            KindArg::FeatureCheck => Self::FeatureCheck,
            KindArg::Activation => Self::Activation,
        }
    }
}

/// Loads a PEM public key (SPKI or PKCS#1) from `path`.
pub fn load_verifier(path: &Path) -> Result<SignatureVerifier> {
    let pem = fs::read_to_string(path)
        .with_context(|| format!("failed to read public key {}", path.display()))?;
    let verifier = SignatureVerifier::from_pem(&pem)
        .with_context(|| format!("invalid public key in {}", path.display()))?;
    debug!(bits = verifier.key_bits(), "loaded public key");
    Ok(verifier)
}

/// Reads and parses a JSON file.
pub fn read_json(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} is not valid JSON", path.display()))
}

/// Verifies a signed response and evaluates it as of `clock`.
///
/// Unlike the library, which tolerates unsigned responses, this refuses
/// anything without a signature.
pub fn verify_response(
    verifier: SignatureVerifier,
    kind: ResponseKind,
    response: &Value,
    clock: Arc<dyn Clock>,
) -> Result<EntitlementState> {
    if response.get(SIGNATURE_FIELD).is_none() {
        bail!("response carries no '{SIGNATURE_FIELD}' field");
    }

    let resolver = StateResolver::new(&EntitlementConfig::default(), Some(Arc::new(verifier)), clock);
    resolver
        .resolve(kind, response)
        .context("response did not verify")
}

/// Canonical JSON for `value`, as signed by the license server.
#[must_use]
pub fn canonicalize(value: &Value) -> String {
    canonicalize_json(value)
}

/// Context-binding hash for a hardware id or domain.
pub fn binding_hash(identity: &str) -> Result<String> {
    let identity = identity.trim();
    if identity.is_empty() {
        bail!("identity is empty");
    }
    Ok(context_binding_hash(identity))
}

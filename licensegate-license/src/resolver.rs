//! Turns server responses into evaluated [`EntitlementState`]s.
//!
//! Every response that carries a `signature` is verified against the pinned
//! key before any of its fields are read. The verified body is kept as the
//! state's [`Attestation`] so a cached copy can be checked again later.

use crate::clock::Clock;
use crate::config::EntitlementConfig;
use crate::error::{LicenseError, LicenseResult};
use crate::state::{
    Attestation, EntitlementPayload, EntitlementState, ResponseKind, StateRecord,
    UnsignaledPolicy,
};
use licensegate_crypto::{
    canonicalize_json, context_binding_hash, split_signature, SignatureVerifier, SIGNATURE_FIELD,
};
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::{Map, Number, Value};
use std::sync::Arc;
use tracing::{debug, warn};

// ── Wire shapes ──────────────────────────────────────────────────

/// The `license` object embedded in every response kind.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LicenseRecord {
    status: Option<String>,
    features: Map<String, Value>,
    metadata: Map<String, Value>,
    #[serde(deserialize_with = "de_epoch")]
    expires_at: Option<i64>,
    #[serde(deserialize_with = "de_epoch", alias = "starts_at")]
    valid_from: Option<i64>,
    #[serde(deserialize_with = "de_epoch")]
    activated_at: Option<i64>,
    hardware_id: Option<String>,
    domain: Option<String>,
    activations_limit: Option<i64>,
    activations_count: Option<i64>,
}

/// Body of a validation response.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ValidationBody {
    valid: Option<bool>,
    license: Option<LicenseRecord>,
    features: Map<String, Value>,
    metadata: Map<String, Value>,
    #[serde(deserialize_with = "de_epoch")]
    timestamp: Option<i64>,
}

/// Body of a feature-check response.
#[derive(Debug, Deserialize)]
struct FeatureCheckBody {
    feature: String,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    value: Option<Number>,
    #[serde(default)]
    valid: Option<bool>,
    #[serde(default)]
    license: Option<LicenseRecord>,
    #[serde(default, deserialize_with = "de_epoch")]
    timestamp: Option<i64>,
}

/// Identity an activation was registered for.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ActivationRecord {
    hardware_id: Option<String>,
    domain: Option<String>,
}

/// Body of an activation response.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ActivationBody {
    activated: Option<bool>,
    license: Option<LicenseRecord>,
    activation: Option<ActivationRecord>,
    #[serde(deserialize_with = "de_epoch")]
    timestamp: Option<i64>,
}

/// The two interchangeable layouts the server uses for the same body.
#[derive(Debug)]
enum ResponseShape<T> {
    /// `{ data: { ... }, timestamp? }`
    Enveloped { data: T, timestamp: Option<i64> },
    /// `{ ... }`
    Flat(T),
}

impl<T: DeserializeOwned> ResponseShape<T> {
    fn classify(body: Value) -> LicenseResult<Self> {
        let Value::Object(mut map) = body else {
            return Err(LicenseError::Validation(
                "response is not a JSON object".to_string(),
            ));
        };

        let shape = match map.remove("data") {
            Some(data @ Value::Object(_)) => Self::Enveloped {
                timestamp: map.get("timestamp").and_then(parse_epoch),
                data: serde_json::from_value(data).map_err(malformed)?,
            },
            Some(other) => {
                map.insert("data".to_string(), other);
                Self::Flat(serde_json::from_value(Value::Object(map)).map_err(malformed)?)
            }
            None => Self::Flat(serde_json::from_value(Value::Object(map)).map_err(malformed)?),
        };
        Ok(shape)
    }
}

fn malformed(err: serde_json::Error) -> LicenseError {
    LicenseError::Validation(format!("malformed response: {err}"))
}

// ── Resolver ─────────────────────────────────────────────────────

/// Verifies, normalizes and classifies server responses.
#[derive(Debug, Clone)]
pub struct StateResolver {
    verifier: Option<Arc<SignatureVerifier>>,
    product_id: Option<String>,
    environment: Option<String>,
    unsignaled: UnsignaledPolicy,
    clock: Arc<dyn Clock>,
}

impl StateResolver {
    /// Creates a resolver. Without a verifier, signed responses are accepted
    /// unverified.
    #[must_use]
    pub fn new(
        config: &EntitlementConfig,
        verifier: Option<Arc<SignatureVerifier>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            verifier,
            product_id: non_empty(&config.product_id),
            environment: non_empty(&config.environment),
            unsignaled: config.unsignaled_policy,
            clock,
        }
    }

    /// Returns true if a verifier is configured.
    #[must_use]
    pub fn verifies_signatures(&self) -> bool {
        self.verifier.is_some()
    }

    /// Resolves a validation response.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::Signature`] if the signature does not match
    /// and [`LicenseError::Validation`] if the body is malformed.
    pub fn resolve_validation(&self, response: &Value) -> LicenseResult<EntitlementState> {
        self.resolve(ResponseKind::Validation, response)
    }

    /// Resolves a feature-check response.
    ///
    /// # Errors
    ///
    /// Same as [`StateResolver::resolve_validation`].
    pub fn resolve_feature_check(&self, response: &Value) -> LicenseResult<EntitlementState> {
        self.resolve(ResponseKind::FeatureCheck, response)
    }

    /// Resolves an activation response.
    ///
    /// # Errors
    ///
    /// Same as [`StateResolver::resolve_validation`].
    pub fn resolve_activation(&self, response: &Value) -> LicenseResult<EntitlementState> {
        self.resolve(ResponseKind::Activation, response)
    }

    /// Resolves a response of the given kind.
    ///
    /// # Errors
    ///
    /// Same as [`StateResolver::resolve_validation`].
    pub fn resolve(&self, kind: ResponseKind, response: &Value) -> LicenseResult<EntitlementState> {
        let (body, signature) = self.authenticate(response)?;
        let attestation = Attestation {
            kind,
            body: canonicalize_json(&body),
        };

        let now = self.clock.now_secs();
        let mut payload = normalize(kind, body)?;
        payload.issued_at = payload.issued_at.or(Some(now));
        payload.last_verified_at = Some(now);
        payload.product_id = self.product_id.clone();
        payload.environment = self.environment.clone();
        payload.signature = signature;
        payload.attestation = Some(attestation);

        let state = EntitlementState::evaluate(payload, now, self.unsignaled);
        debug!(kind = ?kind, state = %state.state(), "resolved entitlement");
        Ok(state)
    }

    /// Rebuilds a state from its persisted record.
    ///
    /// With a verifier configured the record must carry a signature that
    /// matches its attestation. The state is then re-derived from the
    /// attestation; the record's derived fields are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::Signature`] if the record is unsigned, its
    /// signature does not verify, or its response kind does not match the
    /// signed body, and [`LicenseError::Storage`] if the record is unusable.
    pub fn reconstruct(&self, record: &StateRecord) -> LicenseResult<EntitlementState> {
        let Some(attestation) = record.attestation.as_ref() else {
            return Err(match self.verifier {
                Some(_) => LicenseError::Signature("cached state has no attestation".to_string()),
                None => LicenseError::Storage("cached state has no attestation".to_string()),
            });
        };

        if let Some(verifier) = &self.verifier {
            let signature = record.signature.as_deref().ok_or_else(|| {
                LicenseError::Signature("cached state carries no signature".to_string())
            })?;
            match verifier.verify(attestation.body.as_bytes(), signature) {
                Ok(true) => {}
                Ok(false) => {
                    return Err(LicenseError::Signature(
                        "cached state signature mismatch".to_string(),
                    ));
                }
                Err(e) => {
                    return Err(LicenseError::Signature(format!(
                        "cached state signature unreadable: {e}"
                    )));
                }
            }
        }

        let body: Value = serde_json::from_str(&attestation.body)
            .map_err(|e| LicenseError::Storage(format!("cached attestation unreadable: {e}")))?;

        // `kind` sits outside the signed bytes, so it must agree with the body.
        let signed_kind = infer_kind(&body);
        if signed_kind != attestation.kind {
            return Err(LicenseError::Signature(format!(
                "cached attestation claims {:?} but the signed body is {signed_kind:?}",
                attestation.kind
            )));
        }

        let mut payload = normalize(attestation.kind, body)?;
        payload.issued_at = Some(record.issued_at);
        payload.last_verified_at = Some(record.last_verified_at);
        payload.product_id = record.product_id.clone();
        payload.environment = record.environment.clone();
        payload.signature = record.signature.clone();
        payload.attestation = Some(attestation.clone());

        Ok(EntitlementState::evaluate(
            payload,
            self.clock.now_secs(),
            self.unsignaled,
        ))
    }

    /// A restricted state for "could not validate".
    #[must_use]
    pub fn create_restricted_state(&self, reason: &str) -> EntitlementState {
        EntitlementState::restricted(
            reason,
            self.product_id.clone(),
            self.environment.clone(),
            self.clock.now_secs(),
        )
    }

    /// A grace state for "revalidation failed but `prior` still allows
    /// operation". Restricted once the offline window has passed.
    #[must_use]
    pub fn create_grace_state(&self, prior: &EntitlementState) -> EntitlementState {
        EntitlementState::grace_from(prior, self.clock.now_secs())
    }

    /// Splits off and checks the signature. Nothing else is read first.
    fn authenticate(&self, response: &Value) -> LicenseResult<(Value, Option<String>)> {
        let Value::Object(map) = response else {
            return Err(LicenseError::Validation(
                "response is not a JSON object".to_string(),
            ));
        };

        if !map.contains_key(SIGNATURE_FIELD) {
            if self.verifier.is_some() {
                warn!("accepting unsigned response; it will not be cached");
            }
            return Ok((response.clone(), None));
        }

        let (body, signature) =
            split_signature(response).map_err(|e| LicenseError::Signature(e.to_string()))?;

        match &self.verifier {
            Some(verifier) => {
                let canonical = canonicalize_json(&body);
                let verified = verifier
                    .verify(canonical.as_bytes(), &signature)
                    .map_err(|e| LicenseError::Signature(e.to_string()))?;
                if !verified {
                    return Err(LicenseError::Signature(
                        "response signature mismatch".to_string(),
                    ));
                }
            }
            None => debug!("no verifier configured, signed response accepted unverified"),
        }

        Ok((body, Some(signature)))
    }
}

// ── Normalizers ──────────────────────────────────────────────────

fn normalize(kind: ResponseKind, body: Value) -> LicenseResult<EntitlementPayload> {
    match kind {
        ResponseKind::Validation => match ResponseShape::<ValidationBody>::classify(body)? {
            ResponseShape::Enveloped { data, timestamp } => Ok(normalize_enveloped(data, timestamp)),
            ResponseShape::Flat(data) => Ok(normalize_flat(data)),
        },
        ResponseKind::FeatureCheck => {
            let (data, timestamp) = match ResponseShape::<FeatureCheckBody>::classify(body)? {
                ResponseShape::Enveloped { data, timestamp } => (data, timestamp),
                ResponseShape::Flat(data) => (data, None),
            };
            Ok(normalize_feature_check(data, timestamp))
        }
        ResponseKind::Activation => {
            let (data, timestamp) = match ResponseShape::<ActivationBody>::classify(body)? {
                ResponseShape::Enveloped { data, timestamp } => (data, timestamp),
                ResponseShape::Flat(data) => (data, None),
            };
            Ok(normalize_activation(data, timestamp))
        }
    }
}

/// Reads the response kind from the body itself: activations carry
/// `activated` or `activation`, feature checks carry `feature`.
fn infer_kind(body: &Value) -> ResponseKind {
    let data = match body.get("data") {
        Some(data @ Value::Object(_)) => data,
        _ => body,
    };
    if data.get("activated").is_some() || data.get("activation").is_some() {
        ResponseKind::Activation
    } else if data.get("feature").is_some() {
        ResponseKind::FeatureCheck
    } else {
        ResponseKind::Validation
    }
}

/// `{data:{valid, license}, timestamp}`: the envelope's timestamp wins.
fn normalize_enveloped(data: ValidationBody, timestamp: Option<i64>) -> EntitlementPayload {
    let timestamp = timestamp.or(data.timestamp);
    let mut payload = normalize_flat(data);
    payload.issued_at = timestamp;
    payload
}

/// `{valid, license, timestamp}`.
fn normalize_flat(data: ValidationBody) -> EntitlementPayload {
    let mut payload = EntitlementPayload {
        valid: data.valid,
        features: data.features,
        metadata: data.metadata,
        issued_at: data.timestamp,
        ..Default::default()
    };
    if let Some(license) = data.license {
        apply_license(&mut payload, license);
    }
    payload
}

fn normalize_feature_check(data: FeatureCheckBody, timestamp: Option<i64>) -> EntitlementPayload {
    let mut payload = EntitlementPayload {
        valid: data.valid,
        issued_at: timestamp.or(data.timestamp),
        ..Default::default()
    };
    if let Some(license) = data.license {
        apply_license(&mut payload, license);
    }

    let checked = match (data.value, data.enabled) {
        (Some(value), _) => Value::Number(value),
        (None, Some(enabled)) => Value::Bool(enabled),
        (None, None) => Value::Bool(false),
    };
    payload.features.insert(data.feature, checked);
    payload
}

fn normalize_activation(data: ActivationBody, timestamp: Option<i64>) -> EntitlementPayload {
    let mut payload = EntitlementPayload {
        valid: data.activated,
        issued_at: timestamp.or(data.timestamp),
        ..Default::default()
    };
    if let Some(license) = data.license {
        apply_license(&mut payload, license);
    }

    if let Some(activation) = data.activation
        && let Some(binding) = binding_for(activation.hardware_id, activation.domain)
    {
        payload.context_binding = Some(binding);
    }
    payload
}

/// Copies the shared `license` object into the payload.
fn apply_license(payload: &mut EntitlementPayload, license: LicenseRecord) {
    payload.status = license.status;
    payload.license_features = license.features;
    for (key, value) in license.metadata {
        payload.metadata.insert(key, value);
    }
    if let Some(activated_at) = license.activated_at {
        payload
            .metadata
            .insert("activated_at".to_string(), Value::from(activated_at));
    }
    payload.valid_until = license.expires_at;
    payload.valid_from = license.valid_from;
    payload.context_binding = binding_for(license.hardware_id, license.domain);
    payload.max_activations = license.activations_limit;
    payload.current_activations = license.activations_count;
}

/// Hashes the hardware id, or failing that the domain.
fn binding_for(hardware_id: Option<String>, domain: Option<String>) -> Option<String> {
    hardware_id
        .filter(|id| !id.is_empty())
        .or(domain.filter(|d| !d.is_empty()))
        .map(|identity| context_binding_hash(&identity))
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

// ── Timestamps ───────────────────────────────────────────────────

/// Reads epoch seconds from a number, a numeric string, or RFC 3339.
#[must_use]
pub fn parse_epoch(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok().or_else(|| {
            chrono::DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|dt| dt.timestamp())
        }),
        _ => None,
    }
}

fn de_epoch<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => parse_epoch(&value)
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("invalid timestamp: {value}"))),
    }
}

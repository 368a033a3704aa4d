//! Entitlement state: the trust decision derived from a license payload.
//!
//! An [`EntitlementState`] is evaluated once, at construction, from a
//! normalized [`EntitlementPayload`] and the current time. It is never
//! mutated afterwards; reading a cached state always builds a new instance.

use crate::config::{DAY_SECS, EXPIRY_GRACE_SECS, OFFLINE_GRACE_SECS};
use crate::error::{LicenseError, LicenseResult};
use licensegate_crypto::context_binding_hash;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// License statuses that void an entitlement outright.
const INVALIDATING_STATUSES: [&str; 3] = ["revoked", "suspended", "cancelled"];

/// License statuses that withhold updates.
const UPDATE_BLOCKING_STATUSES: [&str; 2] = ["revoked", "suspended"];

/// License statuses that grant downloads.
const DOWNLOAD_STATUSES: [&str; 3] = ["active", "assigned", "available"];

/// Numeric license limits copied into the capability set.
pub const LIMIT_CAPABILITIES: [&str; 2] = ["max_activations", "current_activations"];

/// The trust status of an entitlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitlementStatus {
    /// Fully entitled.
    Active,
    /// Operating on borrowed time (recently expired or offline).
    Grace,
    /// Not entitled right now (not yet valid, long expired, or unverifiable).
    Restricted,
    /// Revoked, suspended, or cancelled.
    Invalid,
}

impl EntitlementStatus {
    /// Returns true if software may keep operating (Active or Grace).
    #[must_use]
    pub fn allows_operation(&self) -> bool {
        matches!(self, Self::Active | Self::Grace)
    }

    /// Returns the lowercase name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Grace => "grace",
            Self::Restricted => "restricted",
            Self::Invalid => "invalid",
        }
    }
}

impl fmt::Display for EntitlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to conclude from a payload that no earlier rule of
/// [`determine_state`] settles: no invalidating status, inside its validity
/// window, not `valid: true`, and no recent failed revalidation. This
/// includes payloads with `valid: false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnsignaledPolicy {
    /// Treat as active (fail-open).
    #[default]
    Active,
    /// Treat as restricted (fail-closed).
    Restricted,
}

/// A single capability value: a flag or a numeric limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Capability {
    /// On/off permission gate.
    Flag(bool),
    /// Scalar limit or quota.
    Number(Number),
}

impl Capability {
    /// Converts a JSON feature value. Anything but booleans and numbers is
    /// not a capability.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Flag(*b)),
            Value::Number(n) => Some(Self::Number(n.clone())),
            _ => None,
        }
    }

    /// Returns true for `true` or a positive number.
    #[must_use]
    pub fn is_granted(&self) -> bool {
        match self {
            Self::Flag(b) => *b,
            Self::Number(n) => n.as_f64().is_some_and(|v| v > 0.0),
        }
    }

    /// Returns the numeric value, if this is a limit.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => n.as_i64(),
            Self::Flag(_) => None,
        }
    }

    /// Converts back to JSON.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Flag(b) => Value::Bool(*b),
            Self::Number(n) => Value::Number(n.clone()),
        }
    }
}

/// Which endpoint a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    /// License validation.
    Validation,
    /// Single feature check.
    FeatureCheck,
    /// Device/domain activation.
    Activation,
}

/// The response a state was derived from, in canonical JSON without its
/// signature. The signature is checked against `body` on every cache read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    /// Endpoint the response came from.
    pub kind: ResponseKind,
    /// Canonical JSON of the response minus `signature`.
    pub body: String,
}

/// A server response normalized into one schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntitlementPayload {
    /// Server's validity verdict.
    pub valid: Option<bool>,
    /// License status string (`active`, `revoked`, ...).
    pub status: Option<String>,
    /// Response-level features.
    pub features: Map<String, Value>,
    /// Features nested under `license`; these override `features`.
    pub license_features: Map<String, Value>,
    /// Opaque pass-through.
    pub metadata: Map<String, Value>,
    /// Start of validity, epoch seconds.
    pub valid_from: Option<i64>,
    /// End of validity, epoch seconds. `None` is a lifetime license.
    pub valid_until: Option<i64>,
    /// Hash of the bound hardware id or domain.
    pub context_binding: Option<String>,
    /// Activation limit.
    pub max_activations: Option<i64>,
    /// Activations in use.
    pub current_activations: Option<i64>,
    /// Set when the last revalidation attempt failed.
    pub revalidation_failed: bool,
    /// Last successful server verification, epoch seconds.
    pub last_verified_at: Option<i64>,
    /// When the server issued the response, epoch seconds.
    pub issued_at: Option<i64>,
    /// Pass-through product id.
    pub product_id: Option<String>,
    /// Pass-through environment.
    pub environment: Option<String>,
    /// Base64 server signature.
    pub signature: Option<String>,
    /// Signed material the signature covers.
    pub attestation: Option<Attestation>,
}

impl EntitlementPayload {
    fn status_in(&self, set: &[&str]) -> bool {
        self.status
            .as_deref()
            .is_some_and(|s| set.iter().any(|candidate| s.eq_ignore_ascii_case(candidate)))
    }
}

/// Classifies a payload at time `now`.
///
/// Precedence: invalidating status, not-yet-valid, expiry (with a 7-day
/// grace), explicit `valid`, failed revalidation within 72 hours of the last
/// verification, and finally `unsignaled`. An explicit `valid: false` is
/// not a rule of its own and falls through to `unsignaled`.
#[must_use]
pub fn determine_state(
    payload: &EntitlementPayload,
    now: i64,
    unsignaled: UnsignaledPolicy,
) -> EntitlementStatus {
    if payload.status_in(&INVALIDATING_STATUSES) {
        return EntitlementStatus::Invalid;
    }

    if payload.valid_from.is_some_and(|from| now < from) {
        return EntitlementStatus::Restricted;
    }

    if let Some(until) = payload.valid_until
        && now > until
    {
        return if now - until < EXPIRY_GRACE_SECS {
            EntitlementStatus::Grace
        } else {
            EntitlementStatus::Restricted
        };
    }

    if payload.valid == Some(true) {
        return EntitlementStatus::Active;
    }

    if payload.revalidation_failed
        && payload
            .last_verified_at
            .is_some_and(|at| now - at < OFFLINE_GRACE_SECS)
    {
        return EntitlementStatus::Grace;
    }

    debug!(
        valid = ?payload.valid,
        status = ?payload.status,
        "payload not settled by status, window or `valid: true`, applying {unsignaled:?} policy"
    );
    match unsignaled {
        UnsignaledPolicy::Active => EntitlementStatus::Active,
        UnsignaledPolicy::Restricted => EntitlementStatus::Restricted,
    }
}

/// Builds the capability set for a payload.
#[must_use]
pub fn derive_capabilities(payload: &EntitlementPayload) -> BTreeMap<String, Capability> {
    let mut merged = payload.features.clone();
    for (name, value) in &payload.license_features {
        merged.insert(name.clone(), value.clone());
    }

    let mut caps: BTreeMap<String, Capability> = merged
        .iter()
        .filter_map(|(name, value)| Capability::from_json(value).map(|c| (name.clone(), c)))
        .collect();

    let updates = !(payload.valid == Some(false) || payload.status_in(&UPDATE_BLOCKING_STATUSES));
    caps.insert("updates".to_string(), Capability::Flag(updates));

    let telemetry = merged
        .get("telemetry")
        .and_then(Capability::from_json)
        .unwrap_or(Capability::Flag(true));
    caps.insert("telemetry".to_string(), telemetry);

    let downloads = payload.status_in(&DOWNLOAD_STATUSES) || payload.valid == Some(true);
    caps.insert("downloads".to_string(), Capability::Flag(downloads));

    let limits = [payload.max_activations, payload.current_activations];
    for (name, limit) in LIMIT_CAPABILITIES.iter().zip(limits) {
        if let Some(limit) = limit {
            caps.insert((*name).to_string(), Capability::Number(Number::from(limit)));
        }
    }

    caps
}

/// An immutable, evaluated entitlement snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitlementState {
    status: EntitlementStatus,
    capabilities: BTreeMap<String, Capability>,
    valid_from: Option<i64>,
    valid_until: Option<i64>,
    context_binding: Option<String>,
    product_id: Option<String>,
    environment: Option<String>,
    metadata: Map<String, Value>,
    signature: Option<String>,
    attestation: Option<Attestation>,
    reason: Option<String>,
    issued_at: i64,
    last_verified_at: i64,
    synthetic: bool,
}

impl EntitlementState {
    /// Evaluates `payload` at time `now` with the default (fail-open) policy.
    #[must_use]
    pub fn from_payload(payload: EntitlementPayload, now: i64) -> Self {
        Self::evaluate(payload, now, UnsignaledPolicy::default())
    }

    /// Evaluates `payload` at time `now`.
    #[must_use]
    pub fn evaluate(payload: EntitlementPayload, now: i64, unsignaled: UnsignaledPolicy) -> Self {
        let status = determine_state(&payload, now, unsignaled);
        let capabilities = derive_capabilities(&payload);

        Self {
            status,
            capabilities,
            valid_from: payload.valid_from,
            valid_until: payload.valid_until,
            context_binding: payload.context_binding,
            product_id: payload.product_id,
            environment: payload.environment,
            metadata: payload.metadata,
            signature: payload.signature,
            attestation: payload.attestation,
            reason: None,
            issued_at: payload.issued_at.unwrap_or(now),
            last_verified_at: payload.last_verified_at.unwrap_or(now),
            synthetic: false,
        }
    }

    /// A restricted state produced without any server response.
    #[must_use]
    pub(crate) fn restricted(
        reason: impl Into<String>,
        product_id: Option<String>,
        environment: Option<String>,
        now: i64,
    ) -> Self {
        let payload = EntitlementPayload::default();
        Self {
            status: EntitlementStatus::Restricted,
            capabilities: derive_capabilities(&payload),
            valid_from: None,
            valid_until: None,
            context_binding: None,
            product_id,
            environment,
            metadata: Map::new(),
            signature: None,
            attestation: None,
            reason: Some(reason.into()),
            issued_at: now,
            last_verified_at: 0,
            synthetic: true,
        }
    }

    /// A state carried over from `prior` after a failed revalidation.
    ///
    /// Grace holds while `prior` allowed operation and its last verification
    /// is under 72 hours old; otherwise the result is restricted.
    #[must_use]
    pub(crate) fn grace_from(prior: &Self, now: i64) -> Self {
        let within_window = now - prior.last_verified_at < OFFLINE_GRACE_SECS;
        let status = if prior.allows_operation() && within_window {
            EntitlementStatus::Grace
        } else {
            EntitlementStatus::Restricted
        };

        Self {
            status,
            capabilities: prior.capabilities.clone(),
            valid_from: prior.valid_from,
            valid_until: prior.valid_until,
            context_binding: prior.context_binding.clone(),
            product_id: prior.product_id.clone(),
            environment: prior.environment.clone(),
            metadata: prior.metadata.clone(),
            signature: None,
            attestation: None,
            reason: Some("revalidation failed".to_string()),
            issued_at: now,
            last_verified_at: prior.last_verified_at,
            synthetic: true,
        }
    }

    // ── Status ───────────────────────────────────────────────────

    /// Returns the evaluated status.
    #[must_use]
    pub fn state(&self) -> EntitlementStatus {
        self.status
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == EntitlementStatus::Active
    }

    #[must_use]
    pub fn is_grace(&self) -> bool {
        self.status == EntitlementStatus::Grace
    }

    #[must_use]
    pub fn is_restricted(&self) -> bool {
        self.status == EntitlementStatus::Restricted
    }

    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.status == EntitlementStatus::Invalid
    }

    /// Returns true if software may keep operating (Active or Grace).
    #[must_use]
    pub fn allows_operation(&self) -> bool {
        self.status.allows_operation()
    }

    /// Returns true if this state was synthesized without a fresh response.
    #[must_use]
    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    /// Why a synthetic state was produced.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    // ── Capabilities ─────────────────────────────────────────────

    /// Returns all capabilities.
    #[must_use]
    pub fn capabilities(&self) -> &BTreeMap<String, Capability> {
        &self.capabilities
    }

    /// Returns a single capability.
    #[must_use]
    pub fn capability(&self, name: &str) -> Option<&Capability> {
        self.capabilities.get(name)
    }

    /// Returns true if `name` is present and granted.
    #[must_use]
    pub fn has_capability(&self, name: &str) -> bool {
        self.capability(name).is_some_and(Capability::is_granted)
    }

    /// Returns a numeric capability such as `max_activations`.
    #[must_use]
    pub fn limit(&self, name: &str) -> Option<i64> {
        self.capability(name).and_then(Capability::as_i64)
    }

    /// Fails unless `name` is granted.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::MissingCapability`] naming the capability and
    /// the current state.
    pub fn require_capability(&self, name: &str) -> LicenseResult<()> {
        if self.has_capability(name) {
            Ok(())
        } else {
            Err(LicenseError::MissingCapability {
                capability: name.to_string(),
                state: self.status,
            })
        }
    }

    // ── Validity window ──────────────────────────────────────────

    #[must_use]
    pub fn valid_from(&self) -> Option<i64> {
        self.valid_from
    }

    #[must_use]
    pub fn valid_until(&self) -> Option<i64> {
        self.valid_until
    }

    /// Returns true if the license has no end date.
    #[must_use]
    pub fn is_lifetime(&self) -> bool {
        self.valid_until.is_none()
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now())
    }

    #[must_use]
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.valid_until.is_some_and(|until| now > until)
    }

    /// Whole days until `valid_until`, clamped at zero. `None` for lifetime.
    #[must_use]
    pub fn days_until_expiration(&self) -> Option<i64> {
        self.days_until_expiration_at(now())
    }

    #[must_use]
    pub fn days_until_expiration_at(&self, now: i64) -> Option<i64> {
        self.valid_until
            .map(|until| ((until - now) / DAY_SECS).max(0))
    }

    /// Whole days left in the current grace window, if in grace.
    #[must_use]
    pub fn grace_days_remaining(&self) -> Option<i64> {
        self.grace_days_remaining_at(now())
    }

    #[must_use]
    pub fn grace_days_remaining_at(&self, now: i64) -> Option<i64> {
        if !self.is_grace() {
            return None;
        }
        let ends_at = match self.valid_until {
            Some(until) if now > until => until + EXPIRY_GRACE_SECS,
            _ => self.last_verified_at + OFFLINE_GRACE_SECS,
        };
        Some(((ends_at - now) / DAY_SECS).max(0))
    }

    // ── Verification bookkeeping ─────────────────────────────────

    #[must_use]
    pub fn issued_at(&self) -> i64 {
        self.issued_at
    }

    #[must_use]
    pub fn last_verified_at(&self) -> i64 {
        self.last_verified_at
    }

    /// Returns true if the last verification is older than `interval_secs`.
    #[must_use]
    pub fn needs_revalidation(&self, interval_secs: i64) -> bool {
        self.needs_revalidation_at(interval_secs, now())
    }

    #[must_use]
    pub fn needs_revalidation_at(&self, interval_secs: i64, now: i64) -> bool {
        now - self.last_verified_at > interval_secs
    }

    #[must_use]
    pub fn context_binding(&self) -> Option<&str> {
        self.context_binding.as_deref()
    }

    /// Returns true if `context` hashes to the bound identity, or if the
    /// state is not bound at all.
    #[must_use]
    pub fn verify_context_binding(&self, context: &str) -> bool {
        match &self.context_binding {
            None => true,
            Some(bound) => context_binding_hash(context) == *bound,
        }
    }

    #[must_use]
    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    #[must_use]
    pub fn attestation(&self) -> Option<&Attestation> {
        self.attestation.as_ref()
    }

    // ── Pass-through ─────────────────────────────────────────────

    #[must_use]
    pub fn product_id(&self) -> Option<&str> {
        self.product_id.as_deref()
    }

    #[must_use]
    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    #[must_use]
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    // ── Serialization ────────────────────────────────────────────

    /// Returns the plain, serializable form of this state.
    #[must_use]
    pub fn to_record(&self) -> StateRecord {
        StateRecord {
            state: self.status,
            capabilities: self.capabilities.clone(),
            valid_from: self.valid_from,
            valid_until: self.valid_until,
            context_binding: self.context_binding.clone(),
            product_id: self.product_id.clone(),
            environment: self.environment.clone(),
            metadata: self.metadata.clone(),
            signature: self.signature.clone(),
            attestation: self.attestation.clone(),
            reason: self.reason.clone(),
            issued_at: self.issued_at,
            last_verified_at: self.last_verified_at,
            synthetic: self.synthetic,
        }
    }

    /// Serializes [`EntitlementState::to_record`] as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> LicenseResult<String> {
        Ok(serde_json::to_string(&self.to_record())?)
    }
}

/// Plain serialized form of an [`EntitlementState`].
///
/// Derived fields (`state`, `capabilities`, window, binding) are output
/// only; a cached record is rebuilt from its attestation, never from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub state: EntitlementStatus,
    pub capabilities: BTreeMap<String, Capability>,
    pub valid_from: Option<i64>,
    pub valid_until: Option<i64>,
    pub context_binding: Option<String>,
    pub product_id: Option<String>,
    pub environment: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub signature: Option<String>,
    #[serde(default)]
    pub attestation: Option<Attestation>,
    #[serde(default)]
    pub reason: Option<String>,
    pub issued_at: i64,
    pub last_verified_at: i64,
    #[serde(default)]
    pub synthetic: bool,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

use licensegate_license::{
    determine_state, Capability, EntitlementPayload, EntitlementState, EntitlementStatus,
    LicenseError, UnsignaledPolicy, DAY_SECS, HOUR_SECS,
};
use licensegate_crypto::context_binding_hash;
use serde_json::{json, Map, Value};

const NOW: i64 = 1_800_000_000;

fn payload() -> EntitlementPayload {
    EntitlementPayload::default()
}

fn state_of(payload: EntitlementPayload) -> EntitlementStatus {
    determine_state(&payload, NOW, UnsignaledPolicy::Active)
}

fn object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

// ── determine_state ──────────────────────────────────────────────

#[test]
fn revoked_forces_invalid_regardless_of_window() {
    for status in ["revoked", "suspended", "cancelled"] {
        let p = EntitlementPayload {
            status: Some(status.into()),
            valid: Some(true),
            valid_from: Some(NOW - DAY_SECS),
            valid_until: Some(NOW + 30 * DAY_SECS),
            ..payload()
        };
        assert_eq!(state_of(p), EntitlementStatus::Invalid, "{status}");
    }
}

#[test]
fn not_yet_valid_is_restricted() {
    let p = EntitlementPayload {
        valid: Some(true),
        valid_from: Some(NOW + 1),
        ..payload()
    };
    assert_eq!(state_of(p), EntitlementStatus::Restricted);
}

#[test]
fn expired_three_days_is_grace() {
    let p = EntitlementPayload {
        valid: Some(true),
        valid_until: Some(NOW - 3 * DAY_SECS),
        ..payload()
    };
    assert_eq!(state_of(p), EntitlementStatus::Grace);
}

#[test]
fn expired_eight_days_is_restricted() {
    let p = EntitlementPayload {
        valid: Some(true),
        valid_until: Some(NOW - 8 * DAY_SECS),
        ..payload()
    };
    assert_eq!(state_of(p), EntitlementStatus::Restricted);
}

#[test]
fn not_yet_expired_falls_through_to_valid() {
    let active = EntitlementPayload {
        valid: Some(true),
        valid_until: Some(NOW + DAY_SECS),
        ..payload()
    };
    assert_eq!(state_of(active), EntitlementStatus::Active);

    let revalidation_failed = EntitlementPayload {
        valid_until: Some(NOW + DAY_SECS),
        revalidation_failed: true,
        last_verified_at: Some(NOW - HOUR_SECS),
        ..payload()
    };
    assert_eq!(state_of(revalidation_failed), EntitlementStatus::Grace);
}

#[test]
fn failed_revalidation_grace_is_bounded() {
    let recent = EntitlementPayload {
        revalidation_failed: true,
        last_verified_at: Some(NOW - 71 * HOUR_SECS),
        ..payload()
    };
    assert_eq!(state_of(recent), EntitlementStatus::Grace);

    let stale = EntitlementPayload {
        revalidation_failed: true,
        last_verified_at: Some(NOW - 73 * HOUR_SECS),
        ..payload()
    };
    assert_eq!(
        determine_state(&stale, NOW, UnsignaledPolicy::Restricted),
        EntitlementStatus::Restricted
    );
}

#[test]
fn no_signal_follows_policy() {
    assert_eq!(state_of(payload()), EntitlementStatus::Active);
    assert_eq!(
        determine_state(&payload(), NOW, UnsignaledPolicy::Restricted),
        EntitlementStatus::Restricted
    );
}

#[test]
fn allows_operation_only_active_and_grace() {
    assert!(EntitlementStatus::Active.allows_operation());
    assert!(EntitlementStatus::Grace.allows_operation());
    assert!(!EntitlementStatus::Restricted.allows_operation());
    assert!(!EntitlementStatus::Invalid.allows_operation());
}

#[test]
fn status_serde() {
    assert_eq!(
        serde_json::to_string(&EntitlementStatus::Grace).unwrap(),
        r#""grace""#
    );
    let parsed: EntitlementStatus = serde_json::from_str(r#""invalid""#).unwrap();
    assert_eq!(parsed, EntitlementStatus::Invalid);
}

// ── Capabilities ─────────────────────────────────────────────────

#[test]
fn capabilities_merge_and_force() {
    let state = EntitlementState::from_payload(
        EntitlementPayload {
            valid: Some(true),
            status: Some("active".into()),
            features: object(json!({"pro": false, "export": true, "telemetry": false})),
            license_features: object(json!({"pro": true})),
            max_activations: Some(5),
            current_activations: Some(2),
            ..payload()
        },
        NOW,
    );

    assert!(state.has_capability("pro"));
    assert!(state.has_capability("export"));
    assert!(state.has_capability("updates"));
    assert!(state.has_capability("downloads"));
    assert!(!state.has_capability("telemetry"));
    assert_eq!(state.limit("max_activations"), Some(5));
    assert_eq!(state.limit("current_activations"), Some(2));
    assert!(!state.has_capability("missing"));
}

#[test]
fn invalid_license_withholds_updates_and_downloads() {
    let state = EntitlementState::from_payload(
        EntitlementPayload {
            valid: Some(false),
            status: Some("expired".into()),
            ..payload()
        },
        NOW,
    );
    assert_eq!(state.capability("updates"), Some(&Capability::Flag(false)));
    assert_eq!(state.capability("downloads"), Some(&Capability::Flag(false)));
    assert_eq!(state.capability("telemetry"), Some(&Capability::Flag(true)));
}

#[test]
fn assigned_status_grants_downloads() {
    let state = EntitlementState::from_payload(
        EntitlementPayload {
            status: Some("assigned".into()),
            ..payload()
        },
        NOW,
    );
    assert!(state.has_capability("downloads"));
}

#[test]
fn require_capability_reports_state() {
    let state = EntitlementState::from_payload(
        EntitlementPayload {
            valid: Some(true),
            ..payload()
        },
        NOW,
    );
    assert!(state.require_capability("updates").is_ok());
    match state.require_capability("sso") {
        Err(LicenseError::MissingCapability { capability, state }) => {
            assert_eq!(capability, "sso");
            assert_eq!(state, EntitlementStatus::Active);
        }
        other => panic!("expected MissingCapability, got {other:?}"),
    }
}

// ── Window and bookkeeping ───────────────────────────────────────

#[test]
fn days_until_expiration() {
    let state = EntitlementState::from_payload(
        EntitlementPayload {
            valid: Some(true),
            valid_until: Some(NOW + 30 * DAY_SECS),
            ..payload()
        },
        NOW,
    );
    assert_eq!(state.days_until_expiration_at(NOW), Some(30));
    assert_eq!(state.days_until_expiration_at(NOW + 31 * DAY_SECS), Some(0));
    assert!(!state.is_expired_at(NOW));
    assert!(state.is_expired_at(NOW + 31 * DAY_SECS));
    assert!(!state.is_lifetime());
}

#[test]
fn lifetime_license_has_no_expiry() {
    let state = EntitlementState::from_payload(
        EntitlementPayload {
            valid: Some(true),
            ..payload()
        },
        NOW,
    );
    assert!(state.is_lifetime());
    assert_eq!(state.days_until_expiration_at(NOW), None);
    assert!(!state.is_expired());
}

#[test]
fn grace_days_remaining_after_expiry() {
    let state = EntitlementState::from_payload(
        EntitlementPayload {
            valid_until: Some(NOW - 2 * DAY_SECS),
            ..payload()
        },
        NOW,
    );
    assert!(state.is_grace());
    assert_eq!(state.grace_days_remaining_at(NOW), Some(5));
}

#[test]
fn needs_revalidation_after_interval() {
    let state = EntitlementState::from_payload(
        EntitlementPayload {
            valid: Some(true),
            last_verified_at: Some(NOW),
            ..payload()
        },
        NOW,
    );
    assert!(!state.needs_revalidation_at(HOUR_SECS, NOW + HOUR_SECS));
    assert!(state.needs_revalidation_at(HOUR_SECS, NOW + HOUR_SECS + 1));
}

#[test]
fn context_binding_checks_hash() {
    let bound = EntitlementState::from_payload(
        EntitlementPayload {
            context_binding: Some(context_binding_hash("hw-1")),
            ..payload()
        },
        NOW,
    );
    assert!(bound.verify_context_binding("hw-1"));
    assert!(!bound.verify_context_binding("hw-2"));

    let unbound = EntitlementState::from_payload(payload(), NOW);
    assert!(unbound.verify_context_binding("anything"));
}

#[test]
fn defaults_bookkeeping_to_evaluation_time() {
    let state = EntitlementState::from_payload(payload(), NOW);
    assert_eq!(state.issued_at(), NOW);
    assert_eq!(state.last_verified_at(), NOW);
    assert!(!state.is_synthetic());
}

// ── Serialization ────────────────────────────────────────────────

#[test]
fn record_layout() {
    let state = EntitlementState::from_payload(
        EntitlementPayload {
            valid: Some(true),
            valid_until: Some(NOW + DAY_SECS),
            product_id: Some("prod-1".into()),
            environment: Some("test".into()),
            metadata: object(json!({"customer": "acme"})),
            ..payload()
        },
        NOW,
    );
    let json: Value = serde_json::from_str(&state.to_json().unwrap()).unwrap();
    for field in [
        "state",
        "capabilities",
        "valid_from",
        "valid_until",
        "context_binding",
        "product_id",
        "environment",
        "metadata",
        "signature",
        "issued_at",
        "last_verified_at",
    ] {
        assert!(json.get(field).is_some(), "missing {field}");
    }
    assert_eq!(json["state"], "active");
    assert_eq!(json["capabilities"]["updates"], true);
    assert_eq!(json["metadata"]["customer"], "acme");
}

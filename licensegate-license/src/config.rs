//! Runtime configuration for entitlement resolution.
//!
//! Loading this from files or the environment is left to the host
//! application; everything here has a usable default.

use crate::state::UnsignaledPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Seconds in an hour.
pub const HOUR_SECS: i64 = 60 * 60;

/// Seconds in a day.
pub const DAY_SECS: i64 = 24 * HOUR_SECS;

/// Window after `valid_until` during which a license still operates (7 days).
pub const EXPIRY_GRACE_SECS: i64 = 7 * DAY_SECS;

/// Window after the last successful verification during which a failed
/// revalidation still operates (72 hours).
pub const OFFLINE_GRACE_SECS: i64 = 72 * HOUR_SECS;

/// Configuration for [`EntitlementManager`](crate::EntitlementManager) and
/// its collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntitlementConfig {
    /// Product the license is checked against.
    pub product_id: String,
    /// Deployment environment (e.g. `production`, `staging`).
    pub environment: String,
    /// Base URL of the license server.
    pub base_url: String,
    /// How long a cached state may be served at all.
    pub cache_ttl_secs: i64,
    /// Age after which a cached state is revalidated before use.
    pub revalidation_interval_secs: i64,
    /// Per-attempt network timeout.
    pub timeout_secs: u64,
    /// Total attempts for one network call (including the first).
    pub retry_attempts: u32,
    /// Initial backoff between attempts.
    pub retry_delay_ms: u64,
    /// Upper bound on backoff between attempts.
    pub max_retry_delay_ms: u64,
    /// Wait used on 429 when the server sends no `Retry-After`.
    pub rate_limit_retry_after_secs: u64,
    /// Longest `Retry-After` honored; larger values are clamped.
    pub max_retry_after_secs: u64,
    /// Outcome for payloads that no other rule classifies (see
    /// [`determine_state`](crate::determine_state)).
    pub unsignaled_policy: UnsignaledPolicy,
    /// Refuse to build a manager without a pinned public key.
    pub require_signatures: bool,
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        Self {
            product_id: String::new(),
            environment: "production".to_string(),
            base_url: "https://license.example.com".to_string(),
            cache_ttl_secs: 7 * DAY_SECS,
            revalidation_interval_secs: DAY_SECS,
            timeout_secs: 10,
            retry_attempts: 3,
            retry_delay_ms: 500,
            max_retry_delay_ms: 8_000,
            rate_limit_retry_after_secs: 60,
            max_retry_after_secs: 300,
            unsignaled_policy: UnsignaledPolicy::Active,
            require_signatures: false,
        }
    }
}

impl EntitlementConfig {
    /// Per-attempt timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

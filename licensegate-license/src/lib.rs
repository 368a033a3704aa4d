//! Entitlement resolution for licensegate.
//!
//! This module handles:
//! - Verifying signed license-server responses before reading them
//! - Classifying licenses as active, grace, restricted or invalid
//! - Deriving the capability set (feature flags and limits)
//! - Caching states so software keeps working offline for a bounded time
//!
//! # Design Principles
//!
//! - **Verify on every read**: a cached state is re-verified against the
//!   pinned key each time it is loaded; storage is never trusted
//! - **Bounded offline grace**: 7 days past expiry, 72 hours past the last
//!   successful verification, never indefinitely
//! - **Immutable snapshots**: a state is evaluated once and never mutated
//! - **Verify only**: nothing in this crate can sign
//!
//! # Flow
//!
//! `response → StateResolver (verify, normalize, classify) → EntitlementState
//! → StateStore`, and back through `StateStore::get` (deserialize, re-verify)
//! on later calls. [`EntitlementManager`] ties these to a [`LicenseTransport`].

mod clock;
mod config;
mod error;
#[cfg(feature = "online")]
mod http;
mod manager;
mod resolver;
mod retry;
mod state;
mod store;
mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    EntitlementConfig, DAY_SECS, EXPIRY_GRACE_SECS, HOUR_SECS, OFFLINE_GRACE_SECS,
};
pub use error::{LicenseError, LicenseResult};
pub use manager::{EntitlementManager, EntitlementManagerBuilder, ResolutionContext};
pub use resolver::{parse_epoch, StateResolver};
pub use retry::RetryPolicy;
pub use state::{
    derive_capabilities, determine_state, Attestation, Capability, EntitlementPayload,
    EntitlementState, EntitlementStatus, ResponseKind, StateRecord, UnsignaledPolicy,
    LIMIT_CAPABILITIES,
};
pub use store::{CacheBackend, CacheStats, CachedEntry, FileBackend, MemoryBackend, StateStore};
pub use transport::{LicenseRequest, LicenseTransport};

#[cfg(feature = "online")]
pub use http::HttpTransport;

pub use licensegate_crypto::SignatureVerifier;

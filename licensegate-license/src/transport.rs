//! The network collaborator seam.
//!
//! Transports only move JSON. They never interpret validity or signatures;
//! that is the resolver's job. Errors are classified so the retry policy
//! can tell transport faults from application rejections.

use crate::error::LicenseResult;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Debug;

/// Body sent to every license endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LicenseRequest {
    pub license_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Only set for feature checks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
}

/// Talks to the license server.
///
/// Implementations report connect failures, timeouts and 5xx responses as
/// [`LicenseError::Network`](crate::LicenseError::Network), 429 as
/// [`LicenseError::RateLimited`](crate::LicenseError::RateLimited), and other
/// non-success statuses as [`LicenseError::Rejected`](crate::LicenseError::Rejected).
#[async_trait]
pub trait LicenseTransport: Send + Sync + Debug {
    /// Calls the validation endpoint.
    async fn validate(&self, request: &LicenseRequest) -> LicenseResult<Value>;

    /// Calls the feature-check endpoint.
    async fn check_feature(&self, request: &LicenseRequest) -> LicenseResult<Value>;

    /// Calls the activation endpoint.
    async fn activate(&self, request: &LicenseRequest) -> LicenseResult<Value>;
}

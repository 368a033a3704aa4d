//! HTTP transport backed by reqwest.

use crate::config::EntitlementConfig;
use crate::error::{LicenseError, LicenseResult};
use crate::transport::{LicenseRequest, LicenseTransport};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;

const VALIDATE_PATH: &str = "/v1/licenses/validate";
const FEATURES_PATH: &str = "/v1/licenses/features";
const ACTIVATE_PATH: &str = "/v1/licenses/activate";

/// Posts license requests as JSON to the configured server.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    default_retry_after_secs: u64,
}

impl HttpTransport {
    /// Creates a transport with the configured per-attempt timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is empty or the client cannot be built.
    pub fn new(config: &EntitlementConfig) -> LicenseResult<Self> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(LicenseError::Validation("license server URL is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| LicenseError::Network(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            default_retry_after_secs: config.rate_limit_retry_after_secs,
        })
    }

    async fn post(&self, path: &str, request: &LicenseRequest) -> LicenseResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "posting license request");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| LicenseError::Network(format!("request to {path} failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(self.default_retry_after_secs);
            return Err(LicenseError::RateLimited { retry_after_secs });
        }
        if status.is_server_error() {
            return Err(LicenseError::Network(format!("server error {status} from {path}")));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LicenseError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        response.json::<Value>().await.map_err(|e| {
            if e.is_decode() {
                LicenseError::Validation(format!("unparsable response from {path}: {e}"))
            } else {
                LicenseError::Network(format!("reading response from {path} failed: {e}"))
            }
        })
    }
}

#[async_trait]
impl LicenseTransport for HttpTransport {
    async fn validate(&self, request: &LicenseRequest) -> LicenseResult<Value> {
        self.post(VALIDATE_PATH, request).await
    }

    async fn check_feature(&self, request: &LicenseRequest) -> LicenseResult<Value> {
        self.post(FEATURES_PATH, request).await
    }

    async fn activate(&self, request: &LicenseRequest) -> LicenseResult<Value> {
        self.post(ACTIVATE_PATH, request).await
    }
}

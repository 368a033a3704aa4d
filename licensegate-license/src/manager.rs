//! Cache-first entitlement resolution with bounded offline grace.
//!
//! [`EntitlementManager::resolve`] serves a fresh cached state when it has
//! one, revalidates with the server otherwise, and falls back to a grace
//! state derived from the cached snapshot only when the server is
//! unreachable and the snapshot was verified less than 72 hours ago.

use crate::clock::{Clock, SystemClock};
use crate::config::EntitlementConfig;
use crate::error::{LicenseError, LicenseResult};
use crate::resolver::StateResolver;
use crate::retry::RetryPolicy;
use crate::state::EntitlementState;
use crate::store::{CacheBackend, MemoryBackend, StateStore};
use crate::transport::{LicenseRequest, LicenseTransport};
use licensegate_crypto::SignatureVerifier;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Identity of the machine or site asking for an entitlement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionContext {
    /// Hardware fingerprint of this machine.
    pub hardware_id: Option<String>,
    /// Domain the software is serving.
    pub domain: Option<String>,
}

impl ResolutionContext {
    #[must_use]
    pub fn hardware(id: impl Into<String>) -> Self {
        Self {
            hardware_id: Some(id.into()),
            domain: None,
        }
    }

    #[must_use]
    pub fn domain(domain: impl Into<String>) -> Self {
        Self {
            hardware_id: None,
            domain: Some(domain.into()),
        }
    }

    /// The identity a state binding is checked against.
    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        self.hardware_id.as_deref().or(self.domain.as_deref())
    }
}

/// Builds an [`EntitlementManager`].
#[derive(Debug)]
pub struct EntitlementManagerBuilder {
    config: EntitlementConfig,
    verifier: Option<SignatureVerifier>,
    transport: Option<Arc<dyn LicenseTransport>>,
    clock: Arc<dyn Clock>,
    backend: Option<Box<dyn CacheBackend>>,
    retry: Option<RetryPolicy>,
}

impl EntitlementManagerBuilder {
    /// Pins the public key responses must be signed with.
    #[must_use]
    pub fn verifier(mut self, verifier: SignatureVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Sets the network collaborator. Required.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn LicenseTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replaces the wall clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the in-memory cache backend.
    #[must_use]
    pub fn backend(mut self, backend: Box<dyn CacheBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Replaces the retry policy derived from the config.
    #[must_use]
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Builds the manager.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::Validation`] if no transport was given, or if
    /// the config requires signatures and no verifier was given.
    pub fn build(self) -> LicenseResult<EntitlementManager> {
        let transport = self
            .transport
            .ok_or_else(|| LicenseError::Validation("no license transport configured".to_string()))?;

        if self.config.require_signatures && self.verifier.is_none() {
            return Err(LicenseError::Validation(
                "signatures are required but no public key is configured".to_string(),
            ));
        }

        let resolver = Arc::new(StateResolver::new(
            &self.config,
            self.verifier.map(Arc::new),
            Arc::clone(&self.clock),
        ));
        let store = StateStore::with_backend(
            self.backend.unwrap_or_else(|| Box::new(MemoryBackend::new())),
            Arc::clone(&resolver),
            Arc::clone(&self.clock),
            self.config.cache_ttl_secs,
        );
        let retry = self
            .retry
            .unwrap_or_else(|| RetryPolicy::from_config(&self.config));

        Ok(EntitlementManager {
            config: self.config,
            resolver,
            store,
            transport,
            retry,
            clock: self.clock,
        })
    }
}

/// Resolves entitlements for license keys.
#[derive(Debug)]
pub struct EntitlementManager {
    config: EntitlementConfig,
    resolver: Arc<StateResolver>,
    store: StateStore,
    transport: Arc<dyn LicenseTransport>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl EntitlementManager {
    /// Starts building a manager for `config`.
    #[must_use]
    pub fn builder(config: EntitlementConfig) -> EntitlementManagerBuilder {
        EntitlementManagerBuilder {
            config,
            verifier: None,
            transport: None,
            clock: Arc::new(SystemClock),
            backend: None,
            retry: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &EntitlementConfig {
        &self.config
    }

    #[must_use]
    pub fn resolver(&self) -> &StateResolver {
        &self.resolver
    }

    #[must_use]
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Cache key for a license under this product and environment.
    #[must_use]
    pub fn cache_key(&self, license_key: &str) -> String {
        format!(
            "{license_key}:{}:{}",
            self.config.product_id, self.config.environment
        )
    }

    /// Resolves the entitlement for `license_key`.
    ///
    /// # Errors
    ///
    /// Returns a validation, signature or network error. Network errors are
    /// only returned when no cached state can carry the caller through a
    /// bounded grace period.
    pub async fn resolve(
        &self,
        license_key: &str,
        context: &ResolutionContext,
    ) -> LicenseResult<EntitlementState> {
        let license_key = checked_key(license_key)?;
        let key = self.cache_key(license_key);
        let now = self.clock.now_secs();

        let cached = match self.store.get(&key) {
            Ok(cached) => cached,
            Err(e) => {
                warn!(error = %e, "cached entitlement rejected, revalidating");
                None
            }
        };

        let cached = cached.filter(|state| {
            let bound = context
                .identity()
                .is_none_or(|identity| state.verify_context_binding(identity));
            if !bound {
                debug!("cached entitlement bound to another context, revalidating");
            }
            bound
        });

        if let Some(state) = &cached
            && !state.needs_revalidation_at(self.config.revalidation_interval_secs, now)
        {
            debug!(state = %state.state(), "serving cached entitlement");
            return Ok(state.clone());
        }

        let request = self.request(license_key, context, None);
        match self
            .retry
            .run(|| self.transport.validate(&request))
            .await
        {
            Ok(response) => {
                let state = self.resolver.resolve_validation(&response)?;
                self.persist(&key, &state);
                info!(state = %state.state(), "entitlement revalidated");
                Ok(state)
            }
            Err(err) if err.is_retryable() => {
                if let Some(prior) = cached.filter(EntitlementState::allows_operation) {
                    let grace = self.resolver.create_grace_state(&prior);
                    if grace.is_grace() {
                        warn!(error = %err, "license server unreachable, continuing in grace");
                        return Ok(grace);
                    }
                    warn!("offline grace window has elapsed");
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Like [`EntitlementManager::resolve`], but turns any failure into a
    /// restricted state carrying the failure as its reason.
    pub async fn resolve_or_restricted(
        &self,
        license_key: &str,
        context: &ResolutionContext,
    ) -> EntitlementState {
        match self.resolve(license_key, context).await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "entitlement unresolved, restricting");
                self.resolver.create_restricted_state(&e.to_string())
            }
        }
    }

    /// Resolves and insists on `capability`.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::MissingCapability`] if the resolved state
    /// lacks it, or any error from [`EntitlementManager::resolve`].
    pub async fn require_capability(
        &self,
        license_key: &str,
        capability: &str,
        context: &ResolutionContext,
    ) -> LicenseResult<EntitlementState> {
        let state = self.resolve(license_key, context).await?;
        state.require_capability(capability)?;
        Ok(state)
    }

    /// Asks the server about one feature. The result is not cached.
    ///
    /// # Errors
    ///
    /// Returns a validation, signature or network error.
    pub async fn check_feature(
        &self,
        license_key: &str,
        feature: &str,
        context: &ResolutionContext,
    ) -> LicenseResult<EntitlementState> {
        let license_key = checked_key(license_key)?;
        if feature.trim().is_empty() {
            return Err(LicenseError::Validation("feature name is empty".to_string()));
        }

        let request = self.request(license_key, context, Some(feature));
        let response = self
            .retry
            .run(|| self.transport.check_feature(&request))
            .await?;
        self.resolver.resolve_feature_check(&response)
    }

    /// Activates this machine or domain and caches the resulting state.
    ///
    /// # Errors
    ///
    /// Returns a validation, signature or network error.
    pub async fn activate(
        &self,
        license_key: &str,
        context: &ResolutionContext,
    ) -> LicenseResult<EntitlementState> {
        let license_key = checked_key(license_key)?;
        if context.identity().is_none() {
            return Err(LicenseError::Validation(
                "activation needs a hardware id or domain".to_string(),
            ));
        }

        let request = self.request(license_key, context, None);
        let response = self.retry.run(|| self.transport.activate(&request)).await?;
        let state = self.resolver.resolve_activation(&response)?;
        self.persist(&self.cache_key(license_key), &state);
        info!(state = %state.state(), "license activated");
        Ok(state)
    }

    /// Drops the cached state for `license_key` under this product and
    /// environment. Returns the number of entries removed.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::Validation`] for an empty key, or an error if
    /// the cache backend fails.
    pub fn invalidate(&self, license_key: &str) -> LicenseResult<usize> {
        let license_key = checked_key(license_key)?;
        let removed = self.store.delete(&self.cache_key(license_key))?;
        debug!(removed, "invalidated cached entitlement");
        Ok(usize::from(removed))
    }

    fn request(
        &self,
        license_key: &str,
        context: &ResolutionContext,
        feature: Option<&str>,
    ) -> LicenseRequest {
        LicenseRequest {
            license_key: license_key.to_string(),
            product_id: (!self.config.product_id.is_empty()).then(|| self.config.product_id.clone()),
            environment: (!self.config.environment.is_empty())
                .then(|| self.config.environment.clone()),
            hardware_id: context.hardware_id.clone(),
            domain: context.domain.clone(),
            feature: feature.map(str::to_string),
        }
    }

    /// Caching is best effort; a failed write never fails a resolution.
    fn persist(&self, key: &str, state: &EntitlementState) {
        if let Err(e) = self.store.set(key, state, None) {
            warn!(error = %e, "failed to cache entitlement");
        }
    }
}

fn checked_key(license_key: &str) -> LicenseResult<&str> {
    let trimmed = license_key.trim();
    if trimmed.is_empty() {
        return Err(LicenseError::Validation("license key is empty".to_string()));
    }
    Ok(trimmed)
}

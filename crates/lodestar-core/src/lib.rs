//! Lodestar Core: Nebula certificate issuance gated by delegated auth.
//!
//! Four components do the work: [`credential::CredentialValidator`]
//! authenticates callers against the delegate service with caching and
//! rate limiting, [`allocation::AddressAllocator`] picks overlay
//! addresses, [`ca::CertificateAuthority`] signs node certificates and
//! renders their configs, and [`revocation::RevocationRegistry`] revokes
//! certificates and publishes the revocation list. [`LodestarCore`] wires
//! them together and exposes the HTTP routes.

pub mod allocation;
pub mod ca;
pub mod config;
pub mod credential;
pub mod delegate;
pub mod error;
pub mod health;
pub mod http;
pub mod issuance;
pub mod protocol;
pub mod ratelimit;
pub mod records;
pub mod render;
pub mod revocation;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

pub use error::LodestarError;

use allocation::AddressAllocator;
use ca::CertificateAuthority;
use config::LodestarConfig;
use credential::CredentialValidator;
use delegate::DelegateAuthenticator;
use issuance::{InfrastructureRequest, IssuedNode, LeafRequest};
use protocol::HealthResponse;
use ratelimit::RateLimiter;
use records::{CertificateRecord, Identity, NodeClass, RevocationEntry};
use revocation::RevocationRegistry;
use store::{CertificateStore, CredentialStore};

// ── Internal shared state ───────────────────────────────────────────

/// Shared state behind the facade and the HTTP handlers.
pub(crate) struct LodestarState {
    pub(crate) validator: CredentialValidator,
    pub(crate) allocator: AddressAllocator,
    pub(crate) ca: CertificateAuthority,
    pub(crate) registry: RevocationRegistry,
    pub(crate) certificates: Arc<dyn CertificateStore>,
    pub(crate) delegate: Arc<dyn DelegateAuthenticator>,
    pub(crate) store_timeout: Duration,
}

// ── LodestarCore facade ────────────────────────────────────────────

/// The domain facade handed to the binary crate.
#[derive(Clone)]
pub struct LodestarCore {
    state: Arc<LodestarState>,
}

impl LodestarCore {
    /// Assemble the core from validated configuration and its collaborators.
    pub fn new(
        config: &LodestarConfig,
        ca: CertificateAuthority,
        certificates: Arc<dyn CertificateStore>,
        credentials: Arc<dyn CredentialStore>,
        delegate: Arc<dyn DelegateAuthenticator>,
    ) -> Result<Self, LodestarError> {
        config.validate()?;
        if ca.settings().prefix_len != config.address_plan.prefix_len() {
            return Err(LodestarError::Config(format!(
                "CA issues /{} addresses but the address plan is {}",
                ca.settings().prefix_len,
                config.address_plan.network()
            )));
        }

        let validator = CredentialValidator::new(
            credentials,
            Arc::clone(&delegate),
            RateLimiter::new(config.rate_limit),
            config.credential_cache_ttl,
            config.store_timeout,
        );
        let allocator = AddressAllocator::new(
            config.address_plan.clone(),
            Arc::clone(&certificates),
            config.store_timeout,
        );
        let registry = RevocationRegistry::new(
            Arc::clone(&certificates),
            config.crl_cache_ttl,
            config.store_timeout,
        );

        Ok(Self {
            state: Arc::new(LodestarState {
                validator,
                allocator,
                ca,
                registry,
                certificates,
                delegate,
                store_timeout: config.store_timeout,
            }),
        })
    }

    /// Authenticate an `Authorization` header and apply the rate limit.
    pub async fn authenticate(&self, authorization: Option<&str>) -> Result<Identity, LodestarError> {
        self.state.validator.authenticate(authorization).await
    }

    pub async fn issue_leaf(
        &self,
        identity: &Identity,
        request: LeafRequest,
    ) -> Result<IssuedNode, LodestarError> {
        self.state.issue_leaf(identity, request).await
    }

    /// Issue an EC2 certificate. Requires an elevated role.
    pub async fn issue_infrastructure(
        &self,
        identity: &Identity,
        request: InfrastructureRequest,
    ) -> Result<IssuedNode, LodestarError> {
        self.state.issue_infrastructure(identity, request).await
    }

    pub async fn list_certificates(
        &self,
        identity: &Identity,
        node_class: Option<NodeClass>,
        limit: Option<usize>,
    ) -> Result<Vec<CertificateRecord>, LodestarError> {
        self.state
            .list_certificates(identity, node_class, limit)
            .await
    }

    pub async fn revoke(
        &self,
        identity: &Identity,
        node_name: &str,
        reason: &str,
    ) -> Result<DateTime<Utc>, LodestarError> {
        self.state
            .registry
            .revoke(&identity.owner, node_name, reason)
            .await
    }

    pub async fn revocation_list(&self) -> Result<Arc<[RevocationEntry]>, LodestarError> {
        self.state.registry.list_revoked().await
    }

    pub async fn health(&self) -> HealthResponse {
        health::check(&self.state.certificates, &self.state.delegate).await
    }

    pub fn ca_certificate_pem(&self) -> &str {
        self.state.ca.certificate_pem()
    }

    /// Build the router with all Lodestar routes.
    pub fn routes(&self) -> Router {
        http::routes(Arc::clone(&self.state))
    }

    /// Periodically purge expired credential cache entries until cancelled.
    pub fn spawn_cache_sweeper(
        &self,
        every: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Credential cache sweeper stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        match state.validator.sweep().await {
                            Ok(0) => {}
                            Ok(removed) => {
                                tracing::info!(removed, "Expired credentials purged");
                            }
                            Err(e) => tracing::warn!(error = %e, "Credential cache sweep failed"),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LodestarState>();
        assert_send_sync::<LodestarCore>();
    }
}

//! Bearer credential validation.
//!
//! Tokens are validated by the delegate service and the result is cached
//! under the token's SHA-256 digest. When the delegate is unreachable or
//! misbehaving, the cache is consulted once more with the same freshness
//! condition; with no live entry the request fails closed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lodestar_crypto::digest::sha256_hex;

use crate::delegate::{DelegateAuthenticator, DelegateError};
use crate::error::LodestarError;
use crate::ratelimit::RateLimiter;
use crate::records::{CachedCredential, Identity};
use crate::store::{bounded, CredentialStore};

/// Roles allowed to issue infrastructure certificates.
pub const ELEVATED_ROLES: &[&str] = &["admin", "devops"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid(Identity),
    Invalid,
}

pub struct CredentialValidator {
    store: Arc<dyn CredentialStore>,
    delegate: Arc<dyn DelegateAuthenticator>,
    limiter: RateLimiter,
    cache_ttl: Duration,
    store_timeout: Duration,
}

impl CredentialValidator {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        delegate: Arc<dyn DelegateAuthenticator>,
        limiter: RateLimiter,
        cache_ttl: Duration,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            delegate,
            limiter,
            cache_ttl,
            store_timeout,
        }
    }

    /// Three non-empty dot-separated segments after trimming.
    pub fn is_well_formed(token: &str) -> bool {
        let token = token.trim();
        let mut segments = 0;
        for part in token.split('.') {
            if part.is_empty() {
                return false;
            }
            segments += 1;
        }
        segments == 3
    }

    /// Validate a raw bearer token.
    ///
    /// Fails with [`LodestarError::Upstream`] only when the delegate call
    /// failed and no live cache entry exists.
    pub async fn validate(&self, token: &str) -> Result<Validation, LodestarError> {
        if !Self::is_well_formed(token) {
            return Ok(Validation::Invalid);
        }
        let token = token.trim();
        let digest = sha256_hex(token.as_bytes());

        if let Some(identity) = self.cached(&digest).await {
            tracing::debug!(owner = %identity.owner, "Credential served from cache");
            return Ok(Validation::Valid(identity));
        }

        let resolved = self
            .delegate
            .validate(token)
            .await
            .map_err(|e| match e {
                DelegateError::Rejected(status) => LodestarError::UpstreamRejected(status),
                other => LodestarError::Upstream(other.to_string()),
            });

        match resolved {
            Ok(delegated) => {
                let identity = Identity {
                    owner: delegated.user_id,
                    groups: delegated.roles,
                };
                self.remember(digest, &identity).await;
                Ok(Validation::Valid(identity))
            }
            Err(LodestarError::UpstreamRejected(status)) => {
                tracing::debug!(status, "Delegate rejected credential");
                Ok(Validation::Invalid)
            }
            Err(e) => {
                if let Some(identity) = self.cached(&digest).await {
                    tracing::warn!(
                        error = %e,
                        owner = %identity.owner,
                        "Delegate unavailable, using cached credential"
                    );
                    return Ok(Validation::Valid(identity));
                }
                tracing::warn!(error = %e, "Delegate unavailable and no cached credential");
                Err(e)
            }
        }
    }

    /// Authenticate an `Authorization` header value and apply the
    /// per-owner rate limit.
    pub async fn authenticate(&self, authorization: Option<&str>) -> Result<Identity, LodestarError> {
        let header = authorization
            .ok_or_else(|| LodestarError::Authentication("missing authorization header".into()))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| LodestarError::Authentication("invalid authorization format".into()))?;

        let identity = match self.validate(token).await? {
            Validation::Valid(identity) => identity,
            Validation::Invalid => {
                return Err(LodestarError::Authentication(
                    "invalid or expired token".into(),
                ))
            }
        };

        self.limiter.check(&identity.owner).map_err(|limited| {
            tracing::info!(owner = %identity.owner, "Rate limit exceeded");
            LodestarError::RateLimited {
                limit: limited.limit,
                retry_after_secs: limited.retry_after.as_secs(),
            }
        })?;
        Ok(identity)
    }

    /// Require membership in one of `roles`, compared case-insensitively.
    pub fn require_role(identity: &Identity, roles: &[&str]) -> Result<(), LodestarError> {
        if identity.has_any_role(roles) {
            return Ok(());
        }
        tracing::info!(owner = %identity.owner, required = ?roles, "Role check failed");
        Err(LodestarError::Authorization(roles.join(", ")))
    }

    /// Purge expired cache entries and ended rate-limit windows.
    pub async fn sweep(&self) -> Result<usize, LodestarError> {
        let removed = bounded(self.store_timeout, self.store.sweep_expired(Utc::now())).await?;
        let windows = self.limiter.prune();
        tracing::debug!(credentials = removed, windows, "Credential cache swept");
        Ok(removed)
    }

    async fn cached(&self, digest: &str) -> Option<Identity> {
        match bounded(self.store_timeout, self.store.lookup(digest, Utc::now())).await {
            Ok(entry) => entry.map(Identity::from),
            Err(e) => {
                tracing::warn!(error = %e, "Credential cache lookup failed");
                None
            }
        }
    }

    async fn remember(&self, digest: String, identity: &Identity) {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.cache_ttl).unwrap_or(chrono::Duration::zero());
        let entry = CachedCredential {
            digest,
            owner: identity.owner.clone(),
            groups: identity.groups.clone(),
            cached_at: now,
            expires_at: now + ttl,
        };
        if let Err(e) = bounded(self.store_timeout, self.store.upsert(entry)).await {
            tracing::warn!(error = %e, owner = %identity.owner, "Failed to cache credential");
        }
    }
}

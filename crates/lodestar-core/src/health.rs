//! Dependency health checks.

use std::sync::Arc;
use std::time::Duration;

use crate::delegate::DelegateAuthenticator;
use crate::protocol::HealthResponse;
use crate::store::CertificateStore;

const CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Check the store and the delegate concurrently, two seconds each.
pub async fn check(
    store: &Arc<dyn CertificateStore>,
    delegate: &Arc<dyn DelegateAuthenticator>,
) -> HealthResponse {
    let (db, auth) = tokio::join!(
        tokio::time::timeout(CHECK_TIMEOUT, store.ping()),
        tokio::time::timeout(CHECK_TIMEOUT, delegate.health()),
    );

    let db_ok = matches!(db, Ok(Ok(())));
    let auth_ok = matches!(auth, Ok(Ok(())));
    if !db_ok {
        tracing::warn!("Health check: store unavailable");
    }
    if !auth_ok {
        tracing::warn!("Health check: authentication service unreachable");
    }

    HealthResponse {
        status: if db_ok && auth_ok { "healthy" } else { "degraded" }.to_string(),
        database: if db_ok { "connected" } else { "disconnected" }.to_string(),
        auth_backend: if auth_ok { "reachable" } else { "unreachable" }.to_string(),
    }
}

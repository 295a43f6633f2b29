//! Client for the delegate authentication service.
//!
//! The delegate owns user identity. Lodestar forwards the bearer token to
//! its validate endpoint and reads back the user id and roles.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::DelegateConfig;

/// Health checks get a tighter budget than validation calls.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum DelegateError {
    /// The delegate deliberately refused the credential (401/403).
    #[error("credential rejected (HTTP {0})")]
    Rejected(u16),

    #[error("unexpected HTTP {0}")]
    Status(u16),

    #[error("request failed: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Identity as reported by the delegate.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateIdentity {
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[async_trait]
pub trait DelegateAuthenticator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<DelegateIdentity, DelegateError>;

    /// Reachability check. Only server-side failures count as unhealthy.
    async fn health(&self) -> Result<(), DelegateError>;
}

/// [`DelegateAuthenticator`] over HTTP.
pub struct HttpDelegate {
    client: reqwest::Client,
    validate_url: String,
    health_url: String,
}

impl HttpDelegate {
    pub fn new(config: &DelegateConfig) -> Result<Self, DelegateError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DelegateError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            validate_url: config.validate_url(),
            health_url: config.health_url(),
        })
    }
}

#[async_trait]
impl DelegateAuthenticator for HttpDelegate {
    async fn validate(&self, token: &str) -> Result<DelegateIdentity, DelegateError> {
        let resp = self
            .client
            .get(&self.validate_url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| DelegateError::Transport(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(DelegateError::Rejected(status.as_u16()));
        }
        if status != reqwest::StatusCode::OK {
            return Err(DelegateError::Status(status.as_u16()));
        }

        let identity: DelegateIdentity = resp
            .json()
            .await
            .map_err(|e| DelegateError::Malformed(e.to_string()))?;
        if identity.user_id.is_empty() {
            return Err(DelegateError::Malformed("empty userId".to_string()));
        }
        Ok(identity)
    }

    async fn health(&self) -> Result<(), DelegateError> {
        let resp = self
            .client
            .get(&self.health_url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|e| DelegateError::Transport(e.to_string()))?;
        if resp.status().is_server_error() {
            return Err(DelegateError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};

    async fn spawn(app: Router) -> DelegateConfig {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        DelegateConfig {
            base_url: format!("http://{addr}"),
            validate_path: "/validate".to_string(),
            timeout: Duration::from_millis(500),
        }
    }

    async fn validate_handler(headers: HeaderMap) -> Result<Json<serde_json::Value>, StatusCode> {
        match headers.get("authorization").and_then(|v| v.to_str().ok()) {
            Some("Bearer a.b.c") => Ok(Json(serde_json::json!({
                "userId": "user-1",
                "roles": ["developer"]
            }))),
            Some("Bearer forbidden.x.y") => Err(StatusCode::FORBIDDEN),
            Some("Bearer broken.x.y") => Err(StatusCode::INTERNAL_SERVER_ERROR),
            _ => Err(StatusCode::UNAUTHORIZED),
        }
    }

    #[tokio::test]
    async fn valid_token_returns_identity() {
        let config = spawn(Router::new().route("/validate", get(validate_handler))).await;
        let delegate = HttpDelegate::new(&config).unwrap();
        let id = delegate.validate("a.b.c").await.unwrap();
        assert_eq!(id.user_id, "user-1");
        assert_eq!(id.roles, vec!["developer"]);
    }

    #[tokio::test]
    async fn auth_failures_are_rejections_server_errors_are_not() {
        let config = spawn(Router::new().route("/validate", get(validate_handler))).await;
        let delegate = HttpDelegate::new(&config).unwrap();
        assert!(matches!(
            delegate.validate("x.y.z").await,
            Err(DelegateError::Rejected(401))
        ));
        assert!(matches!(
            delegate.validate("forbidden.x.y").await,
            Err(DelegateError::Rejected(403))
        ));
        assert!(matches!(
            delegate.validate("broken.x.y").await,
            Err(DelegateError::Status(500))
        ));
    }

    #[tokio::test]
    async fn slow_delegate_times_out() {
        let app = Router::new().route(
            "/validate",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let config = spawn(app).await;
        let delegate = HttpDelegate::new(&config).unwrap();
        assert!(matches!(
            delegate.validate("a.b.c").await,
            Err(DelegateError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn health_treats_client_errors_as_reachable() {
        let app = Router::new().route("/health", get(|| async { StatusCode::NOT_FOUND }));
        let config = spawn(app).await;
        assert!(HttpDelegate::new(&config).unwrap().health().await.is_ok());

        let app = Router::new().route("/health", get(|| async { StatusCode::BAD_GATEWAY }));
        let config = spawn(app).await;
        assert!(matches!(
            HttpDelegate::new(&config).unwrap().health().await,
            Err(DelegateError::Status(502))
        ));
    }
}

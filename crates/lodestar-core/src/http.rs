//! Lodestar HTTP route handlers.
//!
//! `/health` and `/api/nebula/crl` are public. Every other route runs
//! behind [`require_identity`], which authenticates the bearer token,
//! applies the rate limit and hands the [`Identity`] to the handler.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, Request, State};
use axum::http::header::{AUTHORIZATION, CACHE_CONTROL, RETRY_AFTER};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use lodestar_common::error::ErrorCode;

use crate::error::LodestarError;
use crate::issuance::{InfrastructureRequest, IssuedNode, LeafRequest};
use crate::protocol::{
    rfc3339, CertListResponse, CertSummary, CrlEntry, CrlResponse, GenerateCertRequest,
    GenerateCertResponse, GenerateInfrastructureCertRequest, ListCertsQuery, RevokeCertRequest,
    RevokeCertResponse,
};
use crate::records::{Environment, Identity, NodeClass};
use crate::LodestarState;

const CRL_CACHE_CONTROL: &str = "public, max-age=3600";

/// Build the Lodestar router.
pub(crate) fn routes(state: Arc<LodestarState>) -> Router {
    let authenticated = Router::new()
        .route("/api/nebula/generate-cert", post(generate_cert_handler))
        .route("/api/nebula/generate-ec2-cert", post(generate_ec2_cert_handler))
        .route("/api/nebula/list-certs", get(list_certs_handler))
        .route("/api/nebula/revoke-cert", post(revoke_cert_handler))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_identity,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/nebula/crl", get(crl_handler))
        .merge(authenticated)
        .with_state(state)
}

/// Authenticate the caller and attach their identity to the request.
async fn require_identity(
    State(state): State<Arc<LodestarState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    match state.validator.authenticate(header.as_deref()).await {
        Ok(identity) => {
            req.extensions_mut().insert(identity);
            next.run(req).await
        }
        Err(e) => error_response(&e),
    }
}

/// GET /health: store and delegate reachability.
async fn health_handler(State(state): State<Arc<LodestarState>>) -> impl IntoResponse {
    let health = crate::health::check(&state.certificates, &state.delegate).await;
    let status = if health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

/// GET /api/nebula/crl: the published revocation list.
async fn crl_handler(State(state): State<Arc<LodestarState>>) -> Response {
    match state.registry.list_revoked().await {
        Ok(entries) => {
            let body = CrlResponse {
                revoked_certificates: entries.iter().map(CrlEntry::from).collect(),
            };
            (
                [(CACHE_CONTROL, HeaderValue::from_static(CRL_CACHE_CONTROL))],
                Json(body),
            )
                .into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// POST /api/nebula/generate-cert: issue a certificate for the caller.
async fn generate_cert_handler(
    State(state): State<Arc<LodestarState>>,
    Extension(identity): Extension<Identity>,
    payload: Result<Json<GenerateCertRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(p) => p,
        Err(rejection) => return invalid_body(rejection),
    };
    let node_class = match request.node_type.parse::<NodeClass>() {
        Ok(class) => class,
        Err(msg) => return error_response(&LodestarError::Validation(msg)),
    };
    let leaf = LeafRequest {
        node_class,
        node_name: request.node_name,
        device_description: request.device_info,
    };
    match state.issue_leaf(&identity, leaf).await {
        Ok(issued) => Json(issue_response(&state, issued)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /api/nebula/generate-ec2-cert: issue an infrastructure certificate.
async fn generate_ec2_cert_handler(
    State(state): State<Arc<LodestarState>>,
    Extension(identity): Extension<Identity>,
    payload: Result<Json<GenerateInfrastructureCertRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(p) => p,
        Err(rejection) => return invalid_body(rejection),
    };
    let environment = match request.environment.parse::<Environment>() {
        Ok(env) => env,
        Err(msg) => return error_response(&LodestarError::Validation(msg)),
    };
    let infra = InfrastructureRequest {
        environment,
        instance_name: request.instance_name,
        owner: request.user_id,
    };
    match state.issue_infrastructure(&identity, infra).await {
        Ok(issued) => Json(issue_response(&state, issued)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/nebula/list-certs: the caller's certificates, newest first.
async fn list_certs_handler(
    State(state): State<Arc<LodestarState>>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<ListCertsQuery>,
) -> Response {
    let node_class = match query.node_type.as_deref().filter(|t| !t.is_empty()) {
        None => None,
        Some(raw) => match raw.parse::<NodeClass>() {
            Ok(class) => Some(class),
            Err(msg) => return error_response(&LodestarError::Validation(msg)),
        },
    };
    // Unparseable limits fall back to the default.
    let limit = query.limit.as_deref().and_then(|l| l.parse::<usize>().ok());

    match state.list_certificates(&identity, node_class, limit).await {
        Ok(records) => Json(CertListResponse {
            certificates: records.iter().map(CertSummary::from).collect(),
        })
        .into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST /api/nebula/revoke-cert: revoke one of the caller's certificates.
async fn revoke_cert_handler(
    State(state): State<Arc<LodestarState>>,
    Extension(identity): Extension<Identity>,
    payload: Result<Json<RevokeCertRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(p) => p,
        Err(rejection) => return invalid_body(rejection),
    };
    if request.node_name.is_empty() || request.reason.trim().is_empty() {
        return error_response(&LodestarError::Validation(
            "nodeName and reason are required".to_string(),
        ));
    }
    match state
        .registry
        .revoke(&identity.owner, &request.node_name, request.reason.trim())
        .await
    {
        Ok(at) => Json(RevokeCertResponse {
            success: true,
            revoked_at: rfc3339(at),
        })
        .into_response(),
        Err(e) => error_response(&e),
    }
}

fn issue_response(state: &LodestarState, issued: IssuedNode) -> GenerateCertResponse {
    let lighthouse = &state.ca.settings().lighthouse;
    GenerateCertResponse {
        certificate: issued.record.certificate_pem,
        private_key: issued.private_key_pem.to_string(),
        config: issued.config,
        lighthouse_ip: lighthouse.internal_ip.to_string(),
        lighthouse_port: lighthouse.port,
        static_host_map: lighthouse.static_host_map(),
        ip: issued.record.address.to_string(),
        expires_at: rfc3339(issued.record.expires_at),
    }
}

fn invalid_body(rejection: JsonRejection) -> Response {
    tracing::debug!(error = %rejection, "Rejected request body");
    error_response(&LodestarError::Validation("invalid request body".to_string()))
}

/// Map a domain error to a JSON error response.
///
/// Server-side failures are logged here and answered with a generic
/// message so store and signing details stay out of responses.
fn error_response(error: &LodestarError) -> Response {
    let code = ErrorCode::from(error);
    let message = match error {
        LodestarError::Persistence(_) | LodestarError::Signing(_) | LodestarError::Config(_) => {
            tracing::error!(error = %error, "Request failed");
            "internal error".to_string()
        }
        other => other.to_string(),
    };
    let mut resp = lodestar_common::http::error_response(code, message);
    if let LodestarError::RateLimited {
        retry_after_secs, ..
    } = error
    {
        resp.headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from((*retry_after_secs).max(1)));
    }
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::{create_authority, CaBlueprint, CertificateAuthority};
    use crate::config::LodestarConfig;
    use crate::delegate::{DelegateAuthenticator, DelegateError, DelegateIdentity};
    use crate::ratelimit::RateLimitConfig;
    use crate::store::MemoryStore;
    use crate::LodestarCore;
    use async_trait::async_trait;
    use axum::body::Body;
    use chrono::Utc;
    use tower::ServiceExt;

    /// Maps `<user>.<roles>.sig` tokens to identities; `bad.*` is rejected.
    struct TokenDelegate;

    #[async_trait]
    impl DelegateAuthenticator for TokenDelegate {
        async fn validate(&self, token: &str) -> Result<DelegateIdentity, DelegateError> {
            let mut parts = token.split('.');
            let user = parts.next().unwrap_or_default();
            if user == "bad" {
                return Err(DelegateError::Rejected(401));
            }
            let roles = parts
                .next()
                .unwrap_or_default()
                .split('+')
                .map(str::to_string)
                .collect();
            Ok(DelegateIdentity {
                user_id: user.to_string(),
                roles,
            })
        }

        async fn health(&self) -> Result<(), DelegateError> {
            Ok(())
        }
    }

    fn config() -> LodestarConfig {
        let mut config = LodestarConfig::default();
        config.lighthouse.external_host = "5.6.7.8".to_string();
        config.rate_limit = RateLimitConfig {
            max_requests: 100,
            ..RateLimitConfig::default()
        };
        config
    }

    fn core_with(config: LodestarConfig) -> LodestarCore {
        let now = Utc::now();
        let (cert, key) = create_authority(
            &CaBlueprint {
                name: "test-ca".to_string(),
                duration: chrono::Duration::days(3650),
                networks: vec![],
                groups: vec![],
            },
            now,
        )
        .unwrap();
        let ca = CertificateAuthority::from_pem(&cert, key.as_bytes(), config.authority_settings(), now)
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        LodestarCore::new(&config, ca, store.clone(), store, Arc::new(TokenDelegate)).unwrap()
    }

    fn app() -> Router {
        core_with(config()).routes()
    }

    fn post_json(uri: &str, token: &str, body: serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::post(uri)
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_auth(uri: &str, token: &str) -> axum::http::Request<Body> {
        axum::http::Request::get(uri)
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    }

    async fn json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let resp = app()
            .oneshot(axum::http::Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json(resp).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["authBackend"], "reachable");
    }

    #[tokio::test]
    async fn crl_is_public_and_cacheable() {
        let resp = app()
            .oneshot(axum::http::Request::get("/api/nebula/crl").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[CACHE_CONTROL], CRL_CACHE_CONTROL);
        let body = json(resp).await;
        assert_eq!(body["revokedCertificates"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn protected_routes_require_bearer_token() {
        let req = axum::http::Request::post("/api/nebula/generate-cert")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let resp = app().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json(resp).await["error"], "unauthenticated");

        let resp = app()
            .oneshot(get_auth("/api/nebula/list-certs", "bad.x.y"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn generate_cert_returns_material_and_rejects_duplicates() {
        let app = app();
        let body = serde_json::json!({
            "nodeType": "laptop",
            "nodeName": "laptop-01",
            "deviceInfo": "MacBook Pro"
        });

        let resp = app
            .clone()
            .oneshot(post_json("/api/nebula/generate-cert", "u1.developer.sig", body.clone()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let issued = json(resp).await;
        assert!(issued["certificate"]
            .as_str()
            .unwrap()
            .starts_with("-----BEGIN NEBULA CERTIFICATE-----"));
        assert!(issued["privateKey"]
            .as_str()
            .unwrap()
            .contains("NEBULA X25519 PRIVATE KEY"));
        assert!(issued["config"].as_str().unwrap().contains("am_lighthouse: false"));
        assert_eq!(issued["lighthouseIp"], "192.168.100.1");
        assert_eq!(issued["lighthousePort"], 4242);
        assert_eq!(issued["staticHostMap"]["192.168.100.1"][0], "5.6.7.8:4242");
        assert!(issued["ip"].as_str().unwrap().starts_with("192.168.100."));
        assert!(issued["expiresAt"].as_str().unwrap().ends_with('Z'));

        let resp = app
            .oneshot(post_json("/api/nebula/generate-cert", "u1.developer.sig", body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(json(resp).await["error"], "conflict");
    }

    #[tokio::test]
    async fn generate_cert_validates_fields() {
        let app = app();
        for body in [
            serde_json::json!({ "nodeType": "server", "nodeName": "x" }),
            serde_json::json!({ "nodeType": "laptop", "nodeName": "-bad" }),
            serde_json::json!({ "nodeName": "missing-type" }),
        ] {
            let resp = app
                .clone()
                .oneshot(post_json("/api/nebula/generate-cert", "u1.developer.sig", body))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            assert_eq!(json(resp).await["error"], "invalid_payload");
        }
    }

    #[tokio::test]
    async fn ec2_issuance_requires_elevated_role() {
        let app = app();
        let body = serde_json::json!({ "environment": "prod", "instanceName": "web-1" });

        let resp = app
            .clone()
            .oneshot(post_json("/api/nebula/generate-ec2-cert", "u1.developer.sig", body.clone()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = app
            .clone()
            .oneshot(post_json("/api/nebula/generate-ec2-cert", "ops.DevOps.sig", body))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json(resp).await["ip"], "192.168.100.10");

        let resp = app
            .oneshot(post_json(
                "/api/nebula/generate-ec2-cert",
                "ops.admin.sig",
                serde_json::json!({ "environment": "qa", "instanceName": "web-2" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn list_and_revoke_flow() {
        let app = app();
        for name in ["a", "b"] {
            let resp = app
                .clone()
                .oneshot(post_json(
                    "/api/nebula/generate-cert",
                    "u1.developer.sig",
                    serde_json::json!({ "nodeType": "laptop", "nodeName": name }),
                ))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/nebula/revoke-cert",
                "u1.developer.sig",
                serde_json::json!({ "nodeName": "a", "reason": "lost device" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json(resp).await["success"], true);

        let resp = app
            .clone()
            .oneshot(get_auth("/api/nebula/list-certs?limit=abc", "u1.developer.sig"))
            .await
            .unwrap();
        let list = json(resp).await;
        let certs = list["certificates"].as_array().unwrap();
        assert_eq!(certs.len(), 2);
        let revoked: Vec<_> = certs
            .iter()
            .filter(|c| c["isRevoked"] == true)
            .map(|c| c["nodeName"].as_str().unwrap())
            .collect();
        assert_eq!(revoked, vec!["a"]);

        let resp = app
            .clone()
            .oneshot(get_auth("/api/nebula/list-certs?nodeType=ec2", "u1.developer.sig"))
            .await
            .unwrap();
        assert!(json(resp).await["certificates"].as_array().unwrap().is_empty());

        let resp = app
            .clone()
            .oneshot(axum::http::Request::get("/api/nebula/crl").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let crl = json(resp).await;
        assert_eq!(crl["revokedCertificates"].as_array().unwrap().len(), 1);
        assert_eq!(crl["revokedCertificates"][0]["reason"], "lost device");

        let resp = app
            .oneshot(post_json(
                "/api/nebula/revoke-cert",
                "u1.developer.sig",
                serde_json::json!({ "nodeName": "a", "reason": "again" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rate_limited_requests_get_429_with_retry_after() {
        let mut config = config();
        config.rate_limit = RateLimitConfig {
            max_requests: 1,
            ..RateLimitConfig::default()
        };
        let app = core_with(config).routes();

        let resp = app
            .clone()
            .oneshot(get_auth("/api/nebula/list-certs", "u1.developer.sig"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(get_auth("/api/nebula/list-certs", "u1.developer.sig"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(resp.headers().contains_key(RETRY_AFTER));
    }

    #[tokio::test]
    async fn nonexistent_route_returns_404() {
        let resp = app()
            .oneshot(axum::http::Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}

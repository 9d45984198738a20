//! Control-plane HTTP API
//!
//! The login endpoint external clients call, plus a health probe. Error
//! mapping: invalid credentials 401, disabled account 403, exhausted pool
//! 503, unusable key 400.

use crate::session::{SessionController, SessionError};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct ApiState {
    pub sessions: Arc<SessionController>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub public_key: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/auth/login", post(login))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(
    addr: &str,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr, "control-plane API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn login(State(state): State<ApiState>, Json(request): Json<LoginRequest>) -> Response {
    match state
        .sessions
        .login(&request.username, &request.password, &request.public_key)
        .await
    {
        Ok(config) => (StatusCode::OK, Json(config)).into_response(),
        Err(e) => {
            let status = match &e {
                SessionError::InvalidCredentials => {
                    tracing::debug!(username = %request.username, "login rejected");
                    StatusCode::UNAUTHORIZED
                }
                SessionError::Disabled => StatusCode::FORBIDDEN,
                SessionError::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
                SessionError::InvalidKey(_) => StatusCode::BAD_REQUEST,
                SessionError::Internal(msg) => {
                    tracing::error!(username = %request.username, "login failed: {}", msg);
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            (status, Json(ErrorBody { error: e.to_string() })).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::IpAllocator;
    use crate::engine::tests::MockBackend;
    use crate::engine::WgEngine;
    use crate::keys::KeyPair;
    use crate::peers::PeerManager;
    use crate::session::{FileUserStore, SessionParams, UserStore};
    use crate::wgconfig::{InterfaceSection, WgConfigFile};
    use axum::body::Body;
    use axum::http::Request;
    use std::net::Ipv4Addr;
    use tower::ServiceExt;

    fn test_router(subnet: &str) -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let users = FileUserStore::open(dir.path().join("users.json")).unwrap();
        users.upsert_user("alice", "alice-pw", false).unwrap();
        users.upsert_user("bob", "bob-pw", false).unwrap();
        users.upsert_user("mallory", "mallory-pw", true).unwrap();

        let allocator = Arc::new(
            IpAllocator::open(subnet.parse().unwrap(), dir.path().join("allocations.json"))
                .unwrap(),
        );
        let engine = Arc::new(WgEngine::new(Box::<MockBackend>::default()));
        let server = KeyPair::generate();
        let peers = Arc::new(PeerManager::new(
            engine,
            WgConfigFile::new(dir.path(), "wg0"),
            InterfaceSection::default(),
        ));
        let users: Arc<dyn UserStore> = Arc::new(users);
        let sessions = Arc::new(SessionController::new(
            users,
            allocator,
            peers,
            SessionParams {
                server_public_key: server.public_key,
                endpoint: "vpn.example.com:51820".into(),
                dns: vec![Ipv4Addr::new(1, 1, 1, 1)],
                extra_routes: Vec::new(),
                tunnel_url: Some("ws://vpn.example.com/".into()),
            },
        ));
        (router(ApiState { sessions }), dir)
    }

    fn login_request(username: &str, password: &str, public_key: &str) -> Request<Body> {
        let body = serde_json::json!({
            "username": username,
            "password": password,
            "public_key": public_key,
        });
        Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (router, _dir) = test_router("10.0.0.0/24");
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "ok");
    }

    #[tokio::test]
    async fn login_returns_client_config() {
        let (router, _dir) = test_router("10.0.0.0/24");
        let key = KeyPair::generate().public_key;
        let response = router
            .oneshot(login_request("alice", "alice-pw", &key))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 16 * 1024).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["interface"]["address"], "10.0.0.2/32");
        assert_eq!(value["peer"]["allowed_ips"][0], "0.0.0.0/0");
        assert_eq!(value["tunnel_url"], "ws://vpn.example.com/");
    }

    #[tokio::test]
    async fn bad_credentials_are_401() {
        let (router, _dir) = test_router("10.0.0.0/24");
        let key = KeyPair::generate().public_key;
        let response = router
            .oneshot(login_request("alice", "wrong", &key))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn disabled_account_is_403() {
        let (router, _dir) = test_router("10.0.0.0/24");
        let key = KeyPair::generate().public_key;
        let response = router
            .oneshot(login_request("mallory", "mallory-pw", &key))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn exhausted_pool_is_503() {
        let (router, _dir) = test_router("10.0.0.0/30");
        let first = router
            .clone()
            .oneshot(login_request("alice", "alice-pw", &KeyPair::generate().public_key))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        // the /30 pool has exactly one assignable address
        let second = router
            .oneshot(login_request("bob", "bob-pw", &KeyPair::generate().public_key))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn malformed_key_is_400() {
        let (router, _dir) = test_router("10.0.0.0/24");
        let response = router
            .oneshot(login_request("alice", "alice-pw", "zzz"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

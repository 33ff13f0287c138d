//! REST API
//!
//! Thin HTTP surface over [`RegistrationService`]. Caller identity comes from
//! the `X-User-Id` header, which the upstream auth proxy sets after
//! authenticating the request; a missing header is an anonymous caller.

use crate::error::RegistrationError;
use crate::service::{log_failure, GroupView, RegistrationResult, RegistrationService, StatusResult};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Header carrying the authenticated caller's user id
pub const USER_ID_HEADER: &str = "x-user-id";

pub struct ApiState {
    pub service: Arc<RegistrationService>,
}

impl ApiState {
    pub fn new(service: Arc<RegistrationService>) -> Self {
        Self { service }
    }
}

fn caller(headers: &HeaderMap) -> Option<&str> {
    headers.get(USER_ID_HEADER).and_then(|v| v.to_str().ok())
}

fn status_code(err: &RegistrationError) -> StatusCode {
    match err {
        RegistrationError::Unauthenticated => StatusCode::UNAUTHORIZED,
        RegistrationError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        RegistrationError::ChallengeNotFound(_) => StatusCode::NOT_FOUND,
        RegistrationError::AlreadyGrouped { .. } => StatusCode::CONFLICT,
        RegistrationError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ============================================================================
// RESPONSES
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub success: bool,
    #[serde(flatten)]
    pub status: StatusResult,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GroupsResponse {
    pub success: bool,
    pub groups: Vec<GroupView>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueResponse {
    pub success: bool,
    pub challenge_id: String,
    pub waiting: usize,
    pub error: Option<String>,
}

// ============================================================================
// HANDLERS
// ============================================================================

/// GET /health
pub async fn health_check() -> &'static str {
    "OK"
}

/// POST /api/v1/challenges/{challenge_id}/registration
pub async fn register(
    State(state): State<Arc<ApiState>>,
    Path(challenge_id): Path<String>,
    headers: HeaderMap,
) -> (StatusCode, Json<RegistrationResult>) {
    match state
        .service
        .try_register(caller(&headers), &challenge_id)
        .await
    {
        Ok(outcome) => (StatusCode::OK, Json(RegistrationResult::registered(&outcome))),
        Err(e) => {
            log_failure("register", &challenge_id, &e);
            (status_code(&e), Json(RegistrationResult::failed(&e)))
        }
    }
}

/// DELETE /api/v1/challenges/{challenge_id}/registration
pub async fn unregister(
    State(state): State<Arc<ApiState>>,
    Path(challenge_id): Path<String>,
    headers: HeaderMap,
) -> (StatusCode, Json<RegistrationResult>) {
    match state
        .service
        .try_unregister(caller(&headers), &challenge_id)
        .await
    {
        Ok(outcome) => (
            StatusCode::OK,
            Json(RegistrationResult::unregistered(outcome, &challenge_id)),
        ),
        Err(e) => {
            log_failure("unregister", &challenge_id, &e);
            (status_code(&e), Json(RegistrationResult::failed(&e)))
        }
    }
}

/// GET /api/v1/challenges/{challenge_id}/registration
///
/// Anonymous callers get `is_registered: false`, not 401.
pub async fn check_status(
    State(state): State<Arc<ApiState>>,
    Path(challenge_id): Path<String>,
    headers: HeaderMap,
) -> (StatusCode, Json<StatusResponse>) {
    match state
        .service
        .check_status(caller(&headers), &challenge_id)
        .await
    {
        Ok(status) => (
            StatusCode::OK,
            Json(StatusResponse {
                success: true,
                status,
                error: None,
            }),
        ),
        Err(e) => {
            log_failure("status", &challenge_id, &e);
            (
                status_code(&e),
                Json(StatusResponse {
                    success: false,
                    status: StatusResult::default(),
                    error: Some(e.public_message()),
                }),
            )
        }
    }
}

/// GET /api/v1/challenges/{challenge_id}/groups
pub async fn list_groups(
    State(state): State<Arc<ApiState>>,
    Path(challenge_id): Path<String>,
) -> (StatusCode, Json<GroupsResponse>) {
    match state.service.list_groups(&challenge_id).await {
        Ok(groups) => (
            StatusCode::OK,
            Json(GroupsResponse {
                success: true,
                groups,
                error: None,
            }),
        ),
        Err(e) => {
            log_failure("list groups", &challenge_id, &e);
            (
                status_code(&e),
                Json(GroupsResponse {
                    success: false,
                    groups: Vec::new(),
                    error: Some(e.public_message()),
                }),
            )
        }
    }
}

/// GET /api/v1/challenges/{challenge_id}/queue
pub async fn queue_depth(
    State(state): State<Arc<ApiState>>,
    Path(challenge_id): Path<String>,
) -> (StatusCode, Json<QueueResponse>) {
    match state.service.queue_depth(&challenge_id).await {
        Ok(waiting) => (
            StatusCode::OK,
            Json(QueueResponse {
                success: true,
                challenge_id,
                waiting,
                error: None,
            }),
        ),
        Err(e) => {
            log_failure("queue depth", &challenge_id, &e);
            (
                status_code(&e),
                Json(QueueResponse {
                    success: false,
                    challenge_id,
                    waiting: 0,
                    error: Some(e.public_message()),
                }),
            )
        }
    }
}

// ============================================================================
// SERVER STARTUP
// ============================================================================

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/v1/challenges/:challenge_id/registration",
            get(check_status).post(register).delete(unregister),
        )
        .route("/api/v1/challenges/:challenge_id/groups", get(list_groups))
        .route("/api/v1/challenges/:challenge_id/queue", get(queue_depth))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

pub async fn run_server(state: Arc<ApiState>, host: &str, port: u16) -> anyhow::Result<()> {
    let app = router(state);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Challenge teams API listening on {}", addr);
    info!("  POST   /api/v1/challenges/:id/registration - Register");
    info!("  DELETE /api/v1/challenges/:id/registration - Unregister");
    info!("  GET    /api/v1/challenges/:id/registration - Registration status");
    info!("  GET    /api/v1/challenges/:id/groups       - Formed groups");
    info!("  GET    /api/v1/challenges/:id/queue        - Queue depth");

    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::StaticCatalog;
    use crate::storage::local::LocalStorage;
    use crate::types::TeamSize;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> Router {
        let storage = Arc::new(LocalStorage::in_memory().unwrap());
        let catalog = StaticCatalog::new().with_challenge("duo", TeamSize::new(2).unwrap());
        let service = RegistrationService::with_storage(storage, Arc::new(catalog));
        router(Arc::new(ApiState::new(Arc::new(service))))
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        user: Option<&str>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_ID_HEADER, user);
        }
        let response = app
            .clone()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    const REGISTRATION: &str = "/api/v1/challenges/duo/registration";

    #[tokio::test]
    async fn test_register_flow() {
        let app = app();

        let (status, body) = send(&app, "POST", REGISTRATION, Some("alice")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["is_registered"], true);
        assert!(body["group_id"].is_null());

        let (_, body) = send(&app, "GET", REGISTRATION, Some("alice")).await;
        assert_eq!(body["is_registered"], true);
        assert_eq!(body["queue_position"], 1);

        let (status, body) = send(&app, "POST", REGISTRATION, Some("bob")).await;
        assert_eq!(status, StatusCode::OK);
        let group_id = body["group_id"].as_str().unwrap().to_string();

        let (_, body) = send(&app, "GET", "/api/v1/challenges/duo/groups", None).await;
        assert_eq!(body["groups"][0]["id"], group_id.as_str());
        assert_eq!(body["groups"][0]["members"], serde_json::json!(["alice", "bob"]));

        let (_, body) = send(&app, "GET", "/api/v1/challenges/duo/queue", None).await;
        assert_eq!(body["waiting"], 0);
    }

    #[tokio::test]
    async fn test_error_status_codes() {
        let app = app();

        let (status, body) = send(&app, "POST", REGISTRATION, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);

        let (status, _) = send(
            &app,
            "POST",
            "/api/v1/challenges/missing/registration",
            Some("alice"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        send(&app, "POST", REGISTRATION, Some("alice")).await;
        send(&app, "POST", REGISTRATION, Some("bob")).await;
        let (status, body) = send(&app, "DELETE", REGISTRATION, Some("alice")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["is_registered"], true);
    }

    #[tokio::test]
    async fn test_anonymous_status_is_not_an_error() {
        let app = app();
        let (status, body) = send(&app, "GET", REGISTRATION, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["is_registered"], false);
        assert!(body["group_id"].is_null());
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

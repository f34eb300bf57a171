//! Health endpoints for the Lobby Controller.
//!
//! - `GET /` - Liveness JSON for load balancers and manual checks
//! - `GET /health` - Liveness probe, `200 {"status":"healthy"}`
//! - `GET /ready` - Readiness probe (accepting WebSocket traffic?)
//!
//! The `/metrics` endpoint is rendered separately by
//! `metrics-exporter-prometheus`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

/// Health state shared with the probe handlers.
#[derive(Debug)]
pub struct HealthState {
    /// Always true after startup (process is running).
    live: AtomicBool,
    /// True while the WebSocket listener accepts traffic.
    ready: AtomicBool,
    instance_id: String,
    started_at: DateTime<Utc>,
}

impl HealthState {
    /// Create a new health state (live=true, ready=false).
    #[must_use]
    pub fn new(instance_id: String) -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            instance_id,
            started_at: Utc::now(),
        }
    }

    /// Mark the service as ready to serve traffic.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Mark the service as not ready (e.g. during shutdown).
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Create the health router.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

/// Liveness JSON for the root path.
async fn root_handler(State(state): State<Arc<HealthState>>) -> Json<Value> {
    Json(json!({
        "service": "lobby-controller",
        "status": if state.is_live() { "ok" } else { "down" },
        "instanceId": state.instance_id,
        "startedAt": state.started_at.to_rfc3339(),
    }))
}

/// Liveness probe. Returns `{"status":"healthy"}` while the process runs.
async fn health_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<Value>) {
    if state.is_live() {
        (StatusCode::OK, Json(json!({"status": "healthy"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unhealthy"})),
        )
    }
}

/// Readiness probe. 200 while the WebSocket listener accepts traffic.
async fn readiness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    fn state() -> Arc<HealthState> {
        Arc::new(HealthState::new("lobby-test-001".to_string()))
    }

    #[test]
    fn test_health_state_default() {
        let state = state();
        assert!(state.is_live(), "Should be live by default");
        assert!(!state.is_ready(), "Should not be ready by default");
    }

    #[test]
    fn test_health_state_set_ready() {
        let state = state();

        state.set_ready();
        assert!(state.is_ready(), "Should be ready after set_ready()");

        state.set_not_ready();
        assert!(
            !state.is_ready(),
            "Should not be ready after set_not_ready()"
        );
    }

    #[tokio::test]
    async fn test_root_returns_liveness_json() {
        let app = health_router(state());

        let request = Request::builder()
            .uri("/")
            .body(Body::empty())
            .expect("Failed to build request");
        let response = app.oneshot(request).await.expect("Failed to execute request");
        assert_eq!(response.status(), StatusCode::OK);

        let body = response
            .into_body()
            .collect()
            .await
            .expect("Failed to read body")
            .to_bytes();
        let json: Value = serde_json::from_slice(&body).expect("Body should be JSON");
        assert_eq!(json["service"], "lobby-controller");
        assert_eq!(json["status"], "ok");
        assert_eq!(json["instanceId"], "lobby-test-001");
    }

    #[tokio::test]
    async fn test_health_returns_healthy() {
        let app = health_router(state());

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .expect("Failed to build request");
        let response = app.oneshot(request).await.expect("Failed to execute request");
        assert_eq!(response.status(), StatusCode::OK);

        let body = response
            .into_body()
            .collect()
            .await
            .expect("Failed to read body")
            .to_bytes();
        let json: Value = serde_json::from_slice(&body).expect("Body should be JSON");
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn test_readiness_tracks_state() {
        let health = state();
        let app = health_router(Arc::clone(&health));

        let request = Request::builder()
            .uri("/ready")
            .body(Body::empty())
            .expect("Failed to build request");
        let response = app
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to execute request");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        health.set_ready();
        let request = Request::builder()
            .uri("/ready")
            .body(Body::empty())
            .expect("Failed to build request");
        let response = app.oneshot(request).await.expect("Failed to execute request");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_path_returns_404() {
        let app = health_router(state());

        let request = Request::builder()
            .uri("/unknown")
            .body(Body::empty())
            .expect("Failed to build request");
        let response = app.oneshot(request).await.expect("Failed to execute request");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

//! Admin HTTP API.
//!
//! Every route requires the configured bearer token.
//!
//! ```text
//! GET    /admin/status
//! GET    /admin/queues
//! GET    /admin/queues/{queue}/counts
//! POST   /admin/queues/{queue}/jobs
//! GET    /admin/queues/{queue}/jobs/{id}
//! POST   /admin/queues/{queue}/pause
//! POST   /admin/queues/{queue}/resume
//! DELETE /admin/jobs/{id}
//! GET    /admin/circuits
//! POST   /admin/circuits/{service}/reset
//! GET    /admin/rate-limits
//! GET    /admin/rate-limits/{provider}
//! PATCH  /admin/rate-limits/{provider}
//! ```

pub mod auth;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::queue::JobQueue;
use crate::resilience::ResilienceRegistry;

const ADMIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// State shared by admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub queue: Arc<JobQueue>,
    pub registry: Arc<ResilienceRegistry>,
    pub api_key: Arc<String>,
    pub started_at: Instant,
}

impl AdminState {
    pub fn new(queue: Arc<JobQueue>, registry: Arc<ResilienceRegistry>, api_key: impl Into<String>) -> Self {
        Self {
            queue,
            registry,
            api_key: Arc::new(api_key.into()),
            started_at: Instant::now(),
        }
    }
}

#[allow(deprecated)]
pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/queues", get(list_queues))
        .route("/admin/queues/{queue}/counts", get(get_queue_counts))
        .route("/admin/queues/{queue}/jobs", post(enqueue_job))
        .route("/admin/queues/{queue}/jobs/{id}", get(get_job))
        .route("/admin/queues/{queue}/pause", post(pause_queue))
        .route("/admin/queues/{queue}/resume", post(resume_queue))
        .route("/admin/jobs/{id}", delete(cancel_job))
        .route("/admin/circuits", get(list_circuits))
        .route("/admin/circuits/{service}/reset", post(reset_circuit))
        .route("/admin/rate-limits", get(list_rate_limits))
        .route("/admin/rate-limits/{provider}", get(get_rate_limit).patch(update_rate_limit))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
        .layer(TimeoutLayer::new(ADMIN_REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
}

/// Serve the admin API until shutdown fires.
pub async fn serve(addr: SocketAddr, state: AdminState, mut shutdown: broadcast::Receiver<()>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(address = %listener.local_addr()?, "Admin API listening");

    axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    tracing::info!("Admin API stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::config::AppConfig;

    const KEY: &str = "test-key";

    fn app() -> Router {
        let config = AppConfig::default();
        let queue = Arc::new(JobQueue::from_config(&config.queue).unwrap());
        let registry = Arc::new(ResilienceRegistry::from_config(&config));
        setup_admin_router(AdminState::new(queue, registry, KEY))
    }

    fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {}", KEY));
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_rejects_missing_token() {
        let response = app()
            .oneshot(Request::builder().uri("/admin/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_enqueue_then_status_and_cancel() {
        let app = app();

        let created = app
            .clone()
            .oneshot(request("POST", "/admin/queues/research/jobs", Some(json!({ "payload": { "q": 1 } }))))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let id = json_body(created).await["id"].as_str().unwrap().to_string();

        let status = app
            .clone()
            .oneshot(request("GET", &format!("/admin/queues/research/jobs/{}", id), None))
            .await
            .unwrap();
        assert_eq!(json_body(status).await["status"], "waiting");

        let cancelled = app
            .clone()
            .oneshot(request("DELETE", &format!("/admin/jobs/{}", id), None))
            .await
            .unwrap();
        assert_eq!(json_body(cancelled).await["cancelled"], true);

        let missing = app
            .oneshot(request("GET", &format!("/admin/queues/research/jobs/{}", id), None))
            .await
            .unwrap();
        assert_eq!(json_body(missing).await["status"], "not_found");
    }

    #[tokio::test]
    async fn test_update_rate_limit() {
        let response = app()
            .oneshot(request("PATCH", "/admin/rate-limits/openai", Some(json!({ "max_requests": 7 }))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["standard"]["limit"], 7);
    }

    #[tokio::test]
    async fn test_update_rate_limit_rejects_zero_ceiling() {
        let app = app();
        let response = app
            .clone()
            .oneshot(request("PATCH", "/admin/rate-limits/openai", Some(json!({ "max_requests": 0 }))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("max_requests"));

        let response = app
            .oneshot(request("GET", "/admin/rate-limits/openai", None))
            .await
            .unwrap();
        assert_ne!(json_body(response).await["standard"]["limit"], 0);
    }

    #[tokio::test]
    async fn test_reset_unknown_circuit_is_404() {
        let response = app()
            .oneshot(request("POST", "/admin/circuits/nobody/reset", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

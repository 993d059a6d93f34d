use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::admin::AdminState;
use crate::queue::{JobCounts, JobOptions, JobStatus, QueueError};
use crate::resilience::{CircuitStats, ProviderLimitsUpdate, RateLimitStats};

/// Error body returned by admin handlers.
pub struct AdminError {
    status: StatusCode,
    message: String,
}

impl AdminError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<QueueError> for AdminError {
    fn from(err: QueueError) -> Self {
        let status = match err {
            QueueError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            QueueError::InvalidOptions(_) => StatusCode::BAD_REQUEST,
            QueueError::ProcessorAlreadyRegistered(_) => StatusCode::CONFLICT,
            QueueError::Io(_) | QueueError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub backend: &'static str,
    pub uptime_secs: u64,
}

#[derive(Serialize)]
pub struct QueueSummary {
    pub name: String,
    pub paused: bool,
    pub concurrency: Option<usize>,
    pub counts: JobCounts,
}

#[derive(Deserialize)]
pub struct EnqueueRequest {
    pub payload: Value,
    #[serde(default)]
    pub options: JobOptions,
}

#[derive(Serialize)]
pub struct EnqueueResponse {
    pub id: String,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        backend: state.queue.backend_kind().as_str(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

pub async fn list_queues(State(state): State<AdminState>) -> Result<Json<Vec<QueueSummary>>, AdminError> {
    let mut summaries = Vec::new();
    for name in state.queue.queue_names().await {
        summaries.push(QueueSummary {
            paused: state.queue.is_paused(&name).await,
            concurrency: state.queue.queue_info(&name).and_then(|info| info.concurrency),
            counts: state.queue.get_job_counts(&name).await?,
            name,
        });
    }
    Ok(Json(summaries))
}

pub async fn get_queue_counts(
    State(state): State<AdminState>,
    Path(queue): Path<String>,
) -> Result<Json<JobCounts>, AdminError> {
    Ok(Json(state.queue.get_job_counts(&queue).await?))
}

pub async fn enqueue_job(
    State(state): State<AdminState>,
    Path(queue): Path<String>,
    Json(request): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AdminError> {
    let id = state.queue.enqueue_job(&queue, request.payload, request.options).await?;
    Ok((StatusCode::CREATED, Json(EnqueueResponse { id })))
}

pub async fn get_job(
    State(state): State<AdminState>,
    Path((queue, id)): Path<(String, String)>,
) -> Json<JobStatus> {
    Json(state.queue.get_job_status(&queue, &id).await)
}

pub async fn cancel_job(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AdminError> {
    let cancelled = state.queue.cancel_job(&id).await?;
    Ok(Json(json!({ "id": id, "cancelled": cancelled })))
}

pub async fn pause_queue(
    State(state): State<AdminState>,
    Path(queue): Path<String>,
) -> Result<Json<Value>, AdminError> {
    state.queue.pause_queue(&queue).await?;
    Ok(Json(json!({ "queue": queue, "paused": true })))
}

pub async fn resume_queue(
    State(state): State<AdminState>,
    Path(queue): Path<String>,
) -> Result<Json<Value>, AdminError> {
    state.queue.resume_queue(&queue).await?;
    Ok(Json(json!({ "queue": queue, "paused": false })))
}

pub async fn list_circuits(State(state): State<AdminState>) -> Json<Vec<CircuitStats>> {
    Json(state.registry.circuit_stats())
}

pub async fn reset_circuit(
    State(state): State<AdminState>,
    Path(service): Path<String>,
) -> Result<Json<Value>, AdminError> {
    if state.registry.reset_circuit(&service) {
        Ok(Json(json!({ "service": service, "state": "closed" })))
    } else {
        Err(AdminError::not_found(format!("no circuit for service '{}'", service)))
    }
}

pub async fn list_rate_limits(State(state): State<AdminState>) -> Json<Vec<RateLimitStats>> {
    Json(state.registry.rate_limiter().all_stats())
}

pub async fn get_rate_limit(
    State(state): State<AdminState>,
    Path(provider): Path<String>,
) -> Json<RateLimitStats> {
    Json(state.registry.rate_limiter().get_rate_limit_stats(&provider))
}

pub async fn update_rate_limit(
    State(state): State<AdminState>,
    Path(provider): Path<String>,
    Json(update): Json<ProviderLimitsUpdate>,
) -> Result<Json<RateLimitStats>, AdminError> {
    let limiter = state.registry.rate_limiter();
    limiter.update_rate_limit_config(&provider, update).map_err(|errors| {
        let details: Vec<String> = errors.iter().map(ToString::to_string).collect();
        AdminError::bad_request(details.join("; "))
    })?;
    Ok(Json(limiter.get_rate_limit_stats(&provider)))
}

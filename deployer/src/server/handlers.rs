//! HTTP request handlers

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::errors::DeployerError;
use crate::jobs::queue::Admission;
use crate::models::deployment::{
    DeploymentKey, DeploymentPayload, DeploymentRecord, DeploymentTarget, TemplateDescriptor,
    TenantDescriptor,
};
use crate::models::job::{JobRecord, Priority};
use crate::server::state::ServerState;
use crate::stream::broadcaster::LogEvent;
use crate::utils::version_info;

/// Error body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for DeployerError {
    fn into_response(self) -> Response {
        let status = match &self {
            DeployerError::AlreadyActive(_) | DeployerError::DomainConflict { .. } => StatusCode::CONFLICT,
            DeployerError::InvalidKey(_)
            | DeployerError::ValidationError(_)
            | DeployerError::Unsupported(_) => StatusCode::BAD_REQUEST,
            DeployerError::NotFound(_) => StatusCode::NOT_FOUND,
            DeployerError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED {
            error!("Request failed: {}", self);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "tenant-deployer".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

/// Deployment submission
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub template: TemplateDescriptor,
    pub tenant: TenantDescriptor,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub target: DeploymentTarget,
}

/// Admission outcome
#[derive(Debug, Serialize)]
#[serde(tag = "admission", rename_all = "snake_case")]
pub enum SubmitResponse {
    Queued { job: JobRecord },
    InProgress { record: DeploymentRecord },
    AlreadyDeployed { record: DeploymentRecord },
}

/// Submit a deployment
pub async fn submit_handler(
    State(state): State<Arc<ServerState>>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<impl IntoResponse, DeployerError> {
    let Json(request) = body.map_err(|e| DeployerError::ValidationError(e.body_text()))?;

    let payload = DeploymentPayload {
        template: request.template,
        tenant: request.tenant,
        timeout_secs: request.timeout_secs,
        target: request.target,
    };
    let key = payload.key()?;

    let response = match state.queue.submit(key, payload, request.priority).await? {
        Admission::Queued(job) => (StatusCode::ACCEPTED, Json(SubmitResponse::Queued { job })),
        Admission::InProgress(record) => (StatusCode::OK, Json(SubmitResponse::InProgress { record })),
        Admission::AlreadyDeployed(record) => (StatusCode::OK, Json(SubmitResponse::AlreadyDeployed { record })),
    };
    Ok(response)
}

fn path_key(template: String, tenant: String) -> Result<DeploymentKey, DeployerError> {
    DeploymentKey::new(template, tenant)
}

/// Job state for a key
pub async fn job_handler(
    State(state): State<Arc<ServerState>>,
    Path((template, tenant)): Path<(String, String)>,
) -> Result<Json<JobRecord>, DeployerError> {
    let key = path_key(template, tenant)?;
    state
        .queue
        .status(&key)
        .await
        .map(Json)
        .ok_or_else(|| DeployerError::NotFound(format!("no job for {}", key)))
}

/// Persisted record for a key
pub async fn record_handler(
    State(state): State<Arc<ServerState>>,
    Path((template, tenant)): Path<(String, String)>,
) -> Result<Json<DeploymentRecord>, DeployerError> {
    let key = path_key(template, tenant)?;
    state
        .queue
        .record(&key)
        .await?
        .map(Json)
        .ok_or_else(|| DeployerError::NotFound(format!("no deployment record for {}", key)))
}

/// Log lines response
#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub lines: Vec<String>,
}

/// Log lines of the current or last run
pub async fn logs_handler(
    State(state): State<Arc<ServerState>>,
    Path((template, tenant)): Path<(String, String)>,
) -> Result<Json<LogsResponse>, DeployerError> {
    let key = path_key(template, tenant)?;
    state
        .queue
        .logs(&key)
        .await?
        .map(|lines| Json(LogsResponse { lines }))
        .ok_or_else(|| DeployerError::NotFound(format!("no logs for {}", key)))
}

/// Live log stream as server-sent events: `log` events, then one `end`
/// event carrying the terminal status
pub async fn stream_handler(
    State(state): State<Arc<ServerState>>,
    Path((template, tenant)): Path<(String, String)>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, DeployerError> {
    let key = path_key(template, tenant)?;
    let subscription = state.queue.subscribe(&key);

    let events = stream::unfold(Some(subscription), |subscription| async move {
        let mut subscription = subscription?;
        match subscription.next().await? {
            LogEvent::Line(line) => {
                // SSE data may not carry carriage returns
                let event = Event::default().event("log").data(line.replace('\r', ""));
                Some((Ok::<_, Infallible>(event), Some(subscription)))
            }
            LogEvent::Finished(status) => {
                let event = Event::default().event("end").data(status.as_str());
                Some((Ok::<_, Infallible>(event), None))
            }
        }
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Cancel a deployment
pub async fn cancel_handler(
    State(state): State<Arc<ServerState>>,
    Path((template, tenant)): Path<(String, String)>,
) -> Result<StatusCode, DeployerError> {
    let key = path_key(template, tenant)?;
    state.queue.cancel(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

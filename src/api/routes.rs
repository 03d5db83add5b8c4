//! API routes for job submission and polling.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AppState;
use crate::geography::SiteInput;
use crate::jobs::{DemandSpec, JobInputs, JobOptions, JobRecord};
use crate::middleware::logging::JobTrace;
use crate::models::{AllocationReport, ErrorKind, JobError};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/:job_id", get(get_job).delete(cancel_job))
        .route("/health", get(health_check))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub demand: Vec<DemandSpec>,
    #[serde(default)]
    pub site: SiteInput,
    /// Base64-encoded metric workbook.
    #[serde(default)]
    pub metric_file_bytes: Option<String>,
    #[serde(default)]
    pub options: JobOptions,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status: &'static str,
    pub fingerprint: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// Rejection body plus the [`JobTrace`] the access log reads.
fn rejection(status: StatusCode, err: JobError) -> Response {
    let kind = err.kind;
    let mut response = (
        status,
        Json(ErrorBody {
            kind,
            message: err.message,
        }),
    )
        .into_response();
    response.extensions_mut().insert(JobTrace::rejected(kind));
    response
}

async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Response {
    let metric_file = match request.metric_file_bytes {
        Some(encoded) => match base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                return rejection(
                    StatusCode::BAD_REQUEST,
                    JobError::new(ErrorKind::InputInvalid, format!("metric_file_bytes: {e}")),
                )
            }
        },
        None => None,
    };

    let inputs = JobInputs {
        demand: request.demand,
        site: request.site,
        metric_file,
        options: request.options,
    };

    match state.jobs.submit(inputs) {
        Ok(outcome) => {
            let mut response = Json(SubmitResponse {
                job_id: outcome.job_id,
                status: outcome.state.as_str(),
                fingerprint: outcome.fingerprint.clone(),
            })
            .into_response();
            response
                .extensions_mut()
                .insert(JobTrace::submitted(outcome.fingerprint));
            response
        }
        Err(e) => {
            let status = match e.kind {
                ErrorKind::InputInvalid | ErrorKind::GeographyUnresolved => StatusCode::BAD_REQUEST,
                ErrorKind::Internal => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            rejection(status, e)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub status: &'static str,
    pub fingerprint: String,
    pub result: Option<AllocationReport>,
    pub error: Option<JobError>,
    pub enqueued_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<JobRecord> for JobView {
    fn from(record: JobRecord) -> Self {
        Self {
            job_id: record.job_id,
            status: record.state.as_str(),
            fingerprint: record.fingerprint,
            result: record.result,
            error: record.error,
            enqueued_at: record.enqueued_at,
            completed_at: record.completed_at,
        }
    }
}

async fn get_job(State(state): State<AppState>, Path(job_id): Path<Uuid>) -> Response {
    let Some(record) = state.jobs.status(job_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let trace = JobTrace::polled(
        record.fingerprint.clone(),
        record.error.as_ref().map(|e| e.kind),
    );
    let mut response = Json(JobView::from(record)).into_response();
    response.extensions_mut().insert(trace);
    response
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: Uuid,
    pub cancelled: bool,
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<CancelResponse>, StatusCode> {
    state
        .jobs
        .cancel(job_id)
        .map(|cancelled| Json(CancelResponse { job_id, cancelled }))
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub cache: &'static str,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let cache = if state.cache.is_connected() {
        "connected"
    } else {
        "degraded"
    };
    Json(HealthResponse { ok: true, cache })
}

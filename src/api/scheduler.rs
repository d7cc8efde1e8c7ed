use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use utoipa::ToSchema;

use super::{AppState, ErrorResponse};
use crate::scheduler::{CheckType, SchedulerStatus, TriggerReport};

#[derive(Debug, Deserialize, ToSchema)]
pub struct TriggerRequest {
    pub check: CheckType,
}

#[utoipa::path(
    get,
    path = "/api/scheduler/status",
    responses(
        (status = 200, description = "Scheduler state and per-job last run times", body = SchedulerStatus)
    ),
    tag = "scheduler"
)]
pub async fn scheduler_status(State(state): State<AppState>) -> Json<SchedulerStatus> {
    Json(state.scheduler.status().await)
}

#[utoipa::path(
    post,
    path = "/api/scheduler/trigger",
    request_body = TriggerRequest,
    responses(
        (status = 200, description = "Requested checks ran to completion", body = TriggerReport),
        (status = 500, description = "A check failed", body = ErrorResponse)
    ),
    tag = "scheduler"
)]
pub async fn trigger_check(
    State(state): State<AppState>,
    Json(request): Json<TriggerRequest>,
) -> Result<Json<TriggerReport>, (StatusCode, Json<ErrorResponse>)> {
    state
        .scheduler
        .trigger(request.check)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse::new(e))))
}

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use super::{AppState, ErrorResponse};
use crate::adapters::structured::{self, LocationUpdateRequest};
use crate::adapters::AdapterOutcome;
use crate::services::ingest::{IngestError, IngestOutcome};

/// How long a driver app should wait before its next report.
const NEXT_POLL_SECS: u64 = 30;

#[derive(Debug, Serialize, ToSchema)]
pub struct UpdateResponse {
    pub success: bool,
    /// True when the fix was already known and nothing was written
    pub deduped: bool,
    pub next_poll_secs: u64,
}

#[utoipa::path(
    post,
    path = "/api/locations/update",
    request_body = LocationUpdateRequest,
    responses(
        (status = 200, description = "Fix accepted or already known", body = UpdateResponse),
        (status = 400, description = "Malformed or out-of-range fields", body = ErrorResponse),
        (status = 404, description = "Unknown vehicle", body = ErrorResponse),
        (status = 500, description = "Storage failure", body = ErrorResponse)
    ),
    tag = "locations"
)]
pub async fn update_location(
    State(state): State<AppState>,
    Json(body): Json<LocationUpdateRequest>,
) -> Result<Json<UpdateResponse>, (StatusCode, Json<ErrorResponse>)> {
    let update = match structured::parse(body) {
        AdapterOutcome::Gps(update) => update,
        AdapterOutcome::Rejected(reason) => {
            return Err((StatusCode::BAD_REQUEST, Json(ErrorResponse::new(reason))))
        }
        // The structured adapter never produces queries or pings
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new("unsupported payload")),
            ))
        }
    };

    match state.ingest.process(update).await {
        Ok(IngestOutcome::Accepted(_)) => Ok(Json(UpdateResponse {
            success: true,
            deduped: false,
            next_poll_secs: NEXT_POLL_SECS,
        })),
        Ok(IngestOutcome::Deduped) => Ok(Json(UpdateResponse {
            success: true,
            deduped: true,
            next_poll_secs: NEXT_POLL_SECS,
        })),
        Err(e) => Err(ingest_error_response(&e)),
    }
}

pub(super) fn ingest_error_response(e: &IngestError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match e {
        IngestError::Invalid(_) => StatusCode::BAD_REQUEST,
        IngestError::NotFound(_) => StatusCode::NOT_FOUND,
        IngestError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorResponse::new(e.to_string())))
}

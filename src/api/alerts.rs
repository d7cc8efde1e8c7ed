use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use utoipa::{IntoParams, ToSchema};

use super::{AppState, ErrorResponse};
use crate::models::{Alert, AlertCandidate, AlertSeverity, AlertStatus, AlertType};
use crate::services::alerts::{AlertError, AlertFilter, AlertStats};

#[derive(Debug, Deserialize, ToSchema)]
pub struct SosRequest {
    pub vehicle_id: String,
    pub message: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AcknowledgeRequest {
    pub acknowledged_by: String,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResolveRequest {
    pub resolved_by: String,
    pub resolution: String,
    pub action_taken: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct DismissRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct AlertListQuery {
    pub status: Option<String>,
    pub alert_type: Option<String>,
    pub vehicle_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct StatsQuery {
    /// Window size in hours (default: 24)
    pub since_hours: Option<i64>,
}

fn parse_filter(query: AlertListQuery) -> Result<AlertFilter, (StatusCode, Json<ErrorResponse>)> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(AlertStatus::parse(raw).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(format!("unknown status: {}", raw))),
            )
        })?),
    };
    let alert_type = match query.alert_type.as_deref() {
        None => None,
        Some(raw) => Some(AlertType::parse(raw).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(format!("unknown alert type: {}", raw))),
            )
        })?),
    };
    Ok(AlertFilter {
        status,
        alert_type,
        vehicle_id: query.vehicle_id.map(|id| id.to_uppercase()),
        limit: query.limit.unwrap_or(0),
        offset: query.offset.unwrap_or(0),
    })
}

fn alert_error_response(e: &AlertError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match e {
        AlertError::NotFound(_) => StatusCode::NOT_FOUND,
        AlertError::EmptyResolution => StatusCode::BAD_REQUEST,
        AlertError::AlreadyAcknowledged
        | AlertError::AlreadyResolved
        | AlertError::Closed
        | AlertError::InProgress
        | AlertError::Conflict => StatusCode::CONFLICT,
        AlertError::Store(_) | AlertError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorResponse::new(e.to_string())))
}

#[utoipa::path(
    post,
    path = "/api/alerts/sos",
    request_body = SosRequest,
    responses(
        (status = 201, description = "SOS alert created", body = Alert),
        (status = 500, description = "Storage failure", body = ErrorResponse)
    ),
    tag = "alerts"
)]
pub async fn create_sos(
    State(state): State<AppState>,
    Json(request): Json<SosRequest>,
) -> Result<(StatusCode, Json<Alert>), (StatusCode, Json<ErrorResponse>)> {
    let vehicle_id = request.vehicle_id.trim().to_uppercase();
    info!(vehicle = %vehicle_id, "SOS received");

    let candidate = AlertCandidate::new(
        vehicle_id,
        AlertType::Sos,
        AlertSeverity::Critical,
        json!({
            "message": request.message,
            "latitude": request.latitude,
            "longitude": request.longitude,
        }),
    );

    match state.alerts.create_from_candidate(&candidate).await {
        // SOS is never deduplicated, so creation always yields an alert
        Ok(Some(alert)) => Ok((StatusCode::CREATED, Json(alert))),
        Ok(None) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new("sos unexpectedly suppressed")),
        )),
        Err(e) => Err(alert_error_response(&e)),
    }
}

#[utoipa::path(
    get,
    path = "/api/alerts",
    params(AlertListQuery),
    responses(
        (status = 200, description = "Open and recent alerts, highest priority first", body = [Alert]),
        (status = 400, description = "Invalid filter value", body = ErrorResponse)
    ),
    tag = "alerts"
)]
pub async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertListQuery>,
) -> Result<Json<Vec<Alert>>, (StatusCode, Json<ErrorResponse>)> {
    let filter = parse_filter(query)?;
    state
        .alerts
        .list(&filter)
        .await
        .map(Json)
        .map_err(|e| alert_error_response(&e))
}

#[utoipa::path(
    get,
    path = "/api/alerts/history",
    params(AlertListQuery),
    responses(
        (status = 200, description = "Full alert history, newest first", body = [Alert])
    ),
    tag = "alerts"
)]
pub async fn alert_history(
    State(state): State<AppState>,
    Query(query): Query<AlertListQuery>,
) -> Result<Json<Vec<Alert>>, (StatusCode, Json<ErrorResponse>)> {
    let filter = parse_filter(query)?;
    state
        .alerts
        .history(&filter)
        .await
        .map(Json)
        .map_err(|e| alert_error_response(&e))
}

#[utoipa::path(
    get,
    path = "/api/alerts/stats",
    params(StatsQuery),
    responses(
        (status = 200, description = "Aggregate counts and response times", body = AlertStats)
    ),
    tag = "alerts"
)]
pub async fn alert_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<AlertStats>, (StatusCode, Json<ErrorResponse>)> {
    let since = Utc::now() - Duration::hours(query.since_hours.unwrap_or(24).max(1));
    state
        .alerts
        .stats(since)
        .await
        .map(Json)
        .map_err(|e| alert_error_response(&e))
}

#[utoipa::path(
    post,
    path = "/api/alerts/{id}/acknowledge",
    params(("id" = String, Path, description = "Alert id")),
    request_body = AcknowledgeRequest,
    responses(
        (status = 200, description = "Alert acknowledged", body = Alert),
        (status = 404, description = "No such alert", body = ErrorResponse),
        (status = 409, description = "Alert is not active", body = ErrorResponse)
    ),
    tag = "alerts"
)]
pub async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AcknowledgeRequest>,
) -> Result<Json<Alert>, (StatusCode, Json<ErrorResponse>)> {
    state
        .alerts
        .acknowledge(&id, &request.acknowledged_by, request.notes.as_deref())
        .await
        .map(Json)
        .map_err(|e| alert_error_response(&e))
}

#[utoipa::path(
    post,
    path = "/api/alerts/{id}/progress",
    params(("id" = String, Path, description = "Alert id")),
    responses(
        (status = 200, description = "Alert moved to in_progress", body = Alert),
        (status = 404, description = "No such alert", body = ErrorResponse),
        (status = 409, description = "Alert is not acknowledged", body = ErrorResponse)
    ),
    tag = "alerts"
)]
pub async fn start_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Alert>, (StatusCode, Json<ErrorResponse>)> {
    state
        .alerts
        .start_progress(&id)
        .await
        .map(Json)
        .map_err(|e| alert_error_response(&e))
}

#[utoipa::path(
    post,
    path = "/api/alerts/{id}/resolve",
    params(("id" = String, Path, description = "Alert id")),
    request_body = ResolveRequest,
    responses(
        (status = 200, description = "Alert resolved", body = Alert),
        (status = 400, description = "Empty resolution description", body = ErrorResponse),
        (status = 404, description = "No such alert", body = ErrorResponse),
        (status = 409, description = "Alert is already closed", body = ErrorResponse)
    ),
    tag = "alerts"
)]
pub async fn resolve_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<Alert>, (StatusCode, Json<ErrorResponse>)> {
    state
        .alerts
        .resolve(
            &id,
            &request.resolved_by,
            &request.resolution,
            request.action_taken.as_deref(),
        )
        .await
        .map(Json)
        .map_err(|e| alert_error_response(&e))
}

#[utoipa::path(
    post,
    path = "/api/alerts/{id}/dismiss",
    params(("id" = String, Path, description = "Alert id")),
    request_body = DismissRequest,
    responses(
        (status = 200, description = "Alert dismissed", body = Alert),
        (status = 404, description = "No such alert", body = ErrorResponse),
        (status = 409, description = "Alert cannot be dismissed from its current state", body = ErrorResponse)
    ),
    tag = "alerts"
)]
pub async fn dismiss_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<DismissRequest>,
) -> Result<Json<Alert>, (StatusCode, Json<ErrorResponse>)> {
    state
        .alerts
        .dismiss(&id, request.reason.as_deref())
        .await
        .map(Json)
        .map_err(|e| alert_error_response(&e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_state;

    fn sos(vehicle: &str) -> SosRequest {
        SosRequest {
            vehicle_id: vehicle.to_string(),
            message: Some("breakdown near depot".into()),
            latitude: Some(18.9696),
            longitude: Some(72.8194),
        }
    }

    #[tokio::test]
    async fn test_sos_creates_critical_alert_every_time() {
        let state = test_state().await;

        let (status, first) = create_sos(State(state.clone()), Json(sos("bus001"))).await.unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(first.vehicle_id, "BUS001");
        assert_eq!(first.severity, AlertSeverity::Critical);
        assert_eq!(first.priority, 10);

        // A second press is a new, independent alert
        let (_, second) = create_sos(State(state), Json(sos("bus001"))).await.unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_lifecycle_conflicts_map_to_409() {
        let state = test_state().await;
        let (_, alert) = create_sos(State(state.clone()), Json(sos("BUS001"))).await.unwrap();

        acknowledge_alert(
            State(state.clone()),
            Path(alert.id.clone()),
            Json(AcknowledgeRequest {
                acknowledged_by: "op1".into(),
                notes: None,
            }),
        )
        .await
        .unwrap();

        let (status, _) = acknowledge_alert(
            State(state.clone()),
            Path(alert.id.clone()),
            Json(AcknowledgeRequest {
                acknowledged_by: "op2".into(),
                notes: None,
            }),
        )
        .await
        .err()
        .expect("conflict");
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = resolve_alert(
            State(state),
            Path(alert.id.clone()),
            Json(ResolveRequest {
                resolved_by: "op1".into(),
                resolution: "  ".into(),
                action_taken: None,
            }),
        )
        .await
        .err()
        .expect("empty resolution");
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_alert_is_404() {
        let state = test_state().await;
        let (status, _) = start_progress(State(state), Path("missing".into()))
            .await
            .err()
            .expect("not found");
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_rejects_unknown_filter_values() {
        let state = test_state().await;
        let (status, body) = list_alerts(
            State(state),
            Query(AlertListQuery {
                status: Some("exploded".into()),
                alert_type: None,
                vehicle_id: None,
                limit: None,
                offset: None,
            }),
        )
        .await
        .err()
        .expect("bad request");
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.error.contains("exploded"));
    }

    #[tokio::test]
    async fn test_stats_cover_recent_window() {
        let state = test_state().await;
        create_sos(State(state.clone()), Json(sos("BUS001"))).await.unwrap();

        let stats = alert_stats(State(state), Query(StatsQuery { since_hours: None }))
            .await
            .unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.critical_open, 1);
    }

    #[tokio::test]
    async fn test_history_includes_dismissed() {
        let state = test_state().await;
        let (_, alert) = create_sos(State(state.clone()), Json(sos("BUS001"))).await.unwrap();
        dismiss_alert(
            State(state.clone()),
            Path(alert.id.clone()),
            Json(DismissRequest {
                reason: Some("false alarm".into()),
            }),
        )
        .await
        .unwrap();

        let history = alert_history(
            State(state),
            Query(AlertListQuery {
                status: None,
                alert_type: None,
                vehicle_id: Some("bus001".into()),
                limit: None,
                offset: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, AlertStatus::Dismissed);
    }
}

//! Inbound webhook endpoints for the SMS and IoT gateway channels.
//!
//! SMS always answers 200 with a reply text for the sender; only transport
//! and storage failures surface as HTTP errors. The gateway endpoint speaks
//! JSON both ways and authenticates with a pre-shared key header.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use utoipa::ToSchema;

use super::{AppState, ErrorResponse};
use crate::adapters::{freetext, gateway, AdapterOutcome};
use crate::models::PassengerQuery;
use crate::services::ingest::{IngestError, IngestOutcome};

const GATEWAY_KEY_HEADER: &str = "x-gateway-key";

const HELP_TEXT: &str = "Commands: GPS <id>,<lat>,<lng>[,speed,heading,time] | \
BUS <id> | ROUTE <id> | NEAREST <place> | HELP";

#[derive(Debug, Deserialize, ToSchema)]
pub struct SmsWebhook {
    /// Sender phone number, as forwarded by the SMS provider
    pub from: String,
    pub body: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SmsReply {
    pub reply: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct GatewayResponse {
    pub success: bool,
    pub message: String,
}

#[utoipa::path(
    post,
    path = "/webhooks/sms",
    request_body = SmsWebhook,
    responses(
        (status = 200, description = "Reply text for the sender", body = SmsReply),
        (status = 500, description = "Storage failure", body = ErrorResponse)
    ),
    tag = "webhooks"
)]
pub async fn receive_sms(
    State(state): State<AppState>,
    Json(message): Json<SmsWebhook>,
) -> Result<Json<SmsReply>, (StatusCode, Json<ErrorResponse>)> {
    info!(from = %message.from, "SMS received");

    let reply = match freetext::parse(&message.body) {
        AdapterOutcome::Gps(update) => {
            let vehicle_id = update.vehicle_id.clone();
            match state.ingest.process(update).await {
                Ok(IngestOutcome::Accepted(_)) => {
                    format!("Location received for {}", vehicle_id.to_uppercase())
                }
                Ok(IngestOutcome::Deduped) => {
                    format!("Location already recorded for {}", vehicle_id.to_uppercase())
                }
                Err(IngestError::NotFound(id)) => {
                    format!("Unknown vehicle {}. Check the id and try again.", id)
                }
                Err(IngestError::Invalid(field)) => {
                    format!("Could not use that update ({} out of range). {}", field, HELP_TEXT)
                }
                Err(IngestError::Store(e)) => {
                    return Err((
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(ErrorResponse::new(e.to_string())),
                    ))
                }
            }
        }
        AdapterOutcome::Query(query) => answer_query(&state, query).await.map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new(e.to_string())),
            )
        })?,
        _ => format!("Sorry, I did not understand that. {}", HELP_TEXT),
    };

    Ok(Json(SmsReply { reply }))
}

async fn answer_query(
    state: &AppState,
    query: PassengerQuery,
) -> Result<String, crate::services::store::StoreError> {
    match query {
        PassengerQuery::Help => Ok(HELP_TEXT.to_string()),
        PassengerQuery::BusStatus { vehicle_id } => {
            let id = vehicle_id.to_uppercase();
            match state.registry.get(&id).await? {
                None => Ok(format!("Unknown vehicle {}. Check the id and try again.", id)),
                Some(vehicle) => match (vehicle.last_lat, vehicle.last_lng) {
                    (Some(lat), Some(lng)) => {
                        let speed = vehicle
                            .last_speed
                            .map(|s| format!(", speed {:.0} km/h", s))
                            .unwrap_or_default();
                        let seen = vehicle
                            .last_captured_at
                            .map(|ts| format!(" as of {} UTC", ts.format("%H:%M")))
                            .unwrap_or_default();
                        Ok(format!("{} is at ({:.4}, {:.4}){}{}", id, lat, lng, speed, seen))
                    }
                    _ => Ok(format!("No location reported yet for {}", id)),
                },
            }
        }
        PassengerQuery::RouteInfo { query } => {
            let route_id = query.to_uppercase();
            let stops = state.registry.route_stops(&route_id).await?;
            if stops.is_empty() {
                return Ok(format!("No route found matching {}", route_id));
            }
            let names: Vec<String> = stops
                .iter()
                .map(|s| s.name.clone().unwrap_or_else(|| s.stop_id.clone()))
                .collect();
            Ok(format!("Route {}: {}", route_id, names.join(" - ")))
        }
        PassengerQuery::Nearest { place } => {
            let Some(stop) = state.registry.find_stop(&place).await? else {
                return Ok(format!("No known place matching {}", place));
            };
            // ~5 km box at the equator; close enough for a text reply
            let nearby = state.registry.near(stop.lat, stop.lng, 0.05).await?;
            if nearby.is_empty() {
                return Ok(format!("No buses near {} right now", place));
            }
            let ids: Vec<&str> = nearby.iter().map(|v| v.id.as_str()).collect();
            Ok(format!("Buses near {}: {}", place, ids.join(", ")))
        }
    }
}

#[utoipa::path(
    post,
    path = "/webhooks/gateway",
    request_body = Value,
    responses(
        (status = 200, description = "Envelope processed", body = GatewayResponse),
        (status = 400, description = "Malformed envelope", body = ErrorResponse),
        (status = 401, description = "Missing or invalid gateway key", body = ErrorResponse),
        (status = 404, description = "Unknown vehicle", body = ErrorResponse),
        (status = 500, description = "Storage failure", body = ErrorResponse)
    ),
    tag = "webhooks"
)]
pub async fn receive_gateway(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<GatewayResponse>, (StatusCode, Json<ErrorResponse>)> {
    let provided_key = headers
        .get(GATEWAY_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    let outcome = gateway::parse(provided_key, &state.gateway_key, &body).map_err(|e| {
        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse::new(e.to_string())),
        )
    })?;

    match outcome {
        AdapterOutcome::TestPing => Ok(Json(GatewayResponse {
            success: true,
            message: "test acknowledged".to_string(),
        })),
        AdapterOutcome::Gps(update) => match state.ingest.process(update).await {
            Ok(IngestOutcome::Accepted(_)) => Ok(Json(GatewayResponse {
                success: true,
                message: "location recorded".to_string(),
            })),
            Ok(IngestOutcome::Deduped) => Ok(Json(GatewayResponse {
                success: true,
                message: "duplicate ignored".to_string(),
            })),
            Err(e) => Err(super::locations::ingest_error_response(&e)),
        },
        AdapterOutcome::Query(query) => {
            let message = answer_query(&state, query).await.map_err(|e| {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse::new(e.to_string())),
                )
            })?;
            Ok(Json(GatewayResponse {
                success: true,
                message,
            }))
        }
        AdapterOutcome::Rejected(reason) => Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(reason)),
        )),
    }
}

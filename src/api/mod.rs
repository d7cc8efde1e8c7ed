pub mod alerts;
pub mod locations;
pub mod scheduler;
pub mod webhooks;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use utoipa::{OpenApi, ToSchema};

use crate::services::alerts::AlertManager;
use crate::services::ingest::IngestService;
use crate::services::vehicles::VehicleRegistry;

#[derive(Clone)]
pub struct AppState {
    pub ingest: IngestService,
    pub alerts: AlertManager,
    pub registry: VehicleRegistry,
    pub scheduler: Arc<crate::scheduler::Scheduler>,
    /// Pre-shared key the IoT gateway must present on every request
    pub gateway_key: Arc<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/locations/update", post(locations::update_location))
        .route("/webhooks/sms", post(webhooks::receive_sms))
        .route("/webhooks/gateway", post(webhooks::receive_gateway))
        .route("/api/alerts", get(alerts::list_alerts))
        .route("/api/alerts/sos", post(alerts::create_sos))
        .route("/api/alerts/stats", get(alerts::alert_stats))
        .route("/api/alerts/history", get(alerts::alert_history))
        .route("/api/alerts/{id}/acknowledge", post(alerts::acknowledge_alert))
        .route("/api/alerts/{id}/progress", post(alerts::start_progress))
        .route("/api/alerts/{id}/resolve", post(alerts::resolve_alert))
        .route("/api/alerts/{id}/dismiss", post(alerts::dismiss_alert))
        .route("/api/scheduler/status", get(scheduler::scheduler_status))
        .route("/api/scheduler/trigger", post(scheduler::trigger_check))
        .with_state(state)
}

/// Fully wired state over a fresh in-memory database.
#[cfg(test)]
pub(crate) async fn test_state() -> AppState {
    use crate::config::{DetectionConfig, SchedulerConfig};
    use crate::scheduler::Scheduler;
    use crate::services::analytics::AnalyticsEngine;
    use crate::services::detector::AnomalyDetector;
    use crate::services::store::{test_pool, LocationStore};

    let pool = test_pool().await;
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let registry = VehicleRegistry::new(pool.clone());
    let locations = LocationStore::new(pool.clone());
    let alerts = AlertManager::new(pool.clone(), DetectionConfig::default(), tx.clone());
    let ingest = IngestService::new(
        registry.clone(),
        locations.clone(),
        AnalyticsEngine::new(DetectionConfig::default()),
        alerts.clone(),
        tx,
    );
    let detector = AnomalyDetector::new(
        registry.clone(),
        locations.clone(),
        alerts.clone(),
        DetectionConfig::default(),
    );
    let scheduler = Arc::new(Scheduler::new(
        detector,
        alerts.clone(),
        SchedulerConfig::default(),
    ));
    AppState {
        ingest,
        alerts,
        registry,
        scheduler,
        gateway_key: Arc::new("test-key".to_string()),
    }
}

#[derive(OpenApi)]
#[openapi(
    info(title = "Fleet Tracking API", version = "0.1.0"),
    paths(
        locations::update_location,
        webhooks::receive_sms,
        webhooks::receive_gateway,
        alerts::list_alerts,
        alerts::create_sos,
        alerts::alert_stats,
        alerts::alert_history,
        alerts::acknowledge_alert,
        alerts::start_progress,
        alerts::resolve_alert,
        alerts::dismiss_alert,
        scheduler::scheduler_status,
        scheduler::trigger_check
    ),
    components(schemas(
        ErrorResponse,
        crate::adapters::structured::LocationUpdateRequest,
        crate::adapters::structured::PassengerCountsBody,
        locations::UpdateResponse,
        webhooks::SmsWebhook,
        webhooks::SmsReply,
        webhooks::GatewayResponse,
        alerts::SosRequest,
        alerts::AcknowledgeRequest,
        alerts::ResolveRequest,
        alerts::DismissRequest,
        crate::models::Alert,
        crate::models::AlertType,
        crate::models::AlertSeverity,
        crate::models::AlertStatus,
        crate::services::alerts::AlertStats,
        scheduler::TriggerRequest,
        crate::scheduler::CheckType,
        crate::scheduler::TriggerReport,
        crate::scheduler::JobStatus,
        crate::scheduler::SchedulerStatus
    )),
    tags(
        (name = "locations", description = "Location ingestion"),
        (name = "webhooks", description = "Inbound SMS and IoT gateway channels"),
        (name = "alerts", description = "Alert lifecycle and reporting"),
        (name = "scheduler", description = "Background job control")
    )
)]
pub struct ApiDoc;

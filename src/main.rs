mod adapters;
pub mod api;
mod config;
mod models;
mod scheduler;
mod services;

use std::sync::Arc;

use axum::{routing::get, Router};
use sqlx::SqlitePool;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use api::{ApiDoc, AppState};
use config::Config;
use scheduler::Scheduler;
use services::alerts::AlertManager;
use services::analytics::AnalyticsEngine;
use services::detector::AnomalyDetector;
use services::ingest::IngestService;
use services::outbox::Outbox;
use services::store::LocationStore;
use services::vehicles::VehicleRegistry;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info,sqlx=warn".into()),
        )
        .init();

    // Load config
    let config = Config::load("config.yaml").expect("Failed to load config");

    // Build CORS layer based on config
    let cors_layer = if config.cors_permissive {
        tracing::warn!("CORS: Permissive mode explicitly enabled (all origins allowed) - DO NOT USE IN PRODUCTION");
        CorsLayer::permissive()
    } else if !config.cors_origins.is_empty() {
        tracing::info!(origins = ?config.cors_origins, "CORS: Restricting to configured origins");
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::OPTIONS,
            ])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::HeaderName::from_static("x-gateway-key"),
            ])
    } else {
        panic!("CORS configuration error: Either set 'cors_origins' with allowed origins, or set 'cors_permissive: true' for development");
    };

    // Initialize SQLite database
    let pool = SqlitePool::connect(&config.database_url)
        .await
        .expect("Failed to connect to SQLite database");

    // Run migrations
    let migrator = sqlx::migrate!("./migrations");
    tracing::info!(migrations = migrator.migrations.len(), "Found migrations");
    migrator
        .run(&pool)
        .await
        .expect("Failed to run migrations");
    tracing::info!("Database migrations completed");

    // Outbound notification pipeline
    let outbox = Outbox::start(config.notification_webhook.clone());
    let events = outbox.sender();

    // Core services
    let registry = VehicleRegistry::new(pool.clone());
    let locations = LocationStore::new(pool.clone());
    let alerts = AlertManager::new(pool.clone(), config.detection.clone(), events.clone());
    let analytics = AnalyticsEngine::new(config.detection.clone());
    let ingest = IngestService::new(
        registry.clone(),
        locations.clone(),
        analytics,
        alerts.clone(),
        events,
    );
    let detector = AnomalyDetector::new(
        registry.clone(),
        locations.clone(),
        alerts.clone(),
        config.detection.clone(),
    );

    // Background checks
    let scheduler = Arc::new(Scheduler::new(
        detector,
        alerts.clone(),
        config.scheduler.clone(),
    ));
    scheduler.start();

    let state = AppState {
        ingest,
        alerts,
        registry,
        scheduler,
        gateway_key: Arc::new(config.gateway_key.clone()),
    };

    // Build the app
    let app = Router::new()
        .route("/", get(root))
        .merge(api::router(state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {}: {}", addr, e));

    tracing::info!("Server running on http://localhost:{}", config.port);
    tracing::info!("Swagger UI: http://localhost:{}/swagger-ui", config.port);

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}

async fn root() -> &'static str {
    "Fleet Tracking API"
}

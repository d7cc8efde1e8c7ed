pub mod alerts;
pub mod analytics;
pub mod detector;
pub mod ingest;
pub mod outbox;
pub mod store;
pub mod vehicles;

//! Scheduled anomaly checks over accumulated location history.
//!
//! Each check reads recent records and produces candidates; idempotency
//! across overlapping runs comes from the lifecycle manager's dedup, not
//! from the checks themselves.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, info};

use super::alerts::{AlertError, AlertManager};
use super::store::{LocationStore, StoreError};
use super::vehicles::VehicleRegistry;
use crate::config::DetectionConfig;
use crate::models::{AlertCandidate, AlertSeverity, AlertType};

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Alert(#[from] AlertError),
}

#[derive(Clone)]
pub struct AnomalyDetector {
    registry: VehicleRegistry,
    locations: LocationStore,
    alerts: AlertManager,
    config: DetectionConfig,
}

impl AnomalyDetector {
    pub fn new(
        registry: VehicleRegistry,
        locations: LocationStore,
        alerts: AlertManager,
        config: DetectionConfig,
    ) -> Self {
        Self {
            registry,
            locations,
            alerts,
            config,
        }
    }

    /// Idle check: vehicles that should be moving but have not been.
    /// Returns the number of alerts actually created.
    pub async fn run_idle_check(&self) -> Result<usize, DetectorError> {
        let candidates = self.idle_candidates(Utc::now()).await?;
        self.promote(candidates).await
    }

    /// Stale-telemetry check: vehicles that have gone quiet entirely.
    pub async fn run_stale_check(&self) -> Result<usize, DetectorError> {
        let candidates = self.stale_candidates(Utc::now()).await?;
        self.promote(candidates).await
    }

    async fn promote(&self, candidates: Vec<AlertCandidate>) -> Result<usize, DetectorError> {
        let mut created = 0;
        for candidate in &candidates {
            if self.alerts.create_from_candidate(candidate).await?.is_some() {
                created += 1;
            }
        }
        if !candidates.is_empty() {
            info!(
                candidates = candidates.len(),
                created, "Detector candidates promoted"
            );
        }
        Ok(created)
    }

    /// Pure evaluation of the idle rule at `now`, no alert writes.
    pub async fn idle_candidates(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AlertCandidate>, DetectorError> {
        let lookback = Duration::minutes(self.config.idle_lookback_minutes);
        let threshold = Duration::minutes(self.config.idle_threshold_minutes);
        let mut candidates = Vec::new();

        for vehicle in self.registry.active_with_driver().await? {
            let fixes = self.locations.since(&vehicle.id, now - lookback).await?;

            if fixes.is_empty() {
                candidates.push(AlertCandidate::new(
                    vehicle.id.clone(),
                    AlertType::Idle,
                    AlertSeverity::Medium,
                    json!({
                        "reason": "no_data",
                        "lookback_minutes": self.config.idle_lookback_minutes,
                    }),
                ));
                continue;
            }

            // Fixes are newest first
            let latest_age = now - fixes[0].captured_at;
            if latest_age < threshold {
                continue;
            }

            let stationary: Vec<_> = fixes
                .iter()
                .filter(|f| {
                    f.speed.unwrap_or(0.0) <= self.config.idle_speed_kmh
                        && (now - f.captured_at) >= threshold
                })
                .collect();

            if stationary.len() >= self.config.idle_min_samples {
                let idle_since = stationary
                    .iter()
                    .map(|f| f.captured_at)
                    .min()
                    .unwrap_or(fixes[0].captured_at);
                let idle_minutes = (now - idle_since).num_minutes();
                debug!(vehicle = %vehicle.id, idle_minutes, "Idle vehicle detected");
                candidates.push(AlertCandidate::new(
                    vehicle.id.clone(),
                    AlertType::Idle,
                    AlertSeverity::Medium,
                    json!({
                        "reason": "stationary",
                        "idle_minutes": idle_minutes,
                        "samples": stationary.len(),
                    }),
                ));
            }
        }
        Ok(candidates)
    }

    /// Pure evaluation of the stale-telemetry rule at `now`.
    pub async fn stale_candidates(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AlertCandidate>, DetectorError> {
        let threshold = Duration::minutes(self.config.stale_threshold_minutes);
        let mut candidates = Vec::new();

        for vehicle in self.registry.active_with_driver().await? {
            let latest = self.locations.latest(&vehicle.id).await?;
            let evidence = match latest {
                Some(record) => {
                    let age = now - record.captured_at;
                    if age < threshold {
                        continue;
                    }
                    json!({
                        "last_seen_minutes": age.num_minutes(),
                        "threshold_minutes": self.config.stale_threshold_minutes,
                    })
                }
                None => json!({
                    "last_seen_minutes": serde_json::Value::Null,
                    "threshold_minutes": self.config.stale_threshold_minutes,
                }),
            };
            candidates.push(AlertCandidate::new(
                vehicle.id.clone(),
                AlertType::StaleData,
                AlertSeverity::Medium,
                evidence,
            ));
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Channel, GpsUpdate};
    use crate::services::store::{test_pool, DerivedFields};
    use crate::services::vehicles::VehicleRegistry;
    use sqlx::SqlitePool;

    async fn detector() -> (AnomalyDetector, VehicleRegistry, LocationStore, SqlitePool) {
        let pool = test_pool().await;
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let registry = VehicleRegistry::new(pool.clone());
        let locations = LocationStore::new(pool.clone());
        let alerts = AlertManager::new(pool.clone(), DetectionConfig::default(), tx);
        let detector = AnomalyDetector::new(
            registry.clone(),
            locations.clone(),
            alerts.clone(),
            DetectionConfig::default(),
        );
        (detector, registry, locations, pool)
    }

    async fn running_vehicle(pool: &SqlitePool, registry: &VehicleRegistry, id: &str) {
        registry.register(id, None, None, Some("DRV1")).await.unwrap();
        sqlx::query("UPDATE vehicles SET status = 'running' WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .unwrap();
    }

    async fn insert_fix(
        locations: &LocationStore,
        vehicle: &str,
        age_minutes: i64,
        speed: f64,
    ) {
        let update = GpsUpdate {
            vehicle_id: vehicle.to_string(),
            latitude: 18.97,
            longitude: 72.82,
            speed: Some(speed),
            heading: None,
            accuracy: Some(5.0),
            altitude: None,
            captured_at: Utc::now() - Duration::minutes(age_minutes),
            trip_id: None,
            passenger_counts: None,
            device_info: None,
            channel: Channel::Api,
        };
        locations.insert(&update, &DerivedFields::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_no_data_candidate() {
        let (detector, registry, _locations, pool) = detector().await;
        running_vehicle(&pool, &registry, "BUS001").await;

        let candidates = detector.idle_candidates(Utc::now()).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].alert_type, AlertType::Idle);
        assert_eq!(candidates[0].evidence["reason"], "no_data");
    }

    #[tokio::test]
    async fn test_idle_stationary_needs_three_old_samples() {
        let (detector, registry, locations, pool) = detector().await;
        running_vehicle(&pool, &registry, "BUS001").await;

        // Two stationary samples old enough: not yet idle
        insert_fix(&locations, "BUS001", 25, 0.0).await;
        insert_fix(&locations, "BUS001", 22, 1.0).await;
        let candidates = detector.idle_candidates(Utc::now()).await.unwrap();
        assert!(candidates.is_empty());

        // Third old stationary sample tips it over
        insert_fix(&locations, "BUS001", 28, 0.5).await;
        let candidates = detector.idle_candidates(Utc::now()).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].evidence["reason"], "stationary");
        assert!(candidates[0].evidence["idle_minutes"].as_i64().unwrap() >= 25);
    }

    #[tokio::test]
    async fn test_idle_suppressed_by_recent_movement() {
        let (detector, registry, locations, pool) = detector().await;
        running_vehicle(&pool, &registry, "BUS001").await;

        insert_fix(&locations, "BUS001", 28, 0.0).await;
        insert_fix(&locations, "BUS001", 25, 0.0).await;
        insert_fix(&locations, "BUS001", 22, 0.0).await;
        // A fresh fix makes the latest age < threshold even though old
        // stationary samples remain
        insert_fix(&locations, "BUS001", 5, 0.0).await;

        let candidates = detector.idle_candidates(Utc::now()).await.unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn test_idle_check_creates_once_within_window() {
        // Scenario: repeated manual runs must not double-create
        let (detector, registry, locations, pool) = detector().await;
        running_vehicle(&pool, &registry, "BUS001").await;
        insert_fix(&locations, "BUS001", 28, 0.0).await;
        insert_fix(&locations, "BUS001", 25, 0.0).await;
        insert_fix(&locations, "BUS001", 22, 0.0).await;

        assert_eq!(detector.run_idle_check().await.unwrap(), 1);
        assert_eq!(detector.run_idle_check().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stale_candidate_for_quiet_vehicle() {
        let (detector, registry, locations, pool) = detector().await;
        running_vehicle(&pool, &registry, "BUS001").await;
        running_vehicle(&pool, &registry, "BUS002").await;

        insert_fix(&locations, "BUS001", 20, 10.0).await; // stale
        insert_fix(&locations, "BUS002", 2, 10.0).await; // fresh

        let candidates = detector.stale_candidates(Utc::now()).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].vehicle_id, "BUS001");
        assert_eq!(candidates[0].alert_type, AlertType::StaleData);
        assert_eq!(candidates[0].evidence["last_seen_minutes"], 20);
    }

    #[tokio::test]
    async fn test_stale_candidate_when_never_reported() {
        let (detector, registry, _locations, pool) = detector().await;
        running_vehicle(&pool, &registry, "BUS001").await;

        let candidates = detector.stale_candidates(Utc::now()).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].evidence["last_seen_minutes"].is_null());
    }

    #[tokio::test]
    async fn test_idle_population_excludes_idle_status() {
        let (detector, registry, _locations, _pool) = detector().await;
        // Registered but never started: status stays idle, not watched
        registry.register("BUS001", None, None, Some("DRV1")).await.unwrap();

        let candidates = detector.idle_candidates(Utc::now()).await.unwrap();
        assert!(candidates.is_empty());
    }
}

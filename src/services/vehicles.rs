//! Vehicle registry: the only mutable shared state the tracking core owns.
//!
//! The per-vehicle last-update cache backs the ingestion dedup rule, so the
//! compare-and-update is one critical section under a single write lock.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use super::store::{fmt_ts, parse_ts, StoreError};
use crate::models::{GpsUpdate, RouteStop, Vehicle, VehicleStatus};

/// Outcome of the dedup compare against the cached last-update time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixDecision {
    /// Fix is newer than anything cached; cache and status were updated
    Accepted { previous_status: VehicleStatus },
    /// Fix is not newer than the cache (ties favor the existing record)
    Stale,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    last_captured_at: Option<DateTime<Utc>>,
    status: VehicleStatus,
}

#[derive(Debug, FromRow)]
struct VehicleRow {
    id: String,
    name: Option<String>,
    status: String,
    route_id: Option<String>,
    driver_id: Option<String>,
    current_trip_id: Option<String>,
    last_lat: Option<f64>,
    last_lng: Option<f64>,
    last_speed: Option<f64>,
    last_captured_at: Option<String>,
}

impl From<VehicleRow> for Vehicle {
    fn from(row: VehicleRow) -> Self {
        Vehicle {
            id: row.id,
            name: row.name,
            status: VehicleStatus::parse(&row.status),
            route_id: row.route_id,
            driver_id: row.driver_id,
            current_trip_id: row.current_trip_id,
            last_lat: row.last_lat,
            last_lng: row.last_lng,
            last_speed: row.last_speed,
            last_captured_at: row.last_captured_at.as_deref().and_then(parse_ts),
        }
    }
}

#[derive(Clone)]
pub struct VehicleRegistry {
    pool: SqlitePool,
    cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl VehicleRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Look up a vehicle by id. Ids are case-insensitive; callers pass the
    /// uppercase-normalized form.
    pub async fn get(&self, vehicle_id: &str) -> Result<Option<Vehicle>, StoreError> {
        let row: Option<VehicleRow> = sqlx::query_as("SELECT * FROM vehicles WHERE id = ?")
            .bind(vehicle_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Vehicle::from))
    }

    /// Apply the dedup rule and, on acceptance, refresh the last-known cache
    /// and bump the vehicle to Running.
    ///
    /// The compare and the cache write happen under one write lock so a
    /// concurrently arriving older fix can never clobber a newer one. The
    /// row update happens after the lock is released; the cache is the
    /// authority for dedup.
    pub async fn commit_fix(
        &self,
        vehicle: &Vehicle,
        update: &GpsUpdate,
    ) -> Result<FixDecision, StoreError> {
        let previous_status;
        {
            let mut cache = self.cache.write().await;
            let entry = cache
                .entry(vehicle.id.clone())
                .or_insert_with(|| CacheEntry {
                    last_captured_at: vehicle.last_captured_at,
                    status: vehicle.status,
                });

            if let Some(cached) = entry.last_captured_at {
                if update.captured_at <= cached {
                    return Ok(FixDecision::Stale);
                }
            }

            previous_status = entry.status;
            entry.last_captured_at = Some(update.captured_at);
            if entry.status != VehicleStatus::Running {
                entry.status = VehicleStatus::Running;
            }
        }

        sqlx::query(
            r#"
            UPDATE vehicles
            SET last_lat = ?, last_lng = ?, last_speed = ?, last_captured_at = ?, status = ?
            WHERE id = ?
            "#,
        )
        .bind(update.latitude)
        .bind(update.longitude)
        .bind(update.speed)
        .bind(fmt_ts(update.captured_at))
        .bind(VehicleStatus::Running.as_str())
        .bind(&vehicle.id)
        .execute(&self.pool)
        .await?;

        Ok(FixDecision::Accepted { previous_status })
    }

    /// Undo an accepted `commit_fix` whose record could not be persisted, so
    /// the device's retry of the same fix is not misread as a duplicate.
    ///
    /// Compare-and-restore: only undoes when the cache still holds this
    /// fix's timestamp. A newer fix that advanced the cache in the meantime
    /// is left alone.
    pub async fn rollback_fix(
        &self,
        vehicle: &Vehicle,
        update: &GpsUpdate,
        previous_status: VehicleStatus,
    ) -> Result<(), StoreError> {
        {
            let mut cache = self.cache.write().await;
            match cache.get_mut(&vehicle.id) {
                Some(entry) if entry.last_captured_at == Some(update.captured_at) => {
                    entry.last_captured_at = vehicle.last_captured_at;
                    entry.status = previous_status;
                }
                _ => return Ok(()),
            }
        }

        sqlx::query(
            r#"
            UPDATE vehicles
            SET last_lat = ?, last_lng = ?, last_speed = ?, last_captured_at = ?, status = ?
            WHERE id = ?
            "#,
        )
        .bind(vehicle.last_lat)
        .bind(vehicle.last_lng)
        .bind(vehicle.last_speed)
        .bind(vehicle.last_captured_at.map(fmt_ts))
        .bind(previous_status.as_str())
        .bind(&vehicle.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Vehicles the anomaly checks watch: Running or Break, with a driver.
    pub async fn active_with_driver(&self) -> Result<Vec<Vehicle>, StoreError> {
        let rows: Vec<VehicleRow> = sqlx::query_as(
            "SELECT * FROM vehicles WHERE status IN ('running', 'break') AND driver_id IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Vehicle::from).collect())
    }

    /// Vehicles within a crude bounding box around a point, for the
    /// passenger `NEAREST` query.
    pub async fn near(
        &self,
        lat: f64,
        lng: f64,
        delta_deg: f64,
    ) -> Result<Vec<Vehicle>, StoreError> {
        let rows: Vec<VehicleRow> = sqlx::query_as(
            r#"
            SELECT * FROM vehicles
            WHERE last_lat BETWEEN ? AND ? AND last_lng BETWEEN ? AND ?
            "#,
        )
        .bind(lat - delta_deg)
        .bind(lat + delta_deg)
        .bind(lng - delta_deg)
        .bind(lng + delta_deg)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Vehicle::from).collect())
    }

    /// Assign a driver to a vehicle, updating both sides of the relation in
    /// one transaction. Passing `None` clears the assignment.
    pub async fn assign_driver(
        &self,
        vehicle_id: &str,
        driver_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        // Detach whichever driver currently holds this vehicle
        sqlx::query("UPDATE drivers SET vehicle_id = NULL WHERE vehicle_id = ?")
            .bind(vehicle_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE vehicles SET driver_id = ? WHERE id = ?")
            .bind(driver_id)
            .bind(vehicle_id)
            .execute(&mut *tx)
            .await?;

        if let Some(driver) = driver_id {
            sqlx::query("UPDATE drivers SET vehicle_id = ? WHERE id = ?")
                .bind(vehicle_id)
                .bind(driver)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        info!(vehicle = vehicle_id, driver = ?driver_id, "Driver assignment updated");
        Ok(())
    }

    /// Ordered stops of a route, read-only to this core.
    pub async fn route_stops(&self, route_id: &str) -> Result<Vec<RouteStop>, StoreError> {
        #[derive(FromRow)]
        struct StopRow {
            route_id: String,
            stop_id: String,
            name: Option<String>,
            lat: f64,
            lng: f64,
            stop_order: i64,
            scheduled_offset_minutes: Option<i64>,
        }

        let rows: Vec<StopRow> = sqlx::query_as(
            "SELECT * FROM route_stops WHERE route_id = ? ORDER BY stop_order ASC",
        )
        .bind(route_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| RouteStop {
                route_id: row.route_id,
                stop_id: row.stop_id,
                name: row.name,
                lat: row.lat,
                lng: row.lng,
                stop_order: row.stop_order,
                scheduled_offset_minutes: row.scheduled_offset_minutes,
            })
            .collect())
    }

    /// Resolve a place name to a known stop, for the passenger `NEAREST`
    /// query. First match by stop order wins.
    pub async fn find_stop(&self, name: &str) -> Result<Option<RouteStop>, StoreError> {
        #[derive(FromRow)]
        struct StopRow {
            route_id: String,
            stop_id: String,
            name: Option<String>,
            lat: f64,
            lng: f64,
            stop_order: i64,
            scheduled_offset_minutes: Option<i64>,
        }

        let row: Option<StopRow> = sqlx::query_as(
            "SELECT * FROM route_stops WHERE name LIKE ? ORDER BY stop_order ASC LIMIT 1",
        )
        .bind(format!("%{}%", name))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| RouteStop {
            route_id: row.route_id,
            stop_id: row.stop_id,
            name: row.name,
            lat: row.lat,
            lng: row.lng,
            stop_order: row.stop_order,
            scheduled_offset_minutes: row.scheduled_offset_minutes,
        }))
    }

    /// Provisioning hook used by fleet setup and tests; not part of the
    /// ingestion path.
    pub async fn register(
        &self,
        vehicle_id: &str,
        name: Option<&str>,
        route_id: Option<&str>,
        driver_id: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO vehicles (id, name, status, route_id, driver_id) VALUES (?, ?, 'idle', ?, ?)",
        )
        .bind(vehicle_id)
        .bind(name)
        .bind(route_id)
        .bind(driver_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

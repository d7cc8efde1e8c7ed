//! SQLite persistence for the tracking core.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC strings so that string
//! comparison in SQL agrees with chronological order.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{FromRow, SqlitePool};
use std::time::Duration;
use tracing::warn;

use crate::models::{
    Channel, DataQualityTier, GpsUpdate, LocationRecord, PassengerCounts,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Serialize a timestamp for storage. Millisecond precision, trailing `Z`.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp; tolerates any RFC 3339 offset.
pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// One reusable retry-with-backoff policy for transient storage failures
/// (SQLite lock contention). Delay doubles per attempt up to the cap and
/// resets on the next call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn storage() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }

    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, sqlx::Error>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        let mut delay = self.base_delay;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && is_transient(&e) => {
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Transient storage error, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.max_delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            let msg = db.message().to_lowercase();
            msg.contains("locked") || msg.contains("busy")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

/// Values the analytics engine derives for a record before it is committed.
#[derive(Debug, Clone, Default)]
pub struct DerivedFields {
    pub distance_from_previous_km: Option<f64>,
    pub calculated_speed_kmh: Option<f64>,
    pub speed_difference: Option<f64>,
    pub is_speed_accurate: Option<bool>,
    pub is_on_route: Option<bool>,
    pub nearest_stop_id: Option<String>,
    pub nearest_stop_distance_m: Option<f64>,
    pub data_quality: Option<DataQualityTier>,
}

#[derive(Debug, FromRow)]
struct LocationRow {
    id: i64,
    vehicle_id: String,
    latitude: f64,
    longitude: f64,
    speed: Option<f64>,
    heading: Option<f64>,
    accuracy: Option<f64>,
    altitude: Option<f64>,
    captured_at: String,
    channel: String,
    trip_id: Option<String>,
    passengers_boarded: Option<i64>,
    passengers_alighted: Option<i64>,
    device_info: Option<String>,
    distance_from_previous_km: Option<f64>,
    calculated_speed_kmh: Option<f64>,
    speed_difference: Option<f64>,
    is_speed_accurate: Option<bool>,
    is_on_route: Option<bool>,
    nearest_stop_id: Option<String>,
    nearest_stop_distance_m: Option<f64>,
    data_quality: String,
    recorded_at: String,
}

impl From<LocationRow> for LocationRecord {
    fn from(row: LocationRow) -> Self {
        let passenger_counts = match (row.passengers_boarded, row.passengers_alighted) {
            (Some(boarded), Some(alighted)) => Some(PassengerCounts { boarded, alighted }),
            _ => None,
        };
        LocationRecord {
            id: row.id,
            vehicle_id: row.vehicle_id,
            latitude: row.latitude,
            longitude: row.longitude,
            speed: row.speed,
            heading: row.heading,
            accuracy: row.accuracy,
            altitude: row.altitude,
            captured_at: parse_ts(&row.captured_at).unwrap_or_else(Utc::now),
            channel: Channel::parse(&row.channel),
            trip_id: row.trip_id,
            passenger_counts,
            device_info: row.device_info,
            distance_from_previous_km: row.distance_from_previous_km,
            calculated_speed_kmh: row.calculated_speed_kmh,
            speed_difference: row.speed_difference,
            is_speed_accurate: row.is_speed_accurate,
            is_on_route: row.is_on_route,
            nearest_stop_id: row.nearest_stop_id,
            nearest_stop_distance_m: row.nearest_stop_distance_m,
            data_quality: DataQualityTier::parse(&row.data_quality),
            recorded_at: parse_ts(&row.recorded_at).unwrap_or_else(Utc::now),
        }
    }
}

/// Append-only location history.
#[derive(Clone)]
pub struct LocationStore {
    pool: SqlitePool,
    retry: RetryPolicy,
}

impl LocationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::storage(),
        }
    }

    /// Commit an accepted fix with its derived fields. Returns the full
    /// record as persisted.
    pub async fn insert(
        &self,
        update: &GpsUpdate,
        derived: &DerivedFields,
    ) -> Result<LocationRecord, StoreError> {
        let data_quality = derived
            .data_quality
            .unwrap_or_else(|| DataQualityTier::from_accuracy(update.accuracy));
        let recorded_at = Utc::now();
        let captured = fmt_ts(update.captured_at);
        let recorded = fmt_ts(recorded_at);

        let id = self
            .retry
            .run(|| async {
                sqlx::query(
                    r#"
                    INSERT INTO locations (
                        vehicle_id, latitude, longitude, speed, heading, accuracy, altitude,
                        captured_at, channel, trip_id, passengers_boarded, passengers_alighted,
                        device_info, distance_from_previous_km, calculated_speed_kmh,
                        speed_difference, is_speed_accurate, is_on_route, nearest_stop_id,
                        nearest_stop_distance_m, data_quality, recorded_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&update.vehicle_id)
                .bind(update.latitude)
                .bind(update.longitude)
                .bind(update.speed)
                .bind(update.heading)
                .bind(update.accuracy)
                .bind(update.altitude)
                .bind(&captured)
                .bind(update.channel.as_str())
                .bind(&update.trip_id)
                .bind(update.passenger_counts.map(|p| p.boarded))
                .bind(update.passenger_counts.map(|p| p.alighted))
                .bind(&update.device_info)
                .bind(derived.distance_from_previous_km)
                .bind(derived.calculated_speed_kmh)
                .bind(derived.speed_difference)
                .bind(derived.is_speed_accurate)
                .bind(derived.is_on_route)
                .bind(&derived.nearest_stop_id)
                .bind(derived.nearest_stop_distance_m)
                .bind(data_quality.as_str())
                .bind(&recorded)
                .execute(&self.pool)
                .await
                .map(|r| r.last_insert_rowid())
            })
            .await?;

        Ok(LocationRecord {
            id,
            vehicle_id: update.vehicle_id.clone(),
            latitude: update.latitude,
            longitude: update.longitude,
            speed: update.speed,
            heading: update.heading,
            accuracy: update.accuracy,
            altitude: update.altitude,
            captured_at: update.captured_at,
            channel: update.channel,
            trip_id: update.trip_id.clone(),
            passenger_counts: update.passenger_counts,
            device_info: update.device_info.clone(),
            distance_from_previous_km: derived.distance_from_previous_km,
            calculated_speed_kmh: derived.calculated_speed_kmh,
            speed_difference: derived.speed_difference,
            is_speed_accurate: derived.is_speed_accurate,
            is_on_route: derived.is_on_route,
            nearest_stop_id: derived.nearest_stop_id.clone(),
            nearest_stop_distance_m: derived.nearest_stop_distance_m,
            data_quality,
            recorded_at,
        })
    }

    /// Latest accepted record for a vehicle, if any.
    pub async fn latest(&self, vehicle_id: &str) -> Result<Option<LocationRecord>, StoreError> {
        let row: Option<LocationRow> = sqlx::query_as(
            "SELECT * FROM locations WHERE vehicle_id = ? ORDER BY captured_at DESC LIMIT 1",
        )
        .bind(vehicle_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(LocationRecord::from))
    }

    /// Records for a vehicle captured at or after `cutoff`, newest first.
    pub async fn since(
        &self,
        vehicle_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<LocationRecord>, StoreError> {
        let rows: Vec<LocationRow> = sqlx::query_as(
            "SELECT * FROM locations WHERE vehicle_id = ? AND captured_at >= ? ORDER BY captured_at DESC",
        )
        .bind(vehicle_id)
        .bind(fmt_ts(cutoff))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(LocationRecord::from).collect())
    }

    /// Full history for a vehicle, oldest first, capped at `limit` rows.
    pub async fn history(
        &self,
        vehicle_id: &str,
        limit: i64,
    ) -> Result<Vec<LocationRecord>, StoreError> {
        let rows: Vec<LocationRow> = sqlx::query_as(
            "SELECT * FROM locations WHERE vehicle_id = ? ORDER BY captured_at ASC LIMIT ?",
        )
        .bind(vehicle_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(LocationRecord::from).collect())
    }
}

/// Shared in-memory database for tests. A single connection keeps every
/// handle on the same database.
#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations");
    pool
}

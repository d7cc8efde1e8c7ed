pub mod alert;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub use alert::{Alert, AlertCandidate, AlertSeverity, AlertStatus, AlertType};

/// Channel a GPS fix arrived through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Authenticated structured request API (mobile clients)
    Api,
    /// Free-text message relayed through the telephony gateway
    Sms,
    /// Bridging JSON gateway for SMS-only devices
    Gateway,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Api => "api",
            Channel::Sms => "sms",
            Channel::Gateway => "gateway",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "sms" => Channel::Sms,
            "gateway" => Channel::Gateway,
            _ => Channel::Api,
        }
    }
}

/// Passenger boarding counts attached to a fix (optional, API channel only)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
pub struct PassengerCounts {
    pub boarded: i64,
    pub alighted: i64,
}

/// One normalized GPS fix, produced by a channel adapter.
///
/// Ephemeral: consumed by the ingestion normalizer and then discarded.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GpsUpdate {
    pub vehicle_id: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Reported speed in km/h
    pub speed: Option<f64>,
    /// Heading in degrees [0, 360]
    pub heading: Option<f64>,
    /// Horizontal accuracy in meters
    pub accuracy: Option<f64>,
    /// Altitude in meters
    pub altitude: Option<f64>,
    /// When the device captured the fix
    pub captured_at: DateTime<Utc>,
    pub trip_id: Option<String>,
    pub passenger_counts: Option<PassengerCounts>,
    pub device_info: Option<String>,
    pub channel: Channel,
}

/// GPS accuracy bucket derived from the reported accuracy radius
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DataQualityTier {
    High,
    Medium,
    Low,
}

impl DataQualityTier {
    /// Bucket a reported accuracy radius. Missing accuracy is treated as low.
    pub fn from_accuracy(accuracy: Option<f64>) -> Self {
        match accuracy {
            Some(a) if a < 10.0 => DataQualityTier::High,
            Some(a) if a < 50.0 => DataQualityTier::Medium,
            _ => DataQualityTier::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataQualityTier::High => "high",
            DataQualityTier::Medium => "medium",
            DataQualityTier::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "high" => DataQualityTier::High,
            "medium" => DataQualityTier::Medium,
            _ => DataQualityTier::Low,
        }
    }
}

/// Durable, append-only canonical record of an accepted fix.
///
/// Everything in [`GpsUpdate`] plus the fields derived by the analytics
/// engine. Never mutated after creation.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LocationRecord {
    pub id: i64,
    pub vehicle_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub accuracy: Option<f64>,
    pub altitude: Option<f64>,
    pub captured_at: DateTime<Utc>,
    pub channel: Channel,
    pub trip_id: Option<String>,
    pub passenger_counts: Option<PassengerCounts>,
    pub device_info: Option<String>,
    /// Great-circle distance from the previous accepted fix, km
    pub distance_from_previous_km: Option<f64>,
    /// Speed derived from distance / time between fixes, km/h
    pub calculated_speed_kmh: Option<f64>,
    /// |reported - calculated| speed, km/h
    pub speed_difference: Option<f64>,
    pub is_speed_accurate: Option<bool>,
    /// None when the vehicle has no assigned route
    pub is_on_route: Option<bool>,
    pub nearest_stop_id: Option<String>,
    pub nearest_stop_distance_m: Option<f64>,
    pub data_quality: DataQualityTier,
    /// When this record was committed (server clock)
    pub recorded_at: DateTime<Utc>,
}

/// Operational status of a vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum VehicleStatus {
    Idle,
    Running,
    Break,
    Completed,
}

impl VehicleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleStatus::Idle => "idle",
            VehicleStatus::Running => "running",
            VehicleStatus::Break => "break",
            VehicleStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => VehicleStatus::Running,
            "break" => VehicleStatus::Break,
            "completed" => VehicleStatus::Completed,
            _ => VehicleStatus::Idle,
        }
    }
}

/// A vehicle as seen by the tracking core.
///
/// Identity and assignment fields are owned by the fleet management surface;
/// this pipeline only writes the last-known cache and `status`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Vehicle {
    pub id: String,
    pub name: Option<String>,
    pub status: VehicleStatus,
    pub route_id: Option<String>,
    pub driver_id: Option<String>,
    pub current_trip_id: Option<String>,
    pub last_lat: Option<f64>,
    pub last_lng: Option<f64>,
    pub last_speed: Option<f64>,
    pub last_captured_at: Option<DateTime<Utc>>,
}

/// One stop on a route, ordered by `stop_order`
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RouteStop {
    pub route_id: String,
    pub stop_id: String,
    pub name: Option<String>,
    pub lat: f64,
    pub lng: f64,
    pub stop_order: i64,
    /// Minutes after route start this stop is scheduled at
    pub scheduled_offset_minutes: Option<i64>,
}

/// A passenger-facing query parsed from a free-text message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PassengerQuery {
    /// `BUS <id>` - where is this bus right now
    BusStatus { vehicle_id: String },
    /// `ROUTE <id>` or `ROUTE <A> TO <B>` - route summary
    RouteInfo { query: String },
    /// `NEAREST <place>` - buses near a named place
    Nearest { place: String },
    /// `HELP` - usage text
    Help,
}

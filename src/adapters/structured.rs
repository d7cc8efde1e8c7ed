use chrono::{DateTime, Utc};
use serde::Deserialize;
use utoipa::ToSchema;

use super::AdapterOutcome;
use crate::models::{Channel, GpsUpdate, PassengerCounts};

/// Request body of the structured location-update API.
///
/// The caller is an authenticated principal already bound to a vehicle by
/// the outer auth layer; the body still names the vehicle so the binding can
/// be checked.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdateRequest {
    pub vehicle_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub accuracy: Option<f64>,
    pub altitude: Option<f64>,
    /// Device capture time (RFC 3339). Defaults to the server clock.
    pub captured_at: Option<DateTime<Utc>>,
    pub trip_id: Option<String>,
    pub passenger_counts: Option<PassengerCountsBody>,
    pub device_info: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PassengerCountsBody {
    pub boarded: i64,
    pub alighted: i64,
}

/// Decode a structured API payload into a canonical fix.
pub fn parse(request: LocationUpdateRequest) -> AdapterOutcome {
    if request.vehicle_id.trim().is_empty() {
        return AdapterOutcome::Rejected("missing_vehicle_id");
    }
    if !request.latitude.is_finite() || !request.longitude.is_finite() {
        return AdapterOutcome::Rejected("missing_coordinates");
    }

    AdapterOutcome::Gps(GpsUpdate {
        vehicle_id: request.vehicle_id,
        latitude: request.latitude,
        longitude: request.longitude,
        speed: request.speed,
        heading: request.heading,
        accuracy: request.accuracy,
        altitude: request.altitude,
        captured_at: request.captured_at.unwrap_or_else(Utc::now),
        trip_id: request.trip_id,
        passenger_counts: request
            .passenger_counts
            .map(|p| PassengerCounts {
                boarded: p.boarded,
                alighted: p.alighted,
            }),
        device_info: request.device_info,
        channel: Channel::Api,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request() -> LocationUpdateRequest {
        LocationUpdateRequest {
            vehicle_id: "BUS001".into(),
            latitude: 18.9696,
            longitude: 72.8194,
            speed: Some(40.0),
            heading: Some(90.0),
            accuracy: Some(8.0),
            altitude: None,
            captured_at: None,
            trip_id: Some("trip-7".into()),
            passenger_counts: Some(PassengerCountsBody {
                boarded: 3,
                alighted: 1,
            }),
            device_info: Some("android/14".into()),
        }
    }

    #[test]
    fn test_structured_parse_produces_api_channel_fix() {
        match parse(base_request()) {
            AdapterOutcome::Gps(update) => {
                assert_eq!(update.vehicle_id, "BUS001");
                assert_eq!(update.channel, Channel::Api);
                assert_eq!(update.speed, Some(40.0));
                assert_eq!(update.passenger_counts.unwrap().boarded, 3);
            }
            other => panic!("expected Gps, got {:?}", other),
        }
    }

    #[test]
    fn test_structured_parse_rejects_blank_vehicle_id() {
        let mut request = base_request();
        request.vehicle_id = "  ".into();
        assert!(matches!(
            parse(request),
            AdapterOutcome::Rejected("missing_vehicle_id")
        ));
    }

    #[test]
    fn test_structured_parse_rejects_nan_coordinates() {
        let mut request = base_request();
        request.latitude = f64::NAN;
        assert!(matches!(
            parse(request),
            AdapterOutcome::Rejected("missing_coordinates")
        ));
    }
}

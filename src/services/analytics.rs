//! Per-fix analytics: distance, calculated speed, bearing, route adherence,
//! geofence membership, ETAs, and the point-in-time anomaly candidates
//! (speeding, route deviation, low signal) that do not need history.

use serde::Serialize;
use serde_json::json;
use utoipa::ToSchema;

use super::store::DerivedFields;
use crate::config::DetectionConfig;
use crate::models::{
    AlertCandidate, AlertSeverity, AlertType, DataQualityTier, GpsUpdate, LocationRecord,
    RouteStop,
};

/// Mean Earth radius in km
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two coordinates, km (haversine).
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Initial bearing from point 1 to point 2, degrees [0, 360).
pub fn bearing_deg(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lng = (lng2 - lng1).to_radians();
    let lat1 = lat1.to_radians();
    let lat2 = lat2.to_radians();
    let y = d_lng.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * d_lng.cos();
    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

/// A fix landing inside a stop's geofence. Exit is inferred by absence on
/// the next fix; no separate exit tracking here.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct GeofenceEvent {
    pub stop_id: String,
    pub stop_name: Option<String>,
    pub distance_m: f64,
    pub event: String,
}

/// ETA to one upcoming stop. ETAs are cumulative along the route order, not
/// independently computed from the vehicle position for every stop.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StopEta {
    pub stop_id: String,
    pub stop_name: Option<String>,
    pub stop_order: i64,
    pub distance_km: f64,
    pub eta_minutes: f64,
}

/// Everything the engine derives from one accepted fix.
#[derive(Debug, Clone, Default)]
pub struct AnalyticsOutput {
    pub derived: DerivedFields,
    /// Bearing of travel from the previous fix, if there was one
    pub bearing_deg: Option<f64>,
    pub geofence_events: Vec<GeofenceEvent>,
    pub etas: Vec<StopEta>,
    /// Point-in-time anomaly candidates emitted inline
    pub candidates: Vec<AlertCandidate>,
}

#[derive(Clone)]
pub struct AnalyticsEngine {
    config: DetectionConfig,
}

impl AnalyticsEngine {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    /// Enrich a newly accepted fix against the vehicle's previous record and
    /// assigned route (both optional).
    pub fn enrich(
        &self,
        update: &GpsUpdate,
        previous: Option<&LocationRecord>,
        route: Option<&[RouteStop]>,
    ) -> AnalyticsOutput {
        let mut out = AnalyticsOutput {
            derived: DerivedFields {
                data_quality: Some(DataQualityTier::from_accuracy(update.accuracy)),
                ..DerivedFields::default()
            },
            ..AnalyticsOutput::default()
        };

        if let Some(prev) = previous {
            self.derive_motion(update, prev, &mut out);
        }

        match route {
            Some(stops) if !stops.is_empty() => self.derive_route(update, stops, &mut out),
            // No assigned route: adherence fields stay None, not false
            _ => {}
        }

        self.emit_point_candidates(update, &mut out);
        out
    }

    fn derive_motion(&self, update: &GpsUpdate, prev: &LocationRecord, out: &mut AnalyticsOutput) {
        let distance_km = haversine_km(
            prev.latitude,
            prev.longitude,
            update.latitude,
            update.longitude,
        );
        out.derived.distance_from_previous_km = Some(distance_km);
        out.bearing_deg = Some(bearing_deg(
            prev.latitude,
            prev.longitude,
            update.latitude,
            update.longitude,
        ));

        let dt_hours = (update.captured_at - prev.captured_at).num_milliseconds() as f64
            / 3_600_000.0;
        if dt_hours > 0.0 {
            let calculated = distance_km / dt_hours;
            out.derived.calculated_speed_kmh = Some(calculated);
            if let Some(reported) = update.speed {
                let diff = (reported - calculated).abs();
                out.derived.speed_difference = Some(diff);
                out.derived.is_speed_accurate = Some(diff < 10.0);
            }
        }
    }

    fn derive_route(&self, update: &GpsUpdate, stops: &[RouteStop], out: &mut AnalyticsOutput) {
        // Distance to every stop; the minimum decides adherence
        let mut nearest: Option<(&RouteStop, f64)> = None;
        for stop in stops {
            let dist_m =
                haversine_km(update.latitude, update.longitude, stop.lat, stop.lng) * 1000.0;

            if dist_m <= self.config.geofence_radius_m {
                out.geofence_events.push(GeofenceEvent {
                    stop_id: stop.stop_id.clone(),
                    stop_name: stop.name.clone(),
                    distance_m: dist_m,
                    event: "entered".to_string(),
                });
            }

            match nearest {
                Some((_, best)) if best <= dist_m => {}
                _ => nearest = Some((stop, dist_m)),
            }
        }

        let Some((nearest_stop, min_dist_m)) = nearest else {
            return;
        };
        out.derived.nearest_stop_id = Some(nearest_stop.stop_id.clone());
        out.derived.nearest_stop_distance_m = Some(min_dist_m);
        out.derived.is_on_route = Some(min_dist_m < self.config.route_adherence_m);

        self.derive_etas(update, stops, nearest_stop.stop_order, out);
    }

    /// Cumulative ETAs: the leg to the first upcoming stop starts at the
    /// vehicle, subsequent legs run stop to stop.
    fn derive_etas(
        &self,
        update: &GpsUpdate,
        stops: &[RouteStop],
        progress_order: i64,
        out: &mut AnalyticsOutput,
    ) {
        let effective_speed = match update.speed {
            Some(s) if s > 0.0 => s,
            _ => self.config.cruising_speed_kmh,
        };

        let mut upcoming: Vec<&RouteStop> = stops
            .iter()
            .filter(|s| s.stop_order > progress_order)
            .collect();
        upcoming.sort_by_key(|s| s.stop_order);

        let mut cumulative_km = 0.0;
        let mut from = (update.latitude, update.longitude);
        for stop in upcoming {
            let leg_km = haversine_km(from.0, from.1, stop.lat, stop.lng);
            cumulative_km += leg_km;
            out.etas.push(StopEta {
                stop_id: stop.stop_id.clone(),
                stop_name: stop.name.clone(),
                stop_order: stop.stop_order,
                distance_km: cumulative_km,
                eta_minutes: cumulative_km / effective_speed * 60.0,
            });
            from = (stop.lat, stop.lng);
        }
    }

    fn emit_point_candidates(&self, update: &GpsUpdate, out: &mut AnalyticsOutput) {
        if let Some(speed) = update.speed {
            if speed > self.config.speeding_kmh {
                out.candidates.push(AlertCandidate::new(
                    update.vehicle_id.clone(),
                    AlertType::Speeding,
                    AlertSeverity::High,
                    json!({
                        "reported_speed_kmh": speed,
                        "limit_kmh": self.config.speeding_kmh,
                        "latitude": update.latitude,
                        "longitude": update.longitude,
                    }),
                ));
            }
        }

        if let (Some(false), Some(dist_m)) = (
            out.derived.is_on_route,
            out.derived.nearest_stop_distance_m,
        ) {
            if dist_m > self.config.route_deviation_m {
                out.candidates.push(AlertCandidate::new(
                    update.vehicle_id.clone(),
                    AlertType::RouteDeviation,
                    AlertSeverity::Medium,
                    json!({
                        "nearest_stop_id": out.derived.nearest_stop_id,
                        "distance_from_route_m": dist_m,
                    }),
                ));
            }
        }

        if let Some(accuracy) = update.accuracy {
            if accuracy > self.config.low_signal_accuracy_m {
                out.candidates.push(AlertCandidate::new(
                    update.vehicle_id.clone(),
                    AlertType::LowSignal,
                    AlertSeverity::Low,
                    json!({ "accuracy_m": accuracy }),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Channel;
    use chrono::{Duration, Utc};

    fn fix(lat: f64, lng: f64, speed: Option<f64>) -> GpsUpdate {
        GpsUpdate {
            vehicle_id: "BUS001".into(),
            latitude: lat,
            longitude: lng,
            speed,
            heading: None,
            accuracy: Some(5.0),
            altitude: None,
            captured_at: Utc::now(),
            trip_id: None,
            passenger_counts: None,
            device_info: None,
            channel: Channel::Api,
        }
    }

    fn record(lat: f64, lng: f64, captured_at: chrono::DateTime<Utc>) -> LocationRecord {
        LocationRecord {
            id: 1,
            vehicle_id: "BUS001".into(),
            latitude: lat,
            longitude: lng,
            speed: None,
            heading: None,
            accuracy: None,
            altitude: None,
            captured_at,
            channel: Channel::Api,
            trip_id: None,
            passenger_counts: None,
            device_info: None,
            distance_from_previous_km: None,
            calculated_speed_kmh: None,
            speed_difference: None,
            is_speed_accurate: None,
            is_on_route: None,
            nearest_stop_id: None,
            nearest_stop_distance_m: None,
            data_quality: DataQualityTier::High,
            recorded_at: captured_at,
        }
    }

    fn stop(id: &str, lat: f64, lng: f64, order: i64) -> RouteStop {
        RouteStop {
            route_id: "R1".into(),
            stop_id: id.into(),
            name: None,
            lat,
            lng,
            stop_order: order,
            scheduled_offset_minutes: None,
        }
    }

    fn engine() -> AnalyticsEngine {
        AnalyticsEngine::new(DetectionConfig::default())
    }

    #[test]
    fn test_haversine_zero_and_symmetric() {
        assert_eq!(haversine_km(19.0, 72.8, 19.0, 72.8), 0.0);
        let ab = haversine_km(19.076, 72.8777, 18.5204, 73.8567);
        let ba = haversine_km(18.5204, 73.8567, 19.076, 72.8777);
        assert!((ab - ba).abs() < 1e-9);
    }

    #[test]
    fn test_haversine_mumbai_pune() {
        // Mumbai to Pune is roughly 120-150 km great-circle
        let km = haversine_km(19.076, 72.8777, 18.5204, 73.8567);
        assert!(km > 120.0 && km < 150.0, "got {km}");
    }

    #[test]
    fn test_bearing_cardinal_directions() {
        // Due east along the equator
        let east = bearing_deg(0.0, 0.0, 0.0, 1.0);
        assert!((east - 90.0).abs() < 0.1, "got {east}");
        let north = bearing_deg(0.0, 0.0, 1.0, 0.0);
        assert!(north < 0.1 || north > 359.9, "got {north}");
    }

    #[test]
    fn test_calculated_speed_and_accuracy_flag() {
        let prev = record(19.076, 72.8777, Utc::now() - Duration::hours(2));
        let mut update = fix(18.5204, 73.8567, Some(60.0));
        update.captured_at = prev.captured_at + Duration::hours(2);

        let out = engine().enrich(&update, Some(&prev), None);
        let dist = out.derived.distance_from_previous_km.unwrap();
        let calc = out.derived.calculated_speed_kmh.unwrap();
        assert!((calc - dist / 2.0).abs() < 1e-9);
        // ~60-75 km/h calculated vs 60 reported: flag depends on the gap
        assert_eq!(
            out.derived.is_speed_accurate,
            Some((60.0 - calc).abs() < 10.0)
        );
        assert!(out.bearing_deg.is_some());
    }

    #[test]
    fn test_no_route_means_no_adherence_fields() {
        let out = engine().enrich(&fix(18.97, 72.82, Some(0.0)), None, None);
        assert!(out.derived.is_on_route.is_none());
        assert!(out.derived.nearest_stop_id.is_none());
        assert!(out.etas.is_empty());
        assert!(out.candidates.is_empty());
    }

    #[test]
    fn test_on_route_within_threshold() {
        let stops = vec![stop("S1", 18.97, 72.82, 1), stop("S2", 19.05, 72.9, 2)];
        // Right on top of S1
        let out = engine().enrich(&fix(18.9701, 72.8201, Some(10.0)), None, Some(&stops));
        assert_eq!(out.derived.is_on_route, Some(true));
        assert_eq!(out.derived.nearest_stop_id.as_deref(), Some("S1"));
        // Inside the 100 m geofence too
        assert_eq!(out.geofence_events.len(), 1);
        assert_eq!(out.geofence_events[0].stop_id, "S1");
        assert_eq!(out.geofence_events[0].event, "entered");
    }

    #[test]
    fn test_far_off_route_emits_deviation_candidate() {
        let stops = vec![stop("S1", 18.97, 72.82, 1)];
        // ~11 km away from the only stop
        let out = engine().enrich(&fix(19.07, 72.82, Some(10.0)), None, Some(&stops));
        assert_eq!(out.derived.is_on_route, Some(false));
        let deviation: Vec<_> = out
            .candidates
            .iter()
            .filter(|c| c.alert_type == AlertType::RouteDeviation)
            .collect();
        assert_eq!(deviation.len(), 1);
        assert_eq!(deviation[0].severity, AlertSeverity::Medium);
    }

    #[test]
    fn test_etas_are_cumulative_in_route_order() {
        let stops = vec![
            stop("S1", 18.97, 72.82, 1),
            stop("S2", 19.00, 72.85, 2),
            stop("S3", 19.03, 72.88, 3),
        ];
        // Near S1, moving at 30 km/h
        let out = engine().enrich(&fix(18.9702, 72.8203, Some(30.0)), None, Some(&stops));
        assert_eq!(out.etas.len(), 2);
        assert_eq!(out.etas[0].stop_id, "S2");
        assert_eq!(out.etas[1].stop_id, "S3");
        // Cumulative: S3 distance = S2 distance + S2->S3 leg
        let leg = haversine_km(19.00, 72.85, 19.03, 72.88);
        assert!((out.etas[1].distance_km - (out.etas[0].distance_km + leg)).abs() < 1e-9);
        assert!(out.etas[1].eta_minutes > out.etas[0].eta_minutes);
    }

    #[test]
    fn test_eta_uses_cruising_default_when_stopped() {
        let stops = vec![stop("S1", 18.97, 72.82, 1), stop("S2", 19.00, 72.85, 2)];
        let out = engine().enrich(&fix(18.9702, 72.8203, Some(0.0)), None, Some(&stops));
        let eta = &out.etas[0];
        // 30 km/h default cruising speed
        assert!((eta.eta_minutes - eta.distance_km / 30.0 * 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_speeding_candidate_severity_high() {
        let out = engine().enrich(&fix(18.97, 72.82, Some(75.0)), None, None);
        let speeding: Vec<_> = out
            .candidates
            .iter()
            .filter(|c| c.alert_type == AlertType::Speeding)
            .collect();
        assert_eq!(speeding.len(), 1);
        assert_eq!(speeding[0].severity, AlertSeverity::High);
        assert_eq!(speeding[0].evidence["reported_speed_kmh"], 75.0);
    }

    #[test]
    fn test_low_signal_candidate() {
        let mut update = fix(18.97, 72.82, Some(10.0));
        update.accuracy = Some(80.0);
        let out = engine().enrich(&update, None, None);
        assert!(out
            .candidates
            .iter()
            .any(|c| c.alert_type == AlertType::LowSignal && c.severity == AlertSeverity::Low));
        assert_eq!(out.derived.data_quality, Some(DataQualityTier::Low));
    }
}

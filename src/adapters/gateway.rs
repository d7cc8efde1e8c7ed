//! Bridging-gateway JSON envelope for SMS-only devices.
//!
//! The gateway hardware has gone through several firmware generations, so
//! field names are normalized across historical aliases; the first non-empty
//! alias wins.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{freetext, timestamp_or_now, AdapterError, AdapterOutcome};
use crate::models::{Channel, GpsUpdate};

const LAT_ALIASES: &[&str] = &["lat", "latitude"];
const LNG_ALIASES: &[&str] = &["lng", "long", "longitude"];
const SPEED_ALIASES: &[&str] = &["speed", "velocity"];
const HEADING_ALIASES: &[&str] = &["heading", "bearing"];
const TIMESTAMP_ALIASES: &[&str] = &["timestamp", "time", "ts"];
const VEHICLE_ALIASES: &[&str] = &["vehicle_id", "vehicleId", "device_id"];

/// Decode one gateway envelope.
///
/// The pre-shared key is verified before the body is looked at; a bad key
/// must never reveal whether the payload would have parsed.
pub fn parse(
    provided_key: Option<&str>,
    expected_key: &str,
    body: &Value,
) -> Result<AdapterOutcome, AdapterError> {
    match provided_key {
        Some(key) if key == expected_key => {}
        _ => return Err(AdapterError::Unauthorized),
    }

    Ok(parse_envelope(body))
}

fn parse_envelope(body: &Value) -> AdapterOutcome {
    match body.get("type").and_then(Value::as_str) {
        Some("test") => AdapterOutcome::TestPing,
        Some("passenger_query") => {
            let text = first_string(body, &["query", "text", "body"]).unwrap_or_default();
            match freetext::parse(&text) {
                AdapterOutcome::Query(query) => AdapterOutcome::Query(query),
                _ => AdapterOutcome::Rejected("unrecognized"),
            }
        }
        Some("sms_raw") => {
            // Raw SMS forwarded by the gateway; same grammar as the
            // telephony channel.
            let text = first_string(body, &["body", "message", "text"]).unwrap_or_default();
            freetext::parse(&text)
        }
        Some(_) => AdapterOutcome::Rejected("unknown_type"),
        // No discriminator: implicit GPS fields
        None => parse_implicit_gps(body),
    }
}

fn parse_implicit_gps(body: &Value) -> AdapterOutcome {
    let Some(vehicle_id) = first_string(body, VEHICLE_ALIASES) else {
        return AdapterOutcome::Rejected("missing_vehicle_id");
    };
    let (Some(latitude), Some(longitude)) =
        (first_number(body, LAT_ALIASES), first_number(body, LNG_ALIASES))
    else {
        return AdapterOutcome::Rejected("missing_coordinates");
    };

    let raw_ts = TIMESTAMP_ALIASES
        .iter()
        .find_map(|key| body.get(*key))
        .cloned()
        .unwrap_or(Value::Null);
    let captured_at = if raw_ts.is_null() {
        Utc::now()
    } else {
        timestamp_or_now(
            parse_timestamp(&raw_ts),
            &raw_ts.to_string(),
            Channel::Gateway,
        )
    };

    AdapterOutcome::Gps(GpsUpdate {
        vehicle_id,
        latitude,
        longitude,
        speed: first_number(body, SPEED_ALIASES),
        heading: first_number(body, HEADING_ALIASES),
        accuracy: first_number(body, &["accuracy", "acc"]),
        altitude: first_number(body, &["altitude", "alt"]),
        captured_at,
        trip_id: first_string(body, &["trip_id", "tripId"]),
        passenger_counts: None,
        device_info: first_string(body, &["device_info", "device"]),
        channel: Channel::Gateway,
    })
}

/// First alias with a non-empty string value.
fn first_string(body: &Value, aliases: &[&str]) -> Option<String> {
    aliases
        .iter()
        .filter_map(|key| body.get(*key))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// First alias carrying a finite number; numeric strings also count since
/// some firmwares quote everything.
fn first_number(body: &Value, aliases: &[&str]) -> Option<f64> {
    aliases
        .iter()
        .filter_map(|key| body.get(*key))
        .find_map(|value| match value {
            Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
            Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            _ => None,
        })
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let epoch = n.as_i64()?;
            if epoch >= 1_000_000_000_000 {
                DateTime::from_timestamp_millis(epoch)
            } else {
                DateTime::from_timestamp(epoch, 0)
            }
        }
        Value::String(s) => {
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.with_timezone(&Utc));
            }
            let epoch: i64 = s.trim().parse().ok()?;
            if epoch >= 1_000_000_000_000 {
                DateTime::from_timestamp_millis(epoch)
            } else {
                DateTime::from_timestamp(epoch, 0)
            }
        }
        _ => None,
    }
}

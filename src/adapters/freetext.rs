//! Free-text message grammar for the telephony channel.
//!
//! Rules are tried strictly in order and parsing stops at the first match:
//! 1. `GPS:<vehicleId>,<lat>,<lng>,<speed>,<heading>,<epochMillis>`
//! 2. `VTS:<vehicleId>:<driverId>:<lat>:<lng>:<accuracy>:<dd-mm-yyyy hh:mm:ss>`
//! 3. `<token>:<lat>,<lng>` shorthand
//! 4. passenger queries (`BUS <id>`, `ROUTE <...>`, `NEAREST <place>`, `HELP`)

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use std::sync::OnceLock;

use super::{timestamp_or_now, AdapterOutcome};
use crate::models::{Channel, GpsUpdate, PassengerQuery};

/// Vendor tracker format, e.g.
/// `VTS:BUS001:DRV17:18.9696:72.8194:12:13-09-2023 14:30:25`
fn vendor_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^VTS:([A-Za-z0-9_-]+):([A-Za-z0-9_-]+):(-?[0-9.]+):(-?[0-9.]+):([0-9.]+):(.+)$",
        )
        .expect("vendor regex is valid")
    })
}

/// Parse one inbound message body. Never panics on untrusted text.
pub fn parse(body: &str) -> AdapterOutcome {
    let text = body.trim();
    if text.is_empty() {
        return AdapterOutcome::Rejected("unrecognized");
    }

    if let Some(rest) = strip_prefix_ci(text, "GPS:") {
        return parse_gps_csv(rest);
    }
    if strip_prefix_ci(text, "VTS:").is_some() {
        return parse_vendor(text);
    }
    if let Some(outcome) = parse_shorthand(text) {
        return outcome;
    }
    if let Some(query) = parse_passenger_query(text) {
        return AdapterOutcome::Query(query);
    }

    AdapterOutcome::Rejected("unrecognized")
}

fn strip_prefix_ci<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    // get() returns None when the cut would fall inside a multi-byte char,
    // so arbitrary message bodies can never slice-panic here
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        text.get(prefix.len()..)
    } else {
        None
    }
}

/// Rule 1: explicit comma-delimited driver format.
fn parse_gps_csv(rest: &str) -> AdapterOutcome {
    let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
    if parts.len() != 6 {
        return AdapterOutcome::Rejected("malformed_gps");
    }

    let vehicle_id = parts[0];
    if vehicle_id.is_empty() {
        return AdapterOutcome::Rejected("missing_vehicle_id");
    }
    let (Ok(latitude), Ok(longitude)) = (parts[1].parse::<f64>(), parts[2].parse::<f64>()) else {
        return AdapterOutcome::Rejected("malformed_gps");
    };
    let speed = parts[3].parse::<f64>().ok();
    let heading = parts[4].parse::<f64>().ok();
    let captured_at = timestamp_or_now(parse_epoch(parts[5]), parts[5], Channel::Sms);

    AdapterOutcome::Gps(GpsUpdate {
        vehicle_id: vehicle_id.to_string(),
        latitude,
        longitude,
        speed,
        heading,
        accuracy: None,
        altitude: None,
        captured_at,
        trip_id: None,
        passenger_counts: None,
        device_info: None,
        channel: Channel::Sms,
    })
}

/// Epoch timestamps arrive in milliseconds, but older firmware sends seconds.
fn parse_epoch(raw: &str) -> Option<DateTime<Utc>> {
    let value: i64 = raw.parse().ok()?;
    if value <= 0 {
        return None;
    }
    if value >= 1_000_000_000_000 {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}

/// Rule 2: vendor colon-delimited format with a human-readable timestamp.
fn parse_vendor(text: &str) -> AdapterOutcome {
    let Some(caps) = vendor_regex().captures(text) else {
        return AdapterOutcome::Rejected("malformed_vendor");
    };

    let (Ok(latitude), Ok(longitude)) = (caps[3].parse::<f64>(), caps[4].parse::<f64>()) else {
        return AdapterOutcome::Rejected("malformed_vendor");
    };
    let accuracy = caps[5].parse::<f64>().ok();
    let raw_ts = caps[6].trim();
    let parsed = NaiveDateTime::parse_from_str(raw_ts, "%d-%m-%Y %H:%M:%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive));
    let captured_at = timestamp_or_now(parsed, raw_ts, Channel::Sms);

    AdapterOutcome::Gps(GpsUpdate {
        vehicle_id: caps[1].to_string(),
        latitude,
        longitude,
        speed: None,
        heading: None,
        accuracy,
        altitude: None,
        captured_at,
        trip_id: None,
        passenger_counts: None,
        device_info: Some(format!("vts driver={}", &caps[2])),
        channel: Channel::Sms,
    })
}

/// Rule 3: bare `<token>:<lat>,<lng>` shorthand.
///
/// Returns None (rather than Rejected) when the shape does not apply at all,
/// so later rules still get a chance.
fn parse_shorthand(text: &str) -> Option<AdapterOutcome> {
    let (token, coords) = text.split_once(':')?;
    let token = token.trim();
    let (lat_raw, lng_raw) = coords.split_once(',')?;
    if token.is_empty() || token.contains(char::is_whitespace) {
        return None;
    }
    let latitude = lat_raw.trim().parse::<f64>().ok()?;
    let longitude = lng_raw.trim().parse::<f64>().ok()?;

    Some(AdapterOutcome::Gps(GpsUpdate {
        vehicle_id: token.to_string(),
        latitude,
        longitude,
        speed: None,
        heading: None,
        accuracy: None,
        altitude: None,
        captured_at: Utc::now(),
        trip_id: None,
        passenger_counts: None,
        device_info: None,
        channel: Channel::Sms,
    }))
}

/// Rule 4: passenger query grammar.
fn parse_passenger_query(text: &str) -> Option<PassengerQuery> {
    let upper = text.to_uppercase();
    if upper == "HELP" {
        return Some(PassengerQuery::Help);
    }
    if let Some(rest) = upper.strip_prefix("BUS ") {
        let id = rest.trim();
        if !id.is_empty() {
            return Some(PassengerQuery::BusStatus {
                vehicle_id: id.to_string(),
            });
        }
    }
    if let Some(rest) = upper.strip_prefix("ROUTE ") {
        let query = rest.trim();
        if !query.is_empty() {
            return Some(PassengerQuery::RouteInfo {
                query: query.to_string(),
            });
        }
    }
    if let Some(rest) = upper.strip_prefix("NEAREST ") {
        let place = rest.trim();
        if !place.is_empty() {
            return Some(PassengerQuery::Nearest {
                place: place.to_string(),
            });
        }
    }
    None
}

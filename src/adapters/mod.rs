pub mod freetext;
pub mod gateway;
pub mod structured;

use chrono::{DateTime, Utc};

use crate::models::{Channel, GpsUpdate, PassengerQuery};

/// What a channel adapter made of one inbound payload.
///
/// Closed set: adding a new wire shape means adding a variant here and
/// handling it everywhere the compiler points at.
#[derive(Debug, Clone)]
pub enum AdapterOutcome {
    Gps(GpsUpdate),
    Query(PassengerQuery),
    /// Gateway connectivity test, acknowledged but otherwise ignored
    TestPing,
    /// Payload understood as malformed; the reason is a stable code
    Rejected(&'static str),
}

/// Authorization failures are not parse failures and must short-circuit
/// before any payload inspection.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("missing or invalid gateway key")]
    Unauthorized,
}

/// Fall back to the server clock when a device timestamp is malformed.
///
/// A bad timestamp must not fail the whole update; the fix is still worth
/// keeping.
pub(crate) fn timestamp_or_now(
    parsed: Option<DateTime<Utc>>,
    raw: &str,
    channel: Channel,
) -> DateTime<Utc> {
    match parsed {
        Some(ts) => ts,
        None => {
            tracing::warn!(
                channel = channel.as_str(),
                raw,
                "Malformed timestamp, falling back to now"
            );
            Utc::now()
        }
    }
}

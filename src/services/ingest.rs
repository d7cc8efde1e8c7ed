//! Ingestion normalizer: range validation, vehicle resolution, per-vehicle
//! timestamp dedup, commit, and synchronous analytics. The caller's success
//! response implies analytics already ran against the fix.

use tracing::{info, warn};

use super::alerts::AlertManager;
use super::analytics::{AnalyticsEngine, GeofenceEvent, StopEta};
use super::outbox::{emit, EventSender, OutboundEvent};
use super::store::{fmt_ts, LocationStore, StoreError};
use super::vehicles::{FixDecision, VehicleRegistry};
use crate::models::{GpsUpdate, LocationRecord, VehicleStatus};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Invalid {0}")]
    Invalid(&'static str),
    #[error("Vehicle not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of one accepted-or-skipped update.
///
/// `Deduped` is a success from the caller's perspective: idempotent retries
/// and slower channels must not see an error.
#[derive(Debug)]
pub enum IngestOutcome {
    Accepted(Box<AcceptedFix>),
    Deduped,
}

#[derive(Debug)]
pub struct AcceptedFix {
    pub record: LocationRecord,
    pub bearing_deg: Option<f64>,
    pub geofence_events: Vec<GeofenceEvent>,
    pub etas: Vec<StopEta>,
}

#[derive(Clone)]
pub struct IngestService {
    registry: VehicleRegistry,
    locations: LocationStore,
    analytics: AnalyticsEngine,
    alerts: AlertManager,
    events: EventSender,
}

impl IngestService {
    pub fn new(
        registry: VehicleRegistry,
        locations: LocationStore,
        analytics: AnalyticsEngine,
        alerts: AlertManager,
        events: EventSender,
    ) -> Self {
        Self {
            registry,
            locations,
            analytics,
            alerts,
            events,
        }
    }

    /// Normalize and commit one fix from any channel.
    pub async fn process(&self, mut update: GpsUpdate) -> Result<IngestOutcome, IngestError> {
        validate_ranges(&update)?;

        // Vehicle ids are case-insensitive on the wire
        update.vehicle_id = update.vehicle_id.trim().to_uppercase();

        let vehicle = self
            .registry
            .get(&update.vehicle_id)
            .await?
            .ok_or_else(|| IngestError::NotFound(update.vehicle_id.clone()))?;

        // Prior record fetched before the dedup commit so analytics sees the
        // state this fix is being compared against
        let previous = self.locations.latest(&update.vehicle_id).await?;

        let decision = self.registry.commit_fix(&vehicle, &update).await?;
        let previous_status = match decision {
            FixDecision::Accepted { previous_status } => previous_status,
            FixDecision::Stale => {
                info!(
                    vehicle = %update.vehicle_id,
                    channel = update.channel.as_str(),
                    captured_at = %fmt_ts(update.captured_at),
                    "Fix deduped (not newer than cached last update)"
                );
                return Ok(IngestOutcome::Deduped);
            }
        };

        let route_stops = match &vehicle.route_id {
            Some(route_id) => Some(self.registry.route_stops(route_id).await?),
            None => None,
        };

        let analytics = self.analytics.enrich(
            &update,
            previous.as_ref(),
            route_stops.as_deref(),
        );

        // The dedup cache advanced when the fix was accepted; if the record
        // cannot be persisted the cache must move back too, or the device's
        // retry would be swallowed as a duplicate.
        let record = match self.locations.insert(&update, &analytics.derived).await {
            Ok(record) => record,
            Err(e) => {
                if let Err(rollback_err) = self
                    .registry
                    .rollback_fix(&vehicle, &update, previous_status)
                    .await
                {
                    warn!(
                        vehicle = %update.vehicle_id,
                        error = %rollback_err,
                        "Failed to roll back dedup state after storage error"
                    );
                }
                return Err(e.into());
            }
        };

        // Point-in-time candidates; a failed promotion must not fail the fix
        for candidate in &analytics.candidates {
            if let Err(e) = self.alerts.create_from_candidate(candidate).await {
                warn!(
                    vehicle = %candidate.vehicle_id,
                    alert_type = candidate.alert_type.as_str(),
                    error = %e,
                    "Failed to promote alert candidate"
                );
            }
        }

        emit(
            &self.events,
            OutboundEvent::LocationUpdate {
                vehicle_id: record.vehicle_id.clone(),
                latitude: record.latitude,
                longitude: record.longitude,
                speed: record.speed,
                captured_at: fmt_ts(record.captured_at),
            },
        );
        if previous_status != VehicleStatus::Running {
            if let Some(trip_id) = &record.trip_id {
                emit(
                    &self.events,
                    OutboundEvent::TripStarted {
                        vehicle_id: record.vehicle_id.clone(),
                        trip_id: trip_id.clone(),
                    },
                );
            }
        }

        Ok(IngestOutcome::Accepted(Box::new(AcceptedFix {
            record,
            bearing_deg: analytics.bearing_deg,
            geofence_events: analytics.geofence_events,
            etas: analytics.etas,
        })))
    }
}

fn validate_ranges(update: &GpsUpdate) -> Result<(), IngestError> {
    if !(-90.0..=90.0).contains(&update.latitude) {
        return Err(IngestError::Invalid("latitude"));
    }
    if !(-180.0..=180.0).contains(&update.longitude) {
        return Err(IngestError::Invalid("longitude"));
    }
    if let Some(speed) = update.speed {
        if !(0.0..=200.0).contains(&speed) {
            return Err(IngestError::Invalid("speed"));
        }
    }
    if let Some(heading) = update.heading {
        if !(0.0..=360.0).contains(&heading) {
            return Err(IngestError::Invalid("heading"));
        }
    }
    Ok(())
}

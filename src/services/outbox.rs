//! Outbound event fan-out, modeled as an explicit outbox.
//!
//! Producers append events to a local channel and move on; a background
//! consumer drains it, re-broadcasts in-process, and best-effort POSTs to an
//! optional webhook with a bounded timeout. Ingestion latency and
//! correctness never depend on delivery.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::models::{Alert, AlertSeverity};

/// Timeout for one webhook delivery attempt. A slow downstream must never
/// back up the queue for long.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Events this core publishes to the external notification collaborator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum OutboundEvent {
    LocationUpdate {
        vehicle_id: String,
        latitude: f64,
        longitude: f64,
        speed: Option<f64>,
        captured_at: String,
    },
    CriticalAlert {
        alert: Alert,
    },
    AlertAcknowledged {
        alert_id: String,
        acknowledged_by: String,
    },
    AlertResolved {
        alert_id: String,
        resolved_by: String,
    },
    AlertDismissed {
        alert_id: String,
        reason: Option<String>,
    },
    AlertEscalated {
        alert_id: String,
        escalation_level: i64,
        priority: i64,
    },
    TripStarted {
        vehicle_id: String,
        trip_id: String,
    },
    TripEnded {
        vehicle_id: String,
        trip_id: String,
    },
}

pub type EventSender = mpsc::UnboundedSender<OutboundEvent>;

/// In-process subscription to the drained event stream (diagnostics, tests).
pub type EventBroadcast = broadcast::Sender<OutboundEvent>;

pub struct Outbox {
    tx: EventSender,
    broadcast_tx: EventBroadcast,
}

impl Outbox {
    /// Build the outbox and spawn its consumer task.
    pub fn start(webhook_url: Option<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (broadcast_tx, _) = broadcast::channel(64);

        let consumer_broadcast = broadcast_tx.clone();
        tokio::spawn(async move {
            consume(rx, consumer_broadcast, webhook_url).await;
        });

        Self { tx, broadcast_tx }
    }

    pub fn sender(&self) -> EventSender {
        self.tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundEvent> {
        self.broadcast_tx.subscribe()
    }
}

/// Push an event, ignoring a closed channel (shutdown in progress).
pub fn emit(tx: &EventSender, event: OutboundEvent) {
    let _ = tx.send(event);
}

/// True when an alert should fan out as a critical notification.
pub fn is_critical(severity: AlertSeverity) -> bool {
    severity == AlertSeverity::Critical
}

async fn consume(
    mut rx: mpsc::UnboundedReceiver<OutboundEvent>,
    broadcast_tx: EventBroadcast,
    webhook_url: Option<String>,
) {
    let client = reqwest::Client::new();

    while let Some(event) = rx.recv().await {
        // In-process listeners first; lagging receivers just miss events
        let _ = broadcast_tx.send(event.clone());

        let Some(url) = webhook_url.as_deref() else {
            debug!(event = ?event, "No webhook configured, event dropped after broadcast");
            continue;
        };

        match client
            .post(url)
            .timeout(DELIVERY_TIMEOUT)
            .json(&event)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(status = %response.status(), "Notification webhook rejected event");
            }
            Err(e) => {
                // Logged and swallowed: notification is secondary to ingestion
                warn!(error = %e, "Notification webhook delivery failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_in_process_subscribers() {
        let outbox = Outbox::start(None);
        let mut sub = outbox.subscribe();
        let tx = outbox.sender();

        emit(
            &tx,
            OutboundEvent::TripStarted {
                vehicle_id: "BUS001".into(),
                trip_id: "T1".into(),
            },
        );

        let event = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("broadcast within deadline")
            .expect("channel open");
        match event {
            OutboundEvent::TripStarted { vehicle_id, trip_id } => {
                assert_eq!(vehicle_id, "BUS001");
                assert_eq!(trip_id, "T1");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_emit_ignores_closed_channel() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        // Must not panic
        emit(
            &tx,
            OutboundEvent::TripEnded {
                vehicle_id: "BUS001".into(),
                trip_id: "T1".into(),
            },
        );
    }

    #[test]
    fn test_only_critical_severity_fans_out_as_critical() {
        assert!(is_critical(AlertSeverity::Critical));
        assert!(!is_critical(AlertSeverity::High));
    }
}

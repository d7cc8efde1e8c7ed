use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Kind of incident an alert reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Sos,
    Breakdown,
    Idle,
    StaleData,
    RouteDeviation,
    Speeding,
    LowSignal,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Sos => "sos",
            AlertType::Breakdown => "breakdown",
            AlertType::Idle => "idle",
            AlertType::StaleData => "stale_data",
            AlertType::RouteDeviation => "route_deviation",
            AlertType::Speeding => "speeding",
            AlertType::LowSignal => "low_signal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sos" => Some(AlertType::Sos),
            "breakdown" => Some(AlertType::Breakdown),
            "idle" => Some(AlertType::Idle),
            "stale_data" => Some(AlertType::StaleData),
            "route_deviation" => Some(AlertType::RouteDeviation),
            "speeding" => Some(AlertType::Speeding),
            "low_signal" => Some(AlertType::LowSignal),
            _ => None,
        }
    }

    /// Base priority assigned on creation, 1..=10
    pub fn base_priority(&self) -> i64 {
        match self {
            AlertType::Sos => 10,
            AlertType::Breakdown => 8,
            AlertType::Speeding => 7,
            AlertType::Idle => 6,
            AlertType::StaleData => 5,
            AlertType::RouteDeviation => 5,
            AlertType::LowSignal => 3,
        }
    }

    /// Default severity when the candidate does not carry one
    pub fn default_severity(&self) -> AlertSeverity {
        match self {
            AlertType::Sos | AlertType::Breakdown => AlertSeverity::Critical,
            AlertType::Speeding => AlertSeverity::High,
            AlertType::Idle | AlertType::StaleData | AlertType::RouteDeviation => {
                AlertSeverity::Medium
            }
            AlertType::LowSignal => AlertSeverity::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "critical" => AlertSeverity::Critical,
            "high" => AlertSeverity::High,
            "medium" => AlertSeverity::Medium,
            _ => AlertSeverity::Low,
        }
    }
}

/// Alert lifecycle state.
///
/// Transitions move strictly forward; `Resolved` and `Dismissed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    InProgress,
    Resolved,
    Dismissed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::InProgress => "in_progress",
            AlertStatus::Resolved => "resolved",
            AlertStatus::Dismissed => "dismissed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AlertStatus::Active),
            "acknowledged" => Some(AlertStatus::Acknowledged),
            "in_progress" => Some(AlertStatus::InProgress),
            "resolved" => Some(AlertStatus::Resolved),
            "dismissed" => Some(AlertStatus::Dismissed),
            _ => None,
        }
    }

    /// An open alert still counts against the per-(vehicle, type) dedup rule
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            AlertStatus::Active | AlertStatus::Acknowledged | AlertStatus::InProgress
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AlertStatus::Resolved | AlertStatus::Dismissed)
    }
}

/// Transient detector output; promoted to an [`Alert`] or discarded by the
/// lifecycle manager.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AlertCandidate {
    pub vehicle_id: String,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    /// Free-form supporting facts (measured idle minutes, reported speed, ...)
    pub evidence: serde_json::Value,
}

impl AlertCandidate {
    pub fn new(
        vehicle_id: impl Into<String>,
        alert_type: AlertType,
        severity: AlertSeverity,
        evidence: serde_json::Value,
    ) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            alert_type,
            severity,
            evidence,
        }
    }
}

/// A durable incident record owned by the alert lifecycle manager
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Alert {
    pub id: String,
    pub vehicle_id: String,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    /// 1..=10, raised by escalation
    pub priority: i64,
    pub escalation_level: i64,
    pub opened_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub notes: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution: Option<String>,
    pub action_taken: Option<String>,
    pub dismiss_reason: Option<String>,
    /// Soft-archive flag set by the cleanup sweep for old dismissed alerts
    pub archived: bool,
    pub evidence: serde_json::Value,
}

impl Alert {
    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.opened_at).num_minutes()
    }

    /// Minutes from open to acknowledgement, None while unacknowledged
    pub fn response_time_minutes(&self) -> Option<i64> {
        self.acknowledged_at
            .map(|ack| (ack - self.opened_at).num_minutes())
    }

    /// Minutes from open to resolution, None while unresolved
    pub fn resolution_time_minutes(&self) -> Option<i64> {
        self.resolved_at
            .map(|res| (res - self.opened_at).num_minutes())
    }
}

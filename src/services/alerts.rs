//! Alert lifecycle manager.
//!
//! Owns every `alerts` row: creation with dedup against already-open
//! incidents, the forward-only state machine, escalation, and the cleanup
//! sweep. The check-then-create runs under a mutex so concurrent detector
//! runs cannot double-create.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use super::outbox::{emit, is_critical, EventSender, OutboundEvent};
use super::store::{fmt_ts, parse_ts, StoreError};
use crate::config::DetectionConfig;
use crate::models::{Alert, AlertCandidate, AlertSeverity, AlertStatus, AlertType};

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("Alert not found: {0}")]
    NotFound(String),
    #[error("Alert is already acknowledged")]
    AlreadyAcknowledged,
    #[error("Alert is already resolved")]
    AlreadyResolved,
    #[error("Alert is closed and cannot transition")]
    Closed,
    #[error("Alert is in progress and can only be resolved")]
    InProgress,
    #[error("Resolution description must not be empty")]
    EmptyResolution,
    #[error("Alert was modified concurrently, re-fetch and retry")]
    Conflict,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, FromRow)]
struct AlertRow {
    id: String,
    vehicle_id: String,
    alert_type: String,
    severity: String,
    status: String,
    priority: i64,
    escalation_level: i64,
    opened_at: String,
    acknowledged_at: Option<String>,
    acknowledged_by: Option<String>,
    notes: Option<String>,
    resolved_at: Option<String>,
    resolved_by: Option<String>,
    resolution: Option<String>,
    action_taken: Option<String>,
    dismiss_reason: Option<String>,
    archived: bool,
    evidence: Option<String>,
}

impl From<AlertRow> for Alert {
    fn from(row: AlertRow) -> Self {
        Alert {
            id: row.id,
            vehicle_id: row.vehicle_id,
            alert_type: AlertType::parse(&row.alert_type).unwrap_or(AlertType::Breakdown),
            severity: AlertSeverity::parse(&row.severity),
            status: AlertStatus::parse(&row.status).unwrap_or(AlertStatus::Active),
            priority: row.priority,
            escalation_level: row.escalation_level,
            opened_at: parse_ts(&row.opened_at).unwrap_or_else(Utc::now),
            acknowledged_at: row.acknowledged_at.as_deref().and_then(parse_ts),
            acknowledged_by: row.acknowledged_by,
            notes: row.notes,
            resolved_at: row.resolved_at.as_deref().and_then(parse_ts),
            resolved_by: row.resolved_by,
            resolution: row.resolution,
            action_taken: row.action_taken,
            dismiss_reason: row.dismiss_reason,
            archived: row.archived,
            evidence: row
                .evidence
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or(serde_json::Value::Null),
        }
    }
}

/// Filters for alert listing and history
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub status: Option<AlertStatus>,
    pub alert_type: Option<AlertType>,
    pub vehicle_id: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

/// Aggregate counts for the stats endpoint
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AlertStats {
    pub total: i64,
    pub active: i64,
    pub acknowledged: i64,
    pub in_progress: i64,
    pub resolved: i64,
    pub dismissed: i64,
    pub critical_open: i64,
    pub avg_response_minutes: Option<f64>,
    pub avg_resolution_minutes: Option<f64>,
}

#[derive(Clone)]
pub struct AlertManager {
    pool: SqlitePool,
    config: DetectionConfig,
    events: EventSender,
    /// Serializes the open-alert check with the insert
    create_lock: Arc<Mutex<()>>,
}

impl AlertManager {
    pub fn new(pool: SqlitePool, config: DetectionConfig, events: EventSender) -> Self {
        Self {
            pool,
            config,
            events,
            create_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Promote a candidate to an alert, or discard it as a duplicate.
    ///
    /// Non-SOS: suppressed while an open alert of the same (vehicle, type)
    /// exists, and for a dedup window after the last one was opened even if
    /// it has since closed. SOS: every press is independently actionable and
    /// always creates a new alert.
    pub async fn create_from_candidate(
        &self,
        candidate: &AlertCandidate,
    ) -> Result<Option<Alert>, AlertError> {
        let _guard = self.create_lock.lock().await;

        if candidate.alert_type != AlertType::Sos {
            if self.is_duplicate(candidate).await? {
                info!(
                    vehicle = %candidate.vehicle_id,
                    alert_type = candidate.alert_type.as_str(),
                    "Candidate suppressed as duplicate"
                );
                return Ok(None);
            }
        }

        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            vehicle_id: candidate.vehicle_id.clone(),
            alert_type: candidate.alert_type,
            severity: candidate.severity,
            status: AlertStatus::Active,
            priority: candidate.alert_type.base_priority(),
            escalation_level: 0,
            opened_at: Utc::now(),
            acknowledged_at: None,
            acknowledged_by: None,
            notes: None,
            resolved_at: None,
            resolved_by: None,
            resolution: None,
            action_taken: None,
            dismiss_reason: None,
            archived: false,
            evidence: candidate.evidence.clone(),
        };

        sqlx::query(
            r#"
            INSERT INTO alerts (id, vehicle_id, alert_type, severity, status, priority,
                                escalation_level, opened_at, evidence)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&alert.id)
        .bind(&alert.vehicle_id)
        .bind(alert.alert_type.as_str())
        .bind(alert.severity.as_str())
        .bind(alert.status.as_str())
        .bind(alert.priority)
        .bind(alert.escalation_level)
        .bind(fmt_ts(alert.opened_at))
        .bind(alert.evidence.to_string())
        .execute(&self.pool)
        .await?;

        info!(
            alert = %alert.id,
            vehicle = %alert.vehicle_id,
            alert_type = alert.alert_type.as_str(),
            severity = alert.severity.as_str(),
            "Alert created"
        );

        if is_critical(alert.severity) {
            emit(
                &self.events,
                OutboundEvent::CriticalAlert {
                    alert: alert.clone(),
                },
            );
        }

        Ok(Some(alert))
    }

    async fn is_duplicate(&self, candidate: &AlertCandidate) -> Result<bool, AlertError> {
        // Any still-open alert of this type keeps the uniqueness invariant
        let (open_count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM alerts
            WHERE vehicle_id = ? AND alert_type = ?
              AND status IN ('active', 'acknowledged', 'in_progress')
            "#,
        )
        .bind(&candidate.vehicle_id)
        .bind(candidate.alert_type.as_str())
        .fetch_one(&self.pool)
        .await?;
        if open_count > 0 {
            return Ok(true);
        }

        // Recently opened (possibly already closed) alerts suppress repeats
        // within the dedup window
        let window_start = Utc::now() - Duration::minutes(self.config.alert_dedup_minutes);
        let (recent_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM alerts WHERE vehicle_id = ? AND alert_type = ? AND opened_at >= ?",
        )
        .bind(&candidate.vehicle_id)
        .bind(candidate.alert_type.as_str())
        .bind(fmt_ts(window_start))
        .fetch_one(&self.pool)
        .await?;
        Ok(recent_count > 0)
    }

    pub async fn get(&self, id: &str) -> Result<Alert, AlertError> {
        let row: Option<AlertRow> = sqlx::query_as("SELECT * FROM alerts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Alert::from)
            .ok_or_else(|| AlertError::NotFound(id.to_string()))
    }

    /// `active -> acknowledged`
    pub async fn acknowledge(
        &self,
        id: &str,
        acknowledged_by: &str,
        notes: Option<&str>,
    ) -> Result<Alert, AlertError> {
        let alert = self.get(id).await?;
        match alert.status {
            AlertStatus::Active => {}
            AlertStatus::Acknowledged | AlertStatus::InProgress => {
                return Err(AlertError::AlreadyAcknowledged)
            }
            AlertStatus::Resolved => return Err(AlertError::AlreadyResolved),
            AlertStatus::Dismissed => return Err(AlertError::Closed),
        }

        let result = sqlx::query(
            r#"
            UPDATE alerts
            SET status = 'acknowledged', acknowledged_at = ?, acknowledged_by = ?, notes = ?
            WHERE id = ? AND status = 'active'
            "#,
        )
        .bind(fmt_ts(Utc::now()))
        .bind(acknowledged_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AlertError::Conflict);
        }

        emit(
            &self.events,
            OutboundEvent::AlertAcknowledged {
                alert_id: id.to_string(),
                acknowledged_by: acknowledged_by.to_string(),
            },
        );
        self.get(id).await
    }

    /// `acknowledged -> in_progress`
    pub async fn start_progress(&self, id: &str) -> Result<Alert, AlertError> {
        let alert = self.get(id).await?;
        match alert.status {
            AlertStatus::Acknowledged => {}
            AlertStatus::Active => return Err(AlertError::Conflict),
            AlertStatus::InProgress => return Err(AlertError::InProgress),
            AlertStatus::Resolved => return Err(AlertError::AlreadyResolved),
            AlertStatus::Dismissed => return Err(AlertError::Closed),
        }

        let result =
            sqlx::query("UPDATE alerts SET status = 'in_progress' WHERE id = ? AND status = 'acknowledged'")
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(AlertError::Conflict);
        }
        self.get(id).await
    }

    /// `{active, acknowledged, in_progress} -> resolved`
    pub async fn resolve(
        &self,
        id: &str,
        resolved_by: &str,
        resolution: &str,
        action_taken: Option<&str>,
    ) -> Result<Alert, AlertError> {
        if resolution.trim().is_empty() {
            return Err(AlertError::EmptyResolution);
        }

        let alert = self.get(id).await?;
        match alert.status {
            AlertStatus::Active | AlertStatus::Acknowledged | AlertStatus::InProgress => {}
            AlertStatus::Resolved => return Err(AlertError::AlreadyResolved),
            AlertStatus::Dismissed => return Err(AlertError::Closed),
        }

        let result = sqlx::query(
            r#"
            UPDATE alerts
            SET status = 'resolved', resolved_at = ?, resolved_by = ?, resolution = ?, action_taken = ?
            WHERE id = ? AND status IN ('active', 'acknowledged', 'in_progress')
            "#,
        )
        .bind(fmt_ts(Utc::now()))
        .bind(resolved_by)
        .bind(resolution)
        .bind(action_taken)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AlertError::Conflict);
        }

        emit(
            &self.events,
            OutboundEvent::AlertResolved {
                alert_id: id.to_string(),
                resolved_by: resolved_by.to_string(),
            },
        );
        self.get(id).await
    }

    /// `{active, acknowledged} -> dismissed`
    pub async fn dismiss(&self, id: &str, reason: Option<&str>) -> Result<Alert, AlertError> {
        let alert = self.get(id).await?;
        match alert.status {
            AlertStatus::Active | AlertStatus::Acknowledged => {}
            AlertStatus::InProgress => return Err(AlertError::InProgress),
            AlertStatus::Resolved => return Err(AlertError::AlreadyResolved),
            AlertStatus::Dismissed => return Err(AlertError::Closed),
        }

        let result = sqlx::query(
            r#"
            UPDATE alerts SET status = 'dismissed', dismiss_reason = ?
            WHERE id = ? AND status IN ('active', 'acknowledged')
            "#,
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AlertError::Conflict);
        }

        emit(
            &self.events,
            OutboundEvent::AlertDismissed {
                alert_id: id.to_string(),
                reason: reason.map(str::to_string),
            },
        );
        self.get(id).await
    }

    /// Escalation sweep: bump every critical, still-active alert that has
    /// waited past the deadline. Status is never changed by escalation.
    pub async fn escalate_due(&self) -> Result<u64, AlertError> {
        let deadline = Utc::now() - Duration::minutes(self.config.escalation_after_minutes);
        let rows: Vec<AlertRow> = sqlx::query_as(
            r#"
            SELECT * FROM alerts
            WHERE severity = 'critical' AND status = 'active'
              AND opened_at <= ? AND escalation_level < ?
            "#,
        )
        .bind(fmt_ts(deadline))
        .bind(self.config.max_escalation_level)
        .fetch_all(&self.pool)
        .await?;

        let mut escalated = 0u64;
        for row in rows {
            let alert: Alert = row.into();
            let new_level = alert.escalation_level + 1;
            let new_priority = (alert.priority + 1).min(10);
            let result = sqlx::query(
                r#"
                UPDATE alerts SET escalation_level = ?, priority = ?
                WHERE id = ? AND status = 'active' AND escalation_level = ?
                "#,
            )
            .bind(new_level)
            .bind(new_priority)
            .bind(&alert.id)
            .bind(alert.escalation_level)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                // Acknowledged or escalated concurrently; skip
                continue;
            }
            escalated += 1;
            info!(
                alert = %alert.id,
                vehicle = %alert.vehicle_id,
                level = new_level,
                priority = new_priority,
                "Alert escalated"
            );
            emit(
                &self.events,
                OutboundEvent::AlertEscalated {
                    alert_id: alert.id,
                    escalation_level: new_level,
                    priority: new_priority,
                },
            );
        }
        Ok(escalated)
    }

    /// Cleanup sweep: hard-delete old resolved alerts, soft-archive old
    /// dismissed ones.
    pub async fn cleanup(&self) -> Result<(u64, u64), AlertError> {
        let cutoff = fmt_ts(Utc::now() - Duration::days(self.config.cleanup_after_days));

        let deleted = sqlx::query(
            "DELETE FROM alerts WHERE status = 'resolved' AND resolved_at IS NOT NULL AND resolved_at < ?",
        )
        .bind(&cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let archived = sqlx::query(
            "UPDATE alerts SET archived = 1 WHERE status = 'dismissed' AND archived = 0 AND opened_at < ?",
        )
        .bind(&cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if deleted > 0 || archived > 0 {
            info!(deleted, archived, "Alert cleanup sweep finished");
        }
        Ok((deleted, archived))
    }

    /// Open and recent alerts, highest priority first.
    pub async fn list(&self, filter: &AlertFilter) -> Result<Vec<Alert>, AlertError> {
        let limit = if filter.limit > 0 { filter.limit } else { 50 };
        let rows: Vec<AlertRow> = sqlx::query_as(
            r#"
            SELECT * FROM alerts
            WHERE archived = 0
              AND (? IS NULL OR status = ?)
              AND (? IS NULL OR alert_type = ?)
              AND (? IS NULL OR vehicle_id = ?)
            ORDER BY priority DESC, opened_at DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.alert_type.map(|t| t.as_str()))
        .bind(filter.alert_type.map(|t| t.as_str()))
        .bind(&filter.vehicle_id)
        .bind(&filter.vehicle_id)
        .bind(limit)
        .bind(filter.offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Alert::from).collect())
    }

    /// Full history, newest first, archived rows included.
    pub async fn history(&self, filter: &AlertFilter) -> Result<Vec<Alert>, AlertError> {
        let limit = if filter.limit > 0 { filter.limit } else { 100 };
        let rows: Vec<AlertRow> = sqlx::query_as(
            r#"
            SELECT * FROM alerts
            WHERE (? IS NULL OR alert_type = ?)
              AND (? IS NULL OR vehicle_id = ?)
            ORDER BY opened_at DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(filter.alert_type.map(|t| t.as_str()))
        .bind(filter.alert_type.map(|t| t.as_str()))
        .bind(&filter.vehicle_id)
        .bind(&filter.vehicle_id)
        .bind(limit)
        .bind(filter.offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Alert::from).collect())
    }

    /// Aggregates over alerts opened at or after `since`.
    pub async fn stats(&self, since: DateTime<Utc>) -> Result<AlertStats, AlertError> {
        let rows: Vec<AlertRow> = sqlx::query_as("SELECT * FROM alerts WHERE opened_at >= ?")
            .bind(fmt_ts(since))
            .fetch_all(&self.pool)
            .await?;
        let alerts: Vec<Alert> = rows.into_iter().map(Alert::from).collect();

        let count_status = |status: AlertStatus| -> i64 {
            alerts.iter().filter(|a| a.status == status).count() as i64
        };
        let response_times: Vec<i64> = alerts
            .iter()
            .filter_map(Alert::response_time_minutes)
            .collect();
        let resolution_times: Vec<i64> = alerts
            .iter()
            .filter_map(Alert::resolution_time_minutes)
            .collect();
        let avg = |values: &[i64]| -> Option<f64> {
            if values.is_empty() {
                None
            } else {
                Some(values.iter().sum::<i64>() as f64 / values.len() as f64)
            }
        };

        Ok(AlertStats {
            total: alerts.len() as i64,
            active: count_status(AlertStatus::Active),
            acknowledged: count_status(AlertStatus::Acknowledged),
            in_progress: count_status(AlertStatus::InProgress),
            resolved: count_status(AlertStatus::Resolved),
            dismissed: count_status(AlertStatus::Dismissed),
            critical_open: alerts
                .iter()
                .filter(|a| a.severity == AlertSeverity::Critical && a.status.is_open())
                .count() as i64,
            avg_response_minutes: avg(&response_times),
            avg_resolution_minutes: avg(&resolution_times),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::test_pool;
    use serde_json::json;

    async fn manager() -> AlertManager {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        AlertManager::new(test_pool().await, DetectionConfig::default(), tx)
    }

    fn candidate(vehicle: &str, alert_type: AlertType) -> AlertCandidate {
        AlertCandidate::new(
            vehicle,
            alert_type,
            alert_type.default_severity(),
            json!({"test": true}),
        )
    }

    #[tokio::test]
    async fn test_create_assigns_base_priority_and_active_status() {
        let manager = manager().await;
        let alert = manager
            .create_from_candidate(&candidate("BUS001", AlertType::Speeding))
            .await
            .unwrap()
            .expect("created");
        assert_eq!(alert.status, AlertStatus::Active);
        assert_eq!(alert.priority, 7);
        assert_eq!(alert.severity, AlertSeverity::High);
        assert_eq!(alert.escalation_level, 0);
    }

    #[tokio::test]
    async fn test_duplicate_open_alert_suppressed() {
        let manager = manager().await;
        let first = manager
            .create_from_candidate(&candidate("BUS001", AlertType::Idle))
            .await
            .unwrap();
        assert!(first.is_some());
        let second = manager
            .create_from_candidate(&candidate("BUS001", AlertType::Idle))
            .await
            .unwrap();
        assert!(second.is_none());
        // Different vehicle or type is unaffected
        assert!(manager
            .create_from_candidate(&candidate("BUS002", AlertType::Idle))
            .await
            .unwrap()
            .is_some());
        assert!(manager
            .create_from_candidate(&candidate("BUS001", AlertType::Speeding))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_sos_always_creates() {
        let manager = manager().await;
        let first = manager
            .create_from_candidate(&candidate("BUS001", AlertType::Sos))
            .await
            .unwrap();
        let second = manager
            .create_from_candidate(&candidate("BUS001", AlertType::Sos))
            .await
            .unwrap();
        assert!(first.is_some());
        assert!(second.is_some());
        assert_ne!(first.unwrap().id, second.unwrap().id);
    }

    #[tokio::test]
    async fn test_concurrent_creates_yield_one_alert() {
        let manager = manager().await;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .create_from_candidate(&candidate("BUS001", AlertType::StaleData))
                    .await
                    .unwrap()
            }));
        }
        let created = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| r.as_ref().unwrap().is_some())
            .count();
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn test_acknowledge_then_reacknowledge_conflicts() {
        let manager = manager().await;
        let alert = manager
            .create_from_candidate(&candidate("BUS001", AlertType::Breakdown))
            .await
            .unwrap()
            .unwrap();

        let acked = manager
            .acknowledge(&alert.id, "op1", Some("looking into it"))
            .await
            .unwrap();
        assert_eq!(acked.status, AlertStatus::Acknowledged);
        assert_eq!(acked.acknowledged_by.as_deref(), Some("op1"));
        assert!(acked.acknowledged_at.is_some());

        assert!(matches!(
            manager.acknowledge(&alert.id, "op2", None).await,
            Err(AlertError::AlreadyAcknowledged)
        ));
    }

    #[tokio::test]
    async fn test_resolve_after_acknowledge_orders_timestamps() {
        let manager = manager().await;
        let alert = manager
            .create_from_candidate(&candidate("BUS001", AlertType::Idle))
            .await
            .unwrap()
            .unwrap();
        manager.acknowledge(&alert.id, "op1", None).await.unwrap();
        let resolved = manager
            .resolve(&alert.id, "op1", "vehicle moving again", Some("called driver"))
            .await
            .unwrap();

        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert!(resolved.acknowledged_at.unwrap() <= resolved.resolved_at.unwrap());
        assert!(resolved.resolution_time_minutes() >= resolved.response_time_minutes());

        assert!(matches!(
            manager.resolve(&alert.id, "op1", "again", None).await,
            Err(AlertError::AlreadyResolved)
        ));
        assert!(matches!(
            manager.acknowledge(&alert.id, "op1", None).await,
            Err(AlertError::AlreadyResolved)
        ));
        assert!(matches!(
            manager.dismiss(&alert.id, None).await,
            Err(AlertError::AlreadyResolved)
        ));
    }

    #[tokio::test]
    async fn test_resolve_requires_description() {
        let manager = manager().await;
        let alert = manager
            .create_from_candidate(&candidate("BUS001", AlertType::Idle))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            manager.resolve(&alert.id, "op1", "   ", None).await,
            Err(AlertError::EmptyResolution)
        ));
    }

    #[tokio::test]
    async fn test_dismiss_is_terminal() {
        let manager = manager().await;
        let alert = manager
            .create_from_candidate(&candidate("BUS001", AlertType::LowSignal))
            .await
            .unwrap()
            .unwrap();
        let dismissed = manager.dismiss(&alert.id, Some("sensor glitch")).await.unwrap();
        assert_eq!(dismissed.status, AlertStatus::Dismissed);
        assert_eq!(dismissed.dismiss_reason.as_deref(), Some("sensor glitch"));

        assert!(matches!(
            manager.resolve(&alert.id, "op1", "done", None).await,
            Err(AlertError::Closed)
        ));
        assert!(matches!(
            manager.acknowledge(&alert.id, "op1", None).await,
            Err(AlertError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_escalation_bumps_level_and_priority() {
        let manager = manager().await;
        let alert = manager
            .create_from_candidate(&candidate("BUS001", AlertType::Sos))
            .await
            .unwrap()
            .unwrap();
        // Backdate past the escalation deadline
        sqlx::query("UPDATE alerts SET opened_at = ? WHERE id = ?")
            .bind(fmt_ts(Utc::now() - Duration::minutes(10)))
            .bind(&alert.id)
            .execute(&manager.pool)
            .await
            .unwrap();

        assert_eq!(manager.escalate_due().await.unwrap(), 1);
        let escalated = manager.get(&alert.id).await.unwrap();
        assert_eq!(escalated.escalation_level, 1);
        // SOS starts at priority 10, stays capped
        assert_eq!(escalated.priority, 10);
        assert_eq!(escalated.status, AlertStatus::Active);
    }

    #[tokio::test]
    async fn test_escalation_stops_at_max_level() {
        let manager = manager().await;
        let alert = manager
            .create_from_candidate(&candidate("BUS001", AlertType::Sos))
            .await
            .unwrap()
            .unwrap();
        sqlx::query("UPDATE alerts SET opened_at = ?, escalation_level = 3 WHERE id = ?")
            .bind(fmt_ts(Utc::now() - Duration::minutes(30)))
            .bind(&alert.id)
            .execute(&manager.pool)
            .await
            .unwrap();
        assert_eq!(manager.escalate_due().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_escalation_skips_acknowledged() {
        let manager = manager().await;
        let alert = manager
            .create_from_candidate(&candidate("BUS001", AlertType::Sos))
            .await
            .unwrap()
            .unwrap();
        sqlx::query("UPDATE alerts SET opened_at = ? WHERE id = ?")
            .bind(fmt_ts(Utc::now() - Duration::minutes(10)))
            .bind(&alert.id)
            .execute(&manager.pool)
            .await
            .unwrap();
        manager.acknowledge(&alert.id, "op1", None).await.unwrap();
        assert_eq!(manager.escalate_due().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_deletes_resolved_and_archives_dismissed() {
        let manager = manager().await;
        let old = fmt_ts(Utc::now() - Duration::days(40));

        let resolved = manager
            .create_from_candidate(&candidate("BUS001", AlertType::Idle))
            .await
            .unwrap()
            .unwrap();
        manager.resolve(&resolved.id, "op", "fixed", None).await.unwrap();
        sqlx::query("UPDATE alerts SET resolved_at = ? WHERE id = ?")
            .bind(&old)
            .bind(&resolved.id)
            .execute(&manager.pool)
            .await
            .unwrap();

        let dismissed = manager
            .create_from_candidate(&candidate("BUS002", AlertType::Idle))
            .await
            .unwrap()
            .unwrap();
        manager.dismiss(&dismissed.id, None).await.unwrap();
        sqlx::query("UPDATE alerts SET opened_at = ? WHERE id = ?")
            .bind(&old)
            .bind(&dismissed.id)
            .execute(&manager.pool)
            .await
            .unwrap();

        let (deleted, archived) = manager.cleanup().await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(archived, 1);

        assert!(matches!(
            manager.get(&resolved.id).await,
            Err(AlertError::NotFound(_))
        ));
        let kept = manager.get(&dismissed.id).await.unwrap();
        assert!(kept.archived);
    }

    #[tokio::test]
    async fn test_list_filters_and_orders_by_priority() {
        let manager = manager().await;
        manager
            .create_from_candidate(&candidate("BUS001", AlertType::LowSignal))
            .await
            .unwrap();
        manager
            .create_from_candidate(&candidate("BUS001", AlertType::Sos))
            .await
            .unwrap();
        manager
            .create_from_candidate(&candidate("BUS002", AlertType::Speeding))
            .await
            .unwrap();

        let all = manager.list(&AlertFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].alert_type, AlertType::Sos);

        let bus1 = manager
            .list(&AlertFilter {
                vehicle_id: Some("BUS001".into()),
                ..AlertFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(bus1.len(), 2);

        let active_only = manager
            .list(&AlertFilter {
                status: Some(AlertStatus::Active),
                ..AlertFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(active_only.len(), 3);
    }

    #[tokio::test]
    async fn test_stats_aggregates() {
        let manager = manager().await;
        let a = manager
            .create_from_candidate(&candidate("BUS001", AlertType::Sos))
            .await
            .unwrap()
            .unwrap();
        manager.acknowledge(&a.id, "op", None).await.unwrap();
        manager
            .create_from_candidate(&candidate("BUS002", AlertType::Idle))
            .await
            .unwrap();

        let stats = manager.stats(Utc::now() - Duration::hours(1)).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.acknowledged, 1);
        assert_eq!(stats.critical_open, 1);
        assert!(stats.avg_response_minutes.is_some());
        assert!(stats.avg_resolution_minutes.is_none());
    }
}

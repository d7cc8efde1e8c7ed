//! Background job scheduler for the anomaly checks and alert sweeps.
//!
//! The scheduler is an explicitly constructed value handed to whoever needs
//! it; there is no global instance. Each job runs on its own tokio task so a
//! slow cleanup sweep never delays the idle check, and a failed iteration is
//! logged and retried on the next tick rather than killing the job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{error, info};
use utoipa::ToSchema;

use crate::config::SchedulerConfig;
use crate::services::alerts::AlertManager;
use crate::services::detector::AnomalyDetector;
use crate::services::store::fmt_ts;

/// Which scheduled check to run on a manual trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    Idle,
    Stale,
    Escalation,
    Cleanup,
    All,
}

/// Result of one manually triggered run.
#[derive(Debug, Default, Serialize, ToSchema)]
pub struct TriggerReport {
    /// Alerts created by the idle check, if it ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_alerts: Option<usize>,
    /// Alerts created by the stale check, if it ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_alerts: Option<usize>,
    /// Alerts escalated by the sweep, if it ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalated: Option<u64>,
    /// (deleted, archived) counts from cleanup, if it ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleaned: Option<(u64, u64)>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct JobStatus {
    pub name: String,
    pub interval_secs: u64,
    pub last_run: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SchedulerStatus {
    pub running: bool,
    pub jobs: Vec<JobStatus>,
}

type LastRuns = Arc<RwLock<HashMap<&'static str, DateTime<Utc>>>>;

pub struct Scheduler {
    detector: AnomalyDetector,
    alerts: AlertManager,
    config: SchedulerConfig,
    last_runs: LastRuns,
    shutdown: watch::Sender<bool>,
    started: std::sync::atomic::AtomicBool,
}

impl Scheduler {
    pub fn new(detector: AnomalyDetector, alerts: AlertManager, config: SchedulerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            detector,
            alerts,
            config,
            last_runs: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
            started: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Spawn one task per job. Safe to call once; jobs run until `stop`.
    pub fn start(&self) {
        self.started
            .store(true, std::sync::atomic::Ordering::SeqCst);

        self.spawn_job("idle_check", self.config.idle_check_secs, {
            let detector = self.detector.clone();
            move || {
                let detector = detector.clone();
                async move { detector.run_idle_check().await.map(|_| ()).map_err(to_log) }
            }
        });
        self.spawn_job("stale_check", self.config.stale_check_secs, {
            let detector = self.detector.clone();
            move || {
                let detector = detector.clone();
                async move { detector.run_stale_check().await.map(|_| ()).map_err(to_log) }
            }
        });
        self.spawn_job("escalation_sweep", self.config.escalation_sweep_secs, {
            let alerts = self.alerts.clone();
            move || {
                let alerts = alerts.clone();
                async move { alerts.escalate_due().await.map(|_| ()).map_err(to_log) }
            }
        });
        self.spawn_job("cleanup_sweep", self.config.cleanup_sweep_secs, {
            let alerts = self.alerts.clone();
            move || {
                let alerts = alerts.clone();
                async move { alerts.cleanup().await.map(|_| ()).map_err(to_log) }
            }
        });

        info!(
            idle_secs = self.config.idle_check_secs,
            stale_secs = self.config.stale_check_secs,
            escalation_secs = self.config.escalation_sweep_secs,
            cleanup_secs = self.config.cleanup_sweep_secs,
            "Scheduler started"
        );
    }

    fn spawn_job<F, Fut>(&self, name: &'static str, interval_secs: u64, job: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), String>> + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        let last_runs = self.last_runs.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so startup is quiet
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = job().await {
                            error!(job = name, error = %e, "Scheduled job failed");
                        }
                        last_runs.write().await.insert(name, Utc::now());
                    }
                    _ = shutdown.changed() => {
                        info!(job = name, "Scheduled job stopped");
                        break;
                    }
                }
            }
        });
    }

    /// Signal every job task to exit.
    pub fn stop(&self) {
        self.started
            .store(false, std::sync::atomic::Ordering::SeqCst);
        let _ = self.shutdown.send(true);
    }

    pub async fn status(&self) -> SchedulerStatus {
        let last_runs = self.last_runs.read().await;
        let job = |name: &'static str, interval_secs: u64| JobStatus {
            name: name.to_string(),
            interval_secs,
            last_run: last_runs.get(name).map(|ts| fmt_ts(*ts)),
        };
        SchedulerStatus {
            running: self.started.load(std::sync::atomic::Ordering::SeqCst),
            jobs: vec![
                job("idle_check", self.config.idle_check_secs),
                job("stale_check", self.config.stale_check_secs),
                job("escalation_sweep", self.config.escalation_sweep_secs),
                job("cleanup_sweep", self.config.cleanup_sweep_secs),
            ],
        }
    }

    /// Run one check (or all of them) immediately, outside the cadence.
    /// Uses the same code paths as the timed jobs, so dedup semantics hold.
    pub async fn trigger(&self, check: CheckType) -> Result<TriggerReport, String> {
        let mut report = TriggerReport::default();

        if matches!(check, CheckType::Idle | CheckType::All) {
            report.idle_alerts = Some(self.detector.run_idle_check().await.map_err(to_log)?);
            self.mark_ran("idle_check").await;
        }
        if matches!(check, CheckType::Stale | CheckType::All) {
            report.stale_alerts = Some(self.detector.run_stale_check().await.map_err(to_log)?);
            self.mark_ran("stale_check").await;
        }
        if matches!(check, CheckType::Escalation | CheckType::All) {
            report.escalated = Some(self.alerts.escalate_due().await.map_err(to_log)?);
            self.mark_ran("escalation_sweep").await;
        }
        if matches!(check, CheckType::Cleanup | CheckType::All) {
            report.cleaned = Some(self.alerts.cleanup().await.map_err(to_log)?);
            self.mark_ran("cleanup_sweep").await;
        }

        info!(check = ?check, report = ?report, "Manual trigger completed");
        Ok(report)
    }

    async fn mark_ran(&self, name: &'static str) {
        self.last_runs.write().await.insert(name, Utc::now());
    }
}

fn to_log<E: std::fmt::Display>(e: E) -> String {
    e.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectionConfig;
    use crate::services::alerts::AlertFilter;
    use crate::services::store::{test_pool, LocationStore};
    use crate::services::vehicles::VehicleRegistry;
    use crate::models::AlertType;

    async fn scheduler() -> (Scheduler, VehicleRegistry, AlertManager, sqlx::SqlitePool) {
        let pool = test_pool().await;
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let registry = VehicleRegistry::new(pool.clone());
        let locations = LocationStore::new(pool.clone());
        let alerts = AlertManager::new(pool.clone(), DetectionConfig::default(), tx);
        let detector = AnomalyDetector::new(
            registry.clone(),
            locations,
            alerts.clone(),
            DetectionConfig::default(),
        );
        (
            Scheduler::new(detector, alerts.clone(), SchedulerConfig::default()),
            registry,
            alerts,
            pool,
        )
    }

    #[tokio::test]
    async fn test_status_reports_all_jobs_before_start() {
        let (scheduler, _registry, _alerts, _pool) = scheduler().await;
        let status = scheduler.status().await;
        assert!(!status.running);
        assert_eq!(status.jobs.len(), 4);
        assert!(status.jobs.iter().all(|j| j.last_run.is_none()));
    }

    #[tokio::test]
    async fn test_start_and_stop_flip_running() {
        let (scheduler, _registry, _alerts, _pool) = scheduler().await;
        scheduler.start();
        assert!(scheduler.status().await.running);
        scheduler.stop();
        assert!(!scheduler.status().await.running);
    }

    #[tokio::test]
    async fn test_manual_trigger_runs_requested_check_only() {
        let (scheduler, registry, alerts, pool) = scheduler().await;
        registry
            .register("BUS001", None, None, Some("DRV1"))
            .await
            .unwrap();
        sqlx::query("UPDATE vehicles SET status = 'running' WHERE id = 'BUS001'")
            .execute(&pool)
            .await
            .unwrap();

        let report = scheduler.trigger(CheckType::Stale).await.unwrap();
        assert_eq!(report.stale_alerts, Some(1));
        assert!(report.idle_alerts.is_none());
        assert!(report.escalated.is_none());
        assert!(report.cleaned.is_none());

        let open = alerts
            .list(&AlertFilter {
                alert_type: Some(AlertType::StaleData),
                ..AlertFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(open.len(), 1);

        let status = scheduler.status().await;
        let stale = status.jobs.iter().find(|j| j.name == "stale_check").unwrap();
        assert!(stale.last_run.is_some());
        let idle = status.jobs.iter().find(|j| j.name == "idle_check").unwrap();
        assert!(idle.last_run.is_none());
    }

    #[tokio::test]
    async fn test_trigger_all_touches_every_job() {
        let (scheduler, _registry, _alerts, _pool) = scheduler().await;
        let report = scheduler.trigger(CheckType::All).await.unwrap();
        assert_eq!(report.idle_alerts, Some(0));
        assert_eq!(report.stale_alerts, Some(0));
        assert_eq!(report.escalated, Some(0));
        assert_eq!(report.cleaned, Some((0, 0)));
        let status = scheduler.status().await;
        assert!(status.jobs.iter().all(|j| j.last_run.is_some()));
    }
}

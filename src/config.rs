use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// SQLite database URL (default: sqlite:database/fleet.db?mode=rwc)
    #[serde(default = "Config::default_database_url")]
    pub database_url: String,
    /// Port the HTTP server binds to (default: 3000)
    #[serde(default = "Config::default_port")]
    pub port: u16,
    /// Allowed CORS origins. Required unless cors_permissive is true.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Explicitly allow all origins (development only). Defaults to false.
    #[serde(default)]
    pub cors_permissive: bool,
    /// Pre-shared key required by the bridging gateway webhook
    pub gateway_key: String,
    /// Optional webhook URL that outbound events are POSTed to
    #[serde(default)]
    pub notification_webhook: Option<String>,
    /// Detection and lifecycle tuning
    #[serde(default)]
    pub detection: DetectionConfig,
    /// Scheduler cadences
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Tunable thresholds for analytics and anomaly detection.
///
/// These are operational knobs, not invariants; the defaults mirror what the
/// fleet has been running with.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    /// History window the idle check looks at (default: 30)
    #[serde(default = "DetectionConfig::default_idle_lookback_minutes")]
    pub idle_lookback_minutes: i64,
    /// A fix must be at least this old to count as stationary evidence (default: 20)
    #[serde(default = "DetectionConfig::default_idle_threshold_minutes")]
    pub idle_threshold_minutes: i64,
    /// Minimum number of stationary fixes before an idle alert (default: 3)
    #[serde(default = "DetectionConfig::default_idle_min_samples")]
    pub idle_min_samples: usize,
    /// Speed at or below which a fix counts as stationary, km/h (default: 2)
    #[serde(default = "DetectionConfig::default_idle_speed_kmh")]
    pub idle_speed_kmh: f64,
    /// Latest-fix age at which telemetry counts as stale, minutes (default: 15)
    #[serde(default = "DetectionConfig::default_stale_threshold_minutes")]
    pub stale_threshold_minutes: i64,
    /// Reported speed above which a speeding candidate fires, km/h (default: 60)
    #[serde(default = "DetectionConfig::default_speeding_kmh")]
    pub speeding_kmh: f64,
    /// Within this distance of the nearest stop a fix is on-route, meters (default: 500)
    #[serde(default = "DetectionConfig::default_route_adherence_m")]
    pub route_adherence_m: f64,
    /// Off-route distance beyond which a deviation candidate fires, meters (default: 1000)
    #[serde(default = "DetectionConfig::default_route_deviation_m")]
    pub route_deviation_m: f64,
    /// Geofence radius around a stop, meters (default: 100)
    #[serde(default = "DetectionConfig::default_geofence_radius_m")]
    pub geofence_radius_m: f64,
    /// Accuracy radius above which a low-signal candidate fires, meters (default: 50)
    #[serde(default = "DetectionConfig::default_low_signal_accuracy_m")]
    pub low_signal_accuracy_m: f64,
    /// Fallback cruising speed for ETA when reported speed is zero, km/h (default: 30)
    #[serde(default = "DetectionConfig::default_cruising_speed_kmh")]
    pub cruising_speed_kmh: f64,
    /// Suppression window for repeat alerts of the same vehicle+type, minutes (default: 120)
    #[serde(default = "DetectionConfig::default_alert_dedup_minutes")]
    pub alert_dedup_minutes: i64,
    /// Unacknowledged critical alerts escalate after this age, minutes (default: 5)
    #[serde(default = "DetectionConfig::default_escalation_after_minutes")]
    pub escalation_after_minutes: i64,
    /// Maximum escalation level (default: 3)
    #[serde(default = "DetectionConfig::default_max_escalation_level")]
    pub max_escalation_level: i64,
    /// Resolved alerts are deleted, dismissed ones archived, after this many days (default: 30)
    #[serde(default = "DetectionConfig::default_cleanup_after_days")]
    pub cleanup_after_days: i64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            idle_lookback_minutes: Self::default_idle_lookback_minutes(),
            idle_threshold_minutes: Self::default_idle_threshold_minutes(),
            idle_min_samples: Self::default_idle_min_samples(),
            idle_speed_kmh: Self::default_idle_speed_kmh(),
            stale_threshold_minutes: Self::default_stale_threshold_minutes(),
            speeding_kmh: Self::default_speeding_kmh(),
            route_adherence_m: Self::default_route_adherence_m(),
            route_deviation_m: Self::default_route_deviation_m(),
            geofence_radius_m: Self::default_geofence_radius_m(),
            low_signal_accuracy_m: Self::default_low_signal_accuracy_m(),
            cruising_speed_kmh: Self::default_cruising_speed_kmh(),
            alert_dedup_minutes: Self::default_alert_dedup_minutes(),
            escalation_after_minutes: Self::default_escalation_after_minutes(),
            max_escalation_level: Self::default_max_escalation_level(),
            cleanup_after_days: Self::default_cleanup_after_days(),
        }
    }
}

impl DetectionConfig {
    fn default_idle_lookback_minutes() -> i64 {
        30
    }
    fn default_idle_threshold_minutes() -> i64 {
        20
    }
    fn default_idle_min_samples() -> usize {
        3
    }
    fn default_idle_speed_kmh() -> f64 {
        2.0
    }
    fn default_stale_threshold_minutes() -> i64 {
        15
    }
    fn default_speeding_kmh() -> f64 {
        60.0
    }
    fn default_route_adherence_m() -> f64 {
        500.0
    }
    fn default_route_deviation_m() -> f64 {
        1000.0
    }
    fn default_geofence_radius_m() -> f64 {
        100.0
    }
    fn default_low_signal_accuracy_m() -> f64 {
        50.0
    }
    fn default_cruising_speed_kmh() -> f64 {
        30.0
    }
    fn default_alert_dedup_minutes() -> i64 {
        120
    }
    fn default_escalation_after_minutes() -> i64 {
        5
    }
    fn default_max_escalation_level() -> i64 {
        3
    }
    fn default_cleanup_after_days() -> i64 {
        30
    }
}

/// How often each background job runs
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Idle check cadence in seconds (default: 300)
    #[serde(default = "SchedulerConfig::default_idle_check_secs")]
    pub idle_check_secs: u64,
    /// Stale-telemetry check cadence in seconds (default: 600)
    #[serde(default = "SchedulerConfig::default_stale_check_secs")]
    pub stale_check_secs: u64,
    /// Escalation sweep cadence in seconds (default: 120)
    #[serde(default = "SchedulerConfig::default_escalation_sweep_secs")]
    pub escalation_sweep_secs: u64,
    /// Cleanup sweep cadence in seconds (default: 86400)
    #[serde(default = "SchedulerConfig::default_cleanup_sweep_secs")]
    pub cleanup_sweep_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_check_secs: Self::default_idle_check_secs(),
            stale_check_secs: Self::default_stale_check_secs(),
            escalation_sweep_secs: Self::default_escalation_sweep_secs(),
            cleanup_sweep_secs: Self::default_cleanup_sweep_secs(),
        }
    }
}

impl SchedulerConfig {
    fn default_idle_check_secs() -> u64 {
        300
    }
    fn default_stale_check_secs() -> u64 {
        600
    }
    fn default_escalation_sweep_secs() -> u64 {
        120
    }
    fn default_cleanup_sweep_secs() -> u64 {
        86400
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    fn default_database_url() -> String {
        "sqlite:database/fleet.db?mode=rwc".to_string()
    }

    fn default_port() -> u16 {
        3000
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
}

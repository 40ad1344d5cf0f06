use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::FixedOffset;
use serde::{Deserialize, Deserializer};

use crate::export::journal::JournalFormat;
use crate::reader::parse::DEFAULT_DATE_TIME_FORMAT;

/// Top-level configuration for the access log monitor.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Access log to tail. Default: "/tmp/access.log".
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,

    /// Pause before polling the log again at end of file. Default: 10ms.
    #[serde(default = "default_read_idle", with = "humantime_serde")]
    pub read_idle: Duration,

    /// Width of a statistics bucket. Default: 100ms.
    #[serde(default = "default_bucket_duration", with = "humantime_serde")]
    pub bucket_duration: Duration,

    /// Period of the watch cycle. Default: 1s.
    #[serde(default = "default_display_period", with = "humantime_serde")]
    pub display_period: Duration,

    /// Windows reported each watch cycle. Default: [10s].
    #[serde(
        default = "default_stats_durations",
        deserialize_with = "deserialize_durations"
    )]
    pub stats_durations: Vec<Duration>,

    /// High traffic alert configuration.
    #[serde(default)]
    pub alert: AlertingConfig,

    /// Sections listed in each report. Default: 10.
    #[serde(default = "default_top_section_count")]
    pub top_section_count: usize,

    /// Sections tracked per statistic, as a multiple of
    /// `top_section_count`. Default: 10.
    #[serde(default = "default_max_section_count_ratio")]
    pub max_section_count_ratio: usize,

    /// chrono format of the bracketed log date.
    #[serde(default = "default_date_time_format")]
    pub date_time_format: String,

    /// Fixed offset used to render instants, e.g. "+02:00". Default: "+00:00".
    #[serde(default = "default_time_zone")]
    pub time_zone: String,

    /// Alert journal file. Alerts are only logged when unset.
    #[serde(default)]
    pub alerts_file: Option<PathBuf>,

    /// Line format of the alert journal. Default: text.
    #[serde(default)]
    pub alerts_format: JournalFormat,

    /// Time given to the reader to exit on shutdown. Default: 3s.
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// High traffic alert configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertingConfig {
    /// Watched window. Default: 2m.
    #[serde(default = "default_alert_duration", with = "humantime_serde")]
    pub duration: Duration,

    /// Average requests per second raising the alert. Default: 10.
    #[serde(default = "default_alert_threshold")]
    pub threshold: f64,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

fn deserialize_durations<'de, D>(deserializer: D) -> std::result::Result<Vec<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<humantime_serde::Serde<Duration>>::deserialize(deserializer)?;
    Ok(raw.into_iter().map(humantime_serde::Serde::into_inner).collect())
}

// --- Default value functions ---

fn default_log_file() -> PathBuf {
    PathBuf::from("/tmp/access.log")
}

fn default_read_idle() -> Duration {
    Duration::from_millis(10)
}

fn default_bucket_duration() -> Duration {
    Duration::from_millis(100)
}

fn default_display_period() -> Duration {
    Duration::from_secs(1)
}

fn default_stats_durations() -> Vec<Duration> {
    vec![Duration::from_secs(10)]
}

fn default_alert_duration() -> Duration {
    Duration::from_secs(120)
}

fn default_alert_threshold() -> f64 {
    10.0
}

fn default_top_section_count() -> usize {
    10
}

fn default_max_section_count_ratio() -> usize {
    10
}

fn default_date_time_format() -> String {
    DEFAULT_DATE_TIME_FORMAT.to_string()
}

fn default_time_zone() -> String {
    "+00:00".to_string()
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(3)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_file: default_log_file(),
            read_idle: default_read_idle(),
            bucket_duration: default_bucket_duration(),
            display_period: default_display_period(),
            stats_durations: default_stats_durations(),
            alert: AlertingConfig::default(),
            top_section_count: default_top_section_count(),
            max_section_count_ratio: default_max_section_count_ratio(),
            date_time_format: default_date_time_format(),
            time_zone: default_time_zone(),
            alerts_file: None,
            alerts_format: JournalFormat::default(),
            shutdown_grace: default_shutdown_grace(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            duration: default_alert_duration(),
            threshold: default_alert_threshold(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.log_file.as_os_str().is_empty() {
            bail!("log_file is required");
        }

        if self.bucket_duration < Duration::from_millis(1) {
            bail!("bucket_duration must be at least 1ms");
        }

        if self.display_period.is_zero() {
            bail!("display_period must be positive");
        }

        if self.read_idle.is_zero() {
            bail!("read_idle must be positive");
        }

        for duration in &self.stats_durations {
            if *duration < self.bucket_duration {
                bail!(
                    "stats_durations entry {} is shorter than bucket_duration {}",
                    humantime::format_duration(*duration),
                    humantime::format_duration(self.bucket_duration),
                );
            }
        }

        if self.alert.duration < self.bucket_duration {
            bail!(
                "alert.duration {} is shorter than bucket_duration {}",
                humantime::format_duration(self.alert.duration),
                humantime::format_duration(self.bucket_duration),
            );
        }

        if !self.alert.threshold.is_finite() || self.alert.threshold <= 0.0 {
            bail!("alert.threshold must be a positive number");
        }

        if self.top_section_count == 0 {
            bail!("top_section_count must be positive");
        }

        if self.max_section_count_ratio == 0 {
            bail!("max_section_count_ratio must be positive");
        }

        if self.date_time_format.is_empty() {
            bail!("date_time_format is required");
        }

        self.zone()?;

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when health is enabled");
        }

        Ok(())
    }

    /// Cap on sections tracked by one statistic.
    pub fn max_section_count(&self) -> usize {
        self.top_section_count
            .saturating_mul(self.max_section_count_ratio)
    }

    /// Parses `time_zone` as a fixed UTC offset.
    pub fn zone(&self) -> Result<FixedOffset> {
        self.time_zone
            .parse::<FixedOffset>()
            .with_context(|| format!("invalid time_zone {:?}", self.time_zone))
    }
}

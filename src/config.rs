use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::store::RetentionPolicy;

/// Top-level configuration for the flowmon agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Poll cycle configuration.
    #[serde(default)]
    pub poll: PollConfig,

    /// Process identity cache configuration.
    #[serde(default)]
    pub identity_cache: IdentityCacheConfig,

    /// Supplementary trace source configuration.
    #[serde(default)]
    pub trace: TraceConfig,

    /// Change publisher configuration.
    #[serde(default)]
    pub publisher: PublisherConfig,

    /// Durable store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Poll cycle configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    /// Interval between flow table polls. Default: 2s.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Consecutive missed polls tolerated before a flow is declared
    /// closed. Default: 3.
    #[serde(default = "default_grace_polls")]
    pub grace_polls: u32,
}

/// Process identity cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityCacheConfig {
    /// Maximum cached process instances. Default: 1000.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

/// Supplementary trace source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TraceConfig {
    /// Enable ingestion from an attached trace source. Default: false.
    /// Absence of a usable source degrades to polling-only operation.
    #[serde(default)]
    pub enabled: bool,

    /// Trace record channel capacity. Default: 8192.
    #[serde(default = "default_trace_buffer")]
    pub buffer: usize,
}

/// Change publisher configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    /// Per-subscriber event buffer capacity. Default: 1024.
    #[serde(default = "default_publisher_buffer")]
    pub buffer: usize,
}

/// Durable store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// ClickHouse connection configuration. Disabled falls back to the
    /// in-memory store (aggregates are lost on restart).
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// Retention horizons per table family.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// How often the retention maintenance pass runs. Default: 6h.
    #[serde(default = "default_maintenance_interval", with = "humantime_serde")]
    pub maintenance_interval: Duration,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// Enable the ClickHouse store. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// ClickHouse native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "flowmon".
    #[serde(default = "default_database")]
    pub database: String,

    /// ClickHouse username.
    #[serde(default)]
    pub username: String,

    /// ClickHouse password.
    #[serde(default)]
    pub password: String,

    /// Write attempts before a batch is dropped. Default: 3.
    #[serde(default = "default_write_attempts")]
    pub write_attempts: u32,

    /// Initial backoff between write attempts, doubled each retry.
    /// Default: 500ms.
    #[serde(default = "default_write_backoff", with = "humantime_serde")]
    pub write_backoff: Duration,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration behavior configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Run migrations on startup. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// Retention horizons per table family.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Raw per-interval samples. Default: 7d.
    #[serde(default = "default_retention_raw", with = "humantime_serde")]
    pub raw: Duration,

    /// Hourly buckets. Default: 30d.
    #[serde(default = "default_retention_hourly", with = "humantime_serde")]
    pub hourly: Duration,

    /// Daily buckets. Default: 365d.
    #[serde(default = "default_retention_daily", with = "humantime_serde")]
    pub daily: Duration,

    /// Weekly buckets. Default: 730d.
    #[serde(default = "default_retention_weekly", with = "humantime_serde")]
    pub weekly: Duration,

    /// Monthly buckets. Default: 1825d.
    #[serde(default = "default_retention_monthly", with = "humantime_serde")]
    pub monthly: Duration,
}

impl RetentionConfig {
    /// The store-layer policy equivalent of this configuration.
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            raw: self.raw,
            hourly: self.hourly,
            daily: self.daily,
            weekly: self.weekly,
            monthly: self.monthly,
        }
    }
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_grace_polls() -> u32 {
    3
}

fn default_cache_capacity() -> usize {
    1000
}

fn default_trace_buffer() -> usize {
    8192
}

fn default_publisher_buffer() -> usize {
    1024
}

fn default_maintenance_interval() -> Duration {
    Duration::from_secs(6 * 60 * 60)
}

fn default_database() -> String {
    "flowmon".to_string()
}

fn default_write_attempts() -> u32 {
    3
}

fn default_write_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_retention_raw() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

fn default_retention_hourly() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60)
}

fn default_retention_daily() -> Duration {
    Duration::from_secs(365 * 24 * 60 * 60)
}

fn default_retention_weekly() -> Duration {
    Duration::from_secs(730 * 24 * 60 * 60)
}

fn default_retention_monthly() -> Duration {
    Duration::from_secs(1825 * 24 * 60 * 60)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            poll: PollConfig::default(),
            identity_cache: IdentityCacheConfig::default(),
            trace: TraceConfig::default(),
            publisher: PublisherConfig::default(),
            store: StoreConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
            grace_polls: default_grace_polls(),
        }
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            buffer: default_trace_buffer(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            clickhouse: ClickHouseConfig::default(),
            retention: RetentionConfig::default(),
            maintenance_interval: default_maintenance_interval(),
        }
    }
}

impl Default for IdentityCacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            buffer: default_publisher_buffer(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
            write_attempts: default_write_attempts(),
            write_backoff: default_write_backoff(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            raw: default_retention_raw(),
            hourly: default_retention_hourly(),
            daily: default_retention_daily(),
            weekly: default_retention_weekly(),
            monthly: default_retention_monthly(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
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
        if self.poll.interval.is_zero() {
            bail!("poll.interval must be positive");
        }

        if self.poll.grace_polls == 0 {
            bail!("poll.grace_polls must be at least 1");
        }

        if self.identity_cache.capacity == 0 {
            bail!("identity_cache.capacity must be positive");
        }

        if self.publisher.buffer == 0 {
            bail!("publisher.buffer must be positive");
        }

        if self.trace.enabled && self.trace.buffer == 0 {
            bail!("trace.buffer must be positive when enabled");
        }

        if self.store.maintenance_interval.is_zero() {
            bail!("store.maintenance_interval must be positive");
        }

        for (name, horizon) in [
            ("raw", self.store.retention.raw),
            ("hourly", self.store.retention.hourly),
            ("daily", self.store.retention.daily),
            ("weekly", self.store.retention.weekly),
            ("monthly", self.store.retention.monthly),
        ] {
            if horizon.is_zero() {
                bail!("store.retention.{name} must be positive");
            }
        }

        if self.store.clickhouse.enabled {
            if self.store.clickhouse.endpoint.is_empty() {
                bail!("store.clickhouse.endpoint is required when enabled");
            }
            if self.store.clickhouse.write_attempts == 0 {
                bail!("store.clickhouse.write_attempts must be positive");
            }
        }

        Ok(())
    }
}

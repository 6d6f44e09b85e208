//! Configuration management.

use serde::Deserialize;
use std::time::Duration;

use crate::telemetry::{LoggingConfig, MetricsConfig};

/// Main pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service name attached to metrics and logs
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Redis configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Admission control configuration
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Cancellation marker configuration
    #[serde(default)]
    pub cancellation: CancellationConfig,

    /// Memory governor configuration
    #[serde(default)]
    pub governor: GovernorConfig,

    /// Job processor configuration
    #[serde(default)]
    pub processor: ProcessorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            environment: default_environment(),
            redis: RedisConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            admission: AdmissionConfig::default(),
            cancellation: CancellationConfig::default(),
            governor: GovernorConfig::default(),
            processor: ProcessorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Key namespace for queues, schedules and markers
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            namespace: default_namespace(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    /// Delay applied when a job is deferred by its run flag
    #[serde(default = "default_defer_delay", with = "humantime_serde")]
    pub defer_delay: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            defer_delay: default_defer_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancellationConfig {
    /// How long a cancellation marker stays visible
    #[serde(default = "default_cancellation_ttl", with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for CancellationConfig {
    fn default() -> Self {
        Self {
            ttl: default_cancellation_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GovernorConfig {
    /// RSS ceiling in kilobytes; 0 disables the governor
    #[serde(default = "default_max_rss_kb")]
    pub max_rss_kb: u64,

    /// Wait before asking the process to stop fetching new jobs
    #[serde(default = "default_grace_time", with = "humantime_serde")]
    pub grace_time: Duration,

    /// Wait between the pause and the terminate signal
    #[serde(default = "default_shutdown_wait", with = "humantime_serde")]
    pub shutdown_wait: Duration,

    /// Wait between the terminate and the kill signal
    #[serde(default = "default_kill_wait", with = "humantime_serde")]
    pub kill_wait: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_rss_kb: default_max_rss_kb(),
            grace_time: default_grace_time(),
            shutdown_wait: default_shutdown_wait(),
            kill_wait: default_kill_wait(),
        }
    }
}

impl GovernorConfig {
    /// A governor configured with a zero ceiling never samples or signals.
    pub fn disabled() -> Self {
        Self {
            max_rss_kb: 0,
            ..Default::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_rss_kb > 0
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    /// Maximum concurrent job executions
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Pause between empty polls of the broker
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Processor name/identifier
    #[serde(default = "default_processor_name")]
    pub name: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval: default_poll_interval(),
            name: default_processor_name(),
        }
    }
}

// Default value functions
fn default_service_name() -> String { "conveyor".to_string() }
fn default_environment() -> String {
    std::env::var("CONVEYOR_ENVIRONMENT").unwrap_or_else(|_| "development".to_string())
}
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_namespace() -> String { "conveyor".to_string() }
fn default_defer_delay() -> Duration { Duration::from_secs(300) }
fn default_cancellation_ttl() -> Duration { Duration::from_secs(3600) }
fn default_max_rss_kb() -> u64 { 2_000_000 }
fn default_grace_time() -> Duration { Duration::from_secs(900) }
fn default_shutdown_wait() -> Duration { Duration::from_secs(30) }
fn default_kill_wait() -> Duration { Duration::from_secs(10) }
fn default_concurrency() -> usize { 20 }
fn default_poll_interval() -> Duration { Duration::from_secs(1) }
fn default_processor_name() -> String { "conveyor-processor".to_string() }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("CONVEYOR").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("CONVEYOR").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}

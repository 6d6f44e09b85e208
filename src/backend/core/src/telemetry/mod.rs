//! Telemetry: logging and metrics setup.
//!
//! - **Logging**: Structured JSON/pretty logging through `tracing-subscriber`
//! - **Metrics**: Prometheus recorder behind the `metrics` facade
//!
//! # Example
//!
//! ```rust,no_run
//! use conveyor_core::config::Config;
//! use conveyor_core::telemetry::init_telemetry;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! let registry = init_telemetry(&config).expect("Failed to initialize telemetry");
//! println!("{}", registry.render());
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig, SpanEventConfig};
pub use self::metrics::{init_metrics, register_metric_descriptions, MetricsConfig, MetricsRegistry};

use crate::config::Config;

/// Initialize logging and metrics from the `logging` and `metrics` sections.
/// Call once at process start.
///
/// # Errors
///
/// Returns an error if any component fails to initialize.
pub fn init_telemetry(config: &Config) -> anyhow::Result<MetricsRegistry> {
    // Metrics first (doesn't depend on anything)
    let registry = init_metrics(&config.metrics, &config.service_name)?;
    init_logging(&config.logging, &config.environment)?;
    Ok(registry)
}

//! Prometheus Metrics for the job pipeline.
//!
//! The pipeline records through the `metrics` facade; whichever recorder is
//! installed acts as the metrics backend. This module installs the Prometheus
//! recorder and describes every job metric. The host process serves
//! [`MetricsRegistry::render`] on whatever scrape endpoint it already runs.
//!
//! # Example
//!
//! ```rust,no_run
//! use conveyor_core::telemetry::metrics::{init_metrics, MetricsConfig};
//!
//! let registry = init_metrics(&MetricsConfig::default(), "conveyor").unwrap();
//! println!("{}", registry.render());
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;

/// Metric names emitted by the pipeline.
pub mod names {
    /// Client: jobs pushed to the broker.
    pub const ENQUEUED_JOBS_TOTAL: &str = "conveyor_enqueued_jobs_total";
    /// Server: jobs currently executing.
    pub const RUNNING_JOBS: &str = "conveyor_running_jobs";
    /// Server: wall-clock time from entering the metrics layer to completion.
    pub const JOBS_COMPLETION_SECONDS: &str = "conveyor_jobs_completion_seconds";
    /// Server: thread CPU time spent on the job.
    pub const JOBS_CPU_SECONDS: &str = "conveyor_jobs_cpu_seconds";
    /// Server: time between enqueue and execution start.
    pub const JOBS_QUEUE_DURATION_SECONDS: &str = "conveyor_jobs_queue_duration_seconds";
    /// Server: jobs that returned an error.
    pub const JOBS_FAILED_TOTAL: &str = "conveyor_jobs_failed_total";
    /// Server: attempts that carry retry metadata.
    pub const JOBS_RETRIED_TOTAL: &str = "conveyor_jobs_retried_total";
    /// Server: attempts that carry interruption metadata.
    pub const JOBS_INTERRUPTED_TOTAL: &str = "conveyor_jobs_interrupted_total";
    /// Server: jobs dropped or deferred by admission control.
    pub const JOBS_SKIPPED_TOTAL: &str = "conveyor_jobs_skipped_total";
    /// Server: jobs parked by a pause-control strategy.
    pub const JOBS_PAUSED_TOTAL: &str = "conveyor_jobs_paused_total";
    /// Governor: escalation signals sent to the process.
    pub const GOVERNOR_SIGNALS_TOTAL: &str = "conveyor_memory_governor_signals_total";
    /// Governor: last sampled resident set size.
    pub const GOVERNOR_RSS_BYTES: &str = "conveyor_memory_governor_rss_bytes";
}

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Histogram buckets for job durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 60.0, 300.0, 600.0]
}

/// Handle to the installed Prometheus recorder.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry with no exporter behind it.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Build a Prometheus builder from configuration.
fn builder(config: &MetricsConfig) -> anyhow::Result<PrometheusBuilder> {
    let mut builder = PrometheusBuilder::new();
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    Ok(builder.set_buckets(&config.duration_buckets)?)
}

/// Initialize the metrics subsystem.
///
/// # Errors
///
/// Returns an error if the buckets are invalid or a recorder is already installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let handle = builder(config)?.install_recorder()?;
    register_metric_descriptions();

    tracing::info!(
        service_name = %service_name,
        buckets = config.duration_buckets.len(),
        "Metrics initialized"
    );

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

/// Register all metric descriptions.
pub fn register_metric_descriptions() {
    describe_counter!(names::ENQUEUED_JOBS_TOTAL, "Jobs pushed to the broker");
    describe_gauge!(names::RUNNING_JOBS, "Jobs currently executing in this process");
    describe_histogram!(
        names::JOBS_COMPLETION_SECONDS,
        Unit::Seconds,
        "Seconds to complete a job"
    );
    describe_histogram!(
        names::JOBS_CPU_SECONDS,
        Unit::Seconds,
        "Seconds of thread CPU time spent on a job"
    );
    describe_histogram!(
        names::JOBS_QUEUE_DURATION_SECONDS,
        Unit::Seconds,
        "Seconds a job waited in the queue before starting"
    );
    describe_counter!(names::JOBS_FAILED_TOTAL, "Jobs that failed");
    describe_counter!(names::JOBS_RETRIED_TOTAL, "Job attempts that are retries");
    describe_counter!(names::JOBS_INTERRUPTED_TOTAL, "Job attempts after an interruption");
    describe_counter!(
        names::JOBS_SKIPPED_TOTAL,
        "Jobs dropped or deferred by admission control"
    );
    describe_counter!(names::JOBS_PAUSED_TOTAL, "Jobs parked by a pause-control strategy");
    describe_counter!(
        names::GOVERNOR_SIGNALS_TOTAL,
        "Signals sent by the memory governor"
    );
    describe_gauge!(
        names::GOVERNOR_RSS_BYTES,
        Unit::Bytes,
        "Resident set size at the last governor sample"
    );
}

//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use conveyor_core::config::{Config, GovernorConfig};
use conveyor_core::error::Result;
use conveyor_core::governor::{ProcessControl, ShutdownSignal, SignalTarget};
use conveyor_core::jobs::{handler_fn, Broker, Job, JobError, WorkerAttributes, WorkerDefinition};
use conveyor_core::middleware::{Pipeline, PipelineBuilder};
use metrics_exporter_prometheus::PrometheusBuilder;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Metrics
// ============================================================================

/// Run `future` on a current-thread runtime with a private Prometheus recorder
/// installed, returning its output and the rendered exposition text.
pub fn with_recorder<F: Future>(future: F) -> (F::Output, String) {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let output = metrics::with_local_recorder(&recorder, || runtime.block_on(future));
    (output, handle.render())
}

/// Sum of every sample of `name` whose labels include all of `labels`.
///
/// Returns `None` when no sample matches.
pub fn sample(rendered: &str, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
    let mut total = None;
    for line in rendered.lines().filter(|l| !l.starts_with('#')) {
        let Some((series, value)) = line.rsplit_once(' ') else {
            continue;
        };
        let (metric, series_labels) = match series.split_once('{') {
            Some((metric, rest)) => (metric, parse_labels(rest.trim_end_matches('}'))),
            None => (series, Vec::new()),
        };
        if metric != name {
            continue;
        }
        let matches = labels.iter().all(|(k, v)| {
            series_labels
                .iter()
                .any(|(sk, sv)| sk == k && sv == v)
        });
        if matches {
            let value: f64 = value.parse().unwrap();
            total = Some(total.unwrap_or(0.0) + value);
        }
    }
    total
}

fn parse_labels(raw: &str) -> Vec<(String, String)> {
    let mut labels = Vec::new();
    let mut rest = raw;
    while let Some((key, after)) = rest.split_once("=\"") {
        let Some(end) = after.find('"') else {
            break;
        };
        labels.push((
            key.trim_start_matches(',').to_string(),
            after[..end].to_string(),
        ));
        rest = &after[end + 1..];
    }
    labels
}

// ============================================================================
// Process
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Sleep(Duration),
    Signal(SignalTarget, ShutdownSignal),
}

/// Process double with a fixed RSS that records sleeps and signals.
pub struct ScriptedProcess {
    pub rss_kb: u64,
    pub group_leader: bool,
    pub samples: AtomicUsize,
    events: Mutex<Vec<ProcessEvent>>,
}

impl ScriptedProcess {
    pub fn new(rss_kb: u64) -> Arc<Self> {
        Self::build(rss_kb, false)
    }

    pub fn group_leader(rss_kb: u64) -> Arc<Self> {
        Self::build(rss_kb, true)
    }

    fn build(rss_kb: u64, group_leader: bool) -> Arc<Self> {
        Arc::new(Self {
            rss_kb,
            group_leader,
            samples: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<ProcessEvent> {
        self.events.lock().clone()
    }

    pub fn samples(&self) -> usize {
        self.samples.load(Ordering::Relaxed)
    }

    /// Yield until `count` events were recorded or the attempts run out.
    pub async fn wait_for_events(&self, count: usize) {
        for _ in 0..1_000 {
            if self.events.lock().len() >= count {
                return;
            }
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl ProcessControl for ScriptedProcess {
    fn rss_kb(&self) -> Result<u64> {
        self.samples.fetch_add(1, Ordering::Relaxed);
        Ok(self.rss_kb)
    }

    fn pid(&self) -> u32 {
        31337
    }

    fn is_group_leader(&self) -> bool {
        self.group_leader
    }

    fn send(&self, target: SignalTarget, signal: ShutdownSignal) -> Result<()> {
        self.events.lock().push(ProcessEvent::Signal(target, signal));
        Ok(())
    }

    async fn sleep(&self, duration: Duration) {
        self.events.lock().push(ProcessEvent::Sleep(duration));
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// Pipelines and Workers
// ============================================================================

/// Defaults with the memory governor switched off.
pub fn quiet_config() -> Config {
    Config {
        governor: GovernorConfig::disabled(),
        ..Default::default()
    }
}

/// A builder using `quiet_config` and a process double far below any ceiling.
pub fn builder(broker: Arc<dyn Broker>) -> PipelineBuilder {
    Pipeline::builder(broker)
        .config(quiet_config())
        .process(ScriptedProcess::new(1))
}

/// A worker that counts its executions and succeeds.
pub fn counting_worker(
    name: &str,
    attributes: WorkerAttributes,
    runs: Arc<AtomicUsize>,
) -> WorkerDefinition {
    WorkerDefinition::new(
        name,
        handler_fn(move |_job: Job, _ctx| {
            let runs = Arc::clone(&runs);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
    )
    .with_attributes(attributes)
}

/// A worker that always fails with `message`.
pub fn failing_worker(name: &str, message: &'static str) -> WorkerDefinition {
    WorkerDefinition::new(
        name,
        handler_fn(move |_job: Job, _ctx| async move { Err(JobError::message(message)) }),
    )
}

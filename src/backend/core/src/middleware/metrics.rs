//! Job metrics recorded around enqueue and execution.

use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, gauge, histogram, Label};
use std::time::{Duration, Instant};

use super::labels::{JobStatusLabel, LabelSet};
use super::{ClientMiddleware, ClientNext, EnqueueOutcome, Next, ServerMiddleware};
use crate::error::Result;
use crate::governor::CpuTimed;
use crate::jobs::{ExecutionContext, Job, JobResult, WorkerDefinition, WorkerRegistry};
use crate::telemetry::metrics::names;

// ═══════════════════════════════════════════════════════════════════════════════
// Client
// ═══════════════════════════════════════════════════════════════════════════════

/// Counts jobs the broker accepted.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientMetrics;

#[async_trait]
impl ClientMiddleware for ClientMetrics {
    fn name(&self) -> &'static str {
        "client_metrics"
    }

    async fn call(
        &self,
        worker: &WorkerDefinition,
        job: &mut Job,
        ctx: &ExecutionContext,
        next: ClientNext<'_>,
    ) -> Result<EnqueueOutcome> {
        let labels = LabelSet::for_client(&worker.attributes, job);
        let outcome = next.run(job, ctx).await?;
        if let EnqueueOutcome::Pushed(_) = outcome {
            counter!(names::ENQUEUED_JOBS_TOTAL, labels.to_labels()).increment(1);
        }
        Ok(outcome)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Server
// ═══════════════════════════════════════════════════════════════════════════════

/// Keeps the running-jobs gauge raised for its lifetime.
struct RunningGauge {
    labels: Vec<Label>,
}

impl RunningGauge {
    fn enter(labels: Vec<Label>) -> Self {
        gauge!(names::RUNNING_JOBS, labels.clone()).increment(1.0);
        Self { labels }
    }
}

impl Drop for RunningGauge {
    fn drop(&mut self) {
        gauge!(names::RUNNING_JOBS, std::mem::take(&mut self.labels)).decrement(1.0);
    }
}

/// CPU seconds worth recording: only measured, positive durations.
fn recordable_cpu(cpu: Option<Duration>) -> Option<f64> {
    cpu.filter(|cpu| !cpu.is_zero()).map(|cpu| cpu.as_secs_f64())
}

/// Records duration, CPU time and outcome of every executed job.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerMetrics;

impl ServerMetrics {
    /// Register zero-valued series for every known worker so dashboards see
    /// them before the first job runs.
    pub fn initialize(workers: &WorkerRegistry) {
        for definition in workers.definitions() {
            let job = Job::new(definition.name.clone(), definition.queue.clone());
            let base = LabelSet::for_server(&definition.attributes, &job);
            let failed = base.with_status(JobStatusLabel::Fail).to_labels();

            counter!(names::JOBS_FAILED_TOTAL, failed).absolute(0);
            counter!(names::JOBS_RETRIED_TOTAL, base.to_labels()).absolute(0);
            counter!(names::JOBS_INTERRUPTED_TOTAL, base.to_labels()).absolute(0);
            gauge!(names::RUNNING_JOBS, base.to_labels()).increment(0.0);
        }
    }
}

#[async_trait]
impl ServerMiddleware for ServerMetrics {
    fn name(&self) -> &'static str {
        "server_metrics"
    }

    async fn call(
        &self,
        worker: &WorkerDefinition,
        job: &mut Job,
        ctx: &ExecutionContext,
        next: Next<'_>,
    ) -> JobResult {
        let labels = LabelSet::for_server(&worker.attributes, job);

        if let Some(waited) = job.queue_duration(Utc::now()) {
            histogram!(names::JOBS_QUEUE_DURATION_SECONDS, labels.to_labels())
                .record(waited.as_secs_f64());
        }
        if job.retry_count.is_some() {
            counter!(names::JOBS_RETRIED_TOTAL, labels.to_labels()).increment(1);
        }
        if job.interrupted_count.is_some() {
            counter!(names::JOBS_INTERRUPTED_TOTAL, labels.to_labels()).increment(1);
        }

        let _running = RunningGauge::enter(labels.to_labels());
        let start = Instant::now();
        let (result, cpu) = CpuTimed::new(next.run(job, ctx)).await;
        let elapsed = start.elapsed();

        let status = if result.is_ok() {
            JobStatusLabel::Done
        } else {
            JobStatusLabel::Fail
        };
        let final_labels = labels.with_status(status).to_labels();

        histogram!(names::JOBS_COMPLETION_SECONDS, final_labels.clone())
            .record(elapsed.as_secs_f64());
        if let Some(seconds) = recordable_cpu(cpu) {
            histogram!(names::JOBS_CPU_SECONDS, final_labels.clone()).record(seconds);
        }
        if result.is_err() {
            counter!(names::JOBS_FAILED_TOTAL, final_labels).increment(1);
        }

        result
    }
}

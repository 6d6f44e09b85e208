//! Admission control: decide whether a job runs, is deferred or is dropped.
//!
//! Inputs are evaluated in a fixed precedence order:
//!
//! 1. `drop_jobs_for_<Worker>` on: drop, even when the run flag is also on
//! 2. `run_jobs_for_<Worker>` explicitly off: defer by the configured delay
//! 3. the worker opted into database-health deferral and a signal says stop:
//!    defer by the worker's delay
//! 4. otherwise run
//!
//! Dropping and deferring are outcomes, not errors: the middleware returns
//! `Ok(())` without running the rest of the chain.

pub mod flags;
pub mod health;
pub mod pause;

pub use flags::{FeatureFlags, FlagKey, FlagKind, InMemoryFeatureFlags};
pub use health::{HealthEvaluator, HealthSignal, InMemoryHealthEvaluator};
pub use pause::{PauseControl, PauseStrategies, PauseStrategy, PausedJobs};

use async_trait::async_trait;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::jobs::{Broker, DeferReason, ExecutionContext, Job, JobResult, WorkerDefinition};
use crate::middleware::{Next, ServerMiddleware};
use crate::telemetry::metrics::names;

/// Admission decision for one job attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Run,
    Drop,
    Defer { reason: DeferReason, delay: Duration },
}

/// Server middleware applying per-worker flags and database health signals.
pub struct AdmissionController {
    flags: Arc<dyn FeatureFlags>,
    health: Arc<dyn HealthEvaluator>,
    broker: Arc<dyn Broker>,
    defer_delay: Duration,
}

impl AdmissionController {
    /// `defer_delay` applies to jobs deferred by their run flag.
    pub fn new(
        flags: Arc<dyn FeatureFlags>,
        health: Arc<dyn HealthEvaluator>,
        broker: Arc<dyn Broker>,
        defer_delay: Duration,
    ) -> Self {
        Self {
            flags,
            health,
            broker,
            defer_delay,
        }
    }

    /// Decide what happens to `job`. Collaborator failures fail open.
    pub async fn decide(&self, worker: &WorkerDefinition, job: &Job) -> Admission {
        if self.flag(&FlagKey::drop_jobs(&worker.name)).await == Some(true) {
            return Admission::Drop;
        }

        if self.flag(&FlagKey::run_jobs(&worker.name)).await == Some(false) {
            return Admission::Defer {
                reason: DeferReason::FeatureFlag,
                delay: self.defer_delay,
            };
        }

        if let Some((scope, delay)) = worker.attributes.health_deferral.resolve(job) {
            match self.health.evaluate(&scope).await {
                Ok(signals) => {
                    if let Some(signal) = signals.iter().find(|s| s.stop) {
                        debug!(
                            worker = %worker.name,
                            indicator = %signal.indicator,
                            reason = signal.reason.as_deref().unwrap_or(""),
                            schema = %scope.schema,
                            "Database health check asked to stop"
                        );
                        return Admission::Defer {
                            reason: DeferReason::DatabaseHealthCheck,
                            delay,
                        };
                    }
                }
                Err(e) => {
                    warn!(worker = %worker.name, error = %e, "Health evaluation failed; admitting job");
                }
            }
        }

        Admission::Run
    }

    async fn flag(&self, key: &FlagKey) -> Option<bool> {
        match self.flags.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(flag = %key, error = %e, "Feature flag lookup failed; treating as unset");
                None
            }
        }
    }

    fn record_skip(worker: &WorkerDefinition, action: &'static str, reason: DeferReason) {
        counter!(
            names::JOBS_SKIPPED_TOTAL,
            "worker" => worker.name.clone(),
            "action" => action,
            "reason" => reason.as_str(),
            "feature_category" => worker.attributes.feature_category.clone().unwrap_or_default(),
        )
        .increment(1);
    }
}

#[async_trait]
impl ServerMiddleware for AdmissionController {
    fn name(&self) -> &'static str {
        "admission_controller"
    }

    async fn call(
        &self,
        worker: &WorkerDefinition,
        job: &mut Job,
        ctx: &ExecutionContext,
        next: Next<'_>,
    ) -> JobResult {
        match self.decide(worker, job).await {
            Admission::Run => {
                job.clear_deferral();
                next.run(job, ctx).await
            }
            Admission::Drop => {
                job.dropped = true;
                info!(
                    worker = %worker.name,
                    job_id = %job.id,
                    flag = %FlagKey::drop_jobs(&worker.name),
                    "Job dropped"
                );
                Self::record_skip(worker, "dropped", DeferReason::FeatureFlag);
                Ok(())
            }
            Admission::Defer { reason, delay } => {
                job.mark_deferred(reason);
                self.broker.perform_in(delay, job.deferred_copy()).await?;
                info!(
                    worker = %worker.name,
                    job_id = %job.id,
                    reason = %reason,
                    delay_secs = delay.as_secs(),
                    deferred_count = job.deferred_count,
                    "Job deferred"
                );
                Self::record_skip(worker, "deferred", reason);
                Ok(())
            }
        }
    }
}

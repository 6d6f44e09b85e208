//! Pause control: park jobs while a named condition holds, resume them later.
//!
//! Workers name a strategy in their attributes. Strategies are looked up in a
//! registry; a name nobody registered resolves to `none` and the job runs.

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::flags::{FeatureFlags, FlagKey};
use crate::error::Result;
use crate::jobs::{Broker, ExecutionContext, Job, JobResult, WorkerDefinition};
use crate::middleware::{Next, ServerMiddleware};
use crate::telemetry::metrics::names;

/// Strategy that never pauses.
pub const NONE: &str = "none";
pub const CLICK_HOUSE_MIGRATION: &str = "click_house_migration";
pub const ZOEKT: &str = "zoekt";
/// Kept so workers still naming it resolve to a no-op.
pub const DEPRECATED: &str = "deprecated";

/// Global flag raised while ClickHouse migrations run.
pub const CLICK_HOUSE_MIGRATION_FLAG: &str = "click_house_migration_in_progress";
/// Global flag raised while search indexing is paused.
pub const ZOEKT_PAUSE_FLAG: &str = "zoekt_indexing_paused";

// ═══════════════════════════════════════════════════════════════════════════════
// Strategies
// ═══════════════════════════════════════════════════════════════════════════════

/// Decides whether jobs under a strategy should wait.
#[async_trait]
pub trait PauseStrategy: Send + Sync {
    async fn should_pause(&self) -> bool;
}

/// Never pauses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverPause;

#[async_trait]
impl PauseStrategy for NeverPause {
    async fn should_pause(&self) -> bool {
        false
    }
}

/// Pauses while a global flag is on. Flag store failures resolve to "run".
pub struct FlagPause {
    flags: Arc<dyn FeatureFlags>,
    key: FlagKey,
}

impl FlagPause {
    pub fn new(flags: Arc<dyn FeatureFlags>, flag: impl Into<String>) -> Self {
        Self {
            flags,
            key: FlagKey::global(flag),
        }
    }
}

#[async_trait]
impl PauseStrategy for FlagPause {
    async fn should_pause(&self) -> bool {
        match self.flags.enabled(&self.key).await {
            Ok(enabled) => enabled,
            Err(e) => {
                warn!(flag = %self.key, error = %e, "Pause flag lookup failed; not pausing");
                false
            }
        }
    }
}

/// Strategy name -> strategy.
pub struct PauseStrategies {
    strategies: HashMap<String, Arc<dyn PauseStrategy>>,
    fallback: Arc<dyn PauseStrategy>,
}

impl PauseStrategies {
    /// A registry containing only `none`.
    pub fn new() -> Self {
        let fallback: Arc<dyn PauseStrategy> = Arc::new(NeverPause);
        let mut strategies = HashMap::new();
        strategies.insert(NONE.to_string(), Arc::clone(&fallback));
        Self {
            strategies,
            fallback,
        }
    }

    /// `none`, `click_house_migration`, `zoekt` and `deprecated`.
    pub fn with_defaults(flags: Arc<dyn FeatureFlags>) -> Self {
        let mut registry = Self::new();
        registry
            .register(
                CLICK_HOUSE_MIGRATION,
                FlagPause::new(Arc::clone(&flags), CLICK_HOUSE_MIGRATION_FLAG),
            )
            .register(ZOEKT, FlagPause::new(flags, ZOEKT_PAUSE_FLAG))
            .register(DEPRECATED, NeverPause);
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        strategy: impl PauseStrategy + 'static,
    ) -> &mut Self {
        self.strategies.insert(name.into(), Arc::new(strategy));
        self
    }

    /// Look up a strategy. Unknown names resolve to `none`.
    pub fn resolve(&self, name: &str) -> Arc<dyn PauseStrategy> {
        match self.strategies.get(name) {
            Some(strategy) => Arc::clone(strategy),
            None => {
                warn!(strategy = %name, "Unknown pause strategy; using none");
                Arc::clone(&self.fallback)
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.strategies.contains_key(name)
    }
}

impl Default for PauseStrategies {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Parked Jobs
// ═══════════════════════════════════════════════════════════════════════════════

/// Jobs parked per strategy, oldest first.
#[derive(Debug, Default)]
pub struct PausedJobs {
    jobs: DashMap<String, Vec<Job>>,
}

impl PausedJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn park(&self, strategy: &str, job: Job) {
        self.jobs.entry(strategy.to_string()).or_default().push(job);
    }

    /// Remove and return every job parked under `strategy`.
    pub fn take(&self, strategy: &str) -> Vec<Job> {
        self.jobs
            .remove(strategy)
            .map(|(_, jobs)| jobs)
            .unwrap_or_default()
    }

    pub fn len(&self, strategy: &str) -> usize {
        self.jobs.get(strategy).map_or(0, |jobs| jobs.len())
    }

    pub fn total(&self) -> usize {
        self.jobs.iter().map(|entry| entry.value().len()).sum()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Middleware
// ═══════════════════════════════════════════════════════════════════════════════

/// Parks jobs whose strategy says pause instead of running them.
pub struct PauseControl {
    strategies: Arc<PauseStrategies>,
    paused: Arc<PausedJobs>,
    broker: Arc<dyn Broker>,
}

impl PauseControl {
    pub fn new(
        strategies: Arc<PauseStrategies>,
        paused: Arc<PausedJobs>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self {
            strategies,
            paused,
            broker,
        }
    }

    pub fn paused(&self) -> &Arc<PausedJobs> {
        &self.paused
    }

    /// Push parked jobs back onto the broker once `strategy` stops pausing.
    ///
    /// Returns how many jobs were re-enqueued. Jobs that could not be pushed
    /// stay parked.
    pub async fn resume(&self, strategy: &str) -> Result<usize> {
        if self.strategies.resolve(strategy).should_pause().await {
            return Ok(0);
        }

        let mut parked = self.paused.take(strategy).into_iter();
        let mut resumed = 0;
        while let Some(job) = parked.next() {
            if let Err(e) = self.broker.enqueue(job.clone()).await {
                self.paused.park(strategy, job);
                for rest in parked {
                    self.paused.park(strategy, rest);
                }
                return Err(e);
            }
            resumed += 1;
        }

        if resumed > 0 {
            info!(strategy = %strategy, resumed, "Resumed paused jobs");
        }
        Ok(resumed)
    }
}

#[async_trait]
impl ServerMiddleware for PauseControl {
    fn name(&self) -> &'static str {
        "pause_control"
    }

    async fn call(
        &self,
        worker: &WorkerDefinition,
        job: &mut Job,
        ctx: &ExecutionContext,
        next: Next<'_>,
    ) -> JobResult {
        let Some(strategy) = worker.attributes.pause_control.as_deref() else {
            return next.run(job, ctx).await;
        };

        if !self.strategies.resolve(strategy).should_pause().await {
            return next.run(job, ctx).await;
        }

        info!(
            worker = %worker.name,
            job_id = %job.id,
            strategy = %strategy,
            "Job paused"
        );
        counter!(
            names::JOBS_PAUSED_TOTAL,
            "worker" => worker.name.clone(),
            "strategy" => strategy.to_string(),
        )
        .increment(1);
        self.paused.park(strategy, job.clone());
        Ok(())
    }
}

//! Middleware chains wrapped around job enqueue and job execution.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                               Pipeline                                      │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  client chain (enqueue)            server chain (execute)                   │
//! │  ┌──────────────────────┐          ┌──────────────────────────────┐         │
//! │  │ shard routing check  │          │ shard awareness scope        │         │
//! │  │ correlation inject   │          │ admission controller         │         │
//! │  │ ip address inject    │  broker  │ pause control                │         │
//! │  │ enqueue metrics      │ ───────▶ │ job monitor (cancellation)   │         │
//! │  └──────────┬───────────┘          │ correlation extract          │         │
//! │             ▼                      │ ip address restore           │         │
//! │       Broker::enqueue              │ server metrics               │         │
//! │                                    │ memory governor              │         │
//! │                                    └──────────────┬───────────────┘         │
//! │                                                   ▼                         │
//! │                                         JobHandler::perform                 │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Middleware runs in registration order on the way in and unwinds in reverse.
//! Each layer receives a [`Next`] that it may run at most once; returning
//! without running it short-circuits the rest of the chain.

pub mod admission;
pub mod correlation;
pub mod labels;
pub mod metrics;
pub mod monitor;
pub mod scope;

pub use admission::{
    Admission, AdmissionController, FeatureFlags, FlagKey, FlagKind, HealthEvaluator,
    HealthSignal, InMemoryFeatureFlags, InMemoryHealthEvaluator, PauseControl, PauseStrategies,
    PauseStrategy, PausedJobs,
};
pub use correlation::{CorrelationExtractor, CorrelationInjector};
pub use labels::{JobStatusLabel, LabelSet};
pub use self::metrics::{ClientMetrics, ServerMetrics};
pub use monitor::{
    CancellationStore, InMemoryCancellationStore, JobMonitor, JobRegistry, RedisCancellationStore,
    RunningJob,
};
pub use scope::{IpAddressInjector, IpAddressRestorer, ShardAwarenessScope, ShardRoutingValidator};

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::error::{ConveyorError, Result};
use crate::governor::{MemoryGovernor, MemoryGovernorMiddleware, ProcessControl, SystemProcess};
use crate::jobs::{
    Broker, ExecutionContext, Job, JobError, JobId, JobResult, WorkerDefinition, WorkerRegistry,
};

// ═══════════════════════════════════════════════════════════════════════════════
// Server Chain
// ═══════════════════════════════════════════════════════════════════════════════

/// A hook wrapped around job execution.
#[async_trait]
pub trait ServerMiddleware: Send + Sync {
    /// Name used in logs and chain introspection.
    fn name(&self) -> &'static str;

    async fn call(
        &self,
        worker: &WorkerDefinition,
        job: &mut Job,
        ctx: &ExecutionContext,
        next: Next<'_>,
    ) -> JobResult;
}

/// The remainder of a server chain.
pub struct Next<'a> {
    worker: &'a WorkerDefinition,
    middlewares: &'a [Arc<dyn ServerMiddleware>],
}

impl<'a> Next<'a> {
    /// Run the rest of the chain, ending in the worker's handler.
    pub async fn run(self, job: &mut Job, ctx: &ExecutionContext) -> JobResult {
        match self.middlewares.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    worker: self.worker,
                    middlewares: rest,
                };
                head.call(self.worker, job, ctx, next).await
            }
            None => self.worker.handler.perform(job, ctx).await,
        }
    }
}

/// Ordered server middleware.
#[derive(Default, Clone)]
pub struct ServerChain {
    middlewares: Vec<Arc<dyn ServerMiddleware>>,
}

impl ServerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware; it runs inside every middleware registered before it.
    pub fn register(&mut self, middleware: impl ServerMiddleware + 'static) -> &mut Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Append a middleware that is also held elsewhere.
    pub fn register_shared(&mut self, middleware: Arc<dyn ServerMiddleware>) -> &mut Self {
        self.middlewares.push(middleware);
        self
    }

    /// Run the chain around one job attempt.
    pub async fn run(
        &self,
        worker: &WorkerDefinition,
        job: &mut Job,
        ctx: &ExecutionContext,
    ) -> JobResult {
        Next {
            worker,
            middlewares: &self.middlewares,
        }
        .run(job, ctx)
        .await
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Client Chain
// ═══════════════════════════════════════════════════════════════════════════════

/// What became of an enqueue request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The broker accepted the job.
    Pushed(JobId),
    /// A client middleware returned without pushing.
    Suppressed,
}

/// A hook wrapped around job enqueue.
#[async_trait]
pub trait ClientMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn call(
        &self,
        worker: &WorkerDefinition,
        job: &mut Job,
        ctx: &ExecutionContext,
        next: ClientNext<'_>,
    ) -> Result<EnqueueOutcome>;
}

/// The remainder of a client chain.
pub struct ClientNext<'a> {
    worker: &'a WorkerDefinition,
    middlewares: &'a [Arc<dyn ClientMiddleware>],
    broker: &'a dyn Broker,
}

impl<'a> ClientNext<'a> {
    /// Run the rest of the chain, ending in a broker push.
    pub async fn run(self, job: &mut Job, ctx: &ExecutionContext) -> Result<EnqueueOutcome> {
        match self.middlewares.split_first() {
            Some((head, rest)) => {
                let next = ClientNext {
                    worker: self.worker,
                    middlewares: rest,
                    broker: self.broker,
                };
                head.call(self.worker, job, ctx, next).await
            }
            None => {
                self.broker.enqueue(job.clone()).await?;
                Ok(EnqueueOutcome::Pushed(job.id))
            }
        }
    }
}

/// Ordered client middleware.
#[derive(Default, Clone)]
pub struct ClientChain {
    middlewares: Vec<Arc<dyn ClientMiddleware>>,
}

impl ClientChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, middleware: impl ClientMiddleware + 'static) -> &mut Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Run the chain around one enqueue.
    pub async fn enqueue(
        &self,
        worker: &WorkerDefinition,
        job: &mut Job,
        ctx: &ExecutionContext,
        broker: &dyn Broker,
    ) -> Result<EnqueueOutcome> {
        ClientNext {
            worker,
            middlewares: &self.middlewares,
            broker,
        }
        .run(job, ctx)
        .await
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Pipeline
// ═══════════════════════════════════════════════════════════════════════════════

/// Workers, broker and both chains, wired with the collaborators they need.
pub struct Pipeline {
    workers: Arc<WorkerRegistry>,
    broker: Arc<dyn Broker>,
    client: ClientChain,
    server: ServerChain,
    monitor: Arc<JobMonitor>,
    pause: Arc<PauseControl>,
    governor: MemoryGovernor,
}

impl Pipeline {
    pub fn builder(broker: Arc<dyn Broker>) -> PipelineBuilder {
        PipelineBuilder::new(broker)
    }

    /// Register a worker type.
    pub fn register_worker(&self, definition: WorkerDefinition) -> Arc<WorkerDefinition> {
        self.workers.register(definition)
    }

    /// Build a job for `worker` and send it through the client chain.
    pub async fn enqueue(
        &self,
        worker: &str,
        args: Vec<Value>,
        ctx: &ExecutionContext,
    ) -> Result<EnqueueOutcome> {
        let definition = self
            .workers
            .get(worker)
            .ok_or_else(|| ConveyorError::unknown_worker(worker))?;
        let job = Job::new(worker, definition.queue.clone()).with_args(args);
        self.push_with(&definition, job, ctx).await
    }

    /// Send a prepared job through the client chain.
    pub async fn push(&self, job: Job, ctx: &ExecutionContext) -> Result<EnqueueOutcome> {
        let definition = self
            .workers
            .get(&job.worker)
            .ok_or_else(|| ConveyorError::unknown_worker(&job.worker))?;
        self.push_with(&definition, job, ctx).await
    }

    async fn push_with(
        &self,
        definition: &WorkerDefinition,
        mut job: Job,
        ctx: &ExecutionContext,
    ) -> Result<EnqueueOutcome> {
        self.client
            .enqueue(definition, &mut job, ctx, self.broker.as_ref())
            .await
    }

    /// Execute one dequeued job in a fresh root context.
    pub async fn perform(&self, mut job: Job) -> JobResult {
        self.run(&mut job, &ExecutionContext::new()).await
    }

    /// Execute a job through the server chain, leaving admission marks on `job`.
    pub async fn run(&self, job: &mut Job, ctx: &ExecutionContext) -> JobResult {
        let definition = self
            .workers
            .get(&job.worker)
            .ok_or_else(|| ConveyorError::unknown_worker(&job.worker))?;

        let span = info_span!(
            "job",
            job_id = %job.id,
            worker = %job.worker,
            queue = %job.queue,
            correlation_id = job.correlation_id.as_deref().unwrap_or(""),
        );

        async move {
            let start = Instant::now();
            info!("Job started");

            let result = self.server.run(&definition, job, ctx).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            match &result {
                Ok(()) => info!(
                    duration_ms,
                    dropped = job.dropped,
                    deferred = job.deferred,
                    "Job finished"
                ),
                Err(JobError::WantShutdown { reason }) => {
                    warn!(duration_ms, reason = %reason, "Job requested shutdown")
                }
                Err(JobError::Infrastructure(e)) => {
                    e.log();
                    error!(duration_ms, error = %e, "Job failed")
                }
                Err(e) => error!(duration_ms, kind = e.kind(), error = %e, "Job failed"),
            }

            result
        }
        .instrument(span)
        .await
    }

    /// Deliver a cooperative interrupt to a running job.
    pub fn interrupt(&self, job_id: JobId) -> Option<RunningJob> {
        self.monitor.interrupt(job_id)
    }

    /// Mark a job as cancelled so it refuses to start.
    pub async fn mark_cancelled(&self, job_id: JobId) -> Result<()> {
        self.monitor.mark_cancelled(job_id).await
    }

    /// Re-enqueue jobs parked by a pause strategy that no longer pauses.
    pub async fn resume_paused(&self, strategy: &str) -> Result<usize> {
        self.pause.resume(strategy).await
    }

    pub fn workers(&self) -> &Arc<WorkerRegistry> {
        &self.workers
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn client_chain(&self) -> &ClientChain {
        &self.client
    }

    pub fn server_chain(&self) -> &ServerChain {
        &self.server
    }

    pub fn job_registry(&self) -> &Arc<JobRegistry> {
        self.monitor.registry()
    }

    pub fn paused_jobs(&self) -> &Arc<PausedJobs> {
        self.pause.paused()
    }

    pub fn governor(&self) -> &MemoryGovernor {
        &self.governor
    }
}

/// Builds a [`Pipeline`] with the default chains.
pub struct PipelineBuilder {
    broker: Arc<dyn Broker>,
    workers: Arc<WorkerRegistry>,
    flags: Arc<dyn FeatureFlags>,
    health: Arc<dyn HealthEvaluator>,
    cancellation: Arc<dyn CancellationStore>,
    process: Arc<dyn ProcessControl>,
    pause_strategies: Option<PauseStrategies>,
    registry: Option<Arc<JobRegistry>>,
    extra_client: Vec<Arc<dyn ClientMiddleware>>,
    extra_server: Vec<Arc<dyn ServerMiddleware>>,
    config: Config,
}

impl PipelineBuilder {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            workers: Arc::new(WorkerRegistry::new()),
            flags: Arc::new(InMemoryFeatureFlags::new()),
            health: Arc::new(InMemoryHealthEvaluator::new()),
            cancellation: Arc::new(InMemoryCancellationStore::new()),
            process: Arc::new(SystemProcess),
            pause_strategies: None,
            registry: None,
            extra_client: Vec::new(),
            extra_server: Vec::new(),
            config: Config::default(),
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn workers(mut self, workers: Arc<WorkerRegistry>) -> Self {
        self.workers = workers;
        self
    }

    pub fn feature_flags(mut self, flags: Arc<dyn FeatureFlags>) -> Self {
        self.flags = flags;
        self
    }

    pub fn health_evaluator(mut self, health: Arc<dyn HealthEvaluator>) -> Self {
        self.health = health;
        self
    }

    pub fn cancellation_store(mut self, store: Arc<dyn CancellationStore>) -> Self {
        self.cancellation = store;
        self
    }

    pub fn process(mut self, process: Arc<dyn ProcessControl>) -> Self {
        self.process = process;
        self
    }

    /// Replace the default pause strategies.
    pub fn pause_strategies(mut self, strategies: PauseStrategies) -> Self {
        self.pause_strategies = Some(strategies);
        self
    }

    /// Share a job registry constructed elsewhere in the process.
    pub fn job_registry(mut self, registry: Arc<JobRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Append a client middleware after the default ones.
    pub fn client_middleware(mut self, middleware: impl ClientMiddleware + 'static) -> Self {
        self.extra_client.push(Arc::new(middleware));
        self
    }

    /// Append a server middleware after the default ones.
    pub fn server_middleware(mut self, middleware: impl ServerMiddleware + 'static) -> Self {
        self.extra_server.push(Arc::new(middleware));
        self
    }

    pub fn build(self) -> Pipeline {
        let registry = self.registry.unwrap_or_else(|| Arc::new(JobRegistry::new()));
        let monitor = Arc::new(JobMonitor::new(
            registry,
            self.cancellation,
            self.config.cancellation.ttl,
        ));
        let strategies = self
            .pause_strategies
            .unwrap_or_else(|| PauseStrategies::with_defaults(Arc::clone(&self.flags)));
        let pause = Arc::new(PauseControl::new(
            Arc::new(strategies),
            Arc::new(PausedJobs::new()),
            Arc::clone(&self.broker),
        ));
        let governor = MemoryGovernor::new(self.config.governor.clone(), self.process);

        let mut client = ClientChain::new();
        client
            .register(ShardRoutingValidator)
            .register(CorrelationInjector)
            .register(IpAddressInjector)
            .register(ClientMetrics);
        for middleware in self.extra_client {
            client.middlewares.push(middleware);
        }

        let mut server = ServerChain::new();
        server
            .register(ShardAwarenessScope)
            .register(AdmissionController::new(
                self.flags,
                self.health,
                Arc::clone(&self.broker),
                self.config.admission.defer_delay,
            ))
            .register_shared(pause.clone())
            .register_shared(monitor.clone())
            .register(CorrelationExtractor)
            .register(IpAddressRestorer)
            .register(ServerMetrics)
            .register(MemoryGovernorMiddleware::new(governor.clone()));
        for middleware in self.extra_server {
            server.register_shared(middleware);
        }

        info!(
            client = ?client.names(),
            server = ?server.names(),
            governor_enabled = self.config.governor.is_enabled(),
            "Pipeline built"
        );

        Pipeline {
            workers: self.workers,
            broker: self.broker,
            client,
            server,
            monitor,
            pause,
            governor,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{handler_fn, InMemoryBroker};
    use parking_lot::Mutex;

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        short_circuit: bool,
    }

    #[async_trait]
    impl ServerMiddleware for Recorder {
        fn name(&self) -> &'static str {
            self.label
        }

        async fn call(
            &self,
            _worker: &WorkerDefinition,
            job: &mut Job,
            ctx: &ExecutionContext,
            next: Next<'_>,
        ) -> JobResult {
            self.log.lock().push(format!("{}:in", self.label));
            if self.short_circuit {
                return Ok(());
            }
            let result = next.run(job, ctx).await;
            self.log.lock().push(format!("{}:out", self.label));
            result
        }
    }

    fn recorder(label: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Recorder {
        Recorder {
            label,
            log: Arc::clone(log),
            short_circuit: false,
        }
    }

    fn worker_logging_to(log: &Arc<Mutex<Vec<String>>>) -> WorkerDefinition {
        let log = Arc::clone(log);
        WorkerDefinition::new(
            "W",
            handler_fn(move |_job, _ctx| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().push("body".to_string());
                    Ok(())
                }
            }),
        )
    }

    #[tokio::test]
    async fn test_chain_runs_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = ServerChain::new();
        chain
            .register(recorder("a", &log))
            .register(recorder("b", &log));

        let worker = worker_logging_to(&log);
        let mut job = Job::new("W", "default");
        chain
            .run(&worker, &mut job, &ExecutionContext::new())
            .await
            .unwrap();

        assert_eq!(
            *log.lock(),
            vec!["a:in", "b:in", "body", "b:out", "a:out"]
        );
        assert_eq!(chain.names(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_inner_layers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = ServerChain::new();
        chain
            .register(recorder("outer", &log))
            .register(Recorder {
                label: "gate",
                log: Arc::clone(&log),
                short_circuit: true,
            })
            .register(recorder("inner", &log));

        let worker = worker_logging_to(&log);
        let mut job = Job::new("W", "default");
        chain
            .run(&worker, &mut job, &ExecutionContext::new())
            .await
            .unwrap();

        assert_eq!(*log.lock(), vec!["outer:in", "gate:in", "outer:out"]);
    }

    #[tokio::test]
    async fn test_errors_propagate_unchanged() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = ServerChain::new();
        chain.register(recorder("a", &log));

        let worker = WorkerDefinition::new(
            "W",
            handler_fn(|_job, _ctx| async { Err(JobError::message("boom")) }),
        );
        let mut job = Job::new("W", "default");
        let err = chain
            .run(&worker, &mut job, &ExecutionContext::new())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "boom");
        assert_eq!(*log.lock(), vec!["a:in", "a:out"]);
    }

    #[tokio::test]
    async fn test_empty_client_chain_pushes() {
        let broker = InMemoryBroker::new();
        let chain = ClientChain::new();
        let worker = worker_logging_to(&Arc::new(Mutex::new(Vec::new())));
        let mut job = Job::new("W", "default");

        let outcome = chain
            .enqueue(&worker, &mut job, &ExecutionContext::new(), &broker)
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Pushed(job.id));
        assert_eq!(broker.ready_jobs().len(), 1);
    }

    #[test]
    fn test_default_chain_order() {
        let pipeline = Pipeline::builder(Arc::new(InMemoryBroker::new())).build();
        assert_eq!(
            pipeline.client_chain().names(),
            vec![
                "shard_routing_validator",
                "correlation_injector",
                "ip_address_injector",
                "client_metrics"
            ]
        );
        assert_eq!(
            pipeline.server_chain().names(),
            vec![
                "shard_awareness_scope",
                "admission_controller",
                "pause_control",
                "job_monitor",
                "correlation_extractor",
                "ip_address_restorer",
                "server_metrics",
                "memory_governor"
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_worker() {
        let pipeline = Pipeline::builder(Arc::new(InMemoryBroker::new())).build();
        let err = pipeline
            .enqueue("Missing", vec![], &ExecutionContext::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::UnknownWorker);

        let result = pipeline.perform(Job::new("Missing", "default")).await;
        assert!(matches!(result, Err(JobError::Infrastructure(_))));
    }
}

//! Worker types: static attributes, job handlers and the worker registry.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::{ExecutionContext, Job, JobResult};

// ═══════════════════════════════════════════════════════════════════════════════
// Static Attributes
// ═══════════════════════════════════════════════════════════════════════════════

/// How quickly a worker's jobs are expected to start and finish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    High,
    #[default]
    Low,
    Throttled,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Low => "low",
            Self::Throttled => "throttled",
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The resource a worker is known to be bound by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceBoundary {
    #[default]
    None,
    Cpu,
    Memory,
}

impl ResourceBoundary {
    /// Metric label value; unbounded workers render as an empty string.
    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Cpu => "cpu",
            Self::Memory => "memory",
        }
    }
}

/// Replica read policy declared by a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataConsistency {
    #[default]
    Always,
    Sticky,
    Delayed,
}

/// Schema and tables a database health check is evaluated against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthScope {
    pub schema: String,
    pub tables: Vec<String>,
}

impl HealthScope {
    pub fn new<I, S>(schema: impl Into<String>, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            schema: schema.into(),
            tables: tables.into_iter().map(Into::into).collect(),
        }
    }
}

/// Computes the health scope from the job being admitted.
pub type HealthScopeSupplier = Arc<dyn Fn(&Job) -> HealthScope + Send + Sync>;

/// How a worker opts into deferral while the database is unhealthy.
#[derive(Clone, Default)]
pub enum DatabaseHealthDeferral {
    #[default]
    None,
    Fixed {
        schema: String,
        tables: Vec<String>,
        delay: Duration,
    },
    Lazy {
        supplier: HealthScopeSupplier,
        delay: Duration,
    },
}

impl DatabaseHealthDeferral {
    pub fn fixed<I, S>(schema: impl Into<String>, tables: I, delay: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let HealthScope { schema, tables } = HealthScope::new(schema, tables);
        Self::Fixed {
            schema,
            tables,
            delay,
        }
    }

    pub fn lazy<F>(supplier: F, delay: Duration) -> Self
    where
        F: Fn(&Job) -> HealthScope + Send + Sync + 'static,
    {
        Self::Lazy {
            supplier: Arc::new(supplier),
            delay,
        }
    }

    /// Resolve the scope to evaluate for this job and the delay to apply.
    pub fn resolve(&self, job: &Job) -> Option<(HealthScope, Duration)> {
        match self {
            Self::None => None,
            Self::Fixed {
                schema,
                tables,
                delay,
            } => Some((
                HealthScope {
                    schema: schema.clone(),
                    tables: tables.clone(),
                },
                *delay,
            )),
            Self::Lazy { supplier, delay } => Some((supplier(job), *delay)),
        }
    }
}

impl fmt::Debug for DatabaseHealthDeferral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Fixed {
                schema,
                tables,
                delay,
            } => f
                .debug_struct("Fixed")
                .field("schema", schema)
                .field("tables", tables)
                .field("delay", delay)
                .finish(),
            Self::Lazy { delay, .. } => f
                .debug_struct("Lazy")
                .field("delay", delay)
                .finish_non_exhaustive(),
        }
    }
}

/// Static attributes declared once per worker type.
#[derive(Debug, Clone, Default)]
pub struct WorkerAttributes {
    /// `None` when the worker does not declare an urgency
    pub urgency: Option<Urgency>,
    pub external_dependencies: bool,
    pub resource_boundary: ResourceBoundary,
    pub feature_category: Option<String>,
    pub data_consistency: DataConsistency,
    /// Redis store the worker's jobs are routed to; `None` is the main store
    pub store: Option<String>,
    pub health_deferral: DatabaseHealthDeferral,
    /// Name of the pause-control strategy
    pub pause_control: Option<String>,
    /// Whether running jobs are tracked for interruption and cancellation
    pub cancellable: bool,
    /// Whether enqueues made while running must name their destination shard
    pub shard_aware: bool,
}

impl WorkerAttributes {
    /// Effective urgency.
    pub fn urgency(&self) -> Urgency {
        self.urgency.unwrap_or_default()
    }

    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = Some(urgency);
        self
    }

    pub fn with_external_dependencies(mut self) -> Self {
        self.external_dependencies = true;
        self
    }

    pub fn with_resource_boundary(mut self, boundary: ResourceBoundary) -> Self {
        self.resource_boundary = boundary;
        self
    }

    pub fn with_feature_category(mut self, category: impl Into<String>) -> Self {
        self.feature_category = Some(category.into());
        self
    }

    pub fn with_data_consistency(mut self, consistency: DataConsistency) -> Self {
        self.data_consistency = consistency;
        self
    }

    pub fn with_store(mut self, store: impl Into<String>) -> Self {
        self.store = Some(store.into());
        self
    }

    pub fn with_health_deferral(mut self, deferral: DatabaseHealthDeferral) -> Self {
        self.health_deferral = deferral;
        self
    }

    pub fn with_pause_control(mut self, strategy: impl Into<String>) -> Self {
        self.pause_control = Some(strategy.into());
        self
    }

    pub fn cancellable(mut self) -> Self {
        self.cancellable = true;
        self
    }

    pub fn shard_aware(mut self) -> Self {
        self.shard_aware = true;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handlers
// ═══════════════════════════════════════════════════════════════════════════════

/// The body of a worker.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn perform(&self, job: &Job, ctx: &ExecutionContext) -> JobResult;
}

/// A handler backed by an async closure over owned copies of the job and context.
pub struct FnHandler<F> {
    f: F,
}

/// Build a [`JobHandler`] from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Job, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    async fn perform(&self, job: &Job, ctx: &ExecutionContext) -> JobResult {
        (self.f)(job.clone(), ctx.clone()).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Definitions and Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Queue used when a worker does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// A registered worker type.
#[derive(Clone)]
pub struct WorkerDefinition {
    pub name: String,
    /// Queue new jobs for this worker are pushed to
    pub queue: String,
    pub attributes: WorkerAttributes,
    pub handler: Arc<dyn JobHandler>,
}

impl WorkerDefinition {
    pub fn new(name: impl Into<String>, handler: impl JobHandler + 'static) -> Self {
        Self {
            name: name.into(),
            queue: DEFAULT_QUEUE.to_string(),
            attributes: WorkerAttributes::default(),
            handler: Arc::new(handler),
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_attributes(mut self, attributes: WorkerAttributes) -> Self {
        self.attributes = attributes;
        self
    }
}

impl fmt::Debug for WorkerDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerDefinition")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("attributes", &self.attributes)
            .finish_non_exhaustive()
    }
}

/// Worker type name -> definition, populated at registration time.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: DashMap<String, Arc<WorkerDefinition>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker, replacing any previous definition with the same name.
    pub fn register(&self, definition: WorkerDefinition) -> Arc<WorkerDefinition> {
        let definition = Arc::new(definition);
        self.workers
            .insert(definition.name.clone(), Arc::clone(&definition));
        definition
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkerDefinition>> {
        self.workers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn definitions(&self) -> Vec<Arc<WorkerDefinition>> {
        self.workers.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> impl JobHandler {
        handler_fn(|_job, _ctx| async { Ok(()) })
    }

    #[test]
    fn test_urgency_defaults_to_low() {
        let attrs = WorkerAttributes::default();
        assert!(attrs.urgency.is_none());
        assert_eq!(attrs.urgency(), Urgency::Low);
        assert_eq!(attrs.with_urgency(Urgency::High).urgency(), Urgency::High);
    }

    #[test]
    fn test_resource_boundary_labels() {
        assert_eq!(ResourceBoundary::None.label(), "");
        assert_eq!(ResourceBoundary::Cpu.label(), "cpu");
        assert_eq!(ResourceBoundary::Memory.label(), "memory");
    }

    #[test]
    fn test_health_deferral_resolution() {
        let job = Job::new("W", "default").with_args(vec![serde_json::json!("ci")]);

        assert!(DatabaseHealthDeferral::None.resolve(&job).is_none());

        let fixed = DatabaseHealthDeferral::fixed("main", ["users"], Duration::from_secs(60));
        let (scope, delay) = fixed.resolve(&job).unwrap();
        assert_eq!(scope, HealthScope::new("main", ["users"]));
        assert_eq!(delay, Duration::from_secs(60));

        let lazy = DatabaseHealthDeferral::lazy(
            |job| {
                let schema = job.args[0].as_str().unwrap_or("main").to_string();
                HealthScope::new(schema, ["builds"])
            },
            Duration::from_secs(30),
        );
        let (scope, delay) = lazy.resolve(&job).unwrap();
        assert_eq!(scope.schema, "ci");
        assert_eq!(delay, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_fn_handler() {
        let handler = handler_fn(|job, _ctx| async move {
            if job.args.is_empty() {
                Ok(())
            } else {
                Err(crate::jobs::JobError::message("unexpected args"))
            }
        });
        let ctx = ExecutionContext::new();
        assert!(handler.perform(&Job::new("W", "q"), &ctx).await.is_ok());
        let with_args = Job::new("W", "q").with_args(vec![serde_json::json!(1)]);
        assert!(handler.perform(&with_args, &ctx).await.is_err());
    }

    #[test]
    fn test_registry() {
        let registry = WorkerRegistry::new();
        assert!(registry.is_empty());

        registry.register(
            WorkerDefinition::new("B", noop())
                .with_attributes(WorkerAttributes::default().with_feature_category("source_code")),
        );
        registry.register(WorkerDefinition::new("A", noop()));

        assert_eq!(registry.names(), vec!["A", "B"]);
        let b = registry.get("B").unwrap();
        assert_eq!(b.attributes.feature_category.as_deref(), Some("source_code"));
        assert!(registry.get("C").is_none());
    }
}

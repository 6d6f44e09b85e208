//! Running-job registry, cooperative interruption and cancellation markers.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Next, ServerMiddleware};
use crate::config::RedisConfig;
use crate::error::{ConveyorError, ErrorCode, Result};
use crate::jobs::{ExecutionContext, Job, JobId, JobResult, WorkerDefinition};

// ═══════════════════════════════════════════════════════════════════════════════
// Cancellation Markers
// ═══════════════════════════════════════════════════════════════════════════════

/// Store of expiring "cancelled" markers keyed by job id.
#[async_trait]
pub trait CancellationStore: Send + Sync {
    async fn mark_cancelled(&self, job_id: JobId, ttl: Duration) -> Result<()>;

    async fn is_cancelled(&self, job_id: JobId) -> Result<bool>;
}

/// In-memory markers for testing and development.
#[derive(Debug, Default)]
pub struct InMemoryCancellationStore {
    markers: DashMap<JobId, tokio::time::Instant>,
}

impl InMemoryCancellationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CancellationStore for InMemoryCancellationStore {
    async fn mark_cancelled(&self, job_id: JobId, ttl: Duration) -> Result<()> {
        self.markers
            .insert(job_id, tokio::time::Instant::now() + ttl);
        Ok(())
    }

    async fn is_cancelled(&self, job_id: JobId) -> Result<bool> {
        let now = tokio::time::Instant::now();
        let expired = match self.markers.get(&job_id) {
            Some(expires_at) if *expires_at > now => return Ok(true),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.markers.remove_if(&job_id, |_, expires_at| *expires_at <= now);
        }
        Ok(false)
    }
}

/// Redis markers: `SET <namespace>:cancel:<job_id> 1 EX <ttl>`.
pub struct RedisCancellationStore {
    client: redis::Client,
    namespace: String,
}

impl RedisCancellationStore {
    pub fn new(client: redis::Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Open a client for `config.url`, keeping markers under `config.namespace`.
    pub fn from_config(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            ConveyorError::with_internal(
                ErrorCode::CancellationStoreError,
                "Failed to create Redis client",
                e.to_string(),
            )
        })?;
        Ok(Self::new(client, config.namespace.clone()))
    }

    fn key(&self, job_id: JobId) -> String {
        format!("{}:cancel:{}", self.namespace, job_id)
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                ConveyorError::with_internal(
                    ErrorCode::CancellationStoreError,
                    "Failed to get Redis connection for cancellation markers",
                    e.to_string(),
                )
            })
    }
}

#[async_trait]
impl CancellationStore for RedisCancellationStore {
    async fn mark_cancelled(&self, job_id: JobId, ttl: Duration) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("SET")
            .arg(self.key(job_id))
            .arg(1)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| {
                ConveyorError::with_internal(
                    ErrorCode::CancellationStoreError,
                    "Failed to set cancellation marker",
                    e.to_string(),
                )
            })
    }

    async fn is_cancelled(&self, job_id: JobId) -> Result<bool> {
        let mut conn = self.get_conn().await?;
        let exists: i64 = redis::cmd("EXISTS")
            .arg(self.key(job_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                ConveyorError::with_internal(
                    ErrorCode::CancellationStoreError,
                    "Failed to read cancellation marker",
                    e.to_string(),
                )
            })?;
        Ok(exists > 0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// A running job as seen by the control plane.
#[derive(Debug, Clone)]
pub struct RunningJob {
    pub job_id: JobId,
    pub worker: String,
    pub started_at: Instant,
    /// OS thread that registered the job
    pub thread: ThreadId,
    pub thread_name: Option<String>,
    cancellation: CancellationToken,
    interrupts: Arc<AtomicU32>,
    serial: u64,
}

impl RunningJob {
    /// Whether an interrupt has been delivered.
    pub fn is_interrupted(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Number of interrupts delivered while the job ran.
    pub fn interrupt_count(&self) -> u32 {
        self.interrupts.load(Ordering::Relaxed)
    }
}

/// Process-wide map of running jobs. Construct once and share.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: DashMap<JobId, RunningJob>,
    serial: AtomicU64,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a job until the returned guard drops.
    pub fn register(&self, job_id: JobId, worker: &str) -> Registration<'_> {
        let thread = std::thread::current();
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        let entry = RunningJob {
            job_id,
            worker: worker.to_string(),
            started_at: Instant::now(),
            thread: thread.id(),
            thread_name: thread.name().map(str::to_string),
            cancellation: CancellationToken::new(),
            interrupts: Arc::new(AtomicU32::new(0)),
            serial,
        };
        let cancellation = entry.cancellation.clone();
        self.jobs.insert(job_id, entry);

        Registration {
            registry: self,
            job_id,
            serial,
            cancellation,
        }
    }

    /// Deliver a cooperative interrupt. Unknown ids return `None`.
    pub fn interrupt(&self, job_id: JobId) -> Option<RunningJob> {
        let entry = self.jobs.get(&job_id)?;
        entry.cancellation.cancel();
        entry.interrupts.fetch_add(1, Ordering::Relaxed);
        info!(job_id = %job_id, worker = %entry.worker, "Interrupt delivered");
        Some(entry.clone())
    }

    pub fn get(&self, job_id: JobId) -> Option<RunningJob> {
        self.jobs.get(&job_id).map(|entry| entry.clone())
    }

    pub fn running(&self) -> Vec<RunningJob> {
        self.jobs.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Removes a job from the registry on drop.
pub struct Registration<'a> {
    registry: &'a JobRegistry,
    job_id: JobId,
    serial: u64,
    cancellation: CancellationToken,
}

impl Registration<'_> {
    /// The job's interrupt signal.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        // A duplicate delivery may have re-registered the id; only remove our entry.
        let serial = self.serial;
        self.registry
            .jobs
            .remove_if(&self.job_id, |_, entry| entry.serial == serial);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Middleware
// ═══════════════════════════════════════════════════════════════════════════════

/// Tracks cancellable jobs and refuses to start cancelled ones.
pub struct JobMonitor {
    registry: Arc<JobRegistry>,
    store: Arc<dyn CancellationStore>,
    ttl: Duration,
}

impl JobMonitor {
    pub fn new(registry: Arc<JobRegistry>, store: Arc<dyn CancellationStore>, ttl: Duration) -> Self {
        Self {
            registry,
            store,
            ttl,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Deliver a cooperative interrupt to a running job.
    pub fn interrupt(&self, job_id: JobId) -> Option<RunningJob> {
        self.registry.interrupt(job_id)
    }

    /// Set the cancellation marker, whether or not the job is running.
    pub async fn mark_cancelled(&self, job_id: JobId) -> Result<()> {
        self.store.mark_cancelled(job_id, self.ttl).await?;
        info!(job_id = %job_id, ttl_secs = self.ttl.as_secs(), "Job marked cancelled");
        Ok(())
    }
}

#[async_trait]
impl ServerMiddleware for JobMonitor {
    fn name(&self) -> &'static str {
        "job_monitor"
    }

    async fn call(
        &self,
        worker: &WorkerDefinition,
        job: &mut Job,
        ctx: &ExecutionContext,
        next: Next<'_>,
    ) -> JobResult {
        if !worker.attributes.cancellable {
            return next.run(job, ctx).await;
        }

        match self.store.is_cancelled(job.id).await {
            Ok(true) => {
                info!(worker = %worker.name, job_id = %job.id, "Job cancelled before start");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Cancellation check failed; running job");
            }
        }

        let registration = self.registry.register(job.id, &worker.name);
        let scoped = ctx.with_cancellation(registration.cancellation().clone());
        next.run(job, &scoped).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_removed_on_drop() {
        let registry = JobRegistry::new();
        let id = JobId::new();
        {
            let _registration = registry.register(id, "W");
            assert_eq!(registry.len(), 1);
            assert_eq!(registry.get(id).unwrap().thread, std::thread::current().id());
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_interrupt_unknown_returns_none() {
        let registry = JobRegistry::new();
        assert!(registry.interrupt(JobId::new()).is_none());
    }

    #[test]
    fn test_interrupt_known_cancels_token() {
        let registry = JobRegistry::new();
        let id = JobId::new();
        let registration = registry.register(id, "W");

        let handle = registry.interrupt(id).unwrap();
        assert_eq!(handle.job_id, id);
        assert_eq!(handle.interrupt_count(), 1);
        assert!(handle.is_interrupted());
        assert!(registration.cancellation().is_cancelled());
    }

    #[test]
    fn test_stale_guard_keeps_newer_registration() {
        let registry = JobRegistry::new();
        let id = JobId::new();
        let first = registry.register(id, "W");
        let second = registry.register(id, "W");

        drop(first);
        assert_eq!(registry.len(), 1);
        drop(second);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_memory_markers_expire() {
        let store = InMemoryCancellationStore::new();
        let id = JobId::new();

        assert!(!store.is_cancelled(id).await.unwrap());
        store.mark_cancelled(id, Duration::from_secs(3600)).await.unwrap();
        assert!(store.is_cancelled(id).await.unwrap());

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert!(!store.is_cancelled(id).await.unwrap());
    }

    fn redis_config(namespace: &str) -> RedisConfig {
        RedisConfig {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            namespace: namespace.to_string(),
        }
    }

    #[test]
    fn test_redis_marker_key() {
        let store = RedisCancellationStore::from_config(&redis_config("conveyor")).unwrap();
        let id = JobId::new();
        assert_eq!(store.key(id), format!("conveyor:cancel:{}", id));
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server (REDIS_URL)"]
    async fn test_redis_markers_round_trip() {
        let namespace = format!("conveyor-test-{}", uuid::Uuid::new_v4());
        let store = RedisCancellationStore::from_config(&redis_config(&namespace)).unwrap();
        let id = JobId::new();

        assert!(!store.is_cancelled(id).await.unwrap());
        store.mark_cancelled(id, Duration::from_secs(60)).await.unwrap();
        assert!(store.is_cancelled(id).await.unwrap());
        assert!(!store.is_cancelled(JobId::new()).await.unwrap());
    }
}

//! Broker backends: where enqueued and deferred jobs wait to be executed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::time::Duration;

use super::Job;
use crate::config::RedisConfig;
use crate::error::{ConveyorError, ErrorCode, Result};

/// Job broker consumed by the pipeline.
///
/// Delivery is at-least-once. Backends stamp `enqueued_at` on push.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Push a job onto its queue for immediate execution.
    async fn enqueue(&self, job: Job) -> Result<()>;

    /// Schedule a job to become ready after `delay`.
    async fn perform_in(&self, delay: Duration, job: Job) -> Result<()>;

    /// Pop the next ready job, if any.
    async fn dequeue(&self) -> Result<Option<Job>>;
}

fn to_chrono(delay: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(delay).map_err(|e| {
        ConveyorError::with_internal(ErrorCode::InvalidJob, "Delay out of range", e.to_string())
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Broker
// ═══════════════════════════════════════════════════════════════════════════════

/// A job waiting for its run time.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub run_at: DateTime<Utc>,
    pub delay: Duration,
    pub job: Job,
}

impl Eq for ScheduledJob {}

impl PartialEq for ScheduledJob {
    fn eq(&self, other: &Self) -> bool {
        self.job.id == other.job.id
    }
}

impl PartialOrd for ScheduledJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledJob {
    // Earliest run time on top of the max-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other.run_at.cmp(&self.run_at)
    }
}

#[derive(Debug, Default)]
struct InMemoryState {
    ready: VecDeque<Job>,
    scheduled: BinaryHeap<ScheduledJob>,
}

/// In-memory broker for testing and development.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<InMemoryState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move scheduled jobs whose run time has passed onto the ready queue.
    pub fn promote_due(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.lock();
        let mut promoted = 0;
        while state
            .scheduled
            .peek()
            .is_some_and(|scheduled| scheduled.run_at <= now)
        {
            if let Some(scheduled) = state.scheduled.pop() {
                let mut job = scheduled.job;
                job.enqueued_at = Some(now);
                state.ready.push_back(job);
                promoted += 1;
            }
        }
        promoted
    }

    /// Snapshot of the ready queue, oldest first.
    pub fn ready_jobs(&self) -> Vec<Job> {
        self.state.lock().ready.iter().cloned().collect()
    }

    /// Snapshot of scheduled jobs, earliest run time first.
    pub fn scheduled_jobs(&self) -> Vec<ScheduledJob> {
        let mut scheduled = self.state.lock().scheduled.clone().into_vec();
        scheduled.sort_by_key(|s| s.run_at);
        scheduled
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.ready.len() + state.scheduled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, mut job: Job) -> Result<()> {
        job.enqueued_at = Some(Utc::now());
        tracing::debug!(queue = %job.queue, job_id = %job.id, "Job enqueued");
        self.state.lock().ready.push_back(job);
        Ok(())
    }

    async fn perform_in(&self, delay: Duration, job: Job) -> Result<()> {
        let run_at = Utc::now() + to_chrono(delay)?;
        tracing::debug!(queue = %job.queue, job_id = %job.id, run_at = %run_at, "Job scheduled");
        self.state.lock().scheduled.push(ScheduledJob { run_at, delay, job });
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Job>> {
        self.promote_due(Utc::now());
        Ok(self.state.lock().ready.pop_front())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Broker
// ═══════════════════════════════════════════════════════════════════════════════

/// Redis-backed broker: one list per queue plus a sorted set of scheduled jobs.
pub struct RedisBroker {
    client: redis::Client,
    namespace: String,
    queues: Vec<String>,
    block_timeout_secs: u64,
}

impl RedisBroker {
    /// Create a broker that serves the given queues.
    ///
    /// # Arguments
    /// * `client` - A Redis client
    /// * `namespace` - Key prefix (e.g. `"conveyor"`)
    /// * `queues` - Queues popped by `dequeue`, in priority order
    pub fn new<I, S>(client: redis::Client, namespace: impl Into<String>, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            client,
            namespace: namespace.into(),
            queues: queues.into_iter().map(Into::into).collect(),
            block_timeout_secs: 1,
        }
    }

    /// Open a client for `config.url` and serve the given queues under
    /// `config.namespace`. No connection is made until first use.
    pub fn from_config<I, S>(config: &RedisConfig, queues: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            ConveyorError::with_internal(
                ErrorCode::BrokerConnectionFailed,
                "Failed to create Redis client",
                e.to_string(),
            )
        })?;
        Ok(Self::new(client, config.namespace.clone(), queues))
    }

    /// How long `dequeue` blocks waiting for a job.
    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout_secs = timeout.as_secs().max(1);
        self
    }

    fn queue_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.namespace, queue)
    }

    fn schedule_key(&self) -> String {
        format!("{}:schedule", self.namespace)
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                ConveyorError::with_internal(
                    ErrorCode::BrokerConnectionFailed,
                    "Failed to get Redis connection for broker",
                    e.to_string(),
                )
            })
    }

    /// Move due scheduled jobs onto their queues.
    pub async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.get_conn().await?;
        let schedule_key = self.schedule_key();

        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&schedule_key)
            .arg("-inf")
            .arg(now.timestamp_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(100)
            .query_async(&mut conn)
            .await?;

        let mut promoted = 0;
        for payload in due {
            // Whoever removes the member owns the promotion.
            let removed: i64 = redis::cmd("ZREM")
                .arg(&schedule_key)
                .arg(&payload)
                .query_async(&mut conn)
                .await?;
            if removed == 0 {
                continue;
            }

            let mut job: Job = serde_json::from_str(&payload)?;
            job.enqueued_at = Some(now);
            redis::cmd("RPUSH")
                .arg(self.queue_key(&job.queue))
                .arg(serde_json::to_string(&job)?)
                .query_async::<_, i64>(&mut conn)
                .await?;
            promoted += 1;
        }

        Ok(promoted)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, mut job: Job) -> Result<()> {
        job.enqueued_at = Some(Utc::now());
        let serialized = serde_json::to_string(&job)?;

        let mut conn = self.get_conn().await?;
        redis::cmd("RPUSH")
            .arg(self.queue_key(&job.queue))
            .arg(&serialized)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| {
                ConveyorError::with_internal(
                    ErrorCode::BrokerError,
                    "Failed to enqueue job to Redis",
                    e.to_string(),
                )
            })?;

        tracing::debug!(queue = %job.queue, job_id = %job.id, "Job enqueued");
        Ok(())
    }

    async fn perform_in(&self, delay: Duration, job: Job) -> Result<()> {
        let run_at = Utc::now() + to_chrono(delay)?;
        let serialized = serde_json::to_string(&job)?;

        let mut conn = self.get_conn().await?;
        redis::cmd("ZADD")
            .arg(self.schedule_key())
            .arg(run_at.timestamp_millis())
            .arg(&serialized)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| {
                ConveyorError::with_internal(
                    ErrorCode::BrokerError,
                    "Failed to schedule job in Redis",
                    e.to_string(),
                )
            })?;

        tracing::debug!(queue = %job.queue, job_id = %job.id, run_at = %run_at, "Job scheduled");
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Job>> {
        self.promote_due(Utc::now()).await?;

        let keys: Vec<String> = self.queues.iter().map(|q| self.queue_key(q)).collect();
        let mut conn = self.get_conn().await?;

        let result: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(&keys)
            .arg(self.block_timeout_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                ConveyorError::with_internal(
                    ErrorCode::BrokerError,
                    "Failed to dequeue job from Redis",
                    e.to_string(),
                )
            })?;

        match result {
            Some((_key, value)) => {
                let job: Job = serde_json::from_str(&value)?;
                tracing::debug!(queue = %job.queue, job_id = %job.id, "Job dequeued");
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_fifo() {
        let broker = InMemoryBroker::new();
        broker.enqueue(Job::new("first", "default")).await.unwrap();
        broker.enqueue(Job::new("second", "default")).await.unwrap();

        let first = broker.dequeue().await.unwrap().unwrap();
        assert_eq!(first.worker, "first");
        assert!(first.enqueued_at.is_some());
        assert_eq!(broker.dequeue().await.unwrap().unwrap().worker, "second");
        assert!(broker.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scheduled_jobs_wait_for_run_time() {
        let broker = InMemoryBroker::new();
        broker
            .perform_in(Duration::from_secs(300), Job::new("later", "default"))
            .await
            .unwrap();
        broker
            .perform_in(Duration::from_secs(60), Job::new("sooner", "default"))
            .await
            .unwrap();

        assert!(broker.dequeue().await.unwrap().is_none());

        let scheduled = broker.scheduled_jobs();
        assert_eq!(scheduled.len(), 2);
        assert_eq!(scheduled[0].job.worker, "sooner");
        assert_eq!(scheduled[0].delay, Duration::from_secs(60));

        let promoted = broker.promote_due(Utc::now() + chrono::Duration::seconds(120));
        assert_eq!(promoted, 1);
        assert_eq!(broker.dequeue().await.unwrap().unwrap().worker, "sooner");
        assert_eq!(broker.len(), 1);
    }

    fn redis_config(namespace: &str) -> RedisConfig {
        RedisConfig {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            namespace: namespace.to_string(),
        }
    }

    #[test]
    fn test_redis_keys_use_namespace() {
        // No connection is made; keys are derived locally.
        let broker = RedisBroker::from_config(&redis_config("conveyor"), ["default"]).unwrap();
        assert_eq!(broker.queue_key("default"), "conveyor:queue:default");
        assert_eq!(broker.queue_key("mailers"), "conveyor:queue:mailers");
        assert_eq!(broker.schedule_key(), "conveyor:schedule");
        assert_eq!(broker.queues, vec!["default".to_string()]);
    }

    #[test]
    fn test_redis_broker_rejects_invalid_url() {
        let config = RedisConfig {
            url: "not a redis url".to_string(),
            namespace: "conveyor".to_string(),
        };
        let error = RedisBroker::from_config(&config, ["default"]).err().unwrap();
        assert_eq!(error.code(), ErrorCode::BrokerConnectionFailed);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server (REDIS_URL)"]
    async fn test_redis_round_trip() {
        let namespace = format!("conveyor-test-{}", uuid::Uuid::new_v4());
        let broker = RedisBroker::from_config(&redis_config(&namespace), ["default"])
            .unwrap()
            .with_block_timeout(Duration::from_secs(1));

        let job = Job::new("W", "default").with_correlation_id("req-1");
        let id = job.id;
        broker.enqueue(job).await.unwrap();

        let popped = broker.dequeue().await.unwrap().unwrap();
        assert_eq!(popped.id, id);
        assert_eq!(popped.correlation_id.as_deref(), Some("req-1"));
        assert!(popped.enqueued_at.is_some());

        broker
            .perform_in(Duration::from_secs(3600), Job::new("W", "default"))
            .await
            .unwrap();
        assert!(broker.dequeue().await.unwrap().is_none());
        assert_eq!(
            broker
                .promote_due(Utc::now() + chrono::Duration::hours(2))
                .await
                .unwrap(),
            1
        );
        assert_eq!(broker.dequeue().await.unwrap().unwrap().worker, "W");
    }
}

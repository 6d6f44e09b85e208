//! Job payloads and job outcomes.
//!
//! - **Job**: the unit of work carried from enqueue to execution
//! - **DeferReason**: why admission control pushed a job into the future
//! - **JobError**: every way a job attempt can end other than success

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::error::ConveyorError;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Deferral
// ═══════════════════════════════════════════════════════════════════════════════

/// Why a job was deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    /// The worker's run flag is explicitly off
    FeatureFlag,
    /// A database health indicator asked workers to back off
    DatabaseHealthCheck,
}

impl DeferReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FeatureFlag => "feature_flag",
            Self::DatabaseHealthCheck => "database_health_check",
        }
    }
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A unit of work travelling through the client and server chains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,
    /// Queue the job is pushed to
    pub queue: String,
    /// Worker type that performs the job
    pub worker: String,
    /// Positional arguments
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    /// Present once the broker has retried the job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    /// Present once the job has been interrupted by a process shutdown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupted_count: Option<u32>,
    /// Set when admission control deferred this job
    #[serde(default)]
    pub deferred: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferred_by: Option<DeferReason>,
    #[serde(default)]
    pub deferred_count: u32,
    /// Set when admission control dropped this job
    #[serde(default)]
    pub dropped: bool,
    /// Correlation identifier linking log and trace entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Client IP address of the request that enqueued the job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address_state: Option<String>,
    /// Database name -> write-ahead-log position at enqueue time
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub wal_locations: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a first-attempt job for a worker on a queue.
    pub fn new(worker: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            queue: queue.into(),
            worker: worker.into(),
            args: Vec::new(),
            retry_count: None,
            interrupted_count: None,
            deferred: false,
            deferred_by: None,
            deferred_count: 0,
            dropped: false,
            correlation_id: None,
            ip_address_state: None,
            wal_locations: HashMap::new(),
            enqueued_at: None,
            started_at: None,
        }
    }

    /// Set the arguments.
    pub fn with_args(mut self, args: Vec<serde_json::Value>) -> Self {
        self.args = args;
        self
    }

    /// Set a correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the retry count.
    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    /// Set the interrupted count.
    pub fn with_interrupted_count(mut self, count: u32) -> Self {
        self.interrupted_count = Some(count);
        self
    }

    /// Set the enqueue timestamp.
    pub fn enqueued_at(mut self, at: DateTime<Utc>) -> Self {
        self.enqueued_at = Some(at);
        self
    }

    /// Time spent waiting between enqueue and dequeue.
    ///
    /// Measured up to `started_at` when the broker recorded it, otherwise up to
    /// `now`. `None` when the enqueue time is unknown or lies in the future.
    pub fn queue_duration(&self, now: DateTime<Utc>) -> Option<Duration> {
        let enqueued_at = self.enqueued_at?;
        let started_at = self.started_at.unwrap_or(now);
        (started_at - enqueued_at).to_std().ok()
    }

    /// Record a deferral on this attempt.
    pub fn mark_deferred(&mut self, reason: DeferReason) {
        self.deferred = true;
        self.deferred_by = Some(reason);
        self.deferred_count += 1;
    }

    /// Forget a deferral left over from a previous attempt.
    pub fn clear_deferral(&mut self) {
        self.deferred = false;
        self.deferred_by = None;
    }

    /// The job to schedule in place of a deferred attempt.
    ///
    /// Keeps worker, queue, arguments and ambient fields; starts a fresh
    /// attempt history under a new id.
    pub fn deferred_copy(&self) -> Job {
        Job {
            id: JobId::new(),
            retry_count: None,
            interrupted_count: None,
            dropped: false,
            enqueued_at: None,
            started_at: None,
            ..self.clone()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Every way a job attempt can end other than success.
///
/// Dropped and deferred jobs are not errors: admission control returns
/// `Ok(())` without running the job.
#[derive(Debug, Error)]
pub enum JobError {
    /// The job body failed. The original error value is kept intact.
    #[error("{0}")]
    Failed(Box<dyn std::error::Error + Send + Sync + 'static>),

    /// The job asked the process to shut down gracefully.
    #[error("graceful shutdown requested: {reason}")]
    WantShutdown { reason: String },

    /// The job observed a cooperative interrupt and stopped.
    #[error("job {0} was interrupted")]
    Interrupted(JobId),

    /// A collaborator failed while a middleware handled the job.
    #[error(transparent)]
    Infrastructure(#[from] ConveyorError),
}

impl JobError {
    /// Wrap an error raised by a job body.
    pub fn failed<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Failed(Box::new(error))
    }

    /// A job failure carrying only a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self::Failed(message.into().into())
    }

    /// Ask for a graceful process shutdown.
    pub fn want_shutdown(reason: impl Into<String>) -> Self {
        Self::WantShutdown {
            reason: reason.into(),
        }
    }

    pub fn is_want_shutdown(&self) -> bool {
        matches!(self, Self::WantShutdown { .. })
    }

    /// Borrow the original job-body error as a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Self::Failed(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Short kind used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::WantShutdown { .. } => "want_shutdown",
            Self::Interrupted(_) => "interrupted",
            Self::Infrastructure(_) => "infrastructure",
        }
    }
}

/// Result type for job execution.
pub type JobResult = std::result::Result<(), JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

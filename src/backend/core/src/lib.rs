#![allow(clippy::result_large_err)]
//! # Conveyor Core
//!
//! Middleware pipeline wrapped around background-job enqueue and execution.
//!
//! ## Architecture
//!
//! - **Client chain**: Shard routing check, correlation and IP propagation, enqueue metrics
//! - **Server chain**: Admission control (drop / defer / pause), cancellation and interrupts,
//!   context restoration, execution metrics
//! - **Memory governor**: RSS ceiling with a TSTP / TERM / KILL escalation sequence
//! - **Jobs**: Job envelope, worker definitions and registry, brokers, processor pool
//! - **Telemetry**: Structured logging and Prometheus metrics

pub mod config;
pub mod error;
pub mod governor;
pub mod jobs;
pub mod middleware;
pub mod telemetry;

pub use error::{ConveyorError, ErrorCode, ErrorContext, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{ConveyorError, ErrorCode, ErrorContext, Result};
    pub use crate::governor::{MemoryGovernor, ProcessControl, ShutdownState, SystemProcess};
    pub use crate::jobs::{
        handler_fn, Broker, DatabaseHealthDeferral, ExecutionContext, InMemoryBroker, Job,
        JobError, JobHandler, JobId, JobResult, Processor, RedisBroker, ResourceBoundary,
        Urgency, WorkerAttributes, WorkerDefinition, WorkerRegistry,
    };
    pub use crate::middleware::{
        ClientMiddleware, EnqueueOutcome, FeatureFlags, HealthEvaluator, Next, Pipeline,
        PipelineBuilder, ServerMiddleware,
    };
}

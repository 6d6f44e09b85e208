//! Jobs, workers and the broker they travel through.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                               Job Flow                                      │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐    ┌─────────────┐   │
//! │  │   Worker    │    │   Client    │    │   Broker    │    │  Processor  │   │
//! │  │ Definition  │───▶│   Chain     │───▶│ (memory /   │───▶│  (server    │   │
//! │  │ + Registry  │    │             │    │   Redis)    │    │   chain)    │   │
//! │  └─────────────┘    └─────────────┘    └─────────────┘    └─────────────┘   │
//! │                                               ▲                  │          │
//! │                                               └── perform_in ────┘          │
//! │                                                  (deferred copies)          │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use conveyor_core::jobs::{handler_fn, InMemoryBroker, WorkerDefinition, WorkerAttributes};
//! use conveyor_core::middleware::Pipeline;
//!
//! let pipeline = Pipeline::builder(Arc::new(InMemoryBroker::new())).build();
//! pipeline.register_worker(
//!     WorkerDefinition::new("ExportWorker", handler_fn(|job, ctx| async move {
//!         ctx.checkpoint(job.id)?;
//!         Ok(())
//!     }))
//!     .with_attributes(WorkerAttributes::default().cancellable()),
//! );
//!
//! pipeline.enqueue("ExportWorker", vec![json!(42)], &ExecutionContext::new()).await?;
//! ```

pub mod broker;
pub mod context;
pub mod job;
pub mod processor;
pub mod worker;

pub use broker::{Broker, InMemoryBroker, RedisBroker, ScheduledJob};
pub use context::ExecutionContext;
pub use job::{DeferReason, Job, JobError, JobId, JobResult};
pub use processor::{Processor, ProcessorHandle, ProcessorStats};
pub use worker::{
    handler_fn, DataConsistency, DatabaseHealthDeferral, FnHandler, HealthScope,
    HealthScopeSupplier, JobHandler, ResourceBoundary, Urgency, WorkerAttributes,
    WorkerDefinition, WorkerRegistry, DEFAULT_QUEUE,
};

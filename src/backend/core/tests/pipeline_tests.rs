//! Integration tests for the client and server chains.
//!
//! Tests cover:
//! - Execution metrics for successful and failing jobs
//! - Queue duration, retry and interruption counters
//! - Enqueue metrics and label derivation
//! - Correlation id and client IP propagation through the broker
//! - Shard routing validation

mod common;

use common::{builder, counting_worker, failing_worker, sample, with_recorder};
use conveyor_core::error::ErrorCode;
use conveyor_core::jobs::{
    handler_fn, Broker, ExecutionContext, InMemoryBroker, Job, JobError, ResourceBoundary,
    Urgency, WorkerAttributes, WorkerDefinition,
};
use conveyor_core::middleware::{EnqueueOutcome, FlagKey, InMemoryFeatureFlags, ServerMetrics};
use conveyor_core::telemetry::metrics::names;
use parking_lot::Mutex;
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn count(name: &str) -> String {
    format!("{}_count", name)
}

#[derive(Debug)]
struct ExportError {
    rows: usize,
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "export failed after {} rows", self.rows)
    }
}

impl std::error::Error for ExportError {}

// ============================================================================
// Server Metrics
// ============================================================================

#[test]
fn test_successful_job_records_completion_once() {
    let broker = Arc::new(InMemoryBroker::new());
    let flags = Arc::new(InMemoryFeatureFlags::new());
    flags.set(FlagKey::drop_jobs("W"), false);
    flags.set(FlagKey::run_jobs("W"), true);
    let pipeline = builder(broker).feature_flags(flags).build();

    let runs = Arc::new(AtomicUsize::new(0));
    pipeline.register_worker(counting_worker("W", WorkerAttributes::default(), runs.clone()));

    let (result, rendered) =
        with_recorder(async { pipeline.perform(Job::new("W", "default")).await });

    assert!(result.is_ok());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        sample(
            &rendered,
            &count(names::JOBS_COMPLETION_SECONDS),
            &[("worker", "W"), ("job_status", "done")]
        ),
        Some(1.0)
    );
    assert_eq!(
        sample(&rendered, names::RUNNING_JOBS, &[("worker", "W")]),
        Some(0.0)
    );
    assert_eq!(sample(&rendered, names::JOBS_FAILED_TOTAL, &[]), None);
}

#[test]
fn test_failing_job_counts_failure_and_keeps_error() {
    let broker = Arc::new(InMemoryBroker::new());
    let pipeline = builder(broker).build();
    pipeline.register_worker(WorkerDefinition::new(
        "ExportWorker",
        handler_fn(|_job: Job, _ctx| async { Err(JobError::failed(ExportError { rows: 17 })) }),
    ));

    let (result, rendered) =
        with_recorder(async { pipeline.perform(Job::new("ExportWorker", "default")).await });

    let error = result.unwrap_err();
    assert_eq!(error.downcast_ref::<ExportError>().unwrap().rows, 17);
    assert_eq!(error.to_string(), "export failed after 17 rows");

    assert_eq!(
        sample(
            &rendered,
            names::JOBS_FAILED_TOTAL,
            &[("worker", "ExportWorker"), ("job_status", "fail")]
        ),
        Some(1.0)
    );
    assert_eq!(
        sample(
            &rendered,
            &count(names::JOBS_COMPLETION_SECONDS),
            &[("worker", "ExportWorker"), ("job_status", "fail")]
        ),
        Some(1.0)
    );
    assert_eq!(
        sample(&rendered, names::RUNNING_JOBS, &[("worker", "ExportWorker")]),
        Some(0.0)
    );
}

#[test]
fn test_queue_duration_only_when_enqueue_time_known() {
    let broker = Arc::new(InMemoryBroker::new());
    let pipeline = builder(broker).build();
    let runs = Arc::new(AtomicUsize::new(0));
    pipeline.register_worker(counting_worker("W", WorkerAttributes::default(), runs));

    let (_, rendered) =
        with_recorder(async { pipeline.perform(Job::new("W", "default")).await });
    assert_eq!(
        sample(&rendered, &count(names::JOBS_QUEUE_DURATION_SECONDS), &[]),
        None
    );

    let enqueued = Job::new("W", "default").enqueued_at(chrono::Utc::now());
    let (_, rendered) = with_recorder(async { pipeline.perform(enqueued).await });
    assert_eq!(
        sample(
            &rendered,
            &count(names::JOBS_QUEUE_DURATION_SECONDS),
            &[("worker", "W")]
        ),
        Some(1.0)
    );
}

#[test]
fn test_retry_and_interruption_counters() {
    let broker = Arc::new(InMemoryBroker::new());
    let pipeline = builder(broker).build();
    let runs = Arc::new(AtomicUsize::new(0));
    pipeline.register_worker(counting_worker("W", WorkerAttributes::default(), runs));

    let (_, rendered) = with_recorder(async {
        pipeline.perform(Job::new("W", "default")).await.unwrap();
        pipeline
            .perform(Job::new("W", "default").with_retry_count(0))
            .await
            .unwrap();
        pipeline
            .perform(
                Job::new("W", "default")
                    .with_retry_count(3)
                    .with_interrupted_count(1),
            )
            .await
            .unwrap();
    });

    assert_eq!(
        sample(&rendered, names::JOBS_RETRIED_TOTAL, &[("worker", "W")]),
        Some(2.0)
    );
    assert_eq!(
        sample(&rendered, names::JOBS_INTERRUPTED_TOTAL, &[("worker", "W")]),
        Some(1.0)
    );
}

#[test]
fn test_server_labels_follow_worker_attributes() {
    let broker = Arc::new(InMemoryBroker::new());
    let pipeline = builder(broker).build();
    let runs = Arc::new(AtomicUsize::new(0));
    pipeline.register_worker(counting_worker(
        "ReindexWorker",
        WorkerAttributes::default()
            .with_urgency(Urgency::Throttled)
            .with_external_dependencies()
            .with_resource_boundary(ResourceBoundary::Cpu)
            .with_feature_category("global_search")
            .with_store("queues_shard_catchall"),
        runs,
    ));

    let (_, rendered) =
        with_recorder(async { pipeline.perform(Job::new("ReindexWorker", "search")).await });

    assert_eq!(
        sample(
            &rendered,
            &count(names::JOBS_COMPLETION_SECONDS),
            &[
                ("queue", "search"),
                ("worker", "ReindexWorker"),
                ("urgency", "throttled"),
                ("external_dependencies", "yes"),
                ("feature_category", "global_search"),
                ("boundary", "cpu"),
                ("destination_shard_redis", "queues_shard_catchall"),
                ("job_status", "done"),
            ]
        ),
        Some(1.0)
    );
}

#[test]
fn test_initialize_registers_zeroed_series() {
    let broker = Arc::new(InMemoryBroker::new());
    let pipeline = builder(broker).build();
    pipeline.register_worker(failing_worker("FlakyWorker", "flaky"));

    let (_, rendered) = with_recorder(async { ServerMetrics::initialize(pipeline.workers()) });

    assert_eq!(
        sample(
            &rendered,
            names::JOBS_FAILED_TOTAL,
            &[("worker", "FlakyWorker"), ("job_status", "fail"), ("urgency", "low")]
        ),
        Some(0.0)
    );
    assert_eq!(
        sample(&rendered, names::RUNNING_JOBS, &[("worker", "FlakyWorker")]),
        Some(0.0)
    );
}

#[test]
fn test_panicking_job_releases_gauge_and_registry() {
    let broker = Arc::new(InMemoryBroker::new());
    let pipeline = Arc::new(builder(broker).build());
    pipeline.register_worker(
        WorkerDefinition::new(
            "CorruptWorker",
            handler_fn(|job: Job, _ctx| async move {
                if job.args.is_empty() {
                    panic!("corrupt payload");
                }
                Ok(())
            }),
        )
        .with_attributes(WorkerAttributes::default().cancellable()),
    );

    let (joined, rendered) = with_recorder({
        let pipeline = Arc::clone(&pipeline);
        async move {
            tokio::spawn(async move { pipeline.perform(Job::new("CorruptWorker", "default")).await })
                .await
        }
    });

    assert!(joined.unwrap_err().is_panic());
    assert!(pipeline.job_registry().is_empty());
    assert_eq!(
        sample(&rendered, names::RUNNING_JOBS, &[("worker", "CorruptWorker")]),
        Some(0.0)
    );
    assert_eq!(
        sample(&rendered, &count(names::JOBS_COMPLETION_SECONDS), &[("worker", "CorruptWorker")]),
        None
    );
}

#[cfg(target_os = "linux")]
#[test]
fn test_busy_job_records_cpu_time() {
    let broker = Arc::new(InMemoryBroker::new());
    let pipeline = builder(broker).build();
    pipeline.register_worker(WorkerDefinition::new(
        "HashWorker",
        handler_fn(|_job: Job, _ctx| async {
            let mut acc = 0u64;
            for i in 0..5_000_000u64 {
                acc = acc.wrapping_add(std::hint::black_box(i));
            }
            std::hint::black_box(acc);
            Ok(())
        }),
    ));

    let (_, rendered) =
        with_recorder(async { pipeline.perform(Job::new("HashWorker", "default")).await });

    assert_eq!(
        sample(
            &rendered,
            &count(names::JOBS_CPU_SECONDS),
            &[("worker", "HashWorker"), ("job_status", "done")]
        ),
        Some(1.0)
    );
}

// ============================================================================
// Client Metrics
// ============================================================================

#[test]
fn test_enqueue_counts_pushed_jobs_with_empty_default_urgency() {
    let broker = Arc::new(InMemoryBroker::new());
    let pipeline = builder(broker.clone()).build();
    let runs = Arc::new(AtomicUsize::new(0));
    pipeline.register_worker(counting_worker("W", WorkerAttributes::default(), runs));

    let (outcome, rendered) = with_recorder(async {
        pipeline
            .enqueue("W", vec![json!(42)], &ExecutionContext::new())
            .await
    });

    let EnqueueOutcome::Pushed(id) = outcome.unwrap() else {
        panic!("job was not pushed");
    };
    assert_eq!(broker.ready_jobs()[0].id, id);
    assert_eq!(broker.ready_jobs()[0].args, vec![json!(42)]);
    assert_eq!(
        sample(
            &rendered,
            names::ENQUEUED_JOBS_TOTAL,
            &[("worker", "W"), ("urgency", ""), ("boundary", "")]
        ),
        Some(1.0)
    );
}

#[tokio::test]
async fn test_enqueue_unknown_worker_fails() {
    let broker = Arc::new(InMemoryBroker::new());
    let pipeline = builder(broker.clone()).build();

    let error = pipeline
        .enqueue("Missing", vec![], &ExecutionContext::new())
        .await
        .unwrap_err();

    assert_eq!(error.code(), ErrorCode::UnknownWorker);
    assert!(broker.is_empty());
}

// ============================================================================
// Context Propagation
// ============================================================================

#[tokio::test]
async fn test_correlation_and_ip_travel_through_broker() {
    let broker = Arc::new(InMemoryBroker::new());
    let pipeline = builder(broker.clone()).build();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    pipeline.register_worker(WorkerDefinition::new(
        "AuditWorker",
        handler_fn(move |_job: Job, ctx: ExecutionContext| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push((
                    ctx.correlation_id().map(str::to_string),
                    ctx.ip_address().map(str::to_string),
                ));
                Ok(())
            }
        }),
    ));

    let request = ExecutionContext::new()
        .with_correlation_id(Some("req-7f3a".to_string()))
        .with_ip_address(Some("203.0.113.9".to_string()));
    pipeline.enqueue("AuditWorker", vec![], &request).await.unwrap();

    let job = broker.dequeue().await.unwrap().unwrap();
    assert_eq!(job.correlation_id.as_deref(), Some("req-7f3a"));
    assert_eq!(job.ip_address_state.as_deref(), Some("203.0.113.9"));

    pipeline.perform(job).await.unwrap();
    assert_eq!(
        *seen.lock(),
        vec![(Some("req-7f3a".to_string()), Some("203.0.113.9".to_string()))]
    );
}

#[tokio::test]
async fn test_missing_correlation_id_is_not_fabricated() {
    let broker = Arc::new(InMemoryBroker::new());
    let pipeline = builder(broker.clone()).build();
    let runs = Arc::new(AtomicUsize::new(0));
    pipeline.register_worker(counting_worker("W", WorkerAttributes::default(), runs));

    pipeline
        .enqueue("W", vec![], &ExecutionContext::new())
        .await
        .unwrap();

    let job = broker.dequeue().await.unwrap().unwrap();
    assert!(job.correlation_id.is_none());
}

// ============================================================================
// Shard Routing
// ============================================================================

#[tokio::test]
async fn test_shard_aware_scope_rejects_unrouted_enqueue() {
    let broker = Arc::new(InMemoryBroker::new());
    let pipeline = builder(broker.clone()).build();
    let runs = Arc::new(AtomicUsize::new(0));
    pipeline.register_worker(counting_worker(
        "Unrouted",
        WorkerAttributes::default(),
        runs.clone(),
    ));
    pipeline.register_worker(counting_worker(
        "Routed",
        WorkerAttributes::default().with_store("queues_shard_catchall"),
        runs,
    ));

    let validating = ExecutionContext::new().with_shard_validation(true);

    let error = pipeline
        .enqueue("Unrouted", vec![], &validating)
        .await
        .unwrap_err();
    assert_eq!(error.code(), ErrorCode::UnroutedShardCall);
    assert!(broker.is_empty());

    let outcome = pipeline.enqueue("Routed", vec![], &validating).await.unwrap();
    assert!(matches!(outcome, EnqueueOutcome::Pushed(_)));
    assert_eq!(broker.len(), 1);

    pipeline
        .enqueue("Unrouted", vec![], &ExecutionContext::new())
        .await
        .unwrap();
    assert_eq!(broker.len(), 2);
}

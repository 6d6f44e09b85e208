//! Correlation id propagation across the enqueue -> execute boundary.

use async_trait::async_trait;
use tracing::{info_span, Instrument};

use super::{ClientMiddleware, ClientNext, EnqueueOutcome, Next, ServerMiddleware};
use crate::error::Result;
use crate::jobs::{ExecutionContext, Job, JobResult, WorkerDefinition};

/// Copies the ambient correlation id onto outgoing jobs.
///
/// Never fabricates an id: with no ambient id the job is left untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct CorrelationInjector;

#[async_trait]
impl ClientMiddleware for CorrelationInjector {
    fn name(&self) -> &'static str {
        "correlation_injector"
    }

    async fn call(
        &self,
        _worker: &WorkerDefinition,
        job: &mut Job,
        ctx: &ExecutionContext,
        next: ClientNext<'_>,
    ) -> Result<EnqueueOutcome> {
        if let Some(correlation_id) = ctx.correlation_id() {
            job.correlation_id = Some(correlation_id.to_string());
        }
        next.run(job, ctx).await
    }
}

/// Makes the job's correlation id the ambient one for the rest of the chain.
#[derive(Debug, Default, Clone, Copy)]
pub struct CorrelationExtractor;

#[async_trait]
impl ServerMiddleware for CorrelationExtractor {
    fn name(&self) -> &'static str {
        "correlation_extractor"
    }

    async fn call(
        &self,
        _worker: &WorkerDefinition,
        job: &mut Job,
        ctx: &ExecutionContext,
        next: Next<'_>,
    ) -> JobResult {
        let scoped = ctx.with_correlation_id(job.correlation_id.clone());
        let span = info_span!(
            "correlation",
            correlation_id = scoped.correlation_id().unwrap_or("")
        );
        next.run(job, &scoped).instrument(span).await
    }
}

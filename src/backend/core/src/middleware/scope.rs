//! Ambient scopes carried across the chains: shard awareness and client IP.

use async_trait::async_trait;
use tracing::warn;

use super::{ClientMiddleware, ClientNext, EnqueueOutcome, Next, ServerMiddleware};
use crate::error::{ConveyorError, Result};
use crate::jobs::{ExecutionContext, Job, JobResult, WorkerDefinition};

// ═══════════════════════════════════════════════════════════════════════════════
// Shard Awareness
// ═══════════════════════════════════════════════════════════════════════════════

/// Turns on shard validation for the duration of shard-aware jobs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShardAwarenessScope;

#[async_trait]
impl ServerMiddleware for ShardAwarenessScope {
    fn name(&self) -> &'static str {
        "shard_awareness_scope"
    }

    async fn call(
        &self,
        worker: &WorkerDefinition,
        job: &mut Job,
        ctx: &ExecutionContext,
        next: Next<'_>,
    ) -> JobResult {
        let scoped = ctx.with_shard_validation(worker.attributes.shard_aware);
        next.run(job, &scoped).await
    }
}

/// Rejects enqueues from a validating scope that do not name a destination store.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShardRoutingValidator;

#[async_trait]
impl ClientMiddleware for ShardRoutingValidator {
    fn name(&self) -> &'static str {
        "shard_routing_validator"
    }

    async fn call(
        &self,
        worker: &WorkerDefinition,
        job: &mut Job,
        ctx: &ExecutionContext,
        next: ClientNext<'_>,
    ) -> Result<EnqueueOutcome> {
        if ctx.shard_validation_enabled() && worker.attributes.store.is_none() {
            warn!(worker = %worker.name, job_id = %job.id, "Unrouted enqueue from shard-aware job");
            return Err(ConveyorError::unrouted_shard_call(&worker.name));
        }
        next.run(job, ctx).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Client IP Address
// ═══════════════════════════════════════════════════════════════════════════════

/// Copies the ambient client IP address onto outgoing jobs.
#[derive(Debug, Default, Clone, Copy)]
pub struct IpAddressInjector;

#[async_trait]
impl ClientMiddleware for IpAddressInjector {
    fn name(&self) -> &'static str {
        "ip_address_injector"
    }

    async fn call(
        &self,
        _worker: &WorkerDefinition,
        job: &mut Job,
        ctx: &ExecutionContext,
        next: ClientNext<'_>,
    ) -> Result<EnqueueOutcome> {
        if let Some(ip_address) = ctx.ip_address() {
            job.ip_address_state = Some(ip_address.to_string());
        }
        next.run(job, ctx).await
    }
}

/// Makes the job's recorded client IP the ambient one while it runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct IpAddressRestorer;

#[async_trait]
impl ServerMiddleware for IpAddressRestorer {
    fn name(&self) -> &'static str {
        "ip_address_restorer"
    }

    async fn call(
        &self,
        _worker: &WorkerDefinition,
        job: &mut Job,
        ctx: &ExecutionContext,
        next: Next<'_>,
    ) -> JobResult {
        let scoped = ctx.with_ip_address(job.ip_address_state.clone());
        next.run(job, &scoped).await
    }
}

//! Ambient execution context threaded through the middleware chains.
//!
//! A context value is never mutated in place. Middleware that needs to change
//! an ambient value builds an overlay with one of the `with_*` methods and
//! hands it to the next layer; the caller keeps its own value, so the previous
//! state is back in force as soon as the inner call returns, on every path.

use std::future::Future;
use tokio_util::sync::CancellationToken;

use super::{JobError, JobId};

/// Per-call ambient state: correlation id, shard validation, client IP and
/// the cooperative interrupt signal of the running job.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    correlation_id: Option<String>,
    shard_validation: bool,
    ip_address: Option<String>,
    cancellation: CancellationToken,
}

impl ExecutionContext {
    /// An empty root context.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Overlay a correlation id. `None` clears it for the inner scope.
    pub fn with_correlation_id(&self, correlation_id: Option<String>) -> Self {
        Self {
            correlation_id,
            ..self.clone()
        }
    }

    /// Whether enqueues in this scope must name their destination shard.
    pub fn shard_validation_enabled(&self) -> bool {
        self.shard_validation
    }

    pub fn with_shard_validation(&self, enabled: bool) -> Self {
        Self {
            shard_validation: enabled,
            ..self.clone()
        }
    }

    pub fn ip_address(&self) -> Option<&str> {
        self.ip_address.as_deref()
    }

    pub fn with_ip_address(&self, ip_address: Option<String>) -> Self {
        Self {
            ip_address,
            ..self.clone()
        }
    }

    /// The interrupt signal of the job running in this scope.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn with_cancellation(&self, cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            ..self.clone()
        }
    }

    /// Whether an interrupt has been delivered to this job.
    pub fn is_interrupted(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Cooperative interrupt check for job bodies.
    pub fn checkpoint(&self, job_id: JobId) -> Result<(), JobError> {
        if self.is_interrupted() {
            return Err(JobError::Interrupted(job_id));
        }
        Ok(())
    }

    /// Run a future until it completes or an interrupt arrives.
    pub async fn interruptible<F, T>(&self, job_id: JobId, future: F) -> Result<T, JobError>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(JobError::Interrupted(job_id)),
            output = future => Ok(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_overlay_leaves_parent_untouched() {
        let root = ExecutionContext::new().with_correlation_id(Some("outer".to_string()));
        let inner = root.with_correlation_id(Some("inner".to_string()));

        assert_eq!(inner.correlation_id(), Some("inner"));
        assert_eq!(root.correlation_id(), Some("outer"));

        let cleared = root.with_correlation_id(None);
        assert_eq!(cleared.correlation_id(), None);
        assert_eq!(root.correlation_id(), Some("outer"));
    }

    #[test]
    fn test_overlays_compose() {
        let ctx = ExecutionContext::new()
            .with_shard_validation(true)
            .with_ip_address(Some("10.0.0.1".to_string()));
        assert!(ctx.shard_validation_enabled());
        assert_eq!(ctx.ip_address(), Some("10.0.0.1"));
        assert!(!ExecutionContext::new().shard_validation_enabled());
    }

    #[test]
    fn test_checkpoint() {
        let token = CancellationToken::new();
        let ctx = ExecutionContext::new().with_cancellation(token.clone());
        let id = JobId::new();

        assert!(ctx.checkpoint(id).is_ok());
        token.cancel();
        assert!(matches!(ctx.checkpoint(id), Err(JobError::Interrupted(i)) if i == id));
    }

    #[tokio::test]
    async fn test_interruptible_stops_on_interrupt() {
        let token = CancellationToken::new();
        let ctx = ExecutionContext::new().with_cancellation(token.clone());
        let id = JobId::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result = ctx
            .interruptible(id, tokio::time::sleep(Duration::from_secs(60)))
            .await;
        assert!(matches!(result, Err(JobError::Interrupted(_))));
    }

    #[test]
    fn test_interrupt_wakes_pending_body() {
        let token = CancellationToken::new();
        let ctx = ExecutionContext::new().with_cancellation(token.clone());
        let id = JobId::new();

        let mut body = tokio_test::task::spawn(ctx.interruptible(id, std::future::pending::<()>()));
        tokio_test::assert_pending!(body.poll());

        token.cancel();
        assert!(body.is_woken());
        let result = tokio_test::assert_ready!(body.poll());
        assert!(matches!(result, Err(JobError::Interrupted(i)) if i == id));
    }

    #[tokio::test]
    async fn test_interruptible_passes_output_through() {
        let ctx = ExecutionContext::new();
        let value = ctx.interruptible(JobId::new(), async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }
}

//! Memory governor: graceful self-shutdown under memory pressure.
//!
//! After each job the governor samples resident memory. Above the configured
//! ceiling (or when a job asks for it) it runs one escalation sequence on a
//! spawned task:
//!
//! ```text
//! sleep grace_time ─▶ TSTP ─▶ sleep shutdown_wait ─▶ TERM ─▶ sleep kill_wait ─▶ KILL
//! ```
//!
//! Only one sequence runs per process. A ceiling of `0` disables the governor.

pub mod process;

pub use process::{
    parse_vm_rss, thread_cpu_time, CpuTimed, ProcessControl, ShutdownSignal, SignalTarget,
    SystemProcess,
};

use async_trait::async_trait;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::GovernorConfig;
use crate::jobs::{ExecutionContext, Job, JobError, JobResult, WorkerDefinition};
use crate::middleware::{Next, ServerMiddleware};
use crate::telemetry::metrics::names;

/// Progress of the escalation sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Normal,
    /// Pause signal sent
    Warned,
    /// Terminate signal sent
    Terminating,
    /// Kill signal sent; no further sequences start
    Killed,
}

struct Inner {
    config: GovernorConfig,
    process: Arc<dyn ProcessControl>,
    in_flight: AtomicBool,
    state: Mutex<ShutdownState>,
}

/// Shared handle to the process's memory governor.
#[derive(Clone)]
pub struct MemoryGovernor {
    inner: Arc<Inner>,
}

impl MemoryGovernor {
    pub fn new(config: GovernorConfig, process: Arc<dyn ProcessControl>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                process,
                in_flight: AtomicBool::new(false),
                state: Mutex::new(ShutdownState::Normal),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.is_enabled()
    }

    pub fn state(&self) -> ShutdownState {
        *self.inner.state.lock()
    }

    /// Whether an escalation sequence is running.
    pub fn is_in_flight(&self) -> bool {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Sample RSS and start escalating when it exceeds the ceiling.
    ///
    /// Returns the sequence's handle when this call started one.
    pub fn check(&self) -> Option<JoinHandle<()>> {
        if !self.is_enabled() {
            return None;
        }

        let rss_kb = match self.inner.process.rss_kb() {
            Ok(rss_kb) => rss_kb,
            Err(e) => {
                warn!(error = %e, "Could not sample RSS");
                return None;
            }
        };
        gauge!(names::GOVERNOR_RSS_BYTES).set(rss_kb as f64 * 1024.0);

        let max_rss_kb = self.inner.config.max_rss_kb;
        if rss_kb <= max_rss_kb {
            return None;
        }

        self.escalate(format!("RSS {} kB exceeds {} kB", rss_kb, max_rss_kb))
    }

    /// Start escalating now, without sampling.
    pub fn request_shutdown(&self, reason: impl Into<String>) -> Option<JoinHandle<()>> {
        if !self.is_enabled() {
            return None;
        }
        self.escalate(reason.into())
    }

    fn escalate(&self, reason: String) -> Option<JoinHandle<()>> {
        if self.state() == ShutdownState::Killed {
            debug!(reason = %reason, "Process already killed; not escalating");
            return None;
        }
        if self
            .inner
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(reason = %reason, "Shutdown sequence already in flight");
            return None;
        }

        let inner = Arc::clone(&self.inner);
        Some(tokio::spawn(async move {
            inner.run_sequence(reason).await;
        }))
    }
}

impl Inner {
    async fn run_sequence(&self, reason: String) {
        let pid = self.process.pid();
        warn!(
            pid,
            reason = %reason,
            grace_secs = self.config.grace_time.as_secs(),
            "Memory governor shutdown sequence started"
        );

        let steps = [
            (self.config.grace_time, ShutdownSignal::Pause, ShutdownState::Warned),
            (self.config.shutdown_wait, ShutdownSignal::Terminate, ShutdownState::Terminating),
            (self.config.kill_wait, ShutdownSignal::Kill, ShutdownState::Killed),
        ];

        for (wait, signal, next_state) in steps {
            self.process.sleep(wait).await;

            let target = if signal == ShutdownSignal::Kill && self.process.is_group_leader() {
                SignalTarget::Group
            } else {
                SignalTarget::Process(pid)
            };

            warn!(pid, signal = %signal, target = target.pid(), "Sending shutdown signal");
            if let Err(e) = self.process.send(target, signal) {
                error!(error = %e, signal = %signal, "Shutdown signal failed; continuing");
            }
            counter!(names::GOVERNOR_SIGNALS_TOTAL, "signal" => signal.as_str()).increment(1);
            *self.state.lock() = next_state;
        }

        self.in_flight.store(false, Ordering::Release);
    }
}

/// Checks memory after every job and escalates on a shutdown request.
pub struct MemoryGovernorMiddleware {
    governor: MemoryGovernor,
}

impl MemoryGovernorMiddleware {
    pub fn new(governor: MemoryGovernor) -> Self {
        Self { governor }
    }
}

#[async_trait]
impl ServerMiddleware for MemoryGovernorMiddleware {
    fn name(&self) -> &'static str {
        "memory_governor"
    }

    async fn call(
        &self,
        _worker: &WorkerDefinition,
        job: &mut Job,
        ctx: &ExecutionContext,
        next: Next<'_>,
    ) -> JobResult {
        let result = next.run(job, ctx).await;
        match &result {
            Err(JobError::WantShutdown { reason }) => {
                self.governor.request_shutdown(reason.clone());
            }
            _ => {
                self.governor.check();
            }
        }
        result
    }
}

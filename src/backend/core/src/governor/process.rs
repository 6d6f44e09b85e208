//! Process inspection and signalling.

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::error::{ConveyorError, ErrorCode, Result};

/// Signals sent while escalating a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownSignal {
    /// Stop fetching new jobs (`SIGTSTP`)
    Pause,
    /// Finish in-flight work and exit (`SIGTERM`)
    Terminate,
    /// Exit now (`SIGKILL`)
    Kill,
}

impl ShutdownSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "TSTP",
            Self::Terminate => "TERM",
            Self::Kill => "KILL",
        }
    }

    #[cfg(unix)]
    fn raw(&self) -> libc::c_int {
        match self {
            Self::Pause => libc::SIGTSTP,
            Self::Terminate => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recipient of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTarget {
    Process(u32),
    /// The caller's whole process group (pid `0`)
    Group,
}

impl SignalTarget {
    /// The pid argument for `kill(2)`.
    pub fn pid(&self) -> i32 {
        match self {
            Self::Process(pid) => *pid as i32,
            Self::Group => 0,
        }
    }
}

/// Operating-system operations the governor depends on.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Current resident set size in kilobytes.
    fn rss_kb(&self) -> Result<u64>;

    fn pid(&self) -> u32;

    /// Whether this process leads its process group.
    fn is_group_leader(&self) -> bool;

    fn send(&self, target: SignalTarget, signal: ShutdownSignal) -> Result<()>;

    async fn sleep(&self, duration: Duration);
}

/// The running process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcess;

#[async_trait]
impl ProcessControl for SystemProcess {
    fn rss_kb(&self) -> Result<u64> {
        #[cfg(target_os = "linux")]
        {
            let status = std::fs::read_to_string("/proc/self/status")?;
            parse_vm_rss(&status).ok_or_else(|| {
                ConveyorError::new(ErrorCode::ProcessInspectionFailed, "VmRSS missing from /proc/self/status")
            })
        }

        #[cfg(not(target_os = "linux"))]
        {
            Err(ConveyorError::new(
                ErrorCode::ProcessInspectionFailed,
                "RSS sampling is only supported on Linux",
            ))
        }
    }

    fn pid(&self) -> u32 {
        std::process::id()
    }

    fn is_group_leader(&self) -> bool {
        #[cfg(unix)]
        {
            // SAFETY: getpgrp takes no arguments and cannot fail.
            let pgrp = unsafe { libc::getpgrp() };
            pgrp == std::process::id() as libc::pid_t
        }

        #[cfg(not(unix))]
        {
            false
        }
    }

    fn send(&self, target: SignalTarget, signal: ShutdownSignal) -> Result<()> {
        #[cfg(unix)]
        {
            // SAFETY: kill only reads its two integer arguments.
            let rc = unsafe { libc::kill(target.pid(), signal.raw()) };
            if rc != 0 {
                let error = std::io::Error::last_os_error();
                return Err(ConveyorError::with_internal(
                    ErrorCode::SignalDeliveryFailed,
                    format!("Failed to send {} to pid {}", signal, target.pid()),
                    error.to_string(),
                )
                .with_source(error));
            }
            Ok(())
        }

        #[cfg(not(unix))]
        {
            Err(ConveyorError::new(
                ErrorCode::SignalDeliveryFailed,
                format!("Cannot send {} to pid {} on this platform", signal, target.pid()),
            ))
        }
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Extract `VmRSS` (kB) from the contents of `/proc/<pid>/status`.
pub fn parse_vm_rss(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|value| value.split_whitespace().next())
        .and_then(|token| token.parse::<u64>().ok())
}

// ═══════════════════════════════════════════════════════════════════════════════
// CPU Time
// ═══════════════════════════════════════════════════════════════════════════════

/// CPU time consumed by the calling thread so far.
pub fn thread_cpu_time() -> Option<Duration> {
    #[cfg(target_os = "linux")]
    {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: ts is a valid, writable timespec.
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
        if rc != 0 {
            return None;
        }
        Some(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Future adapter that sums the thread CPU time spent inside each poll.
///
/// A task may move between worker threads; measuring per poll charges each
/// slice to the thread that ran it. Resolves to the inner output and the
/// total, or `None` where thread CPU clocks are unavailable.
pub struct CpuTimed<F: Future> {
    inner: Pin<Box<F>>,
    total: Duration,
    measured: bool,
}

impl<F: Future> CpuTimed<F> {
    pub fn new(inner: F) -> Self {
        Self {
            inner: Box::pin(inner),
            total: Duration::ZERO,
            measured: true,
        }
    }
}

impl<F: Future> Future for CpuTimed<F> {
    type Output = (F::Output, Option<Duration>);

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let before = thread_cpu_time();
        let poll = self.inner.as_mut().poll(cx);
        match (before, thread_cpu_time()) {
            (Some(before), Some(after)) => self.total += after.saturating_sub(before),
            _ => self.measured = false,
        }

        match poll {
            Poll::Ready(output) => {
                let cpu = self.measured.then_some(self.total);
                Poll::Ready((output, cpu))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

//! Fixed-size pool that pulls jobs from the broker and runs them through the
//! server chain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::ProcessorConfig;
use crate::error::{ConveyorError, Result};
use crate::middleware::{Pipeline, ServerMetrics};

/// Statistics for a processor.
#[derive(Debug, Clone, Default)]
pub struct ProcessorStats {
    /// Total jobs processed
    pub processed: Arc<AtomicU64>,
    /// Total jobs that returned `Ok`
    pub succeeded: Arc<AtomicU64>,
    /// Total jobs that returned an error
    pub failed: Arc<AtomicU64>,
    /// Currently running jobs
    pub active: Arc<AtomicU64>,
}

impl ProcessorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// Holds one `active` slot and settles the counters when dropped, so a job
/// task that panics still counts as processed and failed.
struct ActiveJob {
    stats: ProcessorStats,
    succeeded: bool,
}

impl ActiveJob {
    fn start(stats: ProcessorStats) -> Self {
        stats.active.fetch_add(1, Ordering::Relaxed);
        Self {
            stats,
            succeeded: false,
        }
    }

    fn succeed(&mut self) {
        self.succeeded = true;
    }
}

impl Drop for ActiveJob {
    fn drop(&mut self) {
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        if self.succeeded {
            self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Handle for controlling a running processor.
pub struct ProcessorHandle {
    shutdown: watch::Sender<bool>,
    stats: ProcessorStats,
    task: JoinHandle<()>,
}

impl ProcessorHandle {
    /// Stop fetching new jobs. In-flight jobs run to completion.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn stats(&self) -> &ProcessorStats {
        &self.stats
    }

    /// Wait for the fetch loop and every in-flight job to finish.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| ConveyorError::internal(format!("Processor task panicked: {}", e)))
    }
}

/// Pulls jobs from the pipeline's broker, running at most `concurrency` at once.
pub struct Processor {
    config: ProcessorConfig,
    stats: ProcessorStats,
}

impl Processor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            config,
            stats: ProcessorStats::new(),
        }
    }

    /// Start the fetch loop, returning a handle for control.
    pub fn start(self, pipeline: Arc<Pipeline>) -> ProcessorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let config = self.config;
        let concurrency = config.concurrency.max(1);

        ServerMetrics::initialize(pipeline.workers());

        let task = tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(concurrency));

            info!(
                processor = %config.name,
                concurrency,
                "Processor started"
            );

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let permit = tokio::select! {
                    biased;
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                match pipeline.broker().dequeue().await {
                    Ok(Some(job)) => {
                        let pipeline = Arc::clone(&pipeline);
                        let mut active = ActiveJob::start(stats.clone());

                        tokio::spawn(async move {
                            let _permit = permit;
                            if pipeline.perform(job).await.is_ok() {
                                active.succeed();
                            }
                        });
                    }
                    Ok(None) => {
                        drop(permit);
                        tokio::select! {
                            _ = shutdown_rx.changed() => {}
                            _ = tokio::time::sleep(config.poll_interval) => {}
                        }
                    }
                    Err(e) => {
                        drop(permit);
                        error!(processor = %config.name, error = %e, "Dequeue failed");
                        tokio::select! {
                            _ = shutdown_rx.changed() => {}
                            _ = tokio::time::sleep(config.poll_interval) => {}
                        }
                    }
                }
            }

            info!(processor = %config.name, "Processor shutting down; draining in-flight jobs");
            // Every permit returns once the in-flight jobs finish.
            if let Ok(permits) = semaphore.acquire_many(concurrency as u32).await {
                drop(permits);
            }
            debug!(processor = %config.name, "In-flight jobs drained");
            info!(processor = %config.name, "Processor stopped");
        });

        ProcessorHandle {
            shutdown: shutdown_tx,
            stats: self.stats,
            task,
        }
    }
}

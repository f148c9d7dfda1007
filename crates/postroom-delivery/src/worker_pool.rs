//! Supervised worker pool with graceful shutdown.

use std::{sync::Arc, time::Duration};

use postroom_core::Clock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{Result, SendError},
    sender::RetryingSender,
    worker::{DeliveryWorker, WorkerConfig, WorkerStats},
    DeliveryQueue,
};

/// Spawns and supervises delivery workers.
///
/// All workers share one cancellation token. Dropping the pool without
/// shutting it down cancels the workers rather than orphaning them.
pub struct WorkerPool {
    queue: DeliveryQueue,
    sender: RetryingSender,
    config: WorkerConfig,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
    stats: Arc<WorkerStats>,
    clock: Arc<dyn Clock>,
}

impl WorkerPool {
    /// Creates an idle pool; call [`spawn_workers`](Self::spawn_workers)
    /// to start it.
    pub fn new(
        queue: DeliveryQueue,
        sender: RetryingSender,
        config: WorkerConfig,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queue,
            sender,
            config,
            cancellation_token,
            worker_handles: Vec::new(),
            stats: Arc::new(WorkerStats::default()),
            clock,
        }
    }

    /// Shared pipeline counters across all workers.
    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Spawns the configured number of workers and returns immediately.
    pub fn spawn_workers(&mut self) {
        info!(worker_count = self.config.worker_count, "spawning delivery workers");

        for worker_id in 0..self.config.worker_count {
            let worker = DeliveryWorker::new(
                worker_id,
                self.queue.clone(),
                self.sender.clone(),
                self.config.clone(),
                self.cancellation_token.clone(),
                self.stats.clone(),
                self.clock.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;
                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "delivery worker terminated with error");
                }
                result
            });

            self.worker_handles.push(handle);
        }
    }

    /// Signals cancellation and waits for workers within `timeout`.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let join_all = async {
            let mut failures = Vec::new();
            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(worker_result) => {
                        if let Err(error) = worker_result {
                            warn!(
                                worker_id,
                                error = %error,
                                "worker completed with error during shutdown"
                            );
                        }
                    }
                    Err(join_error) => {
                        error!(
                            worker_id,
                            error = %join_error,
                            "worker task panicked during shutdown"
                        );
                        failures.push(SendError::WorkerPanic {
                            worker_id,
                            message: join_error.to_string(),
                        });
                    }
                }
            }
            failures
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(failures) => {
                if let Some(panic) = failures.into_iter().next() {
                    return Err(panic);
                }
                info!("worker pool shutdown completed");
                Ok(())
            }
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(SendError::ShutdownTimeout { timeout })
            }
        }
    }

    /// Whether any worker task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|handle| !handle.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.worker_handles.iter().filter(|handle| !handle.is_finished()).count();
        if active > 0 && !self.cancellation_token.is_cancelled() {
            warn!(
                active_workers = active,
                "worker pool dropped without shutdown, cancelling workers"
            );
            self.cancellation_token.cancel();
        }
    }
}

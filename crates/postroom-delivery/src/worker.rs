//! Worker loop draining the delivery queue.
//!
//! Each worker repeatedly claims one job, pushes it through the
//! retrying sender, and reports the outcome back to the queue. The
//! sender is configured without in-call retries here: the queue's
//! reschedule-with-backoff covers retrying across lease cycles, and
//! stacking a second backoff layer inside the lease would compound
//! delays for no benefit.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use postroom_core::{Clock, EmailJob};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    error::{Result, SendError},
    queue::FailureOutcome,
    sender::{OutboundMessage, RetryingSender},
    DeliveryQueue,
};

/// Pause after a claim error before polling again, avoids tight error
/// loops against an unhealthy store.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    pub worker_count: usize,

    /// Base pause between polls when the queue is empty. The actual
    /// pause is jittered so idle workers do not hit the store in
    /// lockstep.
    pub poll_interval: Duration,

    /// Maximum wait for in-flight deliveries during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Pipeline counters shared by all workers in a pool.
#[derive(Debug, Default)]
pub struct WorkerStats {
    processed: AtomicU64,
    sent: AtomicU64,
    retried: AtomicU64,
    dead: AtomicU64,
}

impl WorkerStats {
    /// Jobs claimed and run to an outcome since startup.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Jobs delivered to the provider.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Jobs rescheduled after a transient failure.
    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    /// Jobs dead-lettered.
    pub fn dead(&self) -> u64 {
        self.dead.load(Ordering::Relaxed)
    }
}

/// A single delivery worker.
pub struct DeliveryWorker {
    id: usize,
    queue: DeliveryQueue,
    sender: RetryingSender,
    config: WorkerConfig,
    cancellation_token: CancellationToken,
    stats: Arc<WorkerStats>,
    clock: Arc<dyn Clock>,
}

impl DeliveryWorker {
    /// Creates a worker over the shared queue and sender.
    pub fn new(
        id: usize,
        queue: DeliveryQueue,
        sender: RetryingSender,
        config: WorkerConfig,
        cancellation_token: CancellationToken,
        stats: Arc<WorkerStats>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { id, queue, sender, config, cancellation_token, stats, clock }
    }

    /// Claims and delivers jobs until cancelled.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "delivery worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            match self.process_one().await {
                Ok(true) => {
                    // Delivered or reported a job; look for the next one
                    // immediately.
                }
                Ok(false) => {
                    tokio::select! {
                        () = self.clock.sleep(self.jittered_poll_interval()) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                }
                Err(error) => {
                    error!(
                        worker_id = self.id,
                        error = %error,
                        "worker cycle failed"
                    );
                    tokio::select! {
                        () = self.clock.sleep(ERROR_BACKOFF) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                }
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }

    /// Claims one job and runs it to an outcome.
    ///
    /// Returns `Ok(true)` when a job was processed (whatever the send
    /// result), `Ok(false)` when the queue had nothing claimable.
    pub async fn process_one(&self) -> Result<bool> {
        let worker_name = format!("worker-{}", self.id);
        let Some(job) = self.queue.claim_next(&worker_name).await? else {
            return Ok(false);
        };

        self.deliver(job).await?;
        Ok(true)
    }

    /// Delivers a claimed job and reports the outcome to the queue.
    ///
    /// Send failures are not errors at this level; they become queue
    /// state. Only a store failure while reporting propagates.
    async fn deliver(&self, job: EmailJob) -> Result<()> {
        debug!(
            worker_id = self.id,
            job_id = %job.id,
            attempts = job.attempts,
            "delivering job"
        );

        let message = OutboundMessage::from(&job);
        match self.sender.send_with_retry(&message).await {
            Ok(receipt) => {
                self.queue.complete(job.id).await.map_err(SendError::from)?;
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                info!(
                    worker_id = self.id,
                    job_id = %job.id,
                    provider_message_id = %receipt.provider_message_id,
                    attempts = job.attempts,
                    "job delivered"
                );
            }
            Err(send_error) => {
                match self.queue.fail(&job, &send_error).await.map_err(SendError::from)? {
                    FailureOutcome::Rescheduled => {
                        self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    }
                    FailureOutcome::DeadLettered => {
                        self.stats.dead.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn jittered_poll_interval(&self) -> Duration {
        self.config.poll_interval.mul_f64(rand::rng().random_range(0.5..1.5))
    }
}

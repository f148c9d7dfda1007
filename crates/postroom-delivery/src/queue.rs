//! Durable delivery queue with lease-based claiming.
//!
//! [`JobStore`] abstracts the persistence primitives, each of which
//! must be a single atomic operation; [`DeliveryQueue`] layers policy on
//! top: validation, environment stamping, lease durations, and the
//! dead-or-reschedule decision after a failed attempt. Workers never
//! touch the store directly.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use postroom_core::{
    error::Result, Clock, CoreError, EmailJob, Environment, JobId, JobStatus, NewJob,
};
use tracing::{debug, error, warn};

use crate::{error::SendError, retry::RetryPolicy};

/// Persistence operations the delivery pipeline needs.
///
/// Every method maps to one atomic store operation. The claim is the
/// load-bearing one: its conditional update is what guarantees that two
/// racing workers cannot both win the same job. Timestamps are passed
/// in rather than read inside, keeping implementations clock-free.
pub trait JobStore: Send + Sync + 'static {
    /// Persists a freshly enqueued job.
    fn insert(&self, job: EmailJob) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Atomically claims one eligible job for `worker_id`.
    ///
    /// Eligible means queued with `not_before` reached, or leased with
    /// an expired lease, in the worker's own environment. On success the
    /// job is leased to the worker until `lease_until` and its attempt
    /// counter has been incremented. Returns `None` when nothing is
    /// claimable.
    fn claim_next(
        &self,
        worker_id: String,
        environment: Environment,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<EmailJob>>> + Send + '_>>;

    /// Marks a leased job as sent and clears its lease.
    ///
    /// Idempotent: marking an already-sent job succeeds without change.
    /// `last_error` is left untouched so a success after failed cycles
    /// keeps the prior failure visible for audit.
    fn mark_sent(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Returns a failed job to the queue with a deferred `not_before`.
    fn reschedule(
        &self,
        id: JobId,
        not_before: DateTime<Utc>,
        last_error: String,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Moves a job to the terminal dead state.
    fn mark_dead(
        &self,
        id: JobId,
        last_error: String,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Returns a dead job to the queue with a fresh attempt budget.
    fn requeue_dead(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Fetches a job by ID.
    fn find_job(&self, id: JobId)
        -> Pin<Box<dyn Future<Output = Result<EmailJob>> + Send + '_>>;

    /// Counts jobs currently in `status`.
    fn count_by_status(
        &self,
        status: JobStatus,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;
}

/// What [`DeliveryQueue::fail`] did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Returned to the queue with a deferred `not_before`.
    Rescheduled,
    /// Moved to the terminal dead state.
    DeadLettered,
}

/// Queue tuning knobs.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a claim stays exclusive. Must comfortably exceed the
    /// worst-case send latency, or healthy workers will have jobs
    /// reclaimed out from under them.
    pub lease_duration: Duration,

    /// Claim cycles before a job is declared dead.
    pub max_attempts: u32,

    /// Backoff curve for `not_before` after a transient failure.
    pub backoff: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(60),
            max_attempts: 8,
            backoff: RetryPolicy {
                max_retries: 0,
                base_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(3600),
            },
        }
    }
}

/// Policy layer over a [`JobStore`].
///
/// Cheap to clone; clones share the underlying store.
#[derive(Clone)]
pub struct DeliveryQueue {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    environment: Environment,
    config: QueueConfig,
}

impl DeliveryQueue {
    /// Creates a queue for the given environment.
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        environment: Environment,
        config: QueueConfig,
    ) -> Self {
        Self { store, clock, environment, config }
    }

    /// The queue's configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Persists a new job and returns its ID.
    ///
    /// Talks only to the store; provider health cannot make this block
    /// or fail, so it is safe on the request-handling hot path.
    pub async fn enqueue(&self, spec: NewJob) -> Result<JobId> {
        if spec.to.is_empty() {
            return Err(CoreError::InvalidInput("job must have at least one recipient".into()));
        }
        if spec.subject.trim().is_empty() {
            return Err(CoreError::InvalidInput("job subject must not be empty".into()));
        }

        let now = self.clock.now_utc();
        let id = JobId::new();
        let job = spec.into_job(id, self.environment, now);
        let not_before = job.not_before;

        self.store.insert(job).await?;

        debug!(job_id = %id, not_before = %not_before, "job enqueued");
        Ok(id)
    }

    /// Claims the next eligible job for `worker_id`, if any.
    ///
    /// Only jobs stamped with this queue's environment are visible, so a
    /// development worker cannot drain production mail or vice versa.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<EmailJob>> {
        let now = self.clock.now_utc();
        let lease_until = advance(now, self.config.lease_duration);

        let claimed = self
            .store
            .claim_next(worker_id.to_string(), self.environment, now, lease_until)
            .await?;

        if let Some(job) = &claimed {
            debug!(
                job_id = %job.id,
                worker_id,
                attempts = job.attempts,
                lease_until = %lease_until,
                "job claimed"
            );
        }
        Ok(claimed)
    }

    /// Reports a successful send. Idempotent.
    pub async fn complete(&self, id: JobId) -> Result<()> {
        self.store.mark_sent(id, self.clock.now_utc()).await
    }

    /// Reports a failed send for a job this worker holds.
    ///
    /// Permanent failures dead-letter immediately; spending further
    /// claim cycles on an unrecoverable error only delays the operator
    /// finding out. Transient failures reschedule with backoff until the
    /// attempt cap, then dead-letter too.
    pub async fn fail(&self, job: &EmailJob, send_error: &SendError) -> Result<FailureOutcome> {
        let now = self.clock.now_utc();
        let attempts = u32::try_from(job.attempts).unwrap_or(u32::MAX);
        let last_error = send_error.to_string();

        if !send_error.is_retryable() {
            error!(
                job_id = %job.id,
                attempts,
                error = %last_error,
                "permanent failure, dead-lettering job"
            );
            self.store.mark_dead(job.id, last_error, now).await?;
            return Ok(FailureOutcome::DeadLettered);
        }

        if attempts >= self.config.max_attempts {
            error!(
                job_id = %job.id,
                attempts,
                max_attempts = self.config.max_attempts,
                error = %last_error,
                "attempt budget exhausted, dead-lettering job"
            );
            self.store.mark_dead(job.id, last_error, now).await?;
            return Ok(FailureOutcome::DeadLettered);
        }

        let not_before = advance(now, self.config.backoff.backoff_delay(attempts));
        warn!(
            job_id = %job.id,
            attempts,
            next_attempt_at = %not_before,
            error = %last_error,
            "transient failure, rescheduling job"
        );
        self.store.reschedule(job.id, not_before, last_error, now).await?;
        Ok(FailureOutcome::Rescheduled)
    }

    /// Operator action: give a dead job a fresh attempt budget.
    pub async fn requeue_dead(&self, id: JobId) -> Result<()> {
        self.store.requeue_dead(id, self.clock.now_utc()).await
    }

    /// Fetches a job by ID.
    pub async fn find_job(&self, id: JobId) -> Result<EmailJob> {
        self.store.find_job(id).await
    }

    /// Counts jobs in `status`.
    pub async fn count_by_status(&self, status: JobStatus) -> Result<u64> {
        self.store.count_by_status(status).await
    }
}

/// Adds a std duration to a timestamp, saturating instead of panicking
/// on overflow.
fn advance(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub mod mock {
    //! In-memory job store for tests.
    //!
    //! A single `RwLock` over the job map makes every operation, the
    //! claim included, trivially atomic while preserving the same
    //! observable semantics as the PostgreSQL store.

    use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

    use chrono::{DateTime, Utc};
    use postroom_core::{error::Result, CoreError, EmailJob, Environment, JobId, JobStatus};
    use tokio::sync::RwLock;

    use super::JobStore;

    /// Deterministic in-memory [`JobStore`].
    #[derive(Clone, Default)]
    pub struct MemoryJobStore {
        jobs: Arc<RwLock<HashMap<JobId, EmailJob>>>,
    }

    impl MemoryJobStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Snapshot of a job, if present. Test helper.
        pub async fn job(&self, id: JobId) -> Option<EmailJob> {
            self.jobs.read().await.get(&id).cloned()
        }

        /// Number of stored jobs. Test helper.
        pub async fn len(&self) -> usize {
            self.jobs.read().await.len()
        }

        /// Whether the store is empty. Test helper.
        pub async fn is_empty(&self) -> bool {
            self.jobs.read().await.is_empty()
        }
    }

    impl JobStore for MemoryJobStore {
        fn insert(&self, job: EmailJob) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let jobs = self.jobs.clone();
            Box::pin(async move {
                jobs.write().await.insert(job.id, job);
                Ok(())
            })
        }

        fn claim_next(
            &self,
            worker_id: String,
            environment: Environment,
            now: DateTime<Utc>,
            lease_until: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<Option<EmailJob>>> + Send + '_>> {
            let jobs = self.jobs.clone();
            Box::pin(async move {
                // Holding the write guard across select-and-mutate makes
                // the claim atomic, mirroring the conditional UPDATE in
                // the PostgreSQL store.
                let mut jobs = jobs.write().await;

                let candidate = jobs
                    .values()
                    .filter(|job| job.environment == environment && job.is_claimable(now))
                    .min_by_key(|job| (job.not_before, job.created_at, job.id.0))
                    .map(|job| job.id);

                let Some(id) = candidate else { return Ok(None) };
                let job = jobs.get_mut(&id).ok_or_else(|| {
                    CoreError::Database("claim candidate vanished mid-update".into())
                })?;

                job.status = JobStatus::Leased;
                job.lease_owner = Some(worker_id);
                job.lease_expires_at = Some(lease_until);
                job.attempts += 1;
                job.updated_at = now;

                Ok(Some(job.clone()))
            })
        }

        fn mark_sent(
            &self,
            id: JobId,
            now: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let jobs = self.jobs.clone();
            Box::pin(async move {
                let mut jobs = jobs.write().await;
                let job = jobs
                    .get_mut(&id)
                    .ok_or_else(|| CoreError::NotFound(format!("job {id} not found")))?;

                match job.status {
                    JobStatus::Sent => Ok(()),
                    JobStatus::Leased => {
                        job.status = JobStatus::Sent;
                        job.lease_owner = None;
                        job.lease_expires_at = None;
                        job.updated_at = now;
                        Ok(())
                    }
                    other => Err(CoreError::ConstraintViolation(format!(
                        "cannot mark job {id} sent from status {other}"
                    ))),
                }
            })
        }

        fn reschedule(
            &self,
            id: JobId,
            not_before: DateTime<Utc>,
            last_error: String,
            now: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let jobs = self.jobs.clone();
            Box::pin(async move {
                let mut jobs = jobs.write().await;
                let job = jobs
                    .get_mut(&id)
                    .ok_or_else(|| CoreError::NotFound(format!("job {id} not found")))?;

                if job.status != JobStatus::Leased {
                    return Err(CoreError::ConstraintViolation(format!(
                        "cannot reschedule job {id} from status {}",
                        job.status
                    )));
                }

                job.status = JobStatus::Queued;
                job.lease_owner = None;
                job.lease_expires_at = None;
                job.not_before = not_before;
                job.last_error = Some(last_error);
                job.updated_at = now;
                Ok(())
            })
        }

        fn mark_dead(
            &self,
            id: JobId,
            last_error: String,
            now: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let jobs = self.jobs.clone();
            Box::pin(async move {
                let mut jobs = jobs.write().await;
                let job = jobs
                    .get_mut(&id)
                    .ok_or_else(|| CoreError::NotFound(format!("job {id} not found")))?;

                match job.status {
                    JobStatus::Dead => Ok(()),
                    JobStatus::Sent => Err(CoreError::ConstraintViolation(format!(
                        "cannot dead-letter job {id}: already sent"
                    ))),
                    _ => {
                        job.status = JobStatus::Dead;
                        job.lease_owner = None;
                        job.lease_expires_at = None;
                        job.last_error = Some(last_error);
                        job.updated_at = now;
                        Ok(())
                    }
                }
            })
        }

        fn requeue_dead(
            &self,
            id: JobId,
            now: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let jobs = self.jobs.clone();
            Box::pin(async move {
                let mut jobs = jobs.write().await;
                let job = jobs
                    .get_mut(&id)
                    .ok_or_else(|| CoreError::NotFound(format!("job {id} not found")))?;

                if job.status != JobStatus::Dead {
                    return Err(CoreError::ConstraintViolation(format!(
                        "cannot requeue job {id} from status {}",
                        job.status
                    )));
                }

                job.status = JobStatus::Queued;
                job.attempts = 0;
                job.not_before = now;
                job.updated_at = now;
                Ok(())
            })
        }

        fn find_job(
            &self,
            id: JobId,
        ) -> Pin<Box<dyn Future<Output = Result<EmailJob>> + Send + '_>> {
            let jobs = self.jobs.clone();
            Box::pin(async move {
                jobs.read()
                    .await
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| CoreError::NotFound(format!("job {id} not found")))
            })
        }

        fn count_by_status(
            &self,
            status: JobStatus,
        ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
            let jobs = self.jobs.clone();
            Box::pin(async move {
                let count = jobs.read().await.values().filter(|job| job.status == status).count();
                Ok(count as u64)
            })
        }
    }
}

//! End-to-end pipeline tests over in-memory infrastructure.
//!
//! These run the real worker, queue, and retrying sender against the
//! in-memory job store and a scripted transport, covering the full
//! claim, send, reschedule, and dead-letter cycle without PostgreSQL
//! or a live provider.

use std::{sync::Arc, time::Duration};

use postroom_core::{Clock, Environment, JobStatus, NewJob, TestClock};
use postroom_delivery::{
    queue::mock::MemoryJobStore,
    sender::mock::{FailingTransport, ScriptedTransport},
    DeliveryQueue, DeliveryWorker, QueueConfig, RetryPolicy, RetryingSender, SendError,
    WorkerConfig, WorkerPool, WorkerStats,
};
use tokio_util::sync::CancellationToken;

struct Pipeline {
    store: MemoryJobStore,
    queue: DeliveryQueue,
    worker: DeliveryWorker,
    stats: Arc<WorkerStats>,
    clock: Arc<TestClock>,
}

fn pipeline(transport: Arc<dyn postroom_delivery::MailTransport>) -> Pipeline {
    let clock = Arc::new(TestClock::new());
    let store = MemoryJobStore::new();
    let queue = DeliveryQueue::new(
        Arc::new(store.clone()),
        clock.clone(),
        Environment::Production,
        QueueConfig::default(),
    );
    let sender = RetryingSender::new(
        transport,
        RetryPolicy::default().no_in_call_retries(),
        clock.clone(),
    );
    let stats = Arc::new(WorkerStats::default());
    let worker = DeliveryWorker::new(
        0,
        queue.clone(),
        sender,
        WorkerConfig::default(),
        CancellationToken::new(),
        stats.clone(),
        clock.clone(),
    );
    Pipeline { store, queue, worker, stats, clock }
}

#[tokio::test]
async fn transient_provider_outage_recovers_across_lease_cycles() {
    let transport = Arc::new(ScriptedTransport::with_script(vec![Err(SendError::provider(
        503,
        vec!["Backend error".into()],
        "service unavailable",
    ))]));
    let p = pipeline(transport.clone());

    let id = p
        .queue
        .enqueue(NewJob::new(vec!["ops@example.com".into()], "Weekly digest").with_text("hi"))
        .await
        .unwrap();

    // First cycle hits the outage; the job goes back to queued with a
    // future not_before.
    assert!(p.worker.process_one().await.unwrap());
    let job = p.store.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.as_deref().unwrap_or_default().contains("503"));
    assert!(job.not_before > p.clock.now_utc());

    // Still backing off: nothing claimable yet.
    assert!(!p.worker.process_one().await.unwrap());

    // Past the backoff window the retry succeeds.
    p.clock.advance(Duration::from_secs(3700));
    assert!(p.worker.process_one().await.unwrap());

    let job = p.store.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Sent);
    assert_eq!(job.attempts, 2);
    assert!(job.lease_owner.is_none());
    // The failure stays on record for audit.
    assert!(job.last_error.as_deref().unwrap_or_default().contains("503"));
    assert_eq!(transport.attempt_count(), 2);
    assert_eq!(p.stats.processed(), 2);
    assert_eq!(p.stats.retried(), 1);
    assert_eq!(p.stats.sent(), 1);
}

#[tokio::test]
async fn permanent_rejection_dead_letters_without_retry() {
    let transport = Arc::new(ScriptedTransport::with_script(vec![Err(SendError::provider(
        400,
        vec!["Invalid recipient address".into()],
        "",
    ))]));
    let p = pipeline(transport.clone());

    let id = p
        .queue
        .enqueue(NewJob::new(vec!["not-an-address".into()], "Receipt"))
        .await
        .unwrap();

    assert!(p.worker.process_one().await.unwrap());
    let job = p.store.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Dead);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.as_deref().unwrap_or_default().contains("Invalid recipient"));
    assert_eq!(transport.attempt_count(), 1);

    // Dead jobs are out of rotation entirely.
    assert!(!p.worker.process_one().await.unwrap());

    // Operator requeue grants a fresh budget; the scripted failure is
    // spent, so this cycle delivers.
    p.queue.requeue_dead(id).await.unwrap();
    assert!(p.worker.process_one().await.unwrap());
    let job = p.store.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Sent);
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn attempt_budget_exhaustion_dead_letters_with_last_error() {
    let transport = Arc::new(FailingTransport::new(SendError::timeout(30)));
    let clock = Arc::new(TestClock::new());
    let store = MemoryJobStore::new();
    let config = QueueConfig {
        max_attempts: 3,
        backoff: RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        },
        ..QueueConfig::default()
    };
    let queue = DeliveryQueue::new(
        Arc::new(store.clone()),
        clock.clone(),
        Environment::Production,
        config,
    );
    let sender = RetryingSender::new(
        transport,
        RetryPolicy::default().no_in_call_retries(),
        clock.clone(),
    );
    let worker = DeliveryWorker::new(
        0,
        queue.clone(),
        sender,
        WorkerConfig::default(),
        CancellationToken::new(),
        Arc::new(WorkerStats::default()),
        clock.clone(),
    );

    let id = queue.enqueue(NewJob::new(vec!["a@example.com".into()], "S")).await.unwrap();

    for _ in 0..3 {
        clock.advance(Duration::from_millis(100));
        assert!(worker.process_one().await.unwrap());
    }

    let job = store.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Dead);
    assert_eq!(job.attempts, 3);
    assert!(job.last_error.as_deref().unwrap_or_default().contains("timeout"));
}

#[tokio::test]
async fn worker_pool_drains_queue_and_shuts_down() {
    let clock = Arc::new(TestClock::new());
    let store = MemoryJobStore::new();
    let queue = DeliveryQueue::new(
        Arc::new(store.clone()),
        clock.clone(),
        Environment::Production,
        QueueConfig::default(),
    );
    let sender = RetryingSender::new(
        Arc::new(ScriptedTransport::always_ok()),
        RetryPolicy::default().no_in_call_retries(),
        clock.clone(),
    );

    for i in 0..5 {
        queue
            .enqueue(NewJob::new(vec![format!("user{i}@example.com")], format!("message {i}")))
            .await
            .unwrap();
    }

    let config = WorkerConfig { worker_count: 3, ..WorkerConfig::default() };
    let mut pool = WorkerPool::new(
        queue.clone(),
        sender,
        config,
        CancellationToken::new(),
        clock.clone(),
    );
    assert!(!pool.has_active_workers());
    pool.spawn_workers();
    assert!(pool.has_active_workers());
    let stats = pool.stats();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if queue.count_by_status(JobStatus::Sent).await.unwrap() == 5 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "queue did not drain in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    pool.shutdown_graceful(Duration::from_secs(5)).await.unwrap();
    assert_eq!(queue.count_by_status(JobStatus::Sent).await.unwrap(), 5);
    assert_eq!(queue.count_by_status(JobStatus::Queued).await.unwrap(), 0);
    assert_eq!(stats.sent(), 5);
    assert_eq!(stats.dead(), 0);
}

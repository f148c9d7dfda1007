//! Property-based tests for backoff, error classification, and queue
//! claim semantics.
//!
//! The in-memory store stands in for PostgreSQL here; both implement the
//! same conditional-transition contract, so invariants proven against
//! the mock describe the production store's intended behavior too.

use std::{sync::Arc, time::Duration};

use postroom_core::{Environment, JobStatus, NewJob, TestClock};
use postroom_delivery::{
    classify, queue::mock::MemoryJobStore, DeliveryQueue, ErrorClass, QueueConfig, RetryPolicy,
    SendError,
};
use proptest::prelude::*;

fn queue_with_store() -> (DeliveryQueue, Arc<TestClock>) {
    let clock = Arc::new(TestClock::new());
    let queue = DeliveryQueue::new(
        Arc::new(MemoryJobStore::new()),
        clock.clone(),
        Environment::Production,
        QueueConfig::default(),
    );
    (queue, clock)
}

/// Strategy for plausible recipient addresses.
fn recipient_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-z]{2,10}@example\\.(com|org)", 1..4)
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

    /// Jittered delays never exceed the exponential ceiling or the cap,
    /// for any combination of base, cap, and attempt number.
    #[test]
    fn backoff_delay_is_bounded(
        base_ms in 1u64..120_000,
        cap_ms in 1u64..7_200_000,
        attempt in 0u32..64,
    ) {
        let policy = RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(cap_ms),
        };

        let ceiling = policy.unjittered_delay(attempt);
        prop_assert!(ceiling <= policy.max_delay);

        let delay = policy.backoff_delay(attempt);
        prop_assert!(delay <= ceiling);
        prop_assert!(delay <= policy.max_delay);
    }

    /// Server-side provider failures and throttling are always
    /// retryable; other client errors without a recognized transient
    /// reason never are.
    #[test]
    fn provider_status_classification_is_total(
        status in 100u16..600,
        body in "[ -~]{0,60}",
    ) {
        let error = SendError::provider(status, Vec::new(), body);
        let class = classify(&error);

        if status == 429 || (500..600).contains(&status) {
            prop_assert_eq!(class, ErrorClass::Transient);
            prop_assert!(error.is_retryable());
        } else {
            prop_assert_eq!(class, ErrorClass::Permanent);
            prop_assert!(!error.is_retryable());
        }
    }

    /// A recognized transient reason makes any provider error
    /// retryable, whatever the status code says.
    #[test]
    fn transient_reasons_override_status(
        status in 400u16..500,
        prefix in "[a-z ]{0,10}",
    ) {
        let reason = format!("{prefix}Rate limit exceeded");
        let error = SendError::provider(status, vec![reason], String::new());
        prop_assert_eq!(classify(&error), ErrorClass::Transient);
    }

    /// Draining the queue claims every ready job exactly once, in any
    /// enqueue order, and each claim charges exactly one attempt.
    #[test]
    fn draining_claims_each_job_exactly_once(
        recipients in prop::collection::vec(recipient_strategy(), 1..15),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (queue, _clock) = queue_with_store();

            let mut ids = Vec::new();
            for (i, to) in recipients.iter().enumerate() {
                let id = queue
                    .enqueue(NewJob::new(to.clone(), format!("subject {i}")))
                    .await
                    .unwrap();
                ids.push(id);
            }

            let mut claimed = Vec::new();
            while let Some(job) = queue.claim_next("worker-prop").await.unwrap() {
                prop_assert_eq!(job.attempts, 1);
                prop_assert_eq!(job.status, JobStatus::Leased);
                claimed.push(job.id);
            }

            claimed.sort_by_key(|id| id.0);
            ids.sort_by_key(|id| id.0);
            prop_assert_eq!(claimed, ids);

            // Everything is leased now, so another sweep finds nothing.
            prop_assert!(queue.claim_next("worker-prop").await.unwrap().is_none());
            Ok(())
        })?;
    }

    /// Jobs stay invisible until their lease expires, then become
    /// claimable again with one more attempt charged.
    #[test]
    fn lease_expiry_recycles_jobs(
        extra_wait_secs in 0u64..300,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (queue, clock) = queue_with_store();
            let lease = queue.config().lease_duration;

            queue
                .enqueue(NewJob::new(vec!["a@example.com".into()], "hello"))
                .await
                .unwrap();

            let first = queue.claim_next("worker-0").await.unwrap().unwrap();
            prop_assert_eq!(first.attempts, 1);

            // Just short of expiry the lease still holds.
            clock.advance(lease - Duration::from_millis(1));
            prop_assert!(queue.claim_next("worker-1").await.unwrap().is_none());

            clock.advance(Duration::from_millis(1) + Duration::from_secs(extra_wait_secs));
            let reclaimed = queue.claim_next("worker-1").await.unwrap().unwrap();
            prop_assert_eq!(reclaimed.id, first.id);
            prop_assert_eq!(reclaimed.attempts, 2);
            prop_assert_eq!(reclaimed.lease_owner.as_deref(), Some("worker-1"));
            Ok(())
        })?;
    }
}

//! Property-based tests for job claimability and status encoding.

use chrono::{TimeDelta, Utc};
use postroom_core::{Environment, JobId, JobStatus, NewJob};
use proptest::prelude::*;

fn status_strategy() -> impl Strategy<Value = JobStatus> {
    prop_oneof![
        Just(JobStatus::Queued),
        Just(JobStatus::Leased),
        Just(JobStatus::Sent),
        Just(JobStatus::Failed),
        Just(JobStatus::Dead),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

    /// Statuses survive a round trip through their string form, which is
    /// what the database stores.
    #[test]
    fn status_round_trips_through_string(status in status_strategy()) {
        let parsed: JobStatus = status.to_string().parse().unwrap();
        prop_assert_eq!(parsed, status);
    }

    /// A deferred job becomes claimable exactly when `not_before`
    /// arrives, never before.
    #[test]
    fn deferral_gates_claimability(defer_secs in 0i64..86_400) {
        let now = Utc::now();
        let not_before = now + TimeDelta::seconds(defer_secs);
        let job = NewJob::new(vec!["a@example.com".into()], "S")
            .with_not_before(not_before)
            .into_job(JobId::new(), Environment::Production, now);

        prop_assert_eq!(job.is_claimable(now), defer_secs == 0);
        prop_assert!(!job.is_claimable(not_before - TimeDelta::milliseconds(1)) || defer_secs == 0);
        prop_assert!(job.is_claimable(not_before));
        prop_assert!(job.is_claimable(not_before + TimeDelta::seconds(1)));
    }

    /// Terminal statuses are never claimable, no matter the clock.
    #[test]
    fn terminal_jobs_are_never_claimable(
        status in status_strategy(),
        offset_secs in -86_400i64..86_400,
    ) {
        let now = Utc::now();
        let mut job = NewJob::new(vec!["a@example.com".into()], "S")
            .into_job(JobId::new(), Environment::Production, now);
        job.status = status;

        if status.is_terminal() {
            prop_assert!(!job.is_claimable(now + TimeDelta::seconds(offset_secs)));
        }
    }

    /// An active lease hides the job until expiry, then exposes it again
    /// for reclaim.
    #[test]
    fn lease_expiry_controls_reclaim(lease_secs in 1i64..3_600) {
        let now = Utc::now();
        let mut job = NewJob::new(vec!["a@example.com".into()], "S")
            .into_job(JobId::new(), Environment::Production, now);
        job.status = JobStatus::Leased;
        job.lease_owner = Some("worker-0".into());
        job.lease_expires_at = Some(now + TimeDelta::seconds(lease_secs));

        prop_assert!(!job.is_claimable(now));
        prop_assert!(!job.is_claimable(now + TimeDelta::seconds(lease_secs) - TimeDelta::milliseconds(1)));
        prop_assert!(job.is_claimable(now + TimeDelta::seconds(lease_secs)));
    }
}

//! PostgreSQL-backed job store.
//!
//! The claim is a single `UPDATE` over a `FOR UPDATE SKIP LOCKED`
//! subquery, so concurrent workers never block each other and never
//! both win the same row. All other operations are conditional updates
//! keyed on the expected current status, which is what makes the
//! lifecycle transitions safe to call from any worker at any time.

use std::{future::Future, pin::Pin};

use chrono::{DateTime, Utc};
use postroom_core::{error::Result, CoreError, EmailJob, Environment, JobId, JobStatus};
use sqlx::PgPool;

use crate::queue::JobStore;

/// Column list for `EmailJob` row mapping. `to` needs quoting, it is a
/// reserved word.
const JOB_COLUMNS: &str = r#"id, "to", cc, bcc, subject, text, html, reply_to, from_name,
    message_id_hint, metadata, status, attempts, last_error, lease_owner,
    lease_expires_at, not_before, created_at, updated_at, environment"#;

/// Creates the job table and claim index if they do not exist.
///
/// Runs at startup so a fresh database needs no separate migration
/// step before the pipeline can accept work.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS email_jobs (
            id UUID PRIMARY KEY,
            "to" TEXT[] NOT NULL,
            cc TEXT[] NOT NULL DEFAULT '{}',
            bcc TEXT[] NOT NULL DEFAULT '{}',
            subject TEXT NOT NULL,
            text TEXT,
            html TEXT,
            reply_to TEXT,
            from_name TEXT,
            message_id_hint TEXT,
            metadata JSONB NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'queued',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            lease_owner TEXT,
            lease_expires_at TIMESTAMPTZ,
            not_before TIMESTAMPTZ NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            environment TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_email_jobs_claimable
         ON email_jobs (environment, status, not_before)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Production [`JobStore`] over a connection pool.
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    /// Creates a store over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn status_of(&self, id: JobId) -> Result<Option<JobStatus>> {
        let status: Option<JobStatus> =
            sqlx::query_scalar("SELECT status FROM email_jobs WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(status)
    }

    /// Interprets a zero-row conditional update: distinguishes a job
    /// that is missing, already in the target state, or in a state the
    /// transition does not allow.
    async fn explain_missed_update(
        &self,
        id: JobId,
        target: JobStatus,
        verb: &str,
    ) -> Result<()> {
        match self.status_of(id).await? {
            None => Err(CoreError::NotFound(format!("job {id} not found"))),
            Some(status) if status == target => Ok(()),
            Some(status) => Err(CoreError::ConstraintViolation(format!(
                "cannot {verb} job {id} from status {status}"
            ))),
        }
    }
}

impl JobStore for PostgresJobStore {
    fn insert(&self, job: EmailJob) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT INTO email_jobs
                    (id, "to", cc, bcc, subject, text, html, reply_to, from_name,
                     message_id_hint, metadata, status, attempts, last_error,
                     lease_owner, lease_expires_at, not_before, created_at,
                     updated_at, environment)
                VALUES
                    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                     $15, $16, $17, $18, $19, $20)
                "#,
            )
            .bind(job.id)
            .bind(&job.to)
            .bind(&job.cc)
            .bind(&job.bcc)
            .bind(&job.subject)
            .bind(&job.text)
            .bind(&job.html)
            .bind(&job.reply_to)
            .bind(&job.from_name)
            .bind(&job.message_id_hint)
            .bind(&job.metadata)
            .bind(job.status.to_string())
            .bind(job.attempts)
            .bind(&job.last_error)
            .bind(&job.lease_owner)
            .bind(job.lease_expires_at)
            .bind(job.not_before)
            .bind(job.created_at)
            .bind(job.updated_at)
            .bind(job.environment.to_string())
            .execute(&pool)
            .await?;
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
        let pool = self.pool.clone();
        Box::pin(async move {
            let query = format!(
                r#"
                UPDATE email_jobs SET
                    status = 'leased',
                    lease_owner = $1,
                    lease_expires_at = $2,
                    attempts = attempts + 1,
                    updated_at = $3
                WHERE id = (
                    SELECT id FROM email_jobs
                    WHERE environment = $4
                      AND ((status = 'queued' AND not_before <= $3)
                        OR (status = 'leased' AND lease_expires_at <= $3))
                    ORDER BY not_before, created_at
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING {JOB_COLUMNS}
                "#
            );

            let job = sqlx::query_as::<_, EmailJob>(&query)
                .bind(&worker_id)
                .bind(lease_until)
                .bind(now)
                .bind(environment.to_string())
                .fetch_optional(&pool)
                .await?;
            Ok(job)
        })
    }

    fn mark_sent(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE email_jobs SET
                     status = 'sent', lease_owner = NULL, lease_expires_at = NULL,
                     updated_at = $2
                 WHERE id = $1 AND status = 'leased'",
            )
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return self.explain_missed_update(id, JobStatus::Sent, "mark sent").await;
            }
            Ok(())
        })
    }

    fn reschedule(
        &self,
        id: JobId,
        not_before: DateTime<Utc>,
        last_error: String,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE email_jobs SET
                     status = 'queued', lease_owner = NULL, lease_expires_at = NULL,
                     not_before = $2, last_error = $3, updated_at = $4
                 WHERE id = $1 AND status = 'leased'",
            )
            .bind(id)
            .bind(not_before)
            .bind(&last_error)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return self.explain_missed_update(id, JobStatus::Queued, "reschedule").await;
            }
            Ok(())
        })
    }

    fn mark_dead(
        &self,
        id: JobId,
        last_error: String,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE email_jobs SET
                     status = 'dead', lease_owner = NULL, lease_expires_at = NULL,
                     last_error = $2, updated_at = $3
                 WHERE id = $1 AND status NOT IN ('sent', 'dead')",
            )
            .bind(id)
            .bind(&last_error)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return self.explain_missed_update(id, JobStatus::Dead, "dead-letter").await;
            }
            Ok(())
        })
    }

    fn requeue_dead(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE email_jobs SET
                     status = 'queued', attempts = 0, not_before = $2, updated_at = $2
                 WHERE id = $1 AND status = 'dead'",
            )
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return self.explain_missed_update(id, JobStatus::Queued, "requeue").await;
            }
            Ok(())
        })
    }

    fn find_job(
        &self,
        id: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<EmailJob>> + Send + '_>> {
        Box::pin(async move {
            let query = format!("SELECT {JOB_COLUMNS} FROM email_jobs WHERE id = $1");
            sqlx::query_as::<_, EmailJob>(&query)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("job {id} not found")))
        })
    }

    fn count_by_status(
        &self,
        status: JobStatus,
    ) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        Box::pin(async move {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM email_jobs WHERE status = $1")
                    .bind(status.to_string())
                    .fetch_one(&self.pool)
                    .await?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
    }
}

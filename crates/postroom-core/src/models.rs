//! Domain models and strongly-typed identifiers.
//!
//! Defines the persisted email job record, its lifecycle status, newtype
//! ID wrappers, and the runtime environment tag. Includes the database
//! serialization glue so records round-trip through the job store without
//! stringly-typed fields.

use std::{collections::HashMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed job identifier.
///
/// Wraps a UUID to prevent mixing with other ID types. A job keeps this
/// ID through its entire lifecycle, including across lease reclaims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for JobId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for JobId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Deployment environment the process runs in.
///
/// Stamped into anti-forgery tokens and job records. Tokens minted in one
/// environment never verify in another, and workers only claim jobs
/// stamped with their own tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development: relaxed token strictness, long expiry.
    Development,
    /// Production: client binding enforced, short expiry.
    Production,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Production => write!(f, "production"),
        }
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" => Ok(Self::Development),
            "production" => Ok(Self::Production),
            other => Err(format!("invalid environment: {other}")),
        }
    }
}

impl sqlx::Type<PgDb> for Environment {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for Environment {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Self::from_str(s).map_err(Into::into)
    }
}

/// Lifecycle status of an email job.
///
/// Transitions are gated by the atomic claim: `queued → leased`, then
/// `leased → sent` on success, `leased → queued` on a retryable failure
/// with a future `not_before`, or `leased → dead` when the error is
/// permanent or attempts are exhausted. `sent`, `dead`, and the
/// operator-only `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a worker, claimable once `not_before` passes.
    Queued,
    /// Exclusively held by a worker until the lease expires.
    Leased,
    /// Delivered to the provider. Terminal.
    Sent,
    /// Pulled out of rotation by an operator. Terminal.
    Failed,
    /// Retry budget exhausted or permanent provider rejection. Terminal.
    Dead,
}

impl JobStatus {
    /// Whether the status admits no further pipeline transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Dead)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Leased => write!(f, "leased"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "leased" => Ok(Self::Leased),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "dead" => Ok(Self::Dead),
            other => Err(format!("invalid job status: {other}")),
        }
    }
}

impl sqlx::Type<PgDb> for JobStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for JobStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Self::from_str(s).map_err(Into::into)
    }
}

/// Persisted email job.
///
/// One outbound notification awaiting guaranteed delivery. Workers claim
/// jobs with a time-bounded lease; a crashed worker simply lets
/// `lease_expires_at` pass and the job becomes claimable again.
///
/// Consumers must tolerate duplicate delivery: a job can be claimed more
/// than once over its lifetime, so `message_id_hint` is passed to the
/// provider for downstream deduplication.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EmailJob {
    /// Unique identifier for this job.
    pub id: JobId,

    /// Primary recipients. Never empty.
    pub to: Vec<String>,

    /// Carbon-copy recipients.
    pub cc: Vec<String>,

    /// Blind-carbon-copy recipients.
    pub bcc: Vec<String>,

    /// Message subject.
    pub subject: String,

    /// Plain-text body.
    pub text: Option<String>,

    /// HTML body.
    pub html: Option<String>,

    /// Reply-To address override.
    pub reply_to: Option<String>,

    /// Display name for the From header.
    pub from_name: Option<String>,

    /// Stable hint forwarded to the provider so duplicate claims of the
    /// same job collapse to a single delivered message.
    pub message_id_hint: Option<String>,

    /// Caller-supplied context carried for diagnostics and audit.
    pub metadata: sqlx::types::Json<HashMap<String, String>>,

    /// Current lifecycle status.
    pub status: JobStatus,

    /// Claim-and-attempt cycles so far. Incremented exactly once per
    /// claim, regardless of outcome.
    pub attempts: i32,

    /// Most recent failure, kept for audit even after a later success.
    pub last_error: Option<String>,

    /// Worker currently holding the lease.
    pub lease_owner: Option<String>,

    /// When the current lease stops being exclusive.
    pub lease_expires_at: Option<DateTime<Utc>>,

    /// Earliest time the job is eligible for claiming.
    pub not_before: DateTime<Utc>,

    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,

    /// Last mutation time.
    pub updated_at: DateTime<Utc>,

    /// Environment the job was enqueued from.
    pub environment: Environment,
}

impl EmailJob {
    /// Whether the job is claimable at `now`.
    ///
    /// Either queued with `not_before` reached, or leased with an expired
    /// lease (reclaim of a crashed or hung worker's job).
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Queued => self.not_before <= now,
            JobStatus::Leased => self.lease_expires_at.is_some_and(|expiry| expiry <= now),
            JobStatus::Sent | JobStatus::Failed | JobStatus::Dead => false,
        }
    }
}

/// Specification for a job to enqueue.
///
/// The queue validates recipients, stamps timestamps and the environment
/// tag, and assigns the ID; callers only describe the message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    /// Primary recipients. Must be non-empty.
    pub to: Vec<String>,
    /// Carbon-copy recipients.
    pub cc: Vec<String>,
    /// Blind-carbon-copy recipients.
    pub bcc: Vec<String>,
    /// Message subject.
    pub subject: String,
    /// Plain-text body.
    pub text: Option<String>,
    /// HTML body.
    pub html: Option<String>,
    /// Reply-To override.
    pub reply_to: Option<String>,
    /// From display name.
    pub from_name: Option<String>,
    /// Deduplication hint for the provider.
    pub message_id_hint: Option<String>,
    /// Caller-supplied context.
    pub metadata: HashMap<String, String>,
    /// Earliest delivery time; `None` means immediately claimable.
    pub not_before: Option<DateTime<Utc>>,
}

impl NewJob {
    /// Creates a job spec with the given recipients and subject.
    pub fn new(to: Vec<String>, subject: impl Into<String>) -> Self {
        Self {
            to,
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: subject.into(),
            text: None,
            html: None,
            reply_to: None,
            from_name: None,
            message_id_hint: None,
            metadata: HashMap::new(),
            not_before: None,
        }
    }

    /// Sets the plain-text body.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Sets the HTML body.
    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    /// Sets the Reply-To address.
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Sets the From display name.
    pub fn with_from_name(mut self, from_name: impl Into<String>) -> Self {
        self.from_name = Some(from_name.into());
        self
    }

    /// Sets the provider deduplication hint.
    pub fn with_message_id_hint(mut self, hint: impl Into<String>) -> Self {
        self.message_id_hint = Some(hint.into());
        self
    }

    /// Attaches a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Defers the job until the given time.
    pub fn with_not_before(mut self, not_before: DateTime<Utc>) -> Self {
        self.not_before = Some(not_before);
        self
    }

    /// Materializes a queued job record with stamped identity and times.
    pub fn into_job(self, id: JobId, environment: Environment, now: DateTime<Utc>) -> EmailJob {
        EmailJob {
            id,
            to: self.to,
            cc: self.cc,
            bcc: self.bcc,
            subject: self.subject,
            text: self.text,
            html: self.html,
            reply_to: self.reply_to,
            from_name: self.from_name,
            message_id_hint: self.message_id_hint,
            metadata: sqlx::types::Json(self.metadata),
            status: JobStatus::Queued,
            attempts: 0,
            last_error: None,
            lease_owner: None,
            lease_expires_at: None,
            not_before: self.not_before.unwrap_or(now),
            created_at: now,
            updated_at: now,
            environment,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in
            [JobStatus::Queued, JobStatus::Leased, JobStatus::Sent, JobStatus::Failed, JobStatus::Dead]
        {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn terminal_statuses_identified() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Leased.is_terminal());
        assert!(JobStatus::Sent.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Dead.is_terminal());
    }

    #[test]
    fn new_job_defaults_to_immediately_claimable() {
        let now = Utc::now();
        let job = NewJob::new(vec!["a@example.com".into()], "S")
            .into_job(JobId::new(), Environment::Development, now);

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.not_before, now);
        assert!(job.is_claimable(now));
    }

    #[test]
    fn deferred_job_not_claimable_until_not_before() {
        let now = Utc::now();
        let later = now + TimeDelta::minutes(5);
        let job = NewJob::new(vec!["a@example.com".into()], "S")
            .with_not_before(later)
            .into_job(JobId::new(), Environment::Development, now);

        assert!(!job.is_claimable(now));
        assert!(job.is_claimable(later));
    }

    #[test]
    fn expired_lease_is_claimable() {
        let now = Utc::now();
        let mut job = NewJob::new(vec!["a@example.com".into()], "S")
            .into_job(JobId::new(), Environment::Development, now);
        job.status = JobStatus::Leased;
        job.lease_owner = Some("worker-0".into());
        job.lease_expires_at = Some(now + TimeDelta::seconds(30));

        assert!(!job.is_claimable(now));
        assert!(job.is_claimable(now + TimeDelta::seconds(30)));
    }
}

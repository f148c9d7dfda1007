//! Error types and provider error classification.
//!
//! Everything that can go wrong between "job claimed" and "provider
//! accepted the message" is expressed here, along with the single place
//! that decides whether a failure is worth retrying. The rest of the
//! pipeline asks `is_retryable()` and never inspects provider details
//! itself.

use std::{fmt, time::Duration};

use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, SendError>;

/// Provider reason codes that indicate a transient condition even when
/// the HTTP status alone is ambiguous.
const TRANSIENT_REASONS: &[&str] =
    &["rate limit exceeded", "backend error", "internal error", "temporarily unavailable"];

/// Failures on the path to the outbound mail provider.
#[derive(Debug, Clone, Error)]
pub enum SendError {
    /// Could not reach the provider at all.
    #[error("network connection failed: {message}")]
    Network {
        /// Description of the connection failure.
        message: String,
    },

    /// Provider did not answer within the request timeout.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Seconds waited before giving up.
        timeout_seconds: u64,
    },

    /// Provider answered with a non-success status.
    ///
    /// The display form keeps the reason codes: it is what the queue
    /// records as `last_error`, and a dead-lettered job is only useful
    /// to an operator if it says more than the status code.
    #[error("provider rejected send: HTTP {status_code}{}", format_reasons(.reasons))]
    Provider {
        /// HTTP status code of the response.
        status_code: u16,
        /// Reason codes extracted from the response body.
        reasons: Vec<String>,
        /// Raw response body, truncated for logging.
        body: String,
    },

    /// Message could not be built or serialized for sending.
    #[error("invalid message: {message}")]
    InvalidMessage {
        /// What made the message unsendable.
        message: String,
    },

    /// Job store operation failed while reporting an outcome.
    #[error("job store error: {message}")]
    Store {
        /// Underlying store failure.
        message: String,
    },

    /// Worker pool shutdown exceeded its deadline.
    #[error("worker shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {message}")]
    WorkerPanic {
        /// Identifier of the panicked worker.
        worker_id: usize,
        /// Panic description from the join error.
        message: String,
    },
}

fn format_reasons(reasons: &[String]) -> String {
    if reasons.is_empty() {
        String::new()
    } else {
        format!(" ({})", reasons.join(", "))
    }
}

impl SendError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a provider rejection from an HTTP response.
    pub fn provider(status_code: u16, reasons: Vec<String>, body: impl Into<String>) -> Self {
        Self::Provider { status_code, reasons, body: body.into() }
    }

    /// Creates an invalid-message error.
    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::InvalidMessage { message: message.into() }
    }

    /// Creates a job store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store { message: message.into() }
    }

    /// Whether this failure may succeed on a later attempt.
    ///
    /// Delegates to [`classify`]; see there for the rules.
    pub fn is_retryable(&self) -> bool {
        classify(self) == ErrorClass::Transient
    }
}

impl From<postroom_core::CoreError> for SendError {
    fn from(error: postroom_core::CoreError) -> Self {
        Self::Store { message: error.to_string() }
    }
}

/// Retry classification of a send failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying with backoff.
    Transient,
    /// Retrying cannot help; fail the job immediately.
    Permanent,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// Classifies a send failure as transient or permanent.
///
/// Transient: network failures, timeouts, HTTP 429, any 5xx, and 4xx
/// responses whose reason codes name a known transient condition (some
/// providers report rate limiting as 400 with a reason string).
/// Everything else, notably other 4xx and malformed messages, is
/// permanent and must not consume retry budget.
pub fn classify(error: &SendError) -> ErrorClass {
    match error {
        SendError::Network { .. } | SendError::Timeout { .. } | SendError::Store { .. } => {
            ErrorClass::Transient
        }

        SendError::Provider { status_code, reasons, .. } => {
            if *status_code == 429 || (500..600).contains(status_code) {
                return ErrorClass::Transient;
            }
            let transient_reason = reasons.iter().any(|reason| {
                let reason = reason.to_ascii_lowercase();
                TRANSIENT_REASONS.iter().any(|known| reason.contains(known))
            });
            if transient_reason {
                ErrorClass::Transient
            } else {
                ErrorClass::Permanent
            }
        }

        SendError::InvalidMessage { .. }
        | SendError::ShutdownTimeout { .. }
        | SendError::WorkerPanic { .. } => ErrorClass::Permanent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures_classified() {
        assert!(SendError::network("connection refused").is_retryable());
        assert!(SendError::timeout(30).is_retryable());
        assert!(SendError::provider(429, vec![], "slow down").is_retryable());
        assert!(SendError::provider(500, vec![], "oops").is_retryable());
        assert!(SendError::provider(503, vec![], "maintenance").is_retryable());
        assert!(SendError::store("connection lost").is_retryable());
    }

    #[test]
    fn permanent_failures_classified() {
        assert!(!SendError::provider(400, vec!["invalid recipient".into()], "").is_retryable());
        assert!(!SendError::provider(401, vec![], "bad api key").is_retryable());
        assert!(!SendError::provider(404, vec![], "").is_retryable());
        assert!(!SendError::invalid_message("no recipients").is_retryable());
    }

    #[test]
    fn transient_reason_codes_override_4xx_status() {
        let error = SendError::provider(400, vec!["Rate limit exceeded".into()], "");
        assert_eq!(classify(&error), ErrorClass::Transient);

        let error = SendError::provider(400, vec!["Backend Error".into()], "");
        assert_eq!(classify(&error), ErrorClass::Transient);
    }

    #[test]
    fn error_display_format() {
        assert_eq!(SendError::timeout(30).to_string(), "request timeout after 30s");
        assert_eq!(
            SendError::provider(503, vec![], "x").to_string(),
            "provider rejected send: HTTP 503"
        );
    }

    #[test]
    fn provider_display_carries_reason_codes() {
        let error = SendError::provider(
            400,
            vec!["Invalid recipient address".into(), "blocked domain".into()],
            "",
        );
        assert_eq!(
            error.to_string(),
            "provider rejected send: HTTP 400 (Invalid recipient address, blocked domain)"
        );
    }
}

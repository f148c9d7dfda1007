//! Retrying send path over an abstract mail transport.
//!
//! [`MailTransport`] is the seam between the pipeline and the concrete
//! provider client, so delivery logic is testable against scripted
//! doubles. [`RetryingSender`] wraps one send in classification and
//! full-jitter backoff; it never touches the job store, so it serves
//! both the synchronous best-effort path and the queue workers.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use postroom_core::{Clock, EmailJob};
use tracing::{debug, warn};

use crate::{
    error::{classify, ErrorClass, Result, SendError},
    retry::RetryPolicy,
};

/// Message handed to the transport, flattened from a job record.
///
/// The transport does not see queue state; only what the provider needs.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Primary recipients.
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
    /// Deduplication hint forwarded to the provider. Duplicate claims
    /// of one job reuse the same hint so downstream can collapse them.
    pub message_id_hint: Option<String>,
    /// Caller-supplied context, forwarded for provider-side tracing.
    pub metadata: HashMap<String, String>,
}

impl From<&EmailJob> for OutboundMessage {
    fn from(job: &EmailJob) -> Self {
        Self {
            to: job.to.clone(),
            cc: job.cc.clone(),
            bcc: job.bcc.clone(),
            subject: job.subject.clone(),
            text: job.text.clone(),
            html: job.html.clone(),
            reply_to: job.reply_to.clone(),
            from_name: job.from_name.clone(),
            message_id_hint: job
                .message_id_hint
                .clone()
                .or_else(|| Some(job.id.to_string())),
            metadata: job.metadata.0.clone(),
        }
    }
}

/// Provider acknowledgement for an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderReceipt {
    /// Message identifier assigned by the provider.
    pub provider_message_id: String,
}

/// One-shot send to the outbound mail provider.
///
/// Implementations must be cheap to call repeatedly; retry scheduling
/// lives above this trait.
pub trait MailTransport: Send + Sync + 'static {
    /// Attempts to hand the message to the provider once.
    fn send(
        &self,
        message: &OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderReceipt>> + Send + '_>>;
}

/// Wraps a transport with classification and in-call retry.
///
/// Permanent failures propagate immediately; transient ones are retried
/// up to `policy.max_retries` with full-jitter backoff slept on the
/// injected clock, so the wait is cooperative and test-controllable.
#[derive(Clone)]
pub struct RetryingSender {
    transport: Arc<dyn MailTransport>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl RetryingSender {
    /// Creates a sender over the given transport and policy.
    pub fn new(transport: Arc<dyn MailTransport>, policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { transport, policy, clock }
    }

    /// Sends the message, retrying transient failures.
    ///
    /// Returns the first success, the first permanent failure, or the
    /// last transient failure once the retry budget is spent. Exhaustion
    /// is logged with attempt count and classification so the caller's
    /// failure handling is visible in operations.
    pub async fn send_with_retry(&self, message: &OutboundMessage) -> Result<ProviderReceipt> {
        let mut attempt: u32 = 0;

        loop {
            match self.transport.send(message).await {
                Ok(receipt) => {
                    debug!(
                        provider_message_id = %receipt.provider_message_id,
                        attempt,
                        "message accepted by provider"
                    );
                    return Ok(receipt);
                }
                Err(error) => {
                    let class = classify(&error);
                    if class == ErrorClass::Permanent {
                        warn!(
                            attempt,
                            classification = %class,
                            error = %error,
                            subject = %message.subject,
                            "permanent send failure, not retrying"
                        );
                        return Err(error);
                    }
                    if attempt >= self.policy.max_retries {
                        warn!(
                            attempts = attempt + 1,
                            classification = %class,
                            error = %error,
                            subject = %message.subject,
                            "send retries exhausted"
                        );
                        return Err(error);
                    }

                    let delay = self.policy.backoff_delay(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient send failure, backing off"
                    );
                    self.clock.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

pub mod mock {
    //! Scripted transport double for tests.

    use std::{collections::VecDeque, future::Future, pin::Pin, sync::Mutex};

    use super::{MailTransport, OutboundMessage, ProviderReceipt, Result, SendError};

    /// Transport that replays a fixed script of outcomes.
    ///
    /// Once the script runs out, every further send succeeds. Sent
    /// messages are recorded for assertion.
    pub struct ScriptedTransport {
        script: Mutex<VecDeque<Result<ProviderReceipt>>>,
        sent: Mutex<Vec<OutboundMessage>>,
    }

    impl ScriptedTransport {
        /// Transport that always succeeds.
        pub fn always_ok() -> Self {
            Self::with_script(Vec::new())
        }

        /// Transport that replays `outcomes` in order, then succeeds.
        pub fn with_script(outcomes: Vec<Result<ProviderReceipt>>) -> Self {
            Self {
                script: Mutex::new(outcomes.into()),
                sent: Mutex::new(Vec::new()),
            }
        }

        /// All messages the transport has seen, in order.
        pub fn sent_messages(&self) -> Vec<OutboundMessage> {
            self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
        }

        /// How many send attempts have been made.
        pub fn attempt_count(&self) -> usize {
            self.sent.lock().map(|sent| sent.len()).unwrap_or(0)
        }
    }

    impl MailTransport for ScriptedTransport {
        fn send(
            &self,
            message: &OutboundMessage,
        ) -> Pin<Box<dyn Future<Output = Result<ProviderReceipt>> + Send + '_>> {
            let message = message.clone();
            Box::pin(async move {
                if let Ok(mut sent) = self.sent.lock() {
                    sent.push(message);
                }
                let scripted = self.script.lock().ok().and_then(|mut script| script.pop_front());
                match scripted {
                    Some(outcome) => outcome,
                    None => Ok(ProviderReceipt {
                        provider_message_id: format!("mock-{}", self.attempt_count()),
                    }),
                }
            })
        }
    }

    /// Transport where every send fails with the same error.
    pub struct FailingTransport {
        error: SendError,
        sent: Mutex<Vec<OutboundMessage>>,
    }

    impl FailingTransport {
        /// Creates a transport failing with `error` forever.
        pub fn new(error: SendError) -> Self {
            Self { error, sent: Mutex::new(Vec::new()) }
        }

        /// How many send attempts have been made.
        pub fn attempt_count(&self) -> usize {
            self.sent.lock().map(|sent| sent.len()).unwrap_or(0)
        }
    }

    impl MailTransport for FailingTransport {
        fn send(
            &self,
            message: &OutboundMessage,
        ) -> Pin<Box<dyn Future<Output = Result<ProviderReceipt>> + Send + '_>> {
            let message = message.clone();
            Box::pin(async move {
                if let Ok(mut sent) = self.sent.lock() {
                    sent.push(message);
                }
                Err(self.error.clone())
            })
        }
    }
}

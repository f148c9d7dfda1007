//! Guaranteed email delivery pipeline.
//!
//! A persisted job queue with lease-based claiming feeds worker loops
//! that push messages to the outbound provider through a classifying,
//! backoff-aware sender. At-least-once delivery with idempotency hints:
//! a job may be claimed more than once over its lifetime, but at most
//! one worker holds an active lease on it at any instant.

pub mod error;
pub mod postgres;
pub mod provider;
pub mod queue;
pub mod retry;
pub mod sender;
pub mod worker;
pub mod worker_pool;

pub use error::{classify, ErrorClass, Result, SendError};
pub use postgres::{ensure_schema, PostgresJobStore};
pub use provider::{HttpMailTransport, ProviderConfig};
pub use queue::{DeliveryQueue, FailureOutcome, JobStore, QueueConfig};
pub use retry::RetryPolicy;
pub use sender::{MailTransport, OutboundMessage, ProviderReceipt, RetryingSender};
pub use worker::{DeliveryWorker, WorkerConfig, WorkerStats};
pub use worker_pool::WorkerPool;

//! Core domain types for the Postroom delivery pipeline.
//!
//! Defines email job records, strongly-typed identifiers, the runtime
//! environment tag, and the clock abstraction shared by every component
//! that reasons about expiry, leases, or backoff.

pub mod error;
pub mod models;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{EmailJob, Environment, JobId, JobStatus, NewJob};
pub use time::{Clock, RealClock, TestClock};

//! Abuse protection for public write endpoints.
//!
//! Two independent gates run before any mutating form submission is
//! accepted: [`TokenCodec`] proves the request follows a page this
//! server actually served, and [`RateLimiter`] throttles per-client
//! submission volume. Both return verdicts rather than errors so the
//! failure path cannot be accidentally skipped, and both are pure
//! in-process compute suitable for the request hot path.

pub mod rate_limit;
pub mod token;

pub use rate_limit::{RateDecision, RateLimiter};
pub use token::{normalize_client_ip, ClientContext, StrictnessProfile, TokenCodec};

//! Domain types and time-based primitives shared by every genq crate.
//!
//! - [`job`]: the job record, its status machine, and input validation.
//! - [`retry`]: exponential-backoff retry for fallible async operations.
//! - [`timeout`]: staged timeout escalation with an owned abort signal.

pub mod error;
pub mod job;
pub mod retry;
pub mod timeout;
pub mod types;

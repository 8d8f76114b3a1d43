//! Job orchestration for genq.
//!
//! - [`JobOrchestrator`]: submit, read, track, cancel, and await jobs.
//! - [`DeliveryChannel`]: per-job status stream that prefers the change feed
//!   and falls back to polling the store.
//! - [`JobBinding`]: single-job lifecycle holder publishing a [`JobView`]
//!   for UI consumers.
//! - [`OrchestratorConfig`]: every tunable, loadable from `GENQ_*` variables.

pub mod binding;
pub mod config;
pub mod delivery;
pub mod error;
pub mod orchestrator;

pub use binding::{BindingHooks, JobBinding, JobView};
pub use config::OrchestratorConfig;
pub use delivery::{DeliveryChannel, DeliveryConfig, DeliveryError, DeliveryHandle, DeliveryMode};
pub use error::OrchestratorError;
pub use orchestrator::{CancelOutcome, JobOrchestrator};

//! The call orchestrator and its building blocks
//!
//! - [`builder`]: assembles a [`CallOrchestrator`] from config and collaborators
//! - [`manager`]: boot, shutdown and status
//! - [`calls`]: placing, answering, declining and ending calls
//! - [`controls`]: mute, DTMF and hold
//! - [`events`]: transport event bridges
//! - [`recovery`]: retry and timeout helpers

pub mod builder;
pub mod calls;
pub mod config;
pub mod controls;
pub mod events;
pub mod manager;
pub mod recovery;
pub mod types;

pub use builder::ClientBuilder;
pub use config::{ClientConfig, RetryBudgetConfig, TimeoutConfig};
pub use manager::CallOrchestrator;
pub use recovery::{retry_with_backoff, with_timeout, ErrorContext, RetryConfig};
pub use types::{CallDirection, CallInfo, CallRecorder, CallState, OrchestratorStatus};

//! Shared domain types, configuration and API contracts for the
//! host-local control-plane agent.
//!
//! This crate has no `tokio` dependency of its own: it is the vocabulary
//! the `agent` binary's Store, Task Engine, Console Multiplexer and HTTP
//! surface all speak, kept free of runtime concerns so it stays easy to
//! reason about and to unit test in isolation.

pub mod api;
pub mod config;
pub mod console;
pub mod defaults;
pub mod error;
pub mod metrics;
pub mod task;
pub mod utils;
pub mod zone;

pub use config::AgentConfig;
pub use error::AgentError;
pub use task::{Task, TaskId, TaskMetadata, TaskOperation, TaskOutcome, TaskPriority, TaskStatus};
pub use zone::{Zone, ZoneBrand, ZoneStatus};

/// Result type alias used throughout the shared crate.
pub type Result<T> = anyhow::Result<T>;

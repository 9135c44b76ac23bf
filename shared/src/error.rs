//! Common error types for the control-plane agent
//!
//! These map directly onto the error kinds the HTTP surface and Task Engine
//! need to distinguish: validation failures never have side effects, missing
//! resources are 404s, conflicting/duplicate mutations are 409s, and
//! transient store errors are retried rather than surfaced.

use thiserror::Error;

/// Errors shared across the Store, Task Engine and HTTP surface.
///
/// Each variant corresponds to one of the error kinds named in the error
/// handling design: `ValidationError`, `NotFoundError`, `ConflictError` and
/// `TransientStoreError`. Kinds that are specific to a single component
/// (`CommandTimeout`, `ParseError`, `HandlerError`, `FatalCollectorError`)
/// live closer to where they're produced instead of in this shared enum.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

pub type Result<T> = anyhow::Result<T>;

//! Protocol-level validation errors

use thiserror::Error;

/// Errors raised while constructing or validating protocol values
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("thread id must not be empty")]
    EmptyThreadId,

    #[error("invalid capability name '{0}': expected non-empty lowercase [a-z0-9_]")]
    InvalidCapabilityName(String),

    #[error("workflow definition '{key}' is invalid: {reason}")]
    InvalidWorkflow { key: String, reason: String },
}

//! Namenode agent error abstractions.

use thiserror::Error;

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// An invariant of the HA coordination protocol has been violated.
    ///
    /// These errors are never retried into a guessed state. The agent refuses to make progress
    /// until an operator intervenes.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// A broadcast fact could not be decoded or failed validation.
    #[error("invalid fact {key}: {reason}")]
    InvalidFact { key: String, reason: String },
    /// An external action (installer run, format, service control) failed.
    ///
    /// The step which issued the action has not been recorded as complete.
    #[error("error during {action}")]
    ActionFailed {
        action: &'static str,
        #[source]
        source: anyhow::Error,
    },
    /// The agent has hit an internal error, but will remain online.
    #[error("internal error")]
    Ise(anyhow::Error),
}

impl AppError {
    /// Wrap the given error as a failed external action.
    pub fn action(action: &'static str, source: anyhow::Error) -> Self {
        Self::ActionFailed { action, source }
    }

    /// Check if this error is a protocol violation.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::ProtocolViolation(_))
    }
}

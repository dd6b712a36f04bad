//! Error types for the orchestrator
//!
//! Classifies every failure an operation can end with:
//! - Decode and field-level problems with a model reply
//! - Collaborator failures left after the retry ceiling
//! - Illegal use of the session state machine
//! - History import and configuration problems

use crate::client::CompletionError;
use crate::config::ConfigError;
use mathide_parse::DecodeError;
use mathide_session::{HistoryImportError, PhaseError, UserId};

/// Main orchestrator error type
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Model call failed after retries, or failed terminally
    #[error("model call failed: {0}")]
    Completion(#[from] CompletionError),

    /// Model reply could not be read
    #[error("unusable model reply: {0}")]
    Decode(#[from] DecodeError),

    /// No session for the user
    #[error("no session for user {0}")]
    NoSession(UserId),

    /// Operation not allowed in the current phase
    #[error("session state: {0}")]
    Phase(#[from] PhaseError),

    /// New session requested with a blank task
    #[error("task must not be empty")]
    EmptyTask,

    /// Custom transformation with a blank description
    #[error("transformation description must not be empty")]
    EmptyDescription,

    /// Exported history rejected
    #[error("history import failed: {0}")]
    Import(#[from] HistoryImportError),

    /// Configuration rejected
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl OrchestratorError {
    /// Whether repeating the same operation may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Completion(err) => {
                err.is_transient() || matches!(err, CompletionError::InvalidResponse(_))
            }
            Self::Decode(_) => true,
            _ => false,
        }
    }

    /// Whether the model call itself failed, as opposed to its reply
    #[inline]
    #[must_use]
    pub fn aborts_operation(&self) -> bool {
        matches!(self, Self::Completion(_))
    }

    /// Whether the model answered but the reply was unusable
    #[inline]
    #[must_use]
    pub fn is_decode_failure(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

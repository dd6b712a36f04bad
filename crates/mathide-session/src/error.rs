//! Error types for session state

use crate::phase::SessionPhase;

/// Rejection of an exported history record
///
/// Import validates everything before building state, so any of these
/// leaves the target untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryImportError {
    /// Top level is not an object
    #[error("exported history must be a JSON object")]
    NotAnObject,

    /// A required top-level field is absent
    #[error("exported history is missing `{0}`")]
    MissingTopField(&'static str),

    /// A required step field is absent
    #[error("step {step} is missing `{field}`")]
    MissingField {
        /// Index of the step in the `steps` array
        step: usize,
        /// Missing field
        field: &'static str,
    },

    /// A field is present but has the wrong type or format
    #[error("step {step}: invalid `{field}`: {reason}")]
    InvalidField {
        /// Index of the step in the `steps` array
        step: usize,
        /// Offending field
        field: &'static str,
        /// What was wrong
        reason: String,
    },

    /// Ordinals or parent links do not form a chain
    #[error("inconsistent step chain: {0}")]
    InconsistentChain(String),
}

/// Illegal use of the session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PhaseError {
    /// Transition not allowed from the current phase
    #[error("illegal transition from {from} to {to}")]
    IllegalTransition {
        /// Current phase
        from: SessionPhase,
        /// Requested phase
        to: SessionPhase,
    },

    /// Operation needs a selected candidate
    #[error("no candidate selected")]
    NoSelection,

    /// Operation needs an active task
    #[error("no task in progress")]
    NoTask,
}

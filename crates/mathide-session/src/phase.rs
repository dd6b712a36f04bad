//! Session state machine
//!
//! ```text
//! AwaitingTask → GeneratingCandidates → AwaitingSelection → Applying → Solved
//!                      ▲      │                │    ▲          │
//!                      │      └── (none) ──────┘    │          │
//!                      │                       AwaitingParameterInput
//!                      └────────────── not solved ─────────────┘
//! ```
//!
//! `Solved` is terminal for forward moves. Rollback returns any phase with a
//! task, `Solved` included, to `AwaitingSelection` (offers still registered)
//! or `GeneratingCandidates` (nothing on offer).

use crate::error::PhaseError;
use serde::{Deserialize, Serialize};

/// Phase of one user's session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// No task submitted
    AwaitingTask,
    /// Candidates are needed for the current expression
    GeneratingCandidates,
    /// Candidates are on offer
    AwaitingSelection,
    /// The selected candidate needs parameter values
    AwaitingParameterInput,
    /// A concrete candidate is selected and ready to apply
    Applying,
    /// The completion check reported the task solved
    Solved,
}

impl SessionPhase {
    /// Whether a task is in progress or finished
    #[inline]
    #[must_use]
    pub fn has_task(self) -> bool {
        self != Self::AwaitingTask
    }

    /// Snake-case label
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingTask => "awaiting_task",
            Self::GeneratingCandidates => "generating_candidates",
            Self::AwaitingSelection => "awaiting_selection",
            Self::AwaitingParameterInput => "awaiting_parameter_input",
            Self::Applying => "applying",
            Self::Solved => "solved",
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phases reachable from `from`
#[must_use]
pub fn allowed_transitions(from: SessionPhase) -> Vec<SessionPhase> {
    use SessionPhase::*;
    match from {
        AwaitingTask => vec![GeneratingCandidates],
        GeneratingCandidates => vec![GeneratingCandidates, AwaitingSelection, Applying, Solved],
        AwaitingSelection | AwaitingParameterInput | Applying => vec![
            GeneratingCandidates,
            AwaitingSelection,
            AwaitingParameterInput,
            Applying,
            Solved,
        ],
        Solved => Vec::new(),
    }
}

/// Validate a phase transition
///
/// # Errors
///
/// [`PhaseError::IllegalTransition`] when `to` is not reachable from `from`.
pub fn validate_transition(from: SessionPhase, to: SessionPhase) -> Result<(), PhaseError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(PhaseError::IllegalTransition { from, to })
    }
}

/// Validate the phase a rollback lands in
///
/// # Errors
///
/// [`PhaseError::IllegalTransition`] when `from` has no task or `to` is not
/// one of the two rollback targets.
pub fn validate_rollback(from: SessionPhase, to: SessionPhase) -> Result<(), PhaseError> {
    use SessionPhase::*;
    if from.has_task() && matches!(to, GeneratingCandidates | AwaitingSelection) {
        Ok(())
    } else {
        Err(PhaseError::IllegalTransition { from, to })
    }
}

//! MathIDE Session State
//!
//! Everything a solving session remembers between model calls:
//! - Candidates offered by the model and the registry resolving their ids
//! - The step chain with rollback, branch annotations and export/import
//! - The per-session phase machine
//! - The per-user session store
//!
//! Nothing here talks to the model; that is the orchestrator's job.
//!
//! # Example
//!
//! ```rust
//! use mathide_session::StepHistory;
//!
//! let mut history = StepHistory::new("2(x+1)=4");
//! history.append("2(x+1)=4", vec![], None, None);
//! history.append("2(x+1)=4", vec![], None, Some("2x+2=4".to_string()));
//!
//! assert_eq!(history.current_expression(), "2x+2=4");
//! assert!(history.rollback_to_ordinal(0));
//! assert_eq!(history.current_expression(), "2(x+1)=4");
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod error;
pub mod history;
pub mod phase;
pub mod registry;
pub mod store;
pub mod types;

pub use error::{HistoryImportError, PhaseError};
pub use history::{HistorySummary, StepHistory, StepSummary};
pub use phase::{allowed_transitions, validate_rollback, validate_transition, SessionPhase};
pub use registry::CandidateRegistry;
pub use store::{Selection, Session, SessionHandle, SessionStore};
pub use types::{
    substitute, Branch, BranchKind, Candidate, CandidateId, ParameterDefinition, ParameterType,
    ParameterValue, Step, StepId, UnfilledParameter, UserId, Usefulness,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with session state
    pub use crate::{
        Candidate, CandidateId, CandidateRegistry, Session, SessionPhase, SessionStore, Step,
        StepHistory, StepId, UserId,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

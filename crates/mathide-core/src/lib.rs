//! MathIDE Core - session orchestration
//!
//! The only layer that talks to the model:
//! - Completion contract with bounded, backing-off retry
//! - Prompt catalog for every model operation
//! - Candidate ranking and offer selection
//! - The per-user generate → select → apply → check loop
//! - Engine configuration from TOML and the environment
//!
//! # Example
//!
//! ```rust,ignore
//! use mathide_core::{EngineConfig, SessionOrchestrator};
//! use mathide_session::UserId;
//!
//! # async fn example(client: impl mathide_core::CompletionClient) -> Result<(), mathide_core::OrchestratorError> {
//! let engine = SessionOrchestrator::new(client, EngineConfig::new().with_env_overrides());
//! let user = UserId(42);
//!
//! engine.new_session(user, "2(x+1)=4")?;
//! let outcome = engine.generate(user).await?;
//! let first = outcome.offers[0].id.to_string();
//! engine.select(user, &first).await?;
//! engine.apply(user).await?;
//! let verdict = engine.check(user).await?;
//! println!("solved: {}", verdict.solved);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod client;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod prompts;
pub mod ranking;

pub use client::{
    ChatMessage, CompletionClient, CompletionError, CompletionRequest, CompletionResponse,
    RetryingClient, Role, TokenUsage, TRANSCRIPT_TARGET,
};
pub use config::{ConfigError, EngineConfig, RetryPolicy, Temperatures};
pub use error::OrchestratorError;
pub use orchestrator::{
    ApplyOutcome, BranchingOutcome, CheckVerdict, FillOutcome, GenerationOutcome, Offer,
    ProgressReport, RollbackRecommendation, RollbackTarget, SelectOutcome, SessionOrchestrator,
    VerificationRequest,
};
pub use prompts::{Operation, PromptCatalog, PromptTemplate};
pub use ranking::{rank_candidates, select_offers, select_offers_with};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving sessions
    pub use crate::{
        ApplyOutcome, CompletionClient, EngineConfig, OrchestratorError, RollbackTarget,
        SelectOutcome, SessionOrchestrator,
    };
    pub use mathide_session::prelude::*;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

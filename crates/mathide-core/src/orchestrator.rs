//! Session orchestrator
//!
//! Drives the generate → select → apply → check loop for every user:
//! - Formats requests from the prompt catalog and calls the model
//! - Reads replies through the resilient decoder into typed records
//! - Registers offers, fills parameters and appends steps
//! - Runs the advisory side operations (progress, branching, verification)
//!
//! Each operation holds its session's lock for its whole duration and only
//! mutates the session after the model reply has been decoded. Dropping an
//! operation's future therefore leaves the session exactly as it was.

use crate::client::{ChatMessage, CompletionClient, CompletionRequest, RetryingClient};
use crate::config::EngineConfig;
use crate::error::OrchestratorError;
use crate::prompts::{Operation, PromptCatalog};
use crate::ranking::select_offers;
use mathide_parse::records::{
    read_generation, read_record, ApplyResponse, BranchingResponse, CheckResponse,
    ProgressResponse, VerificationResponse,
};
use mathide_session::{
    validate_transition, Branch, BranchKind, Candidate, CandidateId, CandidateRegistry,
    HistoryImportError, HistorySummary, ParameterDefinition, PhaseError, Selection, Session,
    SessionHandle, SessionPhase, SessionStore, StepHistory, StepId, UserId,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A registered candidate as presented to the user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Offer {
    /// Id to pass back to [`SessionOrchestrator::select`]
    pub id: CandidateId,
    /// The candidate
    pub candidate: Candidate,
}

/// Result of a generation round
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationOutcome {
    /// Step the offers belong to
    pub step_id: StepId,
    /// Offers in presentation order, possibly empty
    pub offers: Vec<Offer>,
}

impl GenerationOutcome {
    /// Whether no candidate survived
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }
}

/// Result of selecting an offer
#[derive(Debug, Clone, PartialEq)]
pub enum SelectOutcome {
    /// Candidate is concrete and selected for applying
    ReadyToApply(Candidate),
    /// Candidate needs parameter values first
    AwaitingParameters {
        /// Selected candidate, still with placeholders
        candidate: Candidate,
        /// Definitions to ask the user for
        pending: Vec<ParameterDefinition>,
    },
    /// Id is unknown, stale, or not on offer for the current step
    NotFound,
}

/// Result of supplying parameter values
#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    /// Every parameter resolved; the concrete candidate is ready to apply
    Complete(Candidate),
    /// Names still waiting for a value
    Pending(Vec<String>),
    /// A definition has neither a value nor a default
    Missing(String),
    /// The selected candidate has no parameter of that name
    UnknownParameter(String),
}

/// Result of applying a transformation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// Model accepted the step; a new step was appended
    Applied {
        /// Id of the appended step
        step_id: StepId,
        /// Expression after the transformation
        result: String,
        /// Model explanation
        explanation: String,
    },
    /// Model rejected the step; history is unchanged
    Rejected {
        /// Model explanation
        explanation: String,
        /// Problems reported by the model
        errors: Vec<String>,
    },
}

/// Completion check verdict
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckVerdict {
    /// Whether the task is solved
    pub solved: bool,
    /// Confidence clamped to `0..=1`
    pub confidence: f64,
    /// Reasoning
    pub explanation: String,
    /// Solution category tag
    pub category: String,
    /// Suggested follow-ups
    pub next_steps: Vec<String>,
}

/// Where to roll back to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackTarget {
    /// Step ordinal, 0-based
    Ordinal(i64),
    /// Step id
    Id(StepId),
}

/// Advisory rollback suggestion
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollbackRecommendation {
    /// Ordinal to return to, always inside the current chain
    pub step: usize,
    /// Why
    pub reason: Option<String>,
    /// Text for the user
    pub message: Option<String>,
}

/// Progress analysis result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressReport {
    /// Overall assessment tag
    pub assessment: String,
    /// Confidence clamped to `0..=1`
    pub confidence: f64,
    /// Free text analysis
    pub analysis: String,
    /// Rollback suggestion, never acted upon automatically
    pub recommendation: Option<RollbackRecommendation>,
}

/// Branching analysis result
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BranchingOutcome {
    /// Branches were attached to the current step
    Branched {
        /// Decomposition kind
        kind: BranchKind,
        /// Attached branches
        branches: Vec<Branch>,
        /// Model explanation
        explanation: String,
    },
    /// Expression does not split
    Linear {
        /// Model explanation
        explanation: String,
    },
}

/// A transformation the user performed themselves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRequest {
    /// Expression before the transformation
    pub expression: String,
    /// What the user claims to have done
    pub claimed_description: String,
    /// Result the user claims
    pub claimed_result: String,
    /// The user's own final result, if separate
    pub user_result: Option<String>,
}

/// The generate → select → apply → check loop
pub struct SessionOrchestrator<C> {
    client: RetryingClient<C>,
    prompts: PromptCatalog,
    registry: Arc<CandidateRegistry>,
    store: Arc<SessionStore>,
    config: EngineConfig,
}

impl<C> std::fmt::Debug for SessionOrchestrator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("config", &self.config)
            .field("sessions", &self.store.len())
            .field("candidates", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl<C: CompletionClient> SessionOrchestrator<C> {
    /// Create an orchestrator with its own registry and store
    #[must_use]
    pub fn new(client: C, config: EngineConfig) -> Self {
        let client = RetryingClient::new(client, config.retry)
            .with_transcript(config.transcript_logging);
        Self {
            client,
            prompts: PromptCatalog::new(),
            registry: Arc::new(CandidateRegistry::new()),
            store: Arc::new(SessionStore::new()),
            config,
        }
    }

    /// With a custom prompt catalog
    #[must_use]
    pub fn with_prompts(mut self, prompts: PromptCatalog) -> Self {
        self.prompts = prompts;
        self
    }

    /// With an externally owned registry and store
    #[must_use]
    pub fn with_shared_state(
        mut self,
        registry: Arc<CandidateRegistry>,
        store: Arc<SessionStore>,
    ) -> Self {
        self.registry = registry;
        self.store = store;
        self
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Candidate registry
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &Arc<CandidateRegistry> {
        &self.registry
    }

    /// Session store
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Wrapped completion client
    #[inline]
    #[must_use]
    pub fn client(&self) -> &C {
        self.client.inner()
    }

    /// Start a session for a task, replacing the user's current one
    ///
    /// Returns the id of the initial step.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::EmptyTask`] for a blank task.
    pub fn new_session(&self, user: UserId, task: &str) -> Result<StepId, OrchestratorError> {
        let task = task.trim();
        if task.is_empty() {
            return Err(OrchestratorError::EmptyTask);
        }
        let session = Session::start(task);
        let step_id = current_step_id(&session)?;

        let (_, previous) = self.store.install(user, session);
        if let Some(previous) = previous {
            self.discard_offers(&previous);
        }
        info!(user = %user, step = %step_id, "new session started");
        Ok(step_id)
    }

    /// Generate, rank and register candidates for the current step
    ///
    /// Elements of the reply that are not valid candidates are dropped. An
    /// empty offer list is a normal outcome.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::Completion`] when the model call fails
    /// - [`OrchestratorError::Decode`] when the reply holds no readable array
    /// - [`OrchestratorError::Phase`] when the session has no task or is solved
    pub async fn generate(&self, user: UserId) -> Result<GenerationOutcome, OrchestratorError> {
        let handle = self.handle(user)?;
        let mut session = handle.lock().await;
        session.touch();

        let outcome = self.generate_offers(user, &handle, &mut session).await;
        self.forget_if_replaced(user, &handle, &session);
        outcome
    }

    async fn generate_offers(
        &self,
        user: UserId,
        handle: &SessionHandle,
        session: &mut Session,
    ) -> Result<GenerationOutcome, OrchestratorError> {
        let (step_id, task, expression) = task_context(session)?;
        validate_transition(session.phase(), SessionPhase::GeneratingCandidates)?;

        let limit = self.config.max_candidates.to_string();
        let text = self
            .complete(
                Operation::Generation,
                &[
                    ("task", task.as_str()),
                    ("expression", expression.as_str()),
                    ("max_candidates", limit.as_str()),
                ],
            )
            .await?;
        let items = read_generation(&text)?;
        let received = items.len();

        let mut offers = select_offers(
            items.into_iter().map(Candidate::from_record).collect(),
            self.config.max_candidates,
        );
        if self.config.preview_mode {
            for candidate in &mut offers {
                candidate.preview_result = Some(candidate.expression.clone());
            }
        }

        if !self.is_current(user, handle) {
            warn!(user = %user, "session replaced during generation, discarding offers");
            return Ok(GenerationOutcome {
                step_id,
                offers: Vec::new(),
            });
        }

        let ids = self.registry.register(step_id, offers.clone());
        let next = if ids.is_empty() {
            SessionPhase::GeneratingCandidates
        } else {
            SessionPhase::AwaitingSelection
        };
        session.set_selection(None);
        session.transition(next)?;

        info!(
            user = %user,
            step = %step_id,
            received,
            offered = ids.len(),
            "generated candidates"
        );
        Ok(GenerationOutcome {
            step_id,
            offers: ids
                .into_iter()
                .zip(offers)
                .map(|(id, candidate)| Offer { id, candidate })
                .collect(),
        })
    }

    /// Select an offered candidate by id
    ///
    /// Unknown or stale ids yield [`SelectOutcome::NotFound`].
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Phase`] when the session has no task or cannot
    /// accept a selection in its current phase.
    pub async fn select(&self, user: UserId, id: &str) -> Result<SelectOutcome, OrchestratorError> {
        let handle = self.handle(user)?;
        let mut session = handle.lock().await;
        session.touch();

        let step_id = current_step_id(&session)?;
        let Some((id, candidate)) = self.registry.resolve_str(id.trim()) else {
            info!(user = %user, "selected candidate is unknown");
            return Ok(SelectOutcome::NotFound);
        };
        if !self.registry.ids_for_step(&step_id).contains(&id) {
            info!(user = %user, candidate = %id, "selected candidate is not on offer for this step");
            return Ok(SelectOutcome::NotFound);
        }

        let mut candidate = (*candidate).clone();
        if candidate.definitions().is_empty() {
            // flagged without definitions: nothing to ask for
            candidate.requires_user_input = false;
        }

        if candidate.is_concrete() {
            session.transition(SessionPhase::Applying)?;
            session.set_selection(Some(Selection::new(Some(id), candidate.clone())));
            debug!(user = %user, candidate = %id, "selected concrete candidate");
            Ok(SelectOutcome::ReadyToApply(candidate))
        } else {
            session.transition(SessionPhase::AwaitingParameterInput)?;
            let pending = candidate.definitions().to_vec();
            session.set_selection(Some(Selection::new(Some(id), candidate.clone())));
            debug!(user = %user, candidate = %id, pending = pending.len(), "selected candidate needs parameters");
            Ok(SelectOutcome::AwaitingParameters { candidate, pending })
        }
    }

    /// Record one parameter value for the selected candidate
    ///
    /// The fill completes once the last definition has a value.
    ///
    /// # Errors
    ///
    /// [`PhaseError::NoSelection`] when nothing is selected.
    pub async fn supply_parameter(
        &self,
        user: UserId,
        name: &str,
        value: impl Into<String> + Send,
    ) -> Result<FillOutcome, OrchestratorError> {
        let handle = self.handle(user)?;
        let mut session = handle.lock().await;
        session.touch();

        let selection = session.selection_mut().ok_or(PhaseError::NoSelection)?;
        if !selection
            .candidate
            .definitions()
            .iter()
            .any(|definition| definition.name == name)
        {
            return Ok(FillOutcome::UnknownParameter(name.to_string()));
        }
        selection.supplied.insert(name.to_string(), value.into());

        let pending: Vec<String> = selection
            .pending_parameters()
            .into_iter()
            .map(str::to_owned)
            .collect();
        if !pending.is_empty() {
            return Ok(FillOutcome::Pending(pending));
        }
        finish_fill(&mut session, |_| None)
    }

    /// Resolve every remaining parameter through `provider`
    ///
    /// Values already supplied take precedence over the provider; a
    /// definition's default is used when the provider yields nothing.
    ///
    /// # Errors
    ///
    /// [`PhaseError::NoSelection`] when nothing is selected.
    pub async fn fill_parameters<F>(
        &self,
        user: UserId,
        provider: F,
    ) -> Result<FillOutcome, OrchestratorError>
    where
        F: FnMut(&ParameterDefinition) -> Option<String> + Send,
    {
        let handle = self.handle(user)?;
        let mut session = handle.lock().await;
        session.touch();
        finish_fill(&mut session, provider)
    }

    /// Apply the selected candidate
    ///
    /// A step is appended only when the model reports the application as
    /// valid.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::Phase`] when no concrete candidate is selected
    /// - [`OrchestratorError::Completion`] when the model call fails
    /// - [`OrchestratorError::Decode`] when the reply lacks `result` or `valid`
    ///
    /// The session is unchanged on error and the apply can be repeated.
    pub async fn apply(&self, user: UserId) -> Result<ApplyOutcome, OrchestratorError> {
        let handle = self.handle(user)?;
        let mut session = handle.lock().await;
        session.touch();

        let selection = session.selection().ok_or(PhaseError::NoSelection)?;
        if session.phase() != SessionPhase::Applying {
            return Err(PhaseError::IllegalTransition {
                from: session.phase(),
                to: SessionPhase::Applying,
            }
            .into());
        }
        let candidate = selection.candidate.clone();
        let outcome = self.run_apply(user, &mut session, candidate).await;
        self.forget_if_replaced(user, &handle, &session);
        outcome
    }

    /// Apply a transformation the user described in free text
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::EmptyDescription`] for a blank description,
    /// otherwise as [`SessionOrchestrator::apply`].
    pub async fn apply_custom(
        &self,
        user: UserId,
        description: &str,
    ) -> Result<ApplyOutcome, OrchestratorError> {
        let description = description.trim();
        if description.is_empty() {
            return Err(OrchestratorError::EmptyDescription);
        }
        let handle = self.handle(user)?;
        let mut session = handle.lock().await;
        session.touch();

        current_step_id(&session)?;
        validate_transition(session.phase(), SessionPhase::Applying)?;
        let outcome = self
            .run_apply(user, &mut session, Candidate::custom(description))
            .await;
        self.forget_if_replaced(user, &handle, &session);
        outcome
    }

    async fn run_apply(
        &self,
        user: UserId,
        session: &mut Session,
        candidate: Candidate,
    ) -> Result<ApplyOutcome, OrchestratorError> {
        let (step_id, task, expression) = task_context(session)?;

        let text = self
            .complete(
                Operation::Apply,
                &[
                    ("task", task.as_str()),
                    ("expression", expression.as_str()),
                    ("description", candidate.description.as_str()),
                    ("transformation", candidate.expression.as_str()),
                    ("kind", candidate.kind.as_str()),
                ],
            )
            .await?;
        let response: ApplyResponse = read_record(&text)?;

        let offered = self.registry.ids_for_step(&step_id);
        if !response.valid {
            let next = if offered.is_empty() {
                SessionPhase::GeneratingCandidates
            } else {
                SessionPhase::AwaitingSelection
            };
            session.set_selection(None);
            session.transition(next)?;
            info!(user = %user, step = %step_id, "model rejected transformation");
            return Ok(ApplyOutcome::Rejected {
                explanation: response.explanation,
                errors: response.errors.unwrap_or_default(),
            });
        }

        let history = session.history_mut().ok_or(PhaseError::NoTask)?;
        let new_step = history
            .append(
                expression,
                offered,
                Some(candidate),
                Some(response.result.clone()),
            )
            .id;
        session.set_selection(None);
        session.transition(SessionPhase::GeneratingCandidates)?;

        info!(user = %user, step = %new_step, "applied transformation");
        Ok(ApplyOutcome::Applied {
            step_id: new_step,
            result: response.result,
            explanation: response.explanation,
        })
    }

    /// Ask the model whether the task is solved
    ///
    /// A positive verdict moves the session to [`SessionPhase::Solved`], any
    /// other back to [`SessionPhase::GeneratingCandidates`].
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::Phase`] without a task or when already solved
    /// - [`OrchestratorError::Completion`] / [`OrchestratorError::Decode`] as for apply
    pub async fn check(&self, user: UserId) -> Result<CheckVerdict, OrchestratorError> {
        let handle = self.handle(user)?;
        let mut session = handle.lock().await;
        session.touch();

        let (_, task, expression) = task_context(&session)?;
        validate_transition(session.phase(), SessionPhase::Solved)?;

        let text = self
            .complete(
                Operation::Check,
                &[("task", task.as_str()), ("expression", expression.as_str())],
            )
            .await?;
        let response: CheckResponse = read_record(&text)?;
        let verdict = CheckVerdict {
            solved: response.solved,
            confidence: response.clamped_confidence(),
            explanation: response.explanation,
            category: response.category,
            next_steps: response.next_steps.unwrap_or_default(),
        };

        session.set_selection(None);
        if verdict.solved {
            session.transition(SessionPhase::Solved)?;
            info!(user = %user, category = %verdict.category, "task solved");
        } else {
            session.transition(SessionPhase::GeneratingCandidates)?;
            debug!(user = %user, confidence = verdict.confidence, "task not solved yet");
        }
        Ok(verdict)
    }

    /// Roll the user's history back to an earlier step
    ///
    /// Returns `false`, changing nothing, when the target is not in the
    /// chain. This is the only way to continue a solved session.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Phase`] when the session has no task.
    pub async fn rollback(
        &self,
        user: UserId,
        target: RollbackTarget,
    ) -> Result<bool, OrchestratorError> {
        let handle = self.handle(user)?;
        let mut session = handle.lock().await;
        session.touch();

        let history = session.history_mut().ok_or(PhaseError::NoTask)?;
        let before: Vec<StepId> = history.steps().iter().map(|step| step.id).collect();
        let rolled = match target {
            RollbackTarget::Ordinal(ordinal) => history.rollback_to_ordinal(ordinal),
            RollbackTarget::Id(id) => history.rollback_to_id(&id),
        };
        if !rolled {
            info!(user = %user, target = ?target, "rollback target not in history");
            return Ok(false);
        }

        let kept = history.len();
        let current = history.current_step().map(|step| step.id);
        for discarded in &before[kept..] {
            self.registry.forget_step(discarded);
        }

        let next = match current {
            Some(step) if !self.registry.ids_for_step(&step).is_empty() => {
                SessionPhase::AwaitingSelection
            }
            _ => SessionPhase::GeneratingCandidates,
        };
        session.set_selection(None);
        session.roll_back(next)?;
        info!(user = %user, steps = kept, phase = %next, "rolled back");
        Ok(true)
    }

    /// Ask the model to review the whole chain
    ///
    /// Purely advisory: the session is never rolled back here. A recommended
    /// step outside the chain is withdrawn.
    ///
    /// # Errors
    ///
    /// As for [`SessionOrchestrator::check`].
    pub async fn analyze_progress(&self, user: UserId) -> Result<ProgressReport, OrchestratorError> {
        let handle = self.handle(user)?;
        let mut session = handle.lock().await;
        session.touch();

        let (_, task, expression) = task_context(&session)?;
        let history = session.history().ok_or(PhaseError::NoTask)?;
        let steps = describe_steps(history);
        let len = history.len();

        let text = self
            .complete(
                Operation::Progress,
                &[
                    ("task", task.as_str()),
                    ("expression", expression.as_str()),
                    ("steps", steps.as_str()),
                ],
            )
            .await?;
        let response: ProgressResponse = read_record(&text)?;

        let recommendation = if response.recommend_rollback {
            let step = response
                .recommended_step
                .and_then(|n| usize::try_from(n).ok())
                .filter(|n| *n < len);
            if step.is_none() {
                warn!(
                    user = %user,
                    recommended = ?response.recommended_step,
                    steps = len,
                    "withdrawing rollback recommendation outside the chain"
                );
            }
            step.map(|step| RollbackRecommendation {
                step,
                reason: response.rollback_reason,
                message: response.suggestion_message,
            })
        } else {
            None
        };

        Ok(ProgressReport {
            assessment: response.progress_assessment,
            confidence: unit_interval(response.confidence),
            analysis: response.analysis,
            recommendation,
        })
    }

    /// Ask the model whether the current expression splits into branches
    ///
    /// When it does, the branches are attached to the current step as
    /// read-only annotations.
    ///
    /// # Errors
    ///
    /// As for [`SessionOrchestrator::check`].
    pub async fn analyze_branching(
        &self,
        user: UserId,
    ) -> Result<BranchingOutcome, OrchestratorError> {
        let handle = self.handle(user)?;
        let mut session = handle.lock().await;
        session.touch();

        let (step_id, task, expression) = task_context(&session)?;
        let text = self
            .complete(
                Operation::Branching,
                &[("task", task.as_str()), ("expression", expression.as_str())],
            )
            .await?;
        let response: BranchingResponse = read_record(&text)?;

        if !response.requires_branching || response.branches.is_empty() {
            if response.requires_branching {
                warn!(user = %user, "branching reported without branches, ignoring");
            }
            return Ok(BranchingOutcome::Linear {
                explanation: response.explanation,
            });
        }

        let kind = branch_kind(response.solution_type.as_deref());
        let branches: Vec<Branch> = response
            .branches
            .into_iter()
            .enumerate()
            .map(|(index, item)| Branch {
                id: format!("branch_{index}"),
                name: item
                    .name
                    .filter(|name| !name.trim().is_empty())
                    .unwrap_or_else(|| format!("Branch {}", index + 1)),
                expression: item.expression.unwrap_or_default(),
                condition: item.condition,
                is_valid: item.is_valid.unwrap_or(true),
            })
            .collect();
        let reason = Some(response.explanation.clone())
            .filter(|text| !text.trim().is_empty())
            .or(response.description);

        let history = session.history_mut().ok_or(PhaseError::NoTask)?;
        history.attach_branches(kind, branches.clone(), reason);
        info!(user = %user, step = %step_id, kind = %kind, count = branches.len(), "attached branches");

        Ok(BranchingOutcome::Branched {
            kind,
            branches,
            explanation: response.explanation,
        })
    }

    /// Check a transformation the user performed themselves
    ///
    /// Needs no session and changes none.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Completion`] or [`OrchestratorError::Decode`].
    pub async fn verify(
        &self,
        request: &VerificationRequest,
    ) -> Result<VerificationResponse, OrchestratorError> {
        let user_result = request.user_result.as_deref().unwrap_or("(not given)");
        let text = self
            .complete(
                Operation::Verify,
                &[
                    ("expression", request.expression.as_str()),
                    ("description", request.claimed_description.as_str()),
                    ("result", request.claimed_result.as_str()),
                    ("user_result", user_result),
                ],
            )
            .await?;
        let verdict: VerificationResponse = read_record(&text)?;
        info!(correct = verdict.is_correct, "verified user transformation");
        Ok(verdict)
    }

    /// Drop the user's session, leaving an empty one
    ///
    /// Returns whether a session existed.
    pub fn cancel(&self, user: UserId) -> bool {
        match self.store.reset(user) {
            Some(previous) => {
                self.discard_offers(&previous);
                info!(user = %user, "session cancelled");
                true
            }
            None => false,
        }
    }

    /// Evict sessions idle longer than the configured timeout
    pub fn evict_idle(&self) -> usize {
        self.store
            .evict_idle_with(self.config.idle_timeout(), |user, session| {
                debug!(user = %user, "evicting idle session");
                self.forget_offers(session);
            })
    }

    /// Serialized history of the user's session
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::NoSession`] / [`PhaseError::NoTask`].
    pub async fn export(&self, user: UserId) -> Result<Value, OrchestratorError> {
        let handle = self.handle(user)?;
        let session = handle.lock().await;
        let history = session.history().ok_or(PhaseError::NoTask)?;
        Ok(history.export())
    }

    /// Replace the user's session with an imported history
    ///
    /// Returns the id of the imported current step. The user's existing
    /// session is untouched when the import is rejected.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Import`] for a malformed or empty history.
    pub fn import(&self, user: UserId, data: &Value) -> Result<StepId, OrchestratorError> {
        let history = StepHistory::import(data)?;
        let step_id = history
            .current_step()
            .map(|step| step.id)
            .ok_or_else(|| HistoryImportError::InconsistentChain("history has no steps".into()))?;

        let (_, previous) = self.store.install(user, Session::resume(history));
        if let Some(previous) = previous {
            self.discard_offers(&previous);
        }
        info!(user = %user, step = %step_id, "session imported");
        Ok(step_id)
    }

    /// Display projection of the user's history
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::NoSession`] / [`PhaseError::NoTask`].
    pub async fn summary(&self, user: UserId) -> Result<HistorySummary, OrchestratorError> {
        let handle = self.handle(user)?;
        let session = handle.lock().await;
        let history = session.history().ok_or(PhaseError::NoTask)?;
        Ok(history.summary())
    }

    /// Current phase of the user's session
    pub async fn phase(&self, user: UserId) -> Option<SessionPhase> {
        let handle = self.store.get(user)?;
        let session = handle.lock().await;
        Some(session.phase())
    }

    /// Current selection of the user's session
    pub async fn selection(&self, user: UserId) -> Option<Selection> {
        let handle = self.store.get(user)?;
        let session = handle.lock().await;
        session.selection().cloned()
    }

    /// Offers registered for the current step
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::NoSession`] / [`PhaseError::NoTask`].
    pub async fn offers(&self, user: UserId) -> Result<Vec<Offer>, OrchestratorError> {
        let handle = self.handle(user)?;
        let session = handle.lock().await;
        let step_id = current_step_id(&session)?;
        Ok(self
            .registry
            .candidates_for_step(&step_id)
            .into_iter()
            .map(|(id, candidate)| Offer {
                id,
                candidate: (*candidate).clone(),
            })
            .collect())
    }

    fn handle(&self, user: UserId) -> Result<SessionHandle, OrchestratorError> {
        self.store
            .get(user)
            .ok_or(OrchestratorError::NoSession(user))
    }

    fn is_current(&self, user: UserId, handle: &SessionHandle) -> bool {
        self.store
            .get(user)
            .is_some_and(|current| Arc::ptr_eq(&current, handle))
    }

    fn discard_offers(&self, handle: &SessionHandle) {
        match handle.try_lock() {
            Ok(session) => self.forget_offers(&session),
            Err(_) => debug!("replaced session is busy, its holder forgets the offers"),
        }
    }

    /// Forget the offers of a session replaced while `session` was held
    ///
    /// Covers the case [`Self::discard_offers`] skips because the lock was
    /// taken.
    fn forget_if_replaced(&self, user: UserId, handle: &SessionHandle, session: &Session) {
        if !self.is_current(user, handle) {
            debug!(user = %user, "releasing replaced session");
            self.forget_offers(session);
        }
    }

    fn forget_offers(&self, session: &Session) {
        if let Some(history) = session.history() {
            let forgotten: usize = history
                .steps()
                .iter()
                .map(|step| self.registry.forget_step(&step.id))
                .sum();
            debug!(forgotten, "forgot offers of discarded session");
        }
    }

    fn temperature(&self, op: Operation) -> f32 {
        let t = &self.config.temperatures;
        match op {
            Operation::Generation => t.generation,
            Operation::Apply => t.apply,
            Operation::Check => t.check,
            Operation::Progress => t.progress,
            Operation::Verify => t.verify,
            Operation::Branching => t.branching,
        }
    }

    async fn complete(
        &self,
        op: Operation,
        vars: &[(&str, &str)],
    ) -> Result<String, OrchestratorError> {
        let (system, user) = self.prompts.render(op, vars);
        let request = CompletionRequest {
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            temperature: self.temperature(op),
            model: self.config.model.clone(),
        };
        debug!(operation = op.name(), "requesting completion");
        let response = self.client.complete(&request).await?;
        Ok(response.content)
    }
}

fn current_step_id(session: &Session) -> Result<StepId, PhaseError> {
    session
        .history()
        .and_then(StepHistory::current_step)
        .map(|step| step.id)
        .ok_or(PhaseError::NoTask)
}

/// Current step id, original task and current expression
fn task_context(session: &Session) -> Result<(StepId, String, String), PhaseError> {
    let history = session.history().ok_or(PhaseError::NoTask)?;
    let step = history.current_step().ok_or(PhaseError::NoTask)?;
    Ok((
        step.id,
        history.original_task().to_owned(),
        history.current_expression().to_owned(),
    ))
}

fn finish_fill<F>(session: &mut Session, mut provider: F) -> Result<FillOutcome, OrchestratorError>
where
    F: FnMut(&ParameterDefinition) -> Option<String>,
{
    let selection = session.selection_mut().ok_or(PhaseError::NoSelection)?;
    if selection.candidate.is_concrete() {
        return Ok(FillOutcome::Complete(selection.candidate.clone()));
    }

    let mut candidate = selection.candidate.clone();
    let supplied = &selection.supplied;
    let filled = candidate.fill_parameters(|definition| {
        supplied
            .get(&definition.name)
            .cloned()
            .or_else(|| provider(definition))
    });

    match filled {
        Ok(()) => {
            selection.candidate = candidate.clone();
            session.transition(SessionPhase::Applying)?;
            debug!(parameters = candidate.parameters.len(), "parameters filled");
            Ok(FillOutcome::Complete(candidate))
        }
        Err(unfilled) => {
            debug!(parameter = %unfilled.name, "parameter has no value");
            Ok(FillOutcome::Missing(unfilled.name))
        }
    }
}

fn describe_steps(history: &StepHistory) -> String {
    history
        .steps()
        .iter()
        .map(|step| {
            let mut line = format!("Step {}: {}", step.ordinal, step.expression);
            if let Some(chosen) = &step.chosen_candidate {
                line.push_str(" | applied: ");
                line.push_str(&chosen.description);
            }
            if let Some(result) = &step.result_expression {
                line.push_str(" | result: ");
                line.push_str(result);
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn branch_kind(tag: Option<&str>) -> BranchKind {
    match tag {
        None => BranchKind::Alternatives,
        Some(tag) => tag.parse().unwrap_or_else(|err: String| {
            warn!(error = %err, "unknown solution type, treating as alternatives");
            BranchKind::Alternatives
        }),
    }
}

fn unit_interval(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

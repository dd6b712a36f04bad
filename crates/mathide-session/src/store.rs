//! Per-user sessions
//!
//! One [`Session`] per user, each behind its own async mutex so that a
//! slow operation for one user never blocks another. The store itself is
//! a concurrent map and holds no cross-user state.

use crate::error::PhaseError;
use crate::history::StepHistory;
use crate::phase::{validate_rollback, validate_transition, SessionPhase};
use crate::types::{Candidate, CandidateId, UserId};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// Shared handle to one user's session
pub type SessionHandle = Arc<Mutex<Session>>;

/// Candidate chosen for the next apply
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Registry id, `None` for user-described candidates
    pub id: Option<CandidateId>,
    /// Candidate as selected, filled in place once parameters are known
    pub candidate: Candidate,
    /// Parameter values supplied so far
    pub supplied: BTreeMap<String, String>,
}

impl Selection {
    /// Select a candidate
    #[must_use]
    pub fn new(id: Option<CandidateId>, candidate: Candidate) -> Self {
        Self {
            id,
            candidate,
            supplied: BTreeMap::new(),
        }
    }

    /// Names of definitions without a supplied value
    #[must_use]
    pub fn pending_parameters(&self) -> Vec<&str> {
        self.candidate
            .definitions()
            .iter()
            .map(|d| d.name.as_str())
            .filter(|name| !self.supplied.contains_key(*name))
            .collect()
    }
}

/// State of one user's solving session
#[derive(Debug)]
pub struct Session {
    phase: SessionPhase,
    history: Option<StepHistory>,
    selection: Option<Selection>,
    last_active: Instant,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Session with no task
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::AwaitingTask,
            history: None,
            selection: None,
            last_active: Instant::now(),
        }
    }

    /// Session for a task, with the task as its initial step
    #[must_use]
    pub fn start(task: impl Into<String>) -> Self {
        let task = task.into();
        let mut history = StepHistory::new(task.clone());
        history.append(task, Vec::new(), None, None);
        Self {
            phase: SessionPhase::GeneratingCandidates,
            history: Some(history),
            selection: None,
            last_active: Instant::now(),
        }
    }

    /// Session rebuilt from an imported history
    #[must_use]
    pub fn resume(history: StepHistory) -> Self {
        Self {
            phase: SessionPhase::GeneratingCandidates,
            history: Some(history),
            selection: None,
            last_active: Instant::now(),
        }
    }

    /// Current phase
    #[inline]
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Move to another phase
    ///
    /// # Errors
    ///
    /// [`PhaseError::IllegalTransition`] when the move is not allowed.
    pub fn transition(&mut self, to: SessionPhase) -> Result<(), PhaseError> {
        validate_transition(self.phase, to)?;
        debug!(from = %self.phase, to = %to, "session phase change");
        self.phase = to;
        Ok(())
    }

    /// Land in `to` after the history was rolled back
    ///
    /// The only way out of [`SessionPhase::Solved`].
    ///
    /// # Errors
    ///
    /// [`PhaseError::IllegalTransition`] when `to` is not a rollback target.
    pub fn roll_back(&mut self, to: SessionPhase) -> Result<(), PhaseError> {
        validate_rollback(self.phase, to)?;
        debug!(from = %self.phase, to = %to, "session rolled back");
        self.phase = to;
        Ok(())
    }

    /// History of the current task
    #[inline]
    #[must_use]
    pub fn history(&self) -> Option<&StepHistory> {
        self.history.as_ref()
    }

    /// Mutable history of the current task
    #[inline]
    pub fn history_mut(&mut self) -> Option<&mut StepHistory> {
        self.history.as_mut()
    }

    /// Current selection
    #[inline]
    #[must_use]
    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    /// Mutable selection
    #[inline]
    pub fn selection_mut(&mut self) -> Option<&mut Selection> {
        self.selection.as_mut()
    }

    /// Replace the selection
    pub fn set_selection(&mut self, selection: Option<Selection>) -> Option<Selection> {
        std::mem::replace(&mut self.selection, selection)
    }

    /// Mark the session as used now
    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    /// Time since the last [`Session::touch`]
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }
}

/// Concurrent map of sessions keyed by user
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<UserId, SessionHandle>,
}

impl SessionStore {
    /// Create an empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session for a task, replacing any existing one
    ///
    /// Returns the new handle and the replaced one, if any.
    pub fn create(
        &self,
        user: UserId,
        task: impl Into<String>,
    ) -> (SessionHandle, Option<SessionHandle>) {
        self.install(user, Session::start(task))
    }

    /// Install a prepared session, replacing any existing one
    pub fn install(
        &self,
        user: UserId,
        session: Session,
    ) -> (SessionHandle, Option<SessionHandle>) {
        let handle = Arc::new(Mutex::new(session));
        let previous = self.sessions.insert(user, Arc::clone(&handle));
        info!(user = %user, replaced = previous.is_some(), "session created");
        (handle, previous)
    }

    /// Session of a user
    #[must_use]
    pub fn get(&self, user: UserId) -> Option<SessionHandle> {
        self.sessions.get(&user).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop the user's session and start an empty one
    ///
    /// Returns the dropped handle, if any.
    pub fn reset(&self, user: UserId) -> Option<SessionHandle> {
        let previous = self
            .sessions
            .insert(user, Arc::new(Mutex::new(Session::new())));
        debug!(user = %user, "session reset");
        previous
    }

    /// Remove the user's session
    pub fn evict(&self, user: UserId) -> Option<SessionHandle> {
        self.sessions.remove(&user).map(|(_, handle)| handle)
    }

    /// Remove sessions idle for at least `max_idle`
    ///
    /// Sessions with an operation in flight are skipped.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        self.evict_idle_with(max_idle, |_, _| {})
    }

    /// Like [`SessionStore::evict_idle`], calling `on_evict` for each
    /// evicted session before it is dropped
    pub fn evict_idle_with<F>(&self, max_idle: Duration, mut on_evict: F) -> usize
    where
        F: FnMut(UserId, &Session),
    {
        let mut evicted = 0;
        self.sessions.retain(|user, handle| {
            let Ok(session) = handle.try_lock() else {
                return true;
            };
            if session.idle_for() < max_idle {
                return true;
            }
            on_evict(*user, &session);
            evicted += 1;
            false
        });
        if evicted > 0 {
            info!(evicted, "evicted idle sessions");
        }
        evicted
    }

    /// Number of sessions
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_creates_initial_step() {
        let session = Session::start("x + 1 = 2");
        assert_eq!(session.phase(), SessionPhase::GeneratingCandidates);
        let history = session.history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history.current_expression(), "x + 1 = 2");
    }

    #[test]
    fn transitions_are_validated() {
        let mut session = Session::new();
        assert!(session.transition(SessionPhase::Applying).is_err());
        assert_eq!(session.phase(), SessionPhase::AwaitingTask);
        session.transition(SessionPhase::GeneratingCandidates).unwrap();
        session.transition(SessionPhase::Solved).unwrap();
        assert!(session.transition(SessionPhase::GeneratingCandidates).is_err());

        assert!(session.roll_back(SessionPhase::Applying).is_err());
        session.roll_back(SessionPhase::AwaitingSelection).unwrap();
        assert_eq!(session.phase(), SessionPhase::AwaitingSelection);
    }

    #[tokio::test]
    async fn create_replaces_previous() {
        let store = SessionStore::new();
        let user = UserId(7);
        let (_, previous) = store.create(user, "a");
        assert!(previous.is_none());
        let (current, previous) = store.create(user, "b");
        assert!(previous.is_some());
        assert_eq!(store.len(), 1);

        let session = current.lock().await;
        assert_eq!(session.history().unwrap().original_task(), "b");
    }

    #[tokio::test]
    async fn reset_leaves_empty_session() {
        let store = SessionStore::new();
        store.create(UserId(1), "task");
        assert!(store.reset(UserId(1)).is_some());
        let handle = store.get(UserId(1)).unwrap();
        let session = handle.lock().await;
        assert_eq!(session.phase(), SessionPhase::AwaitingTask);
        assert!(session.history().is_none());
    }

    #[tokio::test]
    async fn users_do_not_contend() {
        let store = SessionStore::new();
        let (a, _) = store.create(UserId(1), "a");
        let (b, _) = store.create(UserId(2), "b");
        let _held = a.lock().await;
        assert!(b.try_lock().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn evict_idle_skips_recent_and_busy_sessions() {
        let store = SessionStore::new();
        store.create(UserId(1), "idle");
        let (busy, _) = store.create(UserId(2), "busy");

        tokio::time::advance(Duration::from_secs(120)).await;
        store.create(UserId(3), "fresh");

        let _guard = busy.lock().await;
        let mut seen = Vec::new();
        let evicted = store.evict_idle_with(Duration::from_secs(60), |user, _| seen.push(user));

        assert_eq!(evicted, 1);
        assert_eq!(seen, vec![UserId(1)]);
        assert!(store.get(UserId(1)).is_none());
        assert!(store.get(UserId(2)).is_some());
        assert!(store.get(UserId(3)).is_some());
    }

    #[test]
    fn pending_parameters_track_supplied_values() {
        let mut candidate = Candidate::custom("add {a} and {b}");
        candidate.parameter_definitions = Some(
            ["a", "b"]
                .into_iter()
                .map(|name| {
                    serde_json::from_value(serde_json::json!({
                        "name": name, "prompt": "?", "param_type": "number"
                    }))
                    .unwrap()
                })
                .collect(),
        );
        let mut selection = Selection::new(None, candidate);
        assert_eq!(selection.pending_parameters(), vec!["a", "b"]);
        selection.supplied.insert("a".into(), "1".into());
        assert_eq!(selection.pending_parameters(), vec!["b"]);
    }
}

//! Candidate registry
//!
//! Hands out short opaque ids for generated candidates and resolves them
//! back. Shared by every session in the process:
//! - `register` allocates fresh ids and replaces the step's previous offer
//! - `resolve` treats unknown ids as a normal outcome
//! - nothing is persisted

use crate::types::{Candidate, CandidateId, StepId};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Concurrent id → candidate map with step associations
#[derive(Debug, Default)]
pub struct CandidateRegistry {
    candidates: DashMap<CandidateId, Arc<Candidate>>,
    by_step: DashMap<StepId, Vec<CandidateId>>,
}

impl CandidateRegistry {
    /// Create an empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register candidates for a step, returning their ids in input order
    ///
    /// Replaces the step's previous association; candidates from the replaced
    /// association are dropped and resolve as unknown afterwards.
    pub fn register(&self, step: StepId, candidates: Vec<Candidate>) -> Vec<CandidateId> {
        let ids: Vec<CandidateId> = candidates
            .into_iter()
            .map(|candidate| {
                let id = CandidateId::new();
                self.candidates.insert(id, Arc::new(candidate));
                id
            })
            .collect();

        if let Some(previous) = self.by_step.insert(step, ids.clone()) {
            for id in previous {
                self.candidates.remove(&id);
            }
        }

        debug!(step = %step, count = ids.len(), "registered candidates");
        ids
    }

    /// Resolve an id, `None` when never issued or already dropped
    #[must_use]
    pub fn resolve(&self, id: &CandidateId) -> Option<Arc<Candidate>> {
        self.candidates.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Resolve an id given as text, `None` when malformed or unknown
    #[must_use]
    pub fn resolve_str(&self, id: &str) -> Option<(CandidateId, Arc<Candidate>)> {
        let id: CandidateId = id.parse().ok()?;
        self.resolve(&id).map(|candidate| (id, candidate))
    }

    /// Ids registered for a step, empty when unknown
    #[must_use]
    pub fn ids_for_step(&self, step: &StepId) -> Vec<CandidateId> {
        self.by_step
            .get(step)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Candidates registered for a step in registration order
    #[must_use]
    pub fn candidates_for_step(&self, step: &StepId) -> Vec<(CandidateId, Arc<Candidate>)> {
        self.ids_for_step(step)
            .into_iter()
            .filter_map(|id| self.resolve(&id).map(|candidate| (id, candidate)))
            .collect()
    }

    /// Drop a step's association and its candidates
    pub fn forget_step(&self, step: &StepId) -> usize {
        match self.by_step.remove(step) {
            Some((_, ids)) => {
                for id in &ids {
                    self.candidates.remove(id);
                }
                ids.len()
            }
            None => 0,
        }
    }

    /// Number of live candidates
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Whether no candidates are registered
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

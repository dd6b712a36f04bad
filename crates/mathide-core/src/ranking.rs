//! Candidate ranking and offer selection
//!
//! Candidates are ordered by their usefulness tag (`good`, then `neutral`,
//! then everything else), cut to the offer limit, and the retained subset
//! is shuffled so that the list position carries no ranking signal.

use mathide_session::Candidate;
use rand::seq::SliceRandom;
use rand::Rng;

/// Stable sort by usefulness, keeping at most `limit`
#[must_use]
pub fn rank_candidates(mut candidates: Vec<Candidate>, limit: usize) -> Vec<Candidate> {
    // sort_by_key is stable: equal ranks keep input order
    candidates.sort_by_key(|c| c.usefulness().rank());
    candidates.truncate(limit);
    candidates
}

/// Rank, cut and shuffle with the given generator
#[must_use]
pub fn select_offers_with<R: Rng + ?Sized>(
    candidates: Vec<Candidate>,
    limit: usize,
    rng: &mut R,
) -> Vec<Candidate> {
    let mut offers = rank_candidates(candidates, limit);
    offers.shuffle(rng);
    offers
}

/// Rank, cut and shuffle with the thread-local generator
#[must_use]
pub fn select_offers(candidates: Vec<Candidate>, limit: usize) -> Vec<Candidate> {
    select_offers_with(candidates, limit, &mut rand::rng())
}

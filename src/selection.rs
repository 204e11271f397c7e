//! Winning-bid selection over the collected candidate table.

use crate::model::RideBid;
use std::collections::HashMap;

/// A schema-valid, authenticated bid as collected during the window,
/// together with its originating envelope and bidder identity.
#[derive(Debug, Clone)]
pub struct BidCandidate {
    pub bid: RideBid,
    pub envelope_id: String,
    pub driver_pubkey: String,
}

/// Candidate table keyed by bid id. A duplicate bid id overwrites the
/// earlier entry rather than producing two candidates.
pub type CandidateTable = HashMap<String, BidCandidate>;

/// Total order: ascending total price, ties broken by ascending ETA, then
/// bid id so equal offers still rank deterministically. Returns the
/// minimum, or `None` when the window closed empty.
pub fn select_winner(candidates: &CandidateTable) -> Option<&BidCandidate> {
    candidates.values().min_by(|a, b| {
        a.bid
            .total_sats
            .cmp(&b.bid.total_sats)
            .then(a.bid.eta_mins.cmp(&b.bid.eta_mins))
            .then_with(|| a.bid.bid_id.cmp(&b.bid.bid_id))
    })
}

// src/vote.rs
//! Casting, retracting and tallying votes.
//!
//! Every call re-reads the store; nothing is cached between requests. The
//! decision for a cast is made against a snapshot of the voter's current
//! votes and committed as a compare-and-swap, so two racing casts by the
//! same voter cannot both land.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{PollError, StoreError};
use crate::models::{
    OptionResult, Poll, PollResults, PollStatus, VoteOutcome, VoteReceipt,
};
use crate::store::{PollSnapshot, PollStore, VoteMutation};

/// Re-reads allowed when a cast loses a race with another cast by the same voter.
const MAX_VOTE_ATTEMPTS: usize = 3;

/// What a cast should do to the voter's rows, given their current votes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum VotePlan {
    /// Same option resubmitted: retract it.
    Retract,
    /// Insert, first dropping `replaced` (single-select only).
    Cast { replaced: Vec<Uuid> },
}

/// Toggle-off wins over replace; replace only applies to single-select polls.
pub(crate) fn plan_vote(poll: &Poll, held: &BTreeSet<Uuid>, option_id: Uuid) -> VotePlan {
    if held.contains(&option_id) {
        return VotePlan::Retract;
    }
    let replaced = if poll.allow_multiple {
        Vec::new()
    } else {
        held.iter().copied().collect()
    };
    VotePlan::Cast { replaced }
}

/// Nearest-integer share of `total`, 0 when nothing has been cast.
pub(crate) fn percentage(votes: u64, total: u64) -> u32 {
    if total == 0 {
        return 0;
    }
    ((votes * 200 + total) / (total * 2)) as u32
}

pub struct VoteEngine {
    store: Arc<dyn PollStore>,
}

impl VoteEngine {
    pub fn new(store: Arc<dyn PollStore>) -> Self {
        Self { store }
    }

    /// Cast a vote for `option_id`, or retract it if the voter already holds it.
    pub async fn cast_or_retract(
        &self,
        poll_id: Uuid,
        user_id: &str,
        option_id: Uuid,
    ) -> Result<VoteReceipt, PollError> {
        for attempt in 1..=MAX_VOTE_ATTEMPTS {
            let snapshot = self
                .store
                .load_poll(poll_id, Some(user_id))
                .await?
                .ok_or(PollError::NotFound)?;
            let label = check_votable(&snapshot, option_id)?;
            let held = snapshot.voter_options();
            let plan = plan_vote(&snapshot.poll, &held, option_id);

            let (mutation, outcome) = match &plan {
                VotePlan::Retract => (
                    VoteMutation {
                        poll_id,
                        user_id: user_id.to_string(),
                        expected: held.clone(),
                        remove: vec![option_id],
                        insert: None,
                    },
                    VoteOutcome::Removed,
                ),
                VotePlan::Cast { replaced } => (
                    VoteMutation {
                        poll_id,
                        user_id: user_id.to_string(),
                        expected: held.clone(),
                        remove: replaced.clone(),
                        insert: Some(option_id),
                    },
                    VoteOutcome::Added,
                ),
            };

            match self.store.apply_vote(&mutation).await {
                Ok(()) => {
                    info!(
                        %poll_id,
                        %user_id,
                        %option_id,
                        outcome = ?outcome,
                        replaced = mutation.remove.len(),
                        "vote applied"
                    );
                    return Ok(VoteReceipt {
                        outcome,
                        option_id,
                        label,
                    });
                }
                Err(StoreError::Duplicate) => {
                    debug!(%poll_id, %user_id, %option_id, "duplicate vote submission");
                    return Err(PollError::AlreadyVoted);
                }
                Err(StoreError::Conflict) => {
                    if outcome == VoteOutcome::Added
                        && self.voter_holds(poll_id, user_id, option_id).await?
                    {
                        // A concurrent submission of the same vote got there first.
                        return Err(PollError::AlreadyVoted);
                    }
                    debug!(%poll_id, %user_id, attempt, "vote raced another write, re-reading");
                }
                Err(other) => return Err(other.into()),
            }
        }

        warn!(%poll_id, %user_id, "vote kept conflicting, giving up");
        Err(PollError::TransientIo)
    }

    async fn voter_holds(
        &self,
        poll_id: Uuid,
        user_id: &str,
        option_id: Uuid,
    ) -> Result<bool, PollError> {
        Ok(self
            .store
            .load_poll(poll_id, Some(user_id))
            .await?
            .is_some_and(|s| s.voter_votes.iter().any(|v| v.option_id == option_id)))
    }

    /// Per-option counts in position order.
    pub async fn compute_results(&self, poll_id: Uuid) -> Result<PollResults, PollError> {
        let snapshot = self
            .store
            .load_poll(poll_id, None)
            .await?
            .ok_or(PollError::NotFound)?;
        let poll = snapshot.poll;

        let tallies: HashMap<Uuid, _> = self
            .store
            .tally(poll_id)
            .await?
            .into_iter()
            .map(|t| (t.option_id, t))
            .collect();
        let unique_voters = self.store.unique_voters(poll_id).await?;

        let total_votes: u64 = poll
            .options
            .iter()
            .filter_map(|o| tallies.get(&o.id))
            .map(|t| t.votes)
            .sum();

        let options = poll
            .options
            .iter()
            .map(|option| {
                let (votes, voters) = match tallies.get(&option.id) {
                    Some(t) => (t.votes, t.voters.clone()),
                    None => (0, Vec::new()),
                };
                OptionResult {
                    option_id: option.id,
                    position: option.position,
                    marker: option.marker.clone(),
                    label: option.label.clone(),
                    votes,
                    percentage: percentage(votes, total_votes),
                    voters: (!poll.is_anonymous).then_some(voters),
                }
            })
            .collect();

        Ok(PollResults {
            poll_id,
            title: poll.title,
            status: poll.status,
            expires_at: poll.expires_at,
            total_votes,
            unique_voters,
            options,
        })
    }

    /// Options currently held by `user_id`.
    pub async fn list_user_votes(
        &self,
        poll_id: Uuid,
        user_id: &str,
    ) -> Result<BTreeSet<Uuid>, PollError> {
        let snapshot = self
            .store
            .load_poll(poll_id, Some(user_id))
            .await?
            .ok_or(PollError::NotFound)?;
        Ok(snapshot.voter_options())
    }
}

/// Rejects votes on closed or expired polls and foreign options; returns the label.
fn check_votable(snapshot: &PollSnapshot, option_id: Uuid) -> Result<String, PollError> {
    let poll = &snapshot.poll;
    if poll.status == PollStatus::Closed {
        return Err(PollError::PollClosed);
    }
    if poll.is_expired_at(Utc::now()) {
        return Err(PollError::PollExpired);
    }
    poll.option(option_id)
        .map(|o| o.label.clone())
        .ok_or(PollError::InvalidOption)
}

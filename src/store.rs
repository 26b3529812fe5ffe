// store.rs
//! The storage contract the vote engine and lifecycle controller rely on.
//!
//! Implementations must make `apply_vote` and `close_poll` atomic with respect
//! to other processes sharing the same backend; in-process locking alone is
//! not enough when a bot front end and a background worker run side by side.

use std::collections::BTreeSet;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Poll, PollDraft, Vote};

/// A poll together with the votes of one voter.
#[derive(Debug, Clone)]
pub struct PollSnapshot {
    pub poll: Poll,
    pub voter_votes: Vec<Vote>,
}

impl PollSnapshot {
    pub fn voter_options(&self) -> BTreeSet<Uuid> {
        self.voter_votes.iter().map(|v| v.option_id).collect()
    }
}

/// A compare-and-swap change to one voter's votes on one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteMutation {
    pub poll_id: Uuid,
    pub user_id: String,
    /// The option set the decision was made against.
    pub expected: BTreeSet<Uuid>,
    pub remove: Vec<Uuid>,
    pub insert: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionTally {
    pub option_id: Uuid,
    pub votes: u64,
    pub voters: Vec<String>,
}

#[async_trait]
pub trait PollStore: Send + Sync {
    /// Persist a poll and its options in one unit.
    async fn insert_poll(&self, draft: PollDraft) -> Result<Poll, StoreError>;

    /// Load a poll with its options, plus the votes held by `voter` if given.
    async fn load_poll(
        &self,
        poll_id: Uuid,
        voter: Option<&str>,
    ) -> Result<Option<PollSnapshot>, StoreError>;

    /// Apply a vote mutation atomically.
    ///
    /// Fails with `PollMissing`, `PollClosed` or `PollExpired` if the poll is
    /// no longer votable at write time, with `Conflict` if the voter's current
    /// option set differs from `mutation.expected`, and with `Duplicate` if the
    /// insert trips the (poll, user, option) uniqueness constraint. Nothing is
    /// written on error. A concurrent close waits for the write or wins before it.
    async fn apply_vote(&self, mutation: &VoteMutation) -> Result<(), StoreError>;

    /// OPEN -> CLOSED. Returns `false` if the poll is missing or not open.
    async fn close_poll(&self, poll_id: Uuid) -> Result<bool, StoreError>;

    /// Per-option vote counts and voter ids. Options without votes may be absent.
    async fn tally(&self, poll_id: Uuid) -> Result<Vec<OptionTally>, StoreError>;

    async fn unique_voters(&self, poll_id: Uuid) -> Result<u64, StoreError>;

    /// Returns `false` if the poll does not exist.
    async fn set_message_ref(&self, poll_id: Uuid, message_ref: &str)
        -> Result<bool, StoreError>;
}

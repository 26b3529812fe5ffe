// testing.rs
//! A `PollStore` wrapper that injects one failure, for exercising the paths
//! the in-memory store never takes on its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::memory::MemoryPollStore;
use crate::models::{Poll, PollDraft};
use crate::store::{OptionTally, PollSnapshot, PollStore, VoteMutation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Another caller closes the poll right after the first read.
    CloseAfterLoad,
    /// The first write trips the uniqueness constraint.
    DuplicateOnApply,
    /// Another submission of the same mutation commits first; ours conflicts.
    RacedByTwin,
    /// Every tally call fails.
    TallyUnavailable,
}

pub struct FaultyStore {
    pub inner: Arc<MemoryPollStore>,
    fault: Fault,
    fired: AtomicBool,
}

impl FaultyStore {
    pub fn new(fault: Fault) -> Self {
        Self {
            inner: Arc::new(MemoryPollStore::new()),
            fault,
            fired: AtomicBool::new(false),
        }
    }

    fn fire_once(&self, fault: Fault) -> bool {
        self.fault == fault && !self.fired.swap(true, Ordering::SeqCst)
    }
}

#[async_trait]
impl PollStore for FaultyStore {
    async fn insert_poll(&self, draft: PollDraft) -> Result<Poll, StoreError> {
        self.inner.insert_poll(draft).await
    }

    async fn load_poll(
        &self,
        poll_id: Uuid,
        voter: Option<&str>,
    ) -> Result<Option<PollSnapshot>, StoreError> {
        let snapshot = self.inner.load_poll(poll_id, voter).await?;
        if self.fire_once(Fault::CloseAfterLoad) {
            self.inner.close_poll(poll_id).await?;
        }
        Ok(snapshot)
    }

    async fn apply_vote(&self, mutation: &VoteMutation) -> Result<(), StoreError> {
        if self.fire_once(Fault::DuplicateOnApply) {
            return Err(StoreError::Duplicate);
        }
        if self.fire_once(Fault::RacedByTwin) {
            self.inner.apply_vote(mutation).await?;
            return Err(StoreError::Conflict);
        }
        self.inner.apply_vote(mutation).await
    }

    async fn close_poll(&self, poll_id: Uuid) -> Result<bool, StoreError> {
        self.inner.close_poll(poll_id).await
    }

    async fn tally(&self, poll_id: Uuid) -> Result<Vec<OptionTally>, StoreError> {
        if self.fault == Fault::TallyUnavailable {
            return Err(StoreError::Unavailable("tally timed out".into()));
        }
        self.inner.tally(poll_id).await
    }

    async fn unique_voters(&self, poll_id: Uuid) -> Result<u64, StoreError> {
        self.inner.unique_voters(poll_id).await
    }

    async fn set_message_ref(
        &self,
        poll_id: Uuid,
        message_ref: &str,
    ) -> Result<bool, StoreError> {
        self.inner.set_message_ref(poll_id, message_ref).await
    }
}

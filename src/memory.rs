// memory.rs
//! In-process `PollStore` for development and tests.
//!
//! A single mutex guards all tables, so every trait call is atomic. It offers
//! no durability and no cross-process safety.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Poll, PollDraft, PollStatus, Vote};
use crate::store::{OptionTally, PollSnapshot, PollStore, VoteMutation};

#[derive(Default)]
struct Tables {
    polls: HashMap<Uuid, Poll>,
    // Keyed by (poll, user, option): the uniqueness constraint.
    votes: BTreeMap<(Uuid, String, Uuid), Vote>,
}

impl Tables {
    fn voter_options(&self, poll_id: Uuid, user_id: &str) -> BTreeSet<Uuid> {
        self.votes
            .values()
            .filter(|v| v.poll_id == poll_id && v.user_id == user_id)
            .map(|v| v.option_id)
            .collect()
    }
}

#[derive(Default)]
pub struct MemoryPollStore {
    tables: Mutex<Tables>,
}

impl MemoryPollStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    /// Number of vote rows a voter holds on a poll.
    pub fn vote_count(&self, poll_id: Uuid, user_id: &str) -> usize {
        self.lock()
            .map(|t| t.voter_options(poll_id, user_id).len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl PollStore for MemoryPollStore {
    async fn insert_poll(&self, draft: PollDraft) -> Result<Poll, StoreError> {
        let mut options = draft.options;
        options.sort_by_key(|o| o.position);
        let poll = Poll {
            id: draft.id,
            title: draft.title,
            description: draft.description,
            scope: draft.scope,
            creator_id: draft.creator_id,
            allow_multiple: draft.allow_multiple,
            is_anonymous: draft.is_anonymous,
            status: PollStatus::Open,
            expires_at: draft.expires_at,
            created_at: draft.created_at,
            message_ref: None,
            options,
        };
        let mut tables = self.lock()?;
        if tables.polls.contains_key(&poll.id) {
            return Err(StoreError::Duplicate);
        }
        tables.polls.insert(poll.id, poll.clone());
        Ok(poll)
    }

    async fn load_poll(
        &self,
        poll_id: Uuid,
        voter: Option<&str>,
    ) -> Result<Option<PollSnapshot>, StoreError> {
        let tables = self.lock()?;
        let Some(poll) = tables.polls.get(&poll_id) else {
            return Ok(None);
        };
        let voter_votes = match voter {
            Some(user_id) => tables
                .votes
                .values()
                .filter(|v| v.poll_id == poll_id && v.user_id == user_id)
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        Ok(Some(PollSnapshot {
            poll: poll.clone(),
            voter_votes,
        }))
    }

    async fn apply_vote(&self, mutation: &VoteMutation) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        match tables.polls.get(&mutation.poll_id) {
            None => return Err(StoreError::PollMissing),
            Some(poll) if poll.status == PollStatus::Closed => {
                return Err(StoreError::PollClosed)
            }
            Some(poll) if poll.is_expired_at(Utc::now()) => return Err(StoreError::PollExpired),
            Some(_) => {}
        }
        if tables.voter_options(mutation.poll_id, &mutation.user_id) != mutation.expected {
            return Err(StoreError::Conflict);
        }
        if let Some(option_id) = mutation.insert {
            let key = (mutation.poll_id, mutation.user_id.clone(), option_id);
            if tables.votes.contains_key(&key) && !mutation.remove.contains(&option_id) {
                return Err(StoreError::Duplicate);
            }
        }
        for option_id in &mutation.remove {
            tables
                .votes
                .remove(&(mutation.poll_id, mutation.user_id.clone(), *option_id));
        }
        if let Some(option_id) = mutation.insert {
            let vote = Vote {
                id: Uuid::new_v4(),
                poll_id: mutation.poll_id,
                user_id: mutation.user_id.clone(),
                option_id,
                created_at: Utc::now(),
            };
            tables
                .votes
                .insert((mutation.poll_id, mutation.user_id.clone(), option_id), vote);
        }
        Ok(())
    }

    async fn close_poll(&self, poll_id: Uuid) -> Result<bool, StoreError> {
        let mut tables = self.lock()?;
        match tables.polls.get_mut(&poll_id) {
            Some(poll) if poll.status == PollStatus::Open => {
                poll.status = PollStatus::Closed;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn tally(&self, poll_id: Uuid) -> Result<Vec<OptionTally>, StoreError> {
        let tables = self.lock()?;
        let mut by_option: BTreeMap<Uuid, OptionTally> = BTreeMap::new();
        for vote in tables.votes.values().filter(|v| v.poll_id == poll_id) {
            let entry = by_option.entry(vote.option_id).or_insert_with(|| OptionTally {
                option_id: vote.option_id,
                votes: 0,
                voters: Vec::new(),
            });
            entry.votes += 1;
            entry.voters.push(vote.user_id.clone());
        }
        Ok(by_option.into_values().collect())
    }

    async fn unique_voters(&self, poll_id: Uuid) -> Result<u64, StoreError> {
        let tables = self.lock()?;
        let voters: BTreeSet<&str> = tables
            .votes
            .values()
            .filter(|v| v.poll_id == poll_id)
            .map(|v| v.user_id.as_str())
            .collect();
        Ok(voters.len() as u64)
    }

    async fn set_message_ref(
        &self,
        poll_id: Uuid,
        message_ref: &str,
    ) -> Result<bool, StoreError> {
        let mut tables = self.lock()?;
        match tables.polls.get_mut(&poll_id) {
            Some(poll) => {
                poll.message_ref = Some(message_ref.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PollOption, PollScope};

    fn draft() -> PollDraft {
        let id = Uuid::new_v4();
        PollDraft {
            id,
            title: "Lunch".into(),
            description: None,
            scope: PollScope {
                guild_id: "g".into(),
                channel_id: "c".into(),
            },
            creator_id: "alice".into(),
            allow_multiple: false,
            is_anonymous: false,
            expires_at: None,
            created_at: Utc::now(),
            options: ["Pizza", "Sushi"]
                .iter()
                .enumerate()
                .map(|(i, label)| PollOption {
                    id: Uuid::new_v4(),
                    poll_id: id,
                    label: label.to_string(),
                    marker: i.to_string(),
                    position: i as i32,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn stale_expectation_is_a_conflict() {
        let store = MemoryPollStore::new();
        let poll = store.insert_poll(draft()).await.unwrap();
        let pizza = poll.options[0].id;
        let first = VoteMutation {
            poll_id: poll.id,
            user_id: "bob".into(),
            expected: BTreeSet::new(),
            remove: Vec::new(),
            insert: Some(pizza),
        };
        store.apply_vote(&first).await.unwrap();

        let stale = VoteMutation {
            insert: Some(poll.options[1].id),
            ..first.clone()
        };
        assert!(matches!(
            store.apply_vote(&stale).await,
            Err(StoreError::Conflict)
        ));
        assert_eq!(store.vote_count(poll.id, "bob"), 1);
    }

    #[tokio::test]
    async fn writes_to_a_closed_poll_are_refused() {
        let store = MemoryPollStore::new();
        let poll = store.insert_poll(draft()).await.unwrap();
        store.close_poll(poll.id).await.unwrap();
        let mutation = VoteMutation {
            poll_id: poll.id,
            user_id: "bob".into(),
            expected: BTreeSet::new(),
            remove: Vec::new(),
            insert: Some(poll.options[0].id),
        };
        assert!(matches!(
            store.apply_vote(&mutation).await,
            Err(StoreError::PollClosed)
        ));
        assert_eq!(store.vote_count(poll.id, "bob"), 0);

        let missing = VoteMutation {
            poll_id: Uuid::new_v4(),
            ..mutation
        };
        assert!(matches!(
            store.apply_vote(&missing).await,
            Err(StoreError::PollMissing)
        ));
    }

    #[tokio::test]
    async fn close_is_a_one_way_conditional_transition() {
        let store = MemoryPollStore::new();
        let poll = store.insert_poll(draft()).await.unwrap();
        assert!(store.close_poll(poll.id).await.unwrap());
        assert!(!store.close_poll(poll.id).await.unwrap());
        assert!(!store.close_poll(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn tally_groups_by_option() {
        let store = MemoryPollStore::new();
        let poll = store.insert_poll(draft()).await.unwrap();
        for user in ["bob", "carol"] {
            store
                .apply_vote(&VoteMutation {
                    poll_id: poll.id,
                    user_id: user.into(),
                    expected: BTreeSet::new(),
                    remove: Vec::new(),
                    insert: Some(poll.options[1].id),
                })
                .await
                .unwrap();
        }
        let tally = store.tally(poll.id).await.unwrap();
        assert_eq!(tally.len(), 1);
        assert_eq!(tally[0].votes, 2);
        assert_eq!(store.unique_voters(poll.id).await.unwrap(), 2);
    }
}

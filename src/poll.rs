// src/poll.rs
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::PollError;
use crate::models::{
    ClosedPoll, CreatePollRequest, Poll, PollDraft, PollOption, PollScope, PollStatus,
    DEFAULT_MARKERS, MAX_OPTIONS, MIN_OPTIONS,
};
use crate::notify::PollNotifier;
use crate::scheduler::{ClosureHandler, ClosureScheduler};
use crate::store::PollStore;
use crate::vote::VoteEngine;

const MAX_TITLE_LEN: usize = 256;
const MAX_LABEL_LEN: usize = 100;
const MAX_DURATION_MINUTES: i64 = 30 * 24 * 60;

/// Result of a scheduled closure delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureOutcome {
    Closed,
    AlreadyClosed,
    /// The poll was deleted out of band.
    Missing,
}

/// Validate a creation request and lay out ids, positions and markers.
pub fn build_draft(req: CreatePollRequest, now: DateTime<Utc>) -> Result<PollDraft, PollError> {
    let title = req.title.trim().to_string();
    if title.is_empty() {
        return Err(PollError::Invalid("title must not be empty".into()));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(PollError::Invalid(format!(
            "title is longer than {MAX_TITLE_LEN} characters"
        )));
    }
    if !(MIN_OPTIONS..=MAX_OPTIONS).contains(&req.options.len()) {
        return Err(PollError::Invalid(format!(
            "a poll needs between {MIN_OPTIONS} and {MAX_OPTIONS} options, got {}",
            req.options.len()
        )));
    }
    if req.creator_id.trim().is_empty() {
        return Err(PollError::Invalid("creator is required".into()));
    }

    let expires_at = match req.duration_minutes {
        None => None,
        Some(minutes) if minutes <= 0 => {
            return Err(PollError::Invalid("duration must be positive".into()))
        }
        Some(minutes) if minutes > MAX_DURATION_MINUTES => {
            return Err(PollError::Invalid("duration may not exceed 30 days".into()))
        }
        Some(minutes) => Some(now + Duration::minutes(minutes)),
    };

    let poll_id = Uuid::new_v4();
    let mut options = Vec::with_capacity(req.options.len());
    for (position, input) in req.options.into_iter().enumerate() {
        let label = input.label.trim().to_string();
        if label.is_empty() {
            return Err(PollError::Invalid(format!(
                "option {} has an empty label",
                position + 1
            )));
        }
        if label.chars().count() > MAX_LABEL_LEN {
            return Err(PollError::Invalid(format!(
                "option {} is longer than {MAX_LABEL_LEN} characters",
                position + 1
            )));
        }
        let marker = input
            .marker
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MARKERS[position].to_string());
        options.push(PollOption {
            id: Uuid::new_v4(),
            poll_id,
            label,
            marker,
            position: position as i32,
        });
    }

    let description = req
        .description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty());

    Ok(PollDraft {
        id: poll_id,
        title,
        description,
        scope: PollScope {
            guild_id: req.guild_id,
            channel_id: req.channel_id,
        },
        creator_id: req.creator_id,
        allow_multiple: req.allow_multiple,
        is_anonymous: req.is_anonymous,
        expires_at,
        created_at: now,
        options,
    })
}

/// Owns the OPEN -> CLOSED transition.
pub struct PollLifecycle {
    store: Arc<dyn PollStore>,
    engine: Arc<VoteEngine>,
    scheduler: Arc<ClosureScheduler>,
    notifier: Arc<dyn PollNotifier>,
}

impl PollLifecycle {
    pub fn new(
        store: Arc<dyn PollStore>,
        engine: Arc<VoteEngine>,
        scheduler: Arc<ClosureScheduler>,
        notifier: Arc<dyn PollNotifier>,
    ) -> Self {
        Self {
            store,
            engine,
            scheduler,
            notifier,
        }
    }

    pub async fn create_poll(&self, req: CreatePollRequest) -> Result<Poll, PollError> {
        let draft = build_draft(req, Utc::now())?;
        let poll = self.store.insert_poll(draft).await?;
        info!(
            poll_id = %poll.id,
            creator_id = %poll.creator_id,
            options = poll.options.len(),
            expires_at = ?poll.expires_at,
            "poll created"
        );

        if let Some(fire_at) = poll.expires_at {
            if let Err(e) = self.scheduler.schedule(poll.id, fire_at).await {
                // Votes are still refused after expiry; only the automatic close is lost.
                error!(poll_id = %poll.id, error = %e, "failed to schedule poll closure");
            }
        }
        Ok(poll)
    }

    pub async fn get_poll(&self, poll_id: Uuid) -> Result<Poll, PollError> {
        self.store
            .load_poll(poll_id, None)
            .await?
            .map(|s| s.poll)
            .ok_or(PollError::NotFound)
    }

    /// Creator-initiated close. Losing a race to another closer is `AlreadyClosed`.
    ///
    /// Once the close is committed the call succeeds; if the final tally
    /// cannot be read, `results` is `None` and the caller fetches it later.
    pub async fn close_poll(
        &self,
        poll_id: Uuid,
        requester_id: &str,
    ) -> Result<ClosedPoll, PollError> {
        let poll = self.get_poll(poll_id).await?;
        if poll.creator_id != requester_id {
            return Err(PollError::Forbidden);
        }
        if poll.status == PollStatus::Closed {
            return Err(PollError::AlreadyClosed);
        }
        if !self.store.close_poll(poll_id).await? {
            return Err(PollError::AlreadyClosed);
        }
        info!(%poll_id, %requester_id, "poll closed by creator");

        if let Err(e) = self.scheduler.cancel(poll_id).await {
            // The job will fire later and find the poll closed.
            warn!(%poll_id, error = %e, "failed to cancel closure job");
        }

        let results = match self.engine.compute_results(poll_id).await {
            Ok(results) => Some(results),
            Err(e) => {
                warn!(%poll_id, error = %e, "poll closed but final results are unavailable");
                None
            }
        };
        Ok(ClosedPoll {
            poll: Poll {
                status: PollStatus::Closed,
                ..poll
            },
            results,
        })
    }

    /// Close a poll whose deadline passed. Safe to run more than once.
    pub async fn evaluate_scheduled_closure(
        &self,
        poll_id: Uuid,
    ) -> Result<ClosureOutcome, PollError> {
        let Some(snapshot) = self.store.load_poll(poll_id, None).await? else {
            info!(%poll_id, "scheduled closure for a deleted poll, skipping");
            return Ok(ClosureOutcome::Missing);
        };
        if snapshot.poll.status == PollStatus::Closed {
            return Ok(ClosureOutcome::AlreadyClosed);
        }
        if !self.store.close_poll(poll_id).await? {
            return Ok(ClosureOutcome::AlreadyClosed);
        }
        info!(%poll_id, "poll closed on schedule");

        let poll = Poll {
            status: PollStatus::Closed,
            ..snapshot.poll
        };
        self.announce_closed(&poll).await;
        Ok(ClosureOutcome::Closed)
    }

    async fn announce_closed(&self, poll: &Poll) {
        let results = match self.engine.compute_results(poll.id).await {
            Ok(results) => results,
            Err(e) => {
                warn!(poll_id = %poll.id, error = %e, "could not tally closed poll for announcement");
                return;
            }
        };
        if let Err(e) = self.notifier.poll_closed(poll, &results).await {
            warn!(poll_id = %poll.id, error = %e, "closure announcement failed");
        }
    }

    /// Record where the presentation layer posted the poll.
    pub async fn attach_message(
        &self,
        poll_id: Uuid,
        requester_id: &str,
        message_ref: &str,
    ) -> Result<(), PollError> {
        let poll = self.get_poll(poll_id).await?;
        if poll.creator_id != requester_id {
            return Err(PollError::Forbidden);
        }
        if message_ref.trim().is_empty() {
            return Err(PollError::Invalid("message reference must not be empty".into()));
        }
        if !self.store.set_message_ref(poll_id, message_ref.trim()).await? {
            return Err(PollError::NotFound);
        }
        Ok(())
    }
}

#[async_trait]
impl ClosureHandler for PollLifecycle {
    async fn run_closure(&self, poll_id: Uuid) -> Result<(), PollError> {
        self.evaluate_scheduled_closure(poll_id).await.map(|_| ())
    }
}

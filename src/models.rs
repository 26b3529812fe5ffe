// models.rs
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lowest number of options a poll may carry.
pub const MIN_OPTIONS: usize = 2;
/// Highest number of options a poll may carry (one keycap glyph each).
pub const MAX_OPTIONS: usize = 10;

/// Keycap glyphs used as default option markers, indexed by position.
pub const DEFAULT_MARKERS: [&str; MAX_OPTIONS] = [
    "1️⃣", "2️⃣", "3️⃣", "4️⃣", "5️⃣", "6️⃣", "7️⃣", "8️⃣", "9️⃣", "🔟",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollStatus {
    Open,
    Closed,
}

impl PollStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollStatus::Open => "open",
            PollStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for PollStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PollStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PollStatus::Open),
            "closed" => Ok(PollStatus::Closed),
            other => Err(format!("unknown poll status '{other}'")),
        }
    }
}

/// Where a poll lives on the chat platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollScope {
    pub guild_id: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollOption {
    pub id: Uuid,
    pub poll_id: Uuid,
    pub label: String,
    pub marker: String,
    pub position: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Poll {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub scope: PollScope,
    pub creator_id: String,
    pub allow_multiple: bool,
    pub is_anonymous: bool,
    pub status: PollStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub message_ref: Option<String>,
    /// Always sorted by `position`.
    pub options: Vec<PollOption>,
}

impl Poll {
    pub fn option(&self, option_id: Uuid) -> Option<&PollOption> {
        self.options.iter().find(|o| o.id == option_id)
    }

    /// True once `expires_at` has passed, whether or not the closure job ran.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub id: Uuid,
    pub poll_id: Uuid,
    pub user_id: String,
    pub option_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// A fully validated poll ready to be persisted: ids, positions, markers
/// and expiry are already decided.
#[derive(Debug, Clone)]
pub struct PollDraft {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub scope: PollScope,
    pub creator_id: String,
    pub allow_multiple: bool,
    pub is_anonymous: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub options: Vec<PollOption>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptionInput {
    pub label: String,
    #[serde(default)]
    pub marker: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePollRequest {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub guild_id: String,
    pub channel_id: String,
    pub creator_id: String,
    pub options: Vec<OptionInput>,
    #[serde(default)]
    pub allow_multiple: bool,
    #[serde(default)]
    pub is_anonymous: bool,
    /// Minutes until the poll closes by itself.
    #[serde(default)]
    pub duration_minutes: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoteRequest {
    pub user_id: String,
    pub option_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloseRequest {
    pub requester_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachMessageRequest {
    pub requester_id: String,
    pub message_ref: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteOutcome {
    Added,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoteReceipt {
    pub outcome: VoteOutcome,
    pub option_id: Uuid,
    pub label: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptionResult {
    pub option_id: Uuid,
    pub position: i32,
    pub marker: String,
    pub label: String,
    pub votes: u64,
    pub percentage: u32,
    /// Omitted for anonymous polls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voters: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollResults {
    pub poll_id: Uuid,
    pub title: String,
    pub status: PollStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub total_votes: u64,
    pub unique_voters: u64,
    pub options: Vec<OptionResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClosedPoll {
    pub poll: Poll,
    /// `None` when the close committed but the tally could not be read.
    pub results: Option<PollResults>,
}

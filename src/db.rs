// src/db.rs
use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Poll, PollDraft, PollOption, PollScope, PollStatus, Vote};
use crate::store::{OptionTally, PollSnapshot, PollStore, VoteMutation};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS polls (
        id UUID PRIMARY KEY,
        title TEXT NOT NULL,
        description TEXT,
        guild_id TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        creator_id TEXT NOT NULL,
        allow_multiple BOOLEAN NOT NULL DEFAULT FALSE,
        is_anonymous BOOLEAN NOT NULL DEFAULT FALSE,
        status TEXT NOT NULL DEFAULT 'open' CHECK (status IN ('open', 'closed')),
        expires_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        message_ref TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS poll_options (
        id UUID PRIMARY KEY,
        poll_id UUID NOT NULL REFERENCES polls(id) ON DELETE CASCADE,
        label TEXT NOT NULL,
        marker TEXT NOT NULL,
        position INTEGER NOT NULL,
        UNIQUE (poll_id, position)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS votes (
        id UUID PRIMARY KEY,
        poll_id UUID NOT NULL REFERENCES polls(id) ON DELETE CASCADE,
        user_id TEXT NOT NULL,
        option_id UUID NOT NULL REFERENCES poll_options(id) ON DELETE CASCADE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (poll_id, user_id, option_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS votes_poll_user_idx ON votes (poll_id, user_id)",
    r#"
    CREATE TABLE IF NOT EXISTS scheduled_jobs (
        job_key TEXT PRIMARY KEY,
        poll_id UUID NOT NULL,
        run_at TIMESTAMPTZ NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'abandoned')),
        last_error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS scheduled_jobs_due_idx ON scheduled_jobs (status, run_at)",
];

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Create the tables if they do not exist yet.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!("database schema ready");
    Ok(())
}

#[derive(FromRow)]
struct PollRow {
    id: Uuid,
    title: String,
    description: Option<String>,
    guild_id: String,
    channel_id: String,
    creator_id: String,
    allow_multiple: bool,
    is_anonymous: bool,
    status: String,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    message_ref: Option<String>,
}

impl PollRow {
    fn into_poll(self, options: Vec<PollOption>) -> Result<Poll, StoreError> {
        let status = self
            .status
            .parse::<PollStatus>()
            .map_err(StoreError::Corrupt)?;
        Ok(Poll {
            id: self.id,
            title: self.title,
            description: self.description,
            scope: PollScope {
                guild_id: self.guild_id,
                channel_id: self.channel_id,
            },
            creator_id: self.creator_id,
            allow_multiple: self.allow_multiple,
            is_anonymous: self.is_anonymous,
            status,
            expires_at: self.expires_at,
            created_at: self.created_at,
            message_ref: self.message_ref,
            options,
        })
    }
}

#[derive(FromRow)]
struct OptionRow {
    id: Uuid,
    poll_id: Uuid,
    label: String,
    marker: String,
    position: i32,
}

impl From<OptionRow> for PollOption {
    fn from(row: OptionRow) -> Self {
        PollOption {
            id: row.id,
            poll_id: row.poll_id,
            label: row.label,
            marker: row.marker,
            position: row.position,
        }
    }
}

#[derive(FromRow)]
struct VoteRow {
    id: Uuid,
    poll_id: Uuid,
    user_id: String,
    option_id: Uuid,
    created_at: DateTime<Utc>,
}

impl From<VoteRow> for Vote {
    fn from(row: VoteRow) -> Self {
        Vote {
            id: row.id,
            poll_id: row.poll_id,
            user_id: row.user_id,
            option_id: row.option_id,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct TallyRow {
    option_id: Uuid,
    vote_count: i64,
    voters: Vec<String>,
}

/// Postgres-backed `PollStore`.
#[derive(Clone)]
pub struct PgPollStore {
    pool: PgPool,
}

impl PgPollStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Serialises vote mutations for one (poll, user) pair until the
    /// transaction ends, including when the user holds no rows yet.
    async fn lock_voter(
        tx: &mut Transaction<'_, Postgres>,
        poll_id: Uuid,
        user_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("{poll_id}:{user_id}"))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PollStore for PgPollStore {
    async fn insert_poll(&self, draft: PollDraft) -> Result<Poll, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO polls (id, title, description, guild_id, channel_id, creator_id,
                               allow_multiple, is_anonymous, status, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'open', $9, $10)
            "#,
        )
        .bind(draft.id)
        .bind(&draft.title)
        .bind(&draft.description)
        .bind(&draft.scope.guild_id)
        .bind(&draft.scope.channel_id)
        .bind(&draft.creator_id)
        .bind(draft.allow_multiple)
        .bind(draft.is_anonymous)
        .bind(draft.expires_at)
        .bind(draft.created_at)
        .execute(&mut *tx)
        .await?;

        for option in &draft.options {
            sqlx::query(
                "INSERT INTO poll_options (id, poll_id, label, marker, position) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(option.id)
            .bind(draft.id)
            .bind(&option.label)
            .bind(&option.marker)
            .bind(option.position)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        let mut options = draft.options;
        options.sort_by_key(|o| o.position);
        Ok(Poll {
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
        })
    }

    async fn load_poll(
        &self,
        poll_id: Uuid,
        voter: Option<&str>,
    ) -> Result<Option<PollSnapshot>, StoreError> {
        let row = sqlx::query_as::<_, PollRow>("SELECT * FROM polls WHERE id = $1")
            .bind(poll_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let options = sqlx::query_as::<_, OptionRow>(
            "SELECT id, poll_id, label, marker, position FROM poll_options WHERE poll_id = $1 ORDER BY position",
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(PollOption::from)
        .collect();

        let voter_votes = match voter {
            Some(user_id) => sqlx::query_as::<_, VoteRow>(
                "SELECT id, poll_id, user_id, option_id, created_at FROM votes WHERE poll_id = $1 AND user_id = $2",
            )
            .bind(poll_id)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Vote::from)
            .collect(),
            None => Vec::new(),
        };

        Ok(Some(PollSnapshot {
            poll: row.into_poll(options)?,
            voter_votes,
        }))
    }

    async fn apply_vote(&self, mutation: &VoteMutation) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::lock_voter(&mut tx, mutation.poll_id, &mutation.user_id).await?;

        // FOR SHARE makes a concurrent close wait until this vote commits or rolls back.
        let state = sqlx::query_as::<_, (String, Option<DateTime<Utc>>, DateTime<Utc>)>(
            "SELECT status, expires_at, NOW() FROM polls WHERE id = $1 FOR SHARE",
        )
        .bind(mutation.poll_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((status, expires_at, now)) = state else {
            return Err(StoreError::PollMissing);
        };
        if status.parse::<PollStatus>().map_err(StoreError::Corrupt)? == PollStatus::Closed {
            return Err(StoreError::PollClosed);
        }
        if expires_at.is_some_and(|at| at <= now) {
            return Err(StoreError::PollExpired);
        }

        let current: BTreeSet<Uuid> = sqlx::query_scalar::<_, Uuid>(
            "SELECT option_id FROM votes WHERE poll_id = $1 AND user_id = $2",
        )
        .bind(mutation.poll_id)
        .bind(&mutation.user_id)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .collect();
        if current != mutation.expected {
            // Dropping the transaction rolls it back.
            return Err(StoreError::Conflict);
        }

        if !mutation.remove.is_empty() {
            sqlx::query(
                "DELETE FROM votes WHERE poll_id = $1 AND user_id = $2 AND option_id = ANY($3)",
            )
            .bind(mutation.poll_id)
            .bind(&mutation.user_id)
            .bind(&mutation.remove)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(option_id) = mutation.insert {
            sqlx::query(
                "INSERT INTO votes (id, poll_id, user_id, option_id, created_at) VALUES ($1, $2, $3, $4, NOW())",
            )
            .bind(Uuid::new_v4())
            .bind(mutation.poll_id)
            .bind(&mutation.user_id)
            .bind(option_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn close_poll(&self, poll_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE polls SET status = 'closed' WHERE id = $1 AND status = 'open'")
            .bind(poll_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn tally(&self, poll_id: Uuid) -> Result<Vec<OptionTally>, StoreError> {
        let rows = sqlx::query_as::<_, TallyRow>(
            r#"
            SELECT option_id, COUNT(*) AS vote_count, ARRAY_AGG(user_id ORDER BY created_at) AS voters
            FROM votes
            WHERE poll_id = $1
            GROUP BY option_id
            "#,
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| OptionTally {
                option_id: row.option_id,
                votes: row.vote_count.max(0) as u64,
                voters: row.voters,
            })
            .collect())
    }

    async fn unique_voters(&self, poll_id: Uuid) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(DISTINCT user_id) FROM votes WHERE poll_id = $1")
                .bind(poll_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn set_message_ref(
        &self,
        poll_id: Uuid,
        message_ref: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE polls SET message_ref = $2 WHERE id = $1")
            .bind(poll_id)
            .bind(message_ref)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

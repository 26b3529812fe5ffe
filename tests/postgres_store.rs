//! Runs against a live Postgres: `DATABASE_URL=... cargo test --features pg-tests`.
#![cfg(feature = "pg-tests")]

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use poll_engine::db::{migrate, PgPollStore};
use poll_engine::models::{CreatePollRequest, OptionInput, Poll};
use poll_engine::poll::build_draft;
use poll_engine::queue::{JobQueue, JobState, PgJobQueue};
use poll_engine::store::{PollStore, VoteMutation};
use poll_engine::{PollError, StoreError, VoteEngine};
use sqlx::PgPool;
use uuid::Uuid;

async fn seed(pool: &PgPool, allow_multiple: bool) -> (PgPollStore, Poll) {
    migrate(pool).await.unwrap();
    let store = PgPollStore::new(pool.clone());
    let draft = build_draft(
        CreatePollRequest {
            title: "Lunch".into(),
            description: None,
            guild_id: "guild".into(),
            channel_id: "chan".into(),
            creator_id: "alice".into(),
            options: ["Pizza", "Sushi", "Tacos"]
                .iter()
                .map(|l| OptionInput {
                    label: l.to_string(),
                    marker: None,
                })
                .collect(),
            allow_multiple,
            is_anonymous: false,
            duration_minutes: Some(60),
        },
        Utc::now(),
    )
    .unwrap();
    let poll = store.insert_poll(draft).await.unwrap();
    (store, poll)
}

async fn rows_for(pool: &PgPool, poll_id: Uuid, user_id: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM votes WHERE poll_id = $1 AND user_id = $2")
        .bind(poll_id)
        .bind(user_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

fn cast(poll: &Poll, user: &str, expected: BTreeSet<Uuid>, option: usize) -> VoteMutation {
    VoteMutation {
        poll_id: poll.id,
        user_id: user.into(),
        expected,
        remove: Vec::new(),
        insert: Some(poll.options[option].id),
    }
}

#[sqlx::test(migrations = false)]
async fn stale_expectation_rolls_back(pool: PgPool) {
    let (store, poll) = seed(&pool, false).await;
    store
        .apply_vote(&cast(&poll, "bob", BTreeSet::new(), 0))
        .await
        .unwrap();

    let stale = cast(&poll, "bob", BTreeSet::new(), 1);
    assert!(matches!(
        store.apply_vote(&stale).await,
        Err(StoreError::Conflict)
    ));
    assert_eq!(rows_for(&pool, poll.id, "bob").await, 1);

    let again = cast(&poll, "bob", [poll.options[0].id].into_iter().collect(), 0);
    assert!(matches!(
        store.apply_vote(&again).await,
        Err(StoreError::Duplicate)
    ));
}

#[sqlx::test(migrations = false)]
async fn closed_poll_refuses_the_write(pool: PgPool) {
    let (store, poll) = seed(&pool, false).await;
    assert!(store.close_poll(poll.id).await.unwrap());
    assert!(!store.close_poll(poll.id).await.unwrap());

    assert!(matches!(
        store.apply_vote(&cast(&poll, "bob", BTreeSet::new(), 0)).await,
        Err(StoreError::PollClosed)
    ));
    assert_eq!(rows_for(&pool, poll.id, "bob").await, 0);

    let mut missing = cast(&poll, "bob", BTreeSet::new(), 0);
    missing.poll_id = Uuid::new_v4();
    assert!(matches!(
        store.apply_vote(&missing).await,
        Err(StoreError::PollMissing)
    ));
}

#[sqlx::test(migrations = false)]
async fn racing_single_select_casts_leave_one_row(pool: PgPool) {
    let (store, poll) = seed(&pool, false).await;
    let engine = Arc::new(VoteEngine::new(Arc::new(store)));

    let mut tasks = Vec::new();
    for i in 0..12 {
        let engine = engine.clone();
        let (poll_id, option_id) = (poll.id, poll.options[i % 3].id);
        tasks.push(tokio::spawn(async move {
            engine.cast_or_retract(poll_id, "bob", option_id).await
        }));
    }
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) | Err(PollError::AlreadyVoted) | Err(PollError::TransientIo) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(rows_for(&pool, poll.id, "bob").await <= 1);
}

#[sqlx::test(migrations = false)]
async fn job_queue_upserts_leases_and_parks(pool: PgPool) {
    migrate(&pool).await.unwrap();
    let queue = PgJobQueue::new(pool.clone());
    let poll_id = Uuid::new_v4();
    let now = Utc::now();
    let lease = Duration::seconds(30);

    queue.enqueue("close-poll:a", poll_id, now).await.unwrap();
    queue.enqueue("close-poll:a", poll_id, now).await.unwrap();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scheduled_jobs")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);

    // Two claimers at once never both get the row.
    let (a, b) = tokio::join!(
        queue.claim_due(now, lease, 10),
        queue.claim_due(now, lease, 10)
    );
    assert_eq!(a.unwrap().len() + b.unwrap().len(), 1);
    assert!(queue.claim_due(now, lease, 10).await.unwrap().is_empty());

    let again = queue.claim_due(now + lease, lease, 10).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].attempts, 2);

    queue.abandon("close-poll:a", "db down").await.unwrap();
    let job = queue.get("close-poll:a").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Abandoned);
    assert!(queue
        .claim_due(now + Duration::hours(1), lease, 10)
        .await
        .unwrap()
        .is_empty());
    assert!(queue.cancel("close-poll:a").await.unwrap());
}

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use poll_engine::memory::MemoryPollStore;
use poll_engine::models::{CreatePollRequest, OptionInput, VoteOutcome};
use poll_engine::poll::build_draft;
use poll_engine::store::PollStore;
use poll_engine::VoteEngine;
use proptest::prelude::*;

const USERS: [&str; 4] = ["ana", "ben", "cai", "dee"];

fn request(options: usize, allow_multiple: bool) -> CreatePollRequest {
    CreatePollRequest {
        title: "Sequence".into(),
        description: None,
        guild_id: "guild".into(),
        channel_id: "chan".into(),
        creator_id: "creator".into(),
        options: (0..options)
            .map(|i| OptionInput {
                label: format!("option {i}"),
                marker: None,
            })
            .collect(),
        allow_multiple,
        is_anonymous: false,
        duration_minutes: None,
    }
}

/// Replays `casts` through the engine and checks it against a plain
/// set-per-voter model after every step.
async fn replay(options: usize, allow_multiple: bool, casts: Vec<(usize, usize)>) {
    let store = Arc::new(MemoryPollStore::new());
    let draft = build_draft(request(options, allow_multiple), Utc::now()).unwrap();
    let poll = store.insert_poll(draft).await.unwrap();
    let engine = VoteEngine::new(store.clone());
    let mut model: BTreeMap<&str, BTreeSet<usize>> = BTreeMap::new();

    for (user_idx, option_idx) in casts {
        let user = USERS[user_idx];
        let option = option_idx % options;
        let held = model.entry(user).or_default();
        let expected_outcome = if held.remove(&option) {
            VoteOutcome::Removed
        } else {
            if !allow_multiple {
                held.clear();
            }
            held.insert(option);
            VoteOutcome::Added
        };

        let receipt = engine
            .cast_or_retract(poll.id, user, poll.options[option].id)
            .await
            .unwrap();
        assert_eq!(receipt.outcome, expected_outcome);

        for (voter, held) in &model {
            let rows = store.vote_count(poll.id, voter);
            assert_eq!(rows, held.len());
            if !allow_multiple {
                assert!(rows <= 1, "{voter} holds {rows} rows on a single-select poll");
            }
            let ids: BTreeSet<_> = held.iter().map(|i| poll.options[*i].id).collect();
            assert_eq!(engine.list_user_votes(poll.id, voter).await.unwrap(), ids);
        }

        let results = engine.compute_results(poll.id).await.unwrap();
        let total: u64 = model.values().map(|h| h.len() as u64).sum();
        assert_eq!(results.total_votes, total);
        assert_eq!(
            results.unique_voters,
            model.values().filter(|h| !h.is_empty()).count() as u64
        );
        for (i, option) in results.options.iter().enumerate() {
            let count = model.values().filter(|h| h.contains(&i)).count() as u64;
            assert_eq!(option.votes, count);
            assert!(option.percentage <= 100);
            if total == 0 {
                assert_eq!(option.percentage, 0);
            } else {
                let exact = count as f64 * 100.0 / total as f64;
                assert!((option.percentage as f64 - exact).abs() <= 0.5);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn engine_matches_the_set_model(
        options in 2usize..=6,
        allow_multiple in any::<bool>(),
        casts in prop::collection::vec((0..USERS.len(), 0usize..6), 1..40),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(replay(options, allow_multiple, casts));
    }
}

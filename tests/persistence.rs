//! Persisted state across engine instances.
//!
//! Covers the corruption paths (whole blob vs. single record) and a real
//! SQLite file shared by two engine lifetimes.
//!
//! Run with: `cargo test --test persistence`

mod common;

use std::sync::Arc;
use serde_json::{json, Value};

use quota_sync::persistence::{checksum, encode, MemoryStateStore, PersistedState, StoredBlob};
use quota_sync::{
    ActionStatus, ActionType, FlushOutcome, FlushReason, ManualClock, MembershipTier,
    PendingAction, QuotaSyncConfig, RecordOutcome, SyncError, UsageCounter,
};

use common::{config, engine, limits, remote_with_clock, FailingRemote, USER, WINDOW};

fn counter(action_type: ActionType, limit: u32, count: u32) -> UsageCounter {
    let mut counter = UsageCounter::new(action_type, limit, 0, WINDOW);
    counter.current_count = count;
    counter
}

fn saved_state() -> PersistedState {
    let mut state = PersistedState::new(USER, MembershipTier::Free, 900);
    state.counters.push(counter(ActionType::Swipe, 10, 3));
    state.counters.push(counter(ActionType::Match, 5, 2));
    state.tier_limits = limits();
    state.last_sync_at = Some(800);
    state
}

/// Re-sign an edited blob so only record-level validation can catch it.
fn resign(mut stored: StoredBlob, edit: impl FnOnce(&mut Value)) -> StoredBlob {
    let mut value: Value = serde_json::from_str(&stored.blob).unwrap();
    edit(&mut value);
    stored.blob = value.to_string();
    stored.checksum = checksum(&stored.blob);
    stored
}

fn count(engine: &quota_sync::SyncEngine, action_type: ActionType) -> u32 {
    engine.get_state(action_type).map_or(0, |c| c.current_count)
}

// =============================================================================
// Corruption
// =============================================================================

#[tokio::test]
async fn test_checksum_mismatch_starts_empty() {
    let clock = Arc::new(ManualClock::new(1_000));
    let inner = remote_with_clock(clock.clone());
    let store = Arc::new(MemoryStateStore::new());

    let mut stored = encode(&saved_state()).unwrap();
    stored.blob = stored.blob.replace("\"current_count\":3", "\"current_count\":0");
    store.put_raw(USER, stored);

    let (engine, _tx) = engine(inner, config(), clock);
    let engine = engine.with_state_store(store.clone());
    engine.init().await.unwrap();

    assert!(engine.is_ready());
    assert!(engine.counters().iter().all(|c| c.current_count == 0));
    assert_eq!(engine.status().pending, 0);

    // Usable straight away
    assert!(engine.record_action(ActionType::Swipe, json!({})).is_recorded());
    assert_eq!(count(&engine, ActionType::Swipe), 1);
}

#[tokio::test]
async fn test_single_corrupt_counter_is_dropped() {
    let clock = Arc::new(ManualClock::new(1_000));
    let inner = remote_with_clock(clock.clone());
    let store = Arc::new(MemoryStateStore::new());

    let mut state = saved_state();
    let mut stuck = PendingAction::new(ActionType::Match, json!({ "with": "u7" }), 850);
    stuck.status = ActionStatus::Sending;
    state.pending.push(stuck.clone());

    let stored = resign(encode(&state).unwrap(), |v| {
        v["counters"][0]["current_count"] = json!(-4);
    });
    store.put_raw(USER, stored);

    let (engine, _tx) = engine(inner.clone(), config(), clock);
    let engine = engine.with_state_store(store.clone());
    engine.init().await.unwrap();

    // Swipe counter was unreadable, Match survived
    assert_eq!(count(&engine, ActionType::Swipe), 0);
    assert_eq!(count(&engine, ActionType::Match), 2);
    assert_eq!(engine.sync_state().last_sync_timestamp, Some(1_000));

    // The interrupted send is healed back into the queue and delivered
    assert_eq!(engine.status().pending, 1);
    match engine.flush(ActionType::Match, FlushReason::Manual).await {
        FlushOutcome::Completed(report) => assert_eq!(report.acked, vec![stuck.id]),
        other => panic!("expected a completed flush, got {other:?}"),
    }
    assert_eq!(inner.applied_count(), 1);
}

#[tokio::test]
async fn test_stale_limit_is_healed_on_load() {
    let clock = Arc::new(ManualClock::new(1_000));
    let inner = remote_with_clock(clock.clone());
    let store = Arc::new(MemoryStateStore::new());

    let mut state = saved_state();
    state.counters[0].limit = 999;
    store.put_raw(USER, encode(&state).unwrap());

    let (engine, _tx) = engine(inner, config(), clock);
    let engine = engine.with_state_store(store);
    engine.init().await.unwrap();

    let swipes = engine.get_state(ActionType::Swipe).unwrap();
    assert_eq!(swipes.limit, 10);
    assert_eq!(swipes.current_count, 3);
}

#[tokio::test]
async fn test_blob_of_another_user_is_ignored() {
    let clock = Arc::new(ManualClock::new(1_000));
    let inner = remote_with_clock(clock.clone());
    let store = Arc::new(MemoryStateStore::new());

    let mut state = saved_state();
    state.user_id = "someone-else".into();
    store.put_raw(USER, encode(&state).unwrap());

    let (engine, _tx) = engine(inner, config(), clock);
    let engine = engine.with_state_store(store);
    engine.init().await.unwrap();

    assert_eq!(count(&engine, ActionType::Swipe), 0);
    assert_eq!(count(&engine, ActionType::Match), 0);
}

#[tokio::test]
async fn test_flush_persists_state() {
    let clock = Arc::new(ManualClock::new(1_000));
    let inner = remote_with_clock(clock.clone());
    let store = Arc::new(MemoryStateStore::new());

    let (engine, _tx) = engine(inner, config(), clock);
    let engine = engine.with_state_store(store.clone());

    engine.record_action(ActionType::Message, json!({ "text": "hey" }));
    assert_eq!(store.save_count(), 0);

    engine.flush(ActionType::Message, FlushReason::Manual).await;
    assert_eq!(store.save_count(), 1);

    let raw = quota_sync::persistence::decode(&store.get_raw(USER).unwrap()).unwrap();
    assert_eq!(raw.user_id, USER);
    assert_eq!(raw.counters.len(), 1);
    assert!(raw.pending.is_empty());
}

// =============================================================================
// SQLite
// =============================================================================

#[tokio::test]
async fn test_sqlite_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quota_state.db");
    let cfg = QuotaSyncConfig {
        state_path: Some(path.to_string_lossy().into_owned()),
        ..config()
    };

    let clock = Arc::new(ManualClock::new(1_000));
    let inner = remote_with_clock(clock.clone());

    // First session: offline, two swipes never leave the device
    let offline = Arc::new(FailingRemote::always(inner.clone(), SyncError::network("offline")));
    let (first, _tx) = engine(offline.clone(), cfg.clone(), clock.clone());
    first.init().await.unwrap();
    for i in 0..2 {
        let outcome = first.record_action(ActionType::Swipe, json!({ "target": i }));
        assert!(matches!(outcome, RecordOutcome::Recorded { remaining, .. } if remaining == 9 - i));
    }
    first.shutdown().await;
    assert_eq!(offline.submit_calls(), 1);
    assert!(path.exists());

    // Second session: same file, back online
    let (second, _tx) = engine(inner.clone(), cfg, clock);
    second.init().await.unwrap();
    assert_eq!(second.status().pending, 2);
    assert_eq!(count(&second, ActionType::Swipe), 2);

    match second.flush(ActionType::Swipe, FlushReason::Manual).await {
        FlushOutcome::Completed(report) => assert_eq!(report.acked.len(), 2),
        other => panic!("expected a completed flush, got {other:?}"),
    }
    assert_eq!(inner.applied_count(), 2);
    second.shutdown().await;
}

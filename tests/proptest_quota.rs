//! Property-based tests for the quota cache, backoff and validator.
//!
//! Uses proptest to drive random operation sequences and malformed
//! persisted records, checking the cache never oversubscribes and the
//! validator never panics.
//!
//! Run with: `cargo test --test proptest_quota`

use std::time::Duration;
use proptest::prelude::*;
use serde_json::Value;

use quota_sync::persistence::RawState;
use quota_sync::{
    ActionType, MembershipTier, QuotaCache, ReserveOutcome, RetryPolicy, TierLimits, Validator,
};

const WINDOW: i64 = 1_000;

fn limits(limit: u32) -> TierLimits {
    TierLimits::new(0)
        .with_limit(MembershipTier::Free, ActionType::Swipe, limit)
        .with_limit(MembershipTier::Free, ActionType::Message, limit)
}

// =============================================================================
// Strategies for generating test data
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Reserve(ActionType),
    /// Roll back the most recent reservation of this type
    Rollback(ActionType),
    Advance(i64),
}

fn action_type_strategy() -> impl Strategy<Value = ActionType> {
    prop_oneof![Just(ActionType::Swipe), Just(ActionType::Message)]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => action_type_strategy().prop_map(Op::Reserve),
        2 => action_type_strategy().prop_map(Op::Rollback),
        1 => (0..WINDOW * 3).prop_map(Op::Advance),
    ]
}

/// Arbitrary JSON values (including invalid structures)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        prop_oneof![
            Just("swipe".to_string()),
            Just("queued".to_string()),
            Just("sending".to_string()),
            ".*",
        ]
        .prop_map(Value::String),
    ];

    leaf.prop_recursive(3, 48, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
            prop::collection::hash_map(
                prop_oneof![
                    Just("action_type".to_string()),
                    Just("current_count".to_string()),
                    Just("limit".to_string()),
                    Just("window_start".to_string()),
                    Just("reset_timestamp".to_string()),
                    Just("id".to_string()),
                    Just("status".to_string()),
                    "[a-z_]{1,12}",
                ],
                inner,
                0..8
            )
            .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

// =============================================================================
// Quota cache
// =============================================================================

proptest! {
    /// No sequence of reservations, rollbacks and clock jumps pushes a
    /// counter past its limit.
    #[test]
    fn prop_count_never_exceeds_limit(
        limit in 1u32..20,
        ops in prop::collection::vec(op_strategy(), 1..200),
    ) {
        let mut cache = QuotaCache::new(MembershipTier::Free, limits(limit), WINDOW);
        let mut now = 0i64;
        let mut last_window = std::collections::HashMap::new();

        for op in ops {
            match op {
                Op::Reserve(t) => {
                    if let ReserveOutcome::Allowed(r) = cache.check_and_reserve(t, now) {
                        prop_assert!(r.count_after <= r.limit);
                        last_window.insert(t, r.window_start);
                    }
                }
                Op::Rollback(t) => {
                    cache.rollback(t, last_window.get(&t).copied(), now);
                }
                Op::Advance(ms) => now += ms,
            }
            for counter in cache.snapshot() {
                prop_assert!(counter.current_count <= counter.limit);
                prop_assert!(counter.reset_timestamp > counter.window_start);
            }
        }
    }

    /// Jumping across any number of boundaries resets exactly once and lands
    /// on the window that contains `now`.
    #[test]
    fn prop_window_resets_once_per_jump(
        used in 1u32..10,
        jump in WINDOW..WINDOW * 50,
    ) {
        let mut cache = QuotaCache::new(MembershipTier::Free, limits(10), WINDOW);
        for _ in 0..used {
            cache.check_and_reserve(ActionType::Swipe, 0);
        }

        let outcome = cache.check_and_reserve(ActionType::Swipe, jump);
        let ReserveOutcome::Allowed(r) = outcome else {
            return Err(TestCaseError::fail("reservation after reset was denied"));
        };
        prop_assert_eq!(r.count_after, 1);
        prop_assert_eq!(r.window_start, (jump / WINDOW) * WINDOW);

        let counter = cache.counter(ActionType::Swipe).unwrap();
        prop_assert!(counter.window_start <= jump && jump < counter.reset_timestamp);
    }

    /// Rolling back every reservation of the current window restores the
    /// count it started from.
    #[test]
    fn prop_rollback_restores_count(
        before in 0u32..5,
        reserved in 1u32..5,
    ) {
        let mut cache = QuotaCache::new(MembershipTier::Free, limits(10), WINDOW);
        let mut windows = Vec::new();
        for _ in 0..before {
            cache.check_and_reserve(ActionType::Message, 10);
        }
        for _ in 0..reserved {
            if let ReserveOutcome::Allowed(r) = cache.check_and_reserve(ActionType::Message, 20) {
                windows.push(r.window_start);
            }
        }
        for window in windows {
            prop_assert!(cache.rollback(ActionType::Message, Some(window), 30));
        }
        prop_assert_eq!(cache.counter(ActionType::Message).unwrap().current_count, before);
    }
}

// =============================================================================
// Backoff
// =============================================================================

proptest! {
    /// Backoff never shrinks between attempts and never passes the cap,
    /// jitter included.
    #[test]
    fn prop_backoff_is_monotonic_and_capped(
        base_ms in 1u64..5_000,
        max_ms in 1u64..120_000,
        jitter in 0.0f64..=1.0,
        unit in -1.0f64..=1.0,
    ) {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            jitter_ratio: jitter,
        };

        let mut previous = Duration::ZERO;
        for attempt in 1..=40 {
            let delay = policy.backoff(attempt);
            prop_assert!(delay >= previous);
            prop_assert!(delay <= policy.max_delay);
            prop_assert!(policy.apply_jitter(delay, unit) <= policy.max_delay);
            previous = delay;
        }
    }
}

// =============================================================================
// Validator
// =============================================================================

proptest! {
    /// Arbitrary records are sorted into kept and corrupt without panicking.
    #[test]
    fn prop_validator_never_panics(
        counters in prop::collection::vec(arbitrary_json_strategy(), 0..6),
        pending in prop::collection::vec(arbitrary_json_strategy(), 0..6),
    ) {
        let raw = RawState {
            format_version: 1,
            user_id: "user-1".into(),
            counters: counters.clone(),
            pending: pending.clone(),
            ..RawState::default()
        };
        let limits = limits(10);
        let report = Validator::new(MembershipTier::Free, &limits).validate(&raw);

        prop_assert!(report.counters.len() + report.pending.len() + report.corrupt.len() + report.discarded
            <= counters.len() + pending.len());
        for counter in &report.counters {
            prop_assert!(counter.reset_timestamp > counter.window_start);
        }
    }
}

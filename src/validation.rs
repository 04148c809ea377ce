// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integrity checks for cached quota state.
//!
//! Nothing loaded from disk or merged from the remote store is trusted
//! until it has been through the [`Validator`]. Checks are per record: a
//! counter or pending action that fails is dropped on its own and the rest
//! of the state is kept, so one bad entry can't block every quota-gated
//! action.
//!
//! | Record          | Check                                   | On failure            |
//! |-----------------|-----------------------------------------|-----------------------|
//! | counter         | deserializes (counts are `u32`)         | dropped               |
//! | counter         | `reset_timestamp > window_start`        | dropped               |
//! | counter         | `limit` equals current tier limit       | healed to tier limit  |
//! | counter         | one per action type                     | later copies dropped  |
//! | pending action  | deserializes                            | dropped               |
//! | pending action  | unique id                               | later copies dropped  |
//! | pending action  | `Sending`/`Failed`                      | healed to `Queued`    |
//! | pending action  | `Acked`/`Dropped`                       | discarded             |

use std::collections::HashSet;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::action::{ActionId, ActionStatus, ActionType, PendingAction};
use crate::metrics;
use crate::persistence::RawState;
use crate::quota::{MembershipTier, TierLimits, UsageCounter};

/// Kind of record a diagnostic refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Counter,
    PendingAction,
    /// The whole persisted blob
    Blob,
}

impl RecordKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::PendingAction => "pending_action",
            Self::Blob => "blob",
        }
    }
}

/// A record that was dropped, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptRecord {
    pub kind: RecordKind,
    /// Action type or action id when it could be read, else the position
    pub key: String,
    pub details: String,
}

/// Outcome of checking a single record.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict<T> {
    Sanitized { record: T, healed: bool },
    Corrupt(String),
}

/// Sanitized state plus a diagnostic per dropped record.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub counters: Vec<UsageCounter>,
    pub pending: Vec<PendingAction>,
    pub corrupt: Vec<CorruptRecord>,
    /// Records that were repaired in place
    pub healed: usize,
    /// Terminal pending actions removed
    pub discarded: usize,
}

impl ValidationReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty() && self.healed == 0 && self.discarded == 0
    }
}

/// Checks state against the limits of one tier.
#[derive(Debug, Clone, Copy)]
pub struct Validator<'a> {
    tier: MembershipTier,
    limits: &'a TierLimits,
}

impl<'a> Validator<'a> {
    pub fn new(tier: MembershipTier, limits: &'a TierLimits) -> Self {
        Self { tier, limits }
    }

    /// Validate state as it was read from persistence.
    pub fn validate(&self, raw: &RawState) -> ValidationReport {
        let mut report = ValidationReport::default();

        let counters = decode_each::<UsageCounter>(&raw.counters, RecordKind::Counter, &mut report.corrupt);
        let pending = decode_each::<PendingAction>(&raw.pending, RecordKind::PendingAction, &mut report.corrupt);

        self.check_counters(counters, &mut report);
        self.check_pending(pending, &mut report);
        self.finish(report)
    }

    /// Validate typed in-memory state, e.g. before a forced resync.
    pub fn validate_local(&self, counters: Vec<UsageCounter>, pending: Vec<PendingAction>) -> ValidationReport {
        let mut report = ValidationReport::default();
        self.check_counters(counters, &mut report);
        self.check_pending(pending, &mut report);
        self.finish(report)
    }

    /// Check a single counter.
    #[must_use]
    pub fn validate_counter(&self, counter: &UsageCounter) -> Verdict<UsageCounter> {
        if counter.reset_timestamp <= counter.window_start {
            return Verdict::Corrupt(format!(
                "reset_timestamp {} not after window_start {}",
                counter.reset_timestamp, counter.window_start
            ));
        }

        match self.limits.limit_for(self.tier, counter.action_type) {
            Some(limit) if limit != counter.limit => {
                debug!(
                    action_type = %counter.action_type,
                    stored = counter.limit,
                    current = limit,
                    "Stale limit healed"
                );
                let mut record = counter.clone();
                record.limit = limit;
                Verdict::Sanitized { record, healed: true }
            }
            _ => Verdict::Sanitized {
                record: counter.clone(),
                healed: false,
            },
        }
    }

    /// Check a single pending action.
    ///
    /// Terminal actions come back as `Corrupt`; callers that want to tell
    /// them apart use [`ActionStatus::is_terminal`] first.
    #[must_use]
    pub fn validate_pending(&self, action: &PendingAction) -> Verdict<PendingAction> {
        match action.status {
            ActionStatus::Queued => Verdict::Sanitized {
                record: action.clone(),
                healed: false,
            },
            ActionStatus::Sending | ActionStatus::Failed => {
                let mut record = action.clone();
                record.status = ActionStatus::Queued;
                Verdict::Sanitized { record, healed: true }
            }
            ActionStatus::Acked | ActionStatus::Dropped => {
                Verdict::Corrupt(format!("terminal status {}", action.status))
            }
        }
    }

    fn check_counters(&self, counters: Vec<UsageCounter>, report: &mut ValidationReport) {
        let mut seen: HashSet<ActionType> = HashSet::new();
        for counter in counters {
            if !seen.insert(counter.action_type) {
                report.corrupt.push(CorruptRecord {
                    kind: RecordKind::Counter,
                    key: counter.action_type.to_string(),
                    details: "duplicate counter for action type".into(),
                });
                continue;
            }
            match self.validate_counter(&counter) {
                Verdict::Sanitized { record, healed } => {
                    report.healed += usize::from(healed);
                    report.counters.push(record);
                }
                Verdict::Corrupt(details) => {
                    // Free the slot so a later valid copy can still be used
                    seen.remove(&counter.action_type);
                    report.corrupt.push(CorruptRecord {
                        kind: RecordKind::Counter,
                        key: counter.action_type.to_string(),
                        details,
                    });
                }
            }
        }
    }

    fn check_pending(&self, pending: Vec<PendingAction>, report: &mut ValidationReport) {
        let mut seen: HashSet<ActionId> = HashSet::new();
        for action in pending {
            if action.status.is_terminal() {
                report.discarded += 1;
                continue;
            }
            if !seen.insert(action.id) {
                report.corrupt.push(CorruptRecord {
                    kind: RecordKind::PendingAction,
                    key: action.id.to_string(),
                    details: "duplicate action id".into(),
                });
                continue;
            }
            match self.validate_pending(&action) {
                Verdict::Sanitized { record, healed } => {
                    report.healed += usize::from(healed);
                    report.pending.push(record);
                }
                Verdict::Corrupt(details) => report.corrupt.push(CorruptRecord {
                    kind: RecordKind::PendingAction,
                    key: action.id.to_string(),
                    details,
                }),
            }
        }
    }

    fn finish(&self, report: ValidationReport) -> ValidationReport {
        for record in &report.corrupt {
            warn!(
                kind = record.kind.as_str(),
                key = %record.key,
                details = %record.details,
                "Dropping corrupt record"
            );
            metrics::record_corrupt_record(record.kind.as_str());
        }
        if report.healed > 0 || report.discarded > 0 {
            debug!(healed = report.healed, discarded = report.discarded, "State sanitized");
        }
        report
    }
}

fn decode_each<T: DeserializeOwned>(
    values: &[Value],
    kind: RecordKind,
    corrupt: &mut Vec<CorruptRecord>,
) -> Vec<T> {
    let mut out = Vec::with_capacity(values.len());
    for (idx, value) in values.iter().enumerate() {
        match serde_json::from_value::<T>(value.clone()) {
            Ok(record) => out.push(record),
            Err(e) => corrupt.push(CorruptRecord {
                kind,
                key: record_key(value).unwrap_or_else(|| format!("#{idx}")),
                details: e.to_string(),
            }),
        }
    }
    out
}

fn record_key(value: &Value) -> Option<String> {
    value
        .get("id")
        .or_else(|| value.get("action_type"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn limits() -> TierLimits {
        TierLimits::new(0)
            .with_limit(MembershipTier::Free, ActionType::Swipe, 10)
            .with_limit(MembershipTier::Free, ActionType::Message, 3)
    }

    fn raw(counters: Vec<Value>, pending: Vec<Value>) -> RawState {
        RawState {
            counters,
            pending,
            ..RawState::default()
        }
    }

    fn counter_json(action_type: &str, count: i64, limit: u32, start: i64, reset: i64) -> Value {
        json!({
            "action_type": action_type,
            "current_count": count,
            "limit": limit,
            "window_start": start,
            "reset_timestamp": reset,
            "last_action_timestamp": 0
        })
    }

    #[test]
    fn test_valid_state_is_clean() {
        let limits = limits();
        let v = Validator::new(MembershipTier::Free, &limits);
        let action = PendingAction::new(ActionType::Swipe, json!({}), 1);
        let report = v.validate(&raw(
            vec![counter_json("swipe", 3, 10, 0, 100)],
            vec![serde_json::to_value(&action).unwrap()],
        ));
        assert!(report.is_clean());
        assert_eq!(report.counters.len(), 1);
        assert_eq!(report.pending, vec![action]);
    }

    #[test]
    fn test_negative_count_drops_only_that_counter() {
        let limits = limits();
        let v = Validator::new(MembershipTier::Free, &limits);
        let report = v.validate(&raw(
            vec![
                counter_json("swipe", -1, 10, 0, 100),
                counter_json("message", 1, 3, 0, 100),
            ],
            vec![],
        ));
        assert_eq!(report.counters.len(), 1);
        assert_eq!(report.counters[0].action_type, ActionType::Message);
        assert_eq!(report.corrupt.len(), 1);
        assert_eq!(report.corrupt[0].kind, RecordKind::Counter);
        assert_eq!(report.corrupt[0].key, "swipe");
    }

    #[test]
    fn test_inverted_window_is_corrupt() {
        let limits = limits();
        let v = Validator::new(MembershipTier::Free, &limits);
        let report = v.validate(&raw(vec![counter_json("swipe", 1, 10, 100, 100)], vec![]));
        assert!(report.counters.is_empty());
        assert!(report.corrupt[0].details.contains("reset_timestamp"));
    }

    #[test]
    fn test_stale_limit_is_healed() {
        let limits = limits();
        let v = Validator::new(MembershipTier::Free, &limits);
        let mut counter = UsageCounter::new(ActionType::Swipe, 50, 0, 100);
        counter.current_count = 4;
        match v.validate_counter(&counter) {
            Verdict::Sanitized { record, healed } => {
                assert!(healed);
                assert_eq!(record.limit, 10);
                assert_eq!(record.current_count, 4);
            }
            Verdict::Corrupt(d) => panic!("unexpected corrupt: {d}"),
        }
    }

    #[test]
    fn test_limit_without_tier_entry_is_kept() {
        let limits = limits();
        let v = Validator::new(MembershipTier::Free, &limits);
        let counter = UsageCounter::new(ActionType::Match, 7, 0, 100);
        assert_eq!(
            v.validate_counter(&counter),
            Verdict::Sanitized { record: counter.clone(), healed: false }
        );
    }

    #[test]
    fn test_duplicate_counter_keeps_first() {
        let limits = limits();
        let v = Validator::new(MembershipTier::Free, &limits);
        let report = v.validate(&raw(
            vec![counter_json("swipe", 2, 10, 0, 100), counter_json("swipe", 9, 10, 0, 100)],
            vec![],
        ));
        assert_eq!(report.counters.len(), 1);
        assert_eq!(report.counters[0].current_count, 2);
        assert_eq!(report.corrupt.len(), 1);
    }

    #[test]
    fn test_duplicate_pending_ids_dropped() {
        let limits = limits();
        let v = Validator::new(MembershipTier::Free, &limits);
        let action = PendingAction::new(ActionType::Swipe, json!({"n": 1}), 1);
        let mut copy = action.clone();
        copy.payload = json!({"n": 2});
        let report = v.validate_local(vec![], vec![action.clone(), copy]);
        assert_eq!(report.pending, vec![action]);
        assert_eq!(report.corrupt[0].kind, RecordKind::PendingAction);
    }

    #[test]
    fn test_in_flight_statuses_heal_to_queued() {
        let limits = limits();
        let v = Validator::new(MembershipTier::Free, &limits);
        let mut sending = PendingAction::new(ActionType::Swipe, json!({}), 1);
        sending.status = ActionStatus::Sending;
        let mut held = PendingAction::new(ActionType::Message, json!({}), 2);
        held.status = ActionStatus::Failed;
        let mut acked = PendingAction::new(ActionType::Swipe, json!({}), 3);
        acked.status = ActionStatus::Acked;

        let report = v.validate_local(vec![], vec![sending, held, acked]);
        assert_eq!(report.pending.len(), 2);
        assert!(report.pending.iter().all(|a| a.status == ActionStatus::Queued));
        assert_eq!(report.healed, 2);
        assert_eq!(report.discarded, 1);
        assert!(report.corrupt.is_empty());
    }

    #[test]
    fn test_unparsable_pending_uses_id_as_key() {
        let limits = limits();
        let v = Validator::new(MembershipTier::Free, &limits);
        let report = v.validate(&raw(
            vec![],
            vec![json!({"id": "not-a-uuid", "action_type": "swipe"}), json!(42)],
        ));
        assert!(report.pending.is_empty());
        assert_eq!(report.corrupt.len(), 2);
        assert_eq!(report.corrupt[0].key, "not-a-uuid");
        assert_eq!(report.corrupt[1].key, "#1");
    }
}

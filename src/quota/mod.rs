// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Usage counters, tier limits and the local quota cache.

pub mod cache;
pub mod counter;
pub mod tiers;

pub use cache::{DenyReason, QuotaCache, Reservation, ReserveOutcome};
pub use counter::UsageCounter;
pub use tiers::{MembershipTier, TierLimits};

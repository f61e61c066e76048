//! Diff-over-aggregate values kept by the local cache.
//!
//! A [`UserDiffs`] pairs the last globally synchronized aggregates with this
//! instance's un-synchronized deltas. All transitions are pure functions so
//! the cache can apply them atomically under its entry lock.

use std::ops::{Add, AddAssign};

use super::{UserQuotaAggregate, UserRateAggregate};

/// Local view of one user's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserDiffs {
    pub rate: UserRateAggregate,
    pub rate_diff: i64,
    pub quota: UserQuotaAggregate,
    pub quota_diff: i64,
}

impl UserDiffs {
    /// Entry freshly seeded from the shared store, with no local changes.
    pub fn seeded(quota: UserQuotaAggregate, rate: UserRateAggregate) -> Self {
        Self {
            rate,
            rate_diff: 0,
            quota,
            quota_diff: 0,
        }
    }

    pub fn total_quota(&self) -> i64 {
        self.quota.counter + self.quota_diff
    }

    pub fn total_rate(&self) -> i64 {
        self.rate.gauge + self.rate_diff
    }

    /// Effective aggregates (aggregate + local diff).
    pub fn effective(&self) -> (UserQuotaAggregate, UserRateAggregate) {
        (
            UserQuotaAggregate::new(self.total_quota()),
            UserRateAggregate::new(self.total_rate()),
        )
    }

    /// Zero-diff entry whose aggregate already includes the old diffs.
    ///
    /// Effective values are unchanged, so readers see no jump while the old
    /// diffs are being reconciled.
    pub fn renewed(&self) -> Self {
        let (quota, rate) = self.effective();
        Self::seeded(quota, rate)
    }

    /// Replace the aggregates with fresh global sums, keeping local diffs.
    pub fn refreshed(&self, quota: UserQuotaAggregate, rate: UserRateAggregate) -> Self {
        Self {
            rate,
            rate_diff: self.rate_diff,
            quota,
            quota_diff: self.quota_diff,
        }
    }

    /// One download started: consumes quota and one rate slot.
    pub fn incremented(&self) -> Self {
        Self {
            rate_diff: self.rate_diff + 1,
            quota_diff: self.quota_diff + 1,
            ..*self
        }
    }

    /// One download finished: releases the rate slot, quota stays consumed.
    pub fn rate_decremented(&self) -> Self {
        Self {
            rate_diff: self.rate_diff - 1,
            ..*self
        }
    }

    pub fn diff_sync(&self) -> DiffSync {
        DiffSync {
            rate_diff: self.rate_diff,
            quota_diff: self.quota_diff,
        }
    }

    /// No local changes pending.
    pub fn is_clean(&self) -> bool {
        self.rate_diff == 0 && self.quota_diff == 0
    }
}

/// Local deltas captured by a sync pass, waiting to be written to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffSync {
    pub rate_diff: i64,
    pub quota_diff: i64,
}

impl DiffSync {
    pub const fn new(rate_diff: i64, quota_diff: i64) -> Self {
        Self {
            rate_diff,
            quota_diff,
        }
    }
}

impl Add for DiffSync {
    type Output = DiffSync;

    fn add(self, rhs: DiffSync) -> DiffSync {
        DiffSync {
            rate_diff: self.rate_diff + rhs.rate_diff,
            quota_diff: self.quota_diff + rhs.quota_diff,
        }
    }
}

impl AddAssign for DiffSync {
    fn add_assign(&mut self, rhs: DiffSync) {
        *self = *self + rhs;
    }
}

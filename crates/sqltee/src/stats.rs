//! Tee instance statistics aggregation

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters shared by every session of one tee instance
#[derive(Debug)]
pub struct FilterStats {
    /// Sessions admitted with duplication enabled
    pub sessions_active: AtomicU64,
    /// Sessions admitted with duplication disabled by source/user filters
    pub sessions_inactive: AtomicU64,
    /// Sessions refused because of a duplication loop
    pub sessions_looped: AtomicU64,
    /// Sessions refused because the branch session could not be opened
    pub branch_open_failures: AtomicU64,
    /// Requests cloned onto the branch
    pub duplicated: AtomicU64,
    /// Requests the matchers declined to clone
    pub rejected: AtomicU64,
    /// Sessions that lost their branch mid-session
    pub branch_failures: AtomicU64,
}

/// Point-in-time copy of [`FilterStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FilterStatsSnapshot {
    /// Sessions admitted with duplication enabled
    pub sessions_active: u64,
    /// Sessions admitted with duplication disabled
    pub sessions_inactive: u64,
    /// Sessions refused because of a duplication loop
    pub sessions_looped: u64,
    /// Sessions refused because the branch could not be opened
    pub branch_open_failures: u64,
    /// Requests cloned
    pub duplicated: u64,
    /// Requests not cloned
    pub rejected: u64,
    /// Branches lost mid-session
    pub branch_failures: u64,
}

impl FilterStats {
    /// Creates a zeroed counter set.
    pub fn new() -> Self {
        Self {
            sessions_active: AtomicU64::new(0),
            sessions_inactive: AtomicU64::new(0),
            sessions_looped: AtomicU64::new(0),
            branch_open_failures: AtomicU64::new(0),
            duplicated: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            branch_failures: AtomicU64::new(0),
        }
    }

    /// Bumps one of the counters above by one.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads every counter. The counters are read one by one, not atomically
    /// as a set.
    pub fn snapshot(&self) -> FilterStatsSnapshot {
        FilterStatsSnapshot {
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            sessions_inactive: self.sessions_inactive.load(Ordering::Relaxed),
            sessions_looped: self.sessions_looped.load(Ordering::Relaxed),
            branch_open_failures: self.branch_open_failures.load(Ordering::Relaxed),
            duplicated: self.duplicated.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            branch_failures: self.branch_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for FilterStats {
    fn default() -> Self {
        Self::new()
    }
}

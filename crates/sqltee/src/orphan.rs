//! Deferred reclamation of branch sessions that outlive their owner.
//!
//! A primary session may be destroyed while its branch session is still
//! `Stopping`: other contexts can hold references to it, so it can neither be
//! freed nor simply released. Such sessions are parked here and freed once the
//! branch router reports them unreferenced.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::branch::{BranchSession, BranchState};

/// Registry of orphaned branch sessions.
#[derive(Debug, Default)]
pub struct OrphanRegistry {
    pending: Mutex<Vec<Arc<BranchSession>>>,
    registered: AtomicU64,
    freed: AtomicU64,
}

/// Counters of an orphan registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrphanStats {
    /// Entries waiting for their branch session to become freeable
    pub pending: usize,
    /// Entries ever registered
    pub registered: u64,
    /// Entries freed by reclamation
    pub freed: u64,
}

impl OrphanRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry.
    pub fn shared() -> Arc<OrphanRegistry> {
        static SHARED: OnceLock<Arc<OrphanRegistry>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(OrphanRegistry::new())))
    }

    /// Parks a branch session until it becomes freeable.
    pub fn register(&self, branch: Arc<BranchSession>) {
        debug!(session = branch.id().0, "branch session orphaned");
        self.pending.lock().push(branch);
        self.registered.fetch_add(1, Ordering::Relaxed);
    }

    /// Frees every orphan that has become freeable. Returns how many were freed.
    ///
    /// The lock is only held while the pending list is rearranged; the frees
    /// run afterwards because they call back into the branch router.
    pub fn reclaim(&self) -> usize {
        let finished = {
            let mut pending = self.pending.lock();
            let mut finished = Vec::new();
            let mut i = 0;
            while i < pending.len() {
                let status = pending[i].status();
                let state = status.state();
                if state == BranchState::PendingFree
                    || (state == BranchState::Stopping && status.promote())
                {
                    finished.push(pending.swap_remove(i));
                } else if state == BranchState::Freed {
                    pending.swap_remove(i);
                } else {
                    i += 1;
                }
            }
            finished
        };

        let mut freed = 0;
        for branch in finished {
            if branch.free() {
                freed += 1;
            }
        }
        if freed > 0 {
            self.freed.fetch_add(freed as u64, Ordering::Relaxed);
            debug!(freed, "orphaned branch sessions freed");
        }
        freed
    }

    /// Number of entries waiting.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> OrphanStats {
        OrphanStats {
            pending: self.pending_count(),
            registered: self.registered.load(Ordering::Relaxed),
            freed: self.freed.load(Ordering::Relaxed),
        }
    }
}

/// Shortest period [`spawn_reclaimer`] will tick at.
pub const MIN_RECLAIM_PERIOD: Duration = Duration::from_millis(1);

/// Runs [`OrphanRegistry::reclaim`] every `period` until the handle is aborted.
/// Periods below [`MIN_RECLAIM_PERIOD`], zero included, are raised to it.
pub fn spawn_reclaimer(registry: Arc<OrphanRegistry>, period: Duration) -> JoinHandle<()> {
    let period = period.max(MIN_RECLAIM_PERIOD);
    info!(?period, "orphan reclaimer started");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            registry.reclaim();
        }
    })
}

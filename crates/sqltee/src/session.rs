//! Tee sessions: per-client duplication state and branch teardown

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::branch::{BranchSession, BranchState};
use crate::config::TeeConfig;
use crate::decision::{decide, CloneDecision};
use crate::error::Result;
use crate::orphan::OrphanRegistry;
use crate::packet::{expects_multi_packet_reply, Packet, COM_SET_OPTION};
use crate::router::{Downstream, Upstream};
use crate::stats::FilterStats;

/// Per-instance sequence number of a tee session, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl From<u64> for SessionId {
    fn from(seq: u64) -> Self {
        SessionId(seq)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tee-{}", self.0)
    }
}

/// Bookkeeping for the request in flight, indexed by route (0 primary, 1 branch).
///
/// Reset on every request. Replies pass straight through, so the reply
/// counters are kept but nothing reads them yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestScratch {
    /// Command byte of the current request
    pub command: u8,
    /// Whether the reply may span several packets
    pub multipacket: [bool; 2],
    /// Whether a reply is still expected
    pub waiting: [bool; 2],
    /// Replies received
    pub replies: [u32; 2],
    /// Result packets received
    pub reply_packets: [u32; 2],
    /// EOF packets received
    pub eof: [u32; 2],
    /// Client enabled multi-statements through `COM_SET_OPTION`
    pub client_multistatement: bool,
}

impl RequestScratch {
    /// Resets the bookkeeping for a new request. Packets too short to carry
    /// a command leave it untouched and return false.
    pub fn reset(&mut self, packet: &Packet) -> bool {
        let Some(command) = packet.command_byte() else {
            return false;
        };
        if command == COM_SET_OPTION {
            self.client_multistatement = packet.first_argument().is_some_and(|b| b != 0);
            info!(
                "tee: client {} multistatements",
                if self.client_multistatement {
                    "enabled"
                } else {
                    "disabled"
                }
            );
        }
        let multi = expects_multi_packet_reply(command);
        self.multipacket = [multi; 2];
        self.replies = [0; 2];
        self.reply_packets = [0; 2];
        self.eof = [0; 2];
        self.waiting = [true; 2];
        self.command = command;
        true
    }
}

#[derive(Debug, Default)]
struct SessionState {
    active: bool,
    closed: bool,
    duplicated: u64,
    rejected: u64,
    request: RequestScratch,
}

/// What happened to the branch side of one routed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchOutcome {
    /// Duplication disabled for this session
    Inactive,
    /// Matchers declined to clone
    NotCloned,
    /// Clone forwarded to the branch
    Duplicated,
    /// Branch was not `Ready`; clone dropped and duplication disabled
    Discarded,
    /// Branch refused the clone; duplication disabled
    Failed,
}

/// Read-only view of a session's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Whether duplication is still enabled
    pub active: bool,
    /// Requests cloned onto the branch
    pub duplicated: u64,
    /// Requests not cloned
    pub rejected: u64,
}

/// Duplication state of one client session.
///
/// Request routing and close can run on different threads; the mutable
/// fields sit behind one lock that is never held across a routing call.
/// Dropping the session releases the branch session according to its state.
pub struct TeeSession {
    id: SessionId,
    config: Arc<TeeConfig>,
    branch: Option<Arc<BranchSession>>,
    state: Mutex<SessionState>,
    downstream: Arc<dyn Downstream>,
    upstream: Arc<dyn Upstream>,
    orphans: Arc<OrphanRegistry>,
    stats: Arc<FilterStats>,
}

impl std::fmt::Debug for TeeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeeSession")
            .field("id", &self.id)
            .field("filter", &self.config.name())
            .field("branch", &self.branch)
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// Collaborators a session is wired to.
pub(crate) struct SessionParts {
    pub id: SessionId,
    pub config: Arc<TeeConfig>,
    pub branch: Option<Arc<BranchSession>>,
    pub downstream: Arc<dyn Downstream>,
    pub upstream: Arc<dyn Upstream>,
    pub orphans: Arc<OrphanRegistry>,
    pub stats: Arc<FilterStats>,
}

impl TeeSession {
    pub(crate) fn new(parts: SessionParts) -> Self {
        let active = parts.branch.is_some();
        Self {
            id: parts.id,
            config: parts.config,
            branch: parts.branch,
            state: Mutex::new(SessionState {
                active,
                ..Default::default()
            }),
            downstream: parts.downstream,
            upstream: parts.upstream,
            orphans: parts.orphans,
            stats: parts.stats,
        }
    }

    /// Session identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Whether requests are still being duplicated.
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Branch session, if one was created.
    pub fn branch(&self) -> Option<&Arc<BranchSession>> {
        self.branch.as_ref()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SessionStats {
        let state = self.state.lock();
        SessionStats {
            active: state.active,
            duplicated: state.duplicated,
            rejected: state.rejected,
        }
    }

    /// Copy of the current request bookkeeping.
    pub fn request_scratch(&self) -> RequestScratch {
        self.state.lock().request.clone()
    }

    /// Routes a request: always down the main route, and a clone to the
    /// branch when the decision engine says so.
    ///
    /// The error, if any, is the main route's; the branch step still runs
    /// before it is returned. Branch trouble never fails the request; it
    /// disables duplication and shows in the outcome.
    pub fn route_query(&self, packet: Packet) -> Result<BranchOutcome> {
        let decision = {
            let mut state = self.state.lock();
            state.request.reset(&packet);
            if !state.active || self.branch.is_none() {
                None
            } else {
                let decision = decide(self.config.filter(), &packet);
                match decision {
                    CloneDecision::Clone => {
                        state.duplicated += 1;
                        FilterStats::incr(&self.stats.duplicated);
                    }
                    CloneDecision::Skip => {
                        state.rejected += 1;
                        FilterStats::incr(&self.stats.rejected);
                    }
                }
                Some(decision)
            }
        };

        let clone = decision
            .filter(|d| d.is_clone())
            .map(|_| packet.clone());
        let primary = self.downstream.route_query(packet);

        // The clone goes out whatever the main route said, so session state
        // commands keep the branch in step.
        let outcome = match (decision, clone) {
            (None, _) => BranchOutcome::Inactive,
            (Some(_), Some(clone)) => self.forward_branch(clone),
            (Some(_), None) => BranchOutcome::NotCloned,
        };
        primary.map(|()| outcome)
    }

    fn forward_branch(&self, clone: Packet) -> BranchOutcome {
        let Some(branch) = &self.branch else {
            return BranchOutcome::Inactive;
        };
        if !branch.is_ready() {
            self.deactivate();
            info!(
                session = self.id.0,
                state = ?branch.state(),
                "Closed tee filter session: Child session in invalid state."
            );
            return BranchOutcome::Discarded;
        }
        match branch.route(clone) {
            Ok(()) => BranchOutcome::Duplicated,
            Err(e) => {
                self.deactivate();
                warn!(session = self.id.0, error = %e, "branch refused duplicate, duplication disabled");
                BranchOutcome::Failed
            }
        }
    }

    fn deactivate(&self) {
        let mut state = self.state.lock();
        if state.active {
            state.active = false;
            FilterStats::incr(&self.stats.branch_failures);
        }
    }

    /// Passes a reply towards the client unchanged.
    pub fn client_reply(&self, reply: Packet) -> Result<()> {
        self.upstream.client_reply(reply)
    }

    /// Stops duplication and closes the branch session. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.active = false;
        }
        if let Some(branch) = &self.branch {
            branch.close();
        }
        debug!(session = self.id.0, "tee session closed");
    }
}

impl Drop for TeeSession {
    fn drop(&mut self) {
        if let Some(branch) = self.branch.take() {
            match branch.state() {
                BranchState::Ready => {
                    branch.hand_back();
                }
                BranchState::PendingFree => {
                    branch.free();
                }
                BranchState::Stopping => self.orphans.register(branch),
                BranchState::Freed => {}
            }
        }
        self.orphans.reclaim();
    }
}

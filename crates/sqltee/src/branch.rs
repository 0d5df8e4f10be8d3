//! Branch session lifecycle.
//!
//! A branch session lives on the duplication target. Its status cell is shared
//! with the target's router, which advances it from its own execution context;
//! every routing decision reads the cell, never a cached copy. The router-side
//! resources sit in a lease that is released exactly once, either by freeing
//! them or by handing the session back to the router's own refcounting.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, TeeError};
use crate::packet::Packet;
use crate::router::{ClientInfo, Router, RouterSessionId};
use crate::topology::Service;

/// Branch session state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BranchState {
    /// Usable for routing.
    Ready = 0,
    /// Close requested; other contexts may still hold references.
    Stopping = 1,
    /// No live references and no client handle: safe to free.
    PendingFree = 2,
    /// Router resources released.
    Freed = 3,
}

impl From<u8> for BranchState {
    fn from(value: u8) -> Self {
        match value {
            0 => BranchState::Ready,
            1 => BranchState::Stopping,
            2 => BranchState::PendingFree,
            _ => BranchState::Freed,
        }
    }
}

/// Status cell shared between the tee session and the branch router.
#[derive(Debug)]
pub struct SessionStatus {
    state: AtomicU8,
    refs: AtomicUsize,
    client_attached: AtomicBool,
}

/// RAII guard for one live reference. Decrements the count on drop.
pub struct StatusRef<'a> {
    status: &'a SessionStatus,
}

impl Drop for StatusRef<'_> {
    fn drop(&mut self) {
        self.status.release_ref();
    }
}

impl SessionStatus {
    /// New status: `Ready`, no references, client handle attached.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(BranchState::Ready as u8),
            refs: AtomicUsize::new(0),
            client_attached: AtomicBool::new(true),
        }
    }

    /// Current state.
    pub fn state(&self) -> BranchState {
        BranchState::from(self.state.load(Ordering::SeqCst))
    }

    /// Number of live references held by other contexts.
    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    /// Whether the client-side connection handle is still attached.
    pub fn client_attached(&self) -> bool {
        self.client_attached.load(Ordering::SeqCst)
    }

    /// Moves `Ready` to `Stopping`. Returns false if already past `Ready`.
    pub fn begin_stop(&self) -> bool {
        self.state
            .compare_exchange(
                BranchState::Ready as u8,
                BranchState::Stopping as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Takes a live reference.
    pub fn acquire_ref(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Drops a live reference. Never goes below zero.
    pub fn release_ref(&self) {
        let _ = self
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Takes a live reference for the lifetime of the guard.
    pub fn hold(&self) -> StatusRef<'_> {
        self.acquire_ref();
        StatusRef { status: self }
    }

    /// Marks the client-side connection handle as gone.
    pub fn detach_client(&self) {
        self.client_attached.store(false, Ordering::SeqCst);
    }

    /// True once nothing can reach the session anymore.
    pub fn is_unreferenced(&self) -> bool {
        self.refs() == 0 && !self.client_attached()
    }

    /// Moves `Stopping` to `PendingFree` if the session is unreferenced.
    pub fn promote(&self) -> bool {
        if !self.is_unreferenced() {
            return false;
        }
        self.state
            .compare_exchange(
                BranchState::Stopping as u8,
                BranchState::PendingFree as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    fn mark_freed(&self) {
        self.state.store(BranchState::Freed as u8, Ordering::SeqCst);
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Claim on a router session's resources.
struct RouterLease {
    router: Arc<dyn Router>,
    id: RouterSessionId,
}

impl RouterLease {
    fn free(self) {
        self.router.free_session(self.id);
    }

    fn hand_back(self) {
        self.router.release_session(self.id);
    }
}

/// Session on the branch service, created for one primary session.
pub struct BranchSession {
    service: Arc<Service>,
    id: RouterSessionId,
    status: Arc<SessionStatus>,
    lease: Mutex<Option<RouterLease>>,
}

impl std::fmt::Debug for BranchSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchSession")
            .field("service", &self.service.name())
            .field("id", &self.id)
            .field("state", &self.status.state())
            .field("leased", &self.lease.lock().is_some())
            .finish()
    }
}

impl BranchSession {
    /// Opens a connection handle and a session for `client` on `service`.
    ///
    /// If the session cannot be created the connection handle is closed
    /// again before the error is returned.
    pub fn open(service: &Arc<Service>, client: &ClientInfo) -> Result<Arc<Self>> {
        let router = Arc::clone(service.router());
        let unavailable = |e: TeeError| TeeError::BranchUnavailable {
            service: service.name().to_string(),
            reason: e.to_string(),
        };

        let conn = router.open_connection(client).map_err(unavailable)?;
        let status = Arc::new(SessionStatus::new());
        let id = match router.open_session(conn, Arc::clone(&status)) {
            Ok(id) => id,
            Err(e) => {
                router.close_connection(conn);
                return Err(unavailable(e));
            }
        };

        debug!(service = service.name(), session = id.0, "branch session opened");
        Ok(Arc::new(Self {
            service: Arc::clone(service),
            id,
            status,
            lease: Mutex::new(Some(RouterLease { router, id })),
        }))
    }

    /// Router session identifier.
    pub fn id(&self) -> RouterSessionId {
        self.id
    }

    /// Name of the branch service.
    pub fn service_name(&self) -> &str {
        self.service.name()
    }

    /// Shared status cell.
    pub fn status(&self) -> &Arc<SessionStatus> {
        &self.status
    }

    /// Current state as observed now.
    pub fn state(&self) -> BranchState {
        self.status.state()
    }

    /// Whether the session can take requests.
    pub fn is_ready(&self) -> bool {
        self.state() == BranchState::Ready
    }

    /// Whether the router resources are still held by this handle.
    pub fn is_leased(&self) -> bool {
        self.lease.lock().is_some()
    }

    /// Routes a cloned request. Fails without routing if not `Ready`.
    pub fn route(&self, packet: Packet) -> Result<()> {
        let _hold = self.status.hold();
        if !self.is_ready() {
            return Err(TeeError::BranchUnavailable {
                service: self.service_name().to_string(),
                reason: format!("session in state {:?}", self.state()),
            });
        }
        self.service.router().route_query(self.id, packet)
    }

    /// Marks the session `Stopping` and asks the router to close it.
    pub fn close(&self) {
        if self.status.begin_stop() {
            debug!(session = self.id.0, "branch session stopping");
        }
        if self.is_leased() {
            self.service.router().close_session(self.id);
        }
    }

    /// Frees the router resources. Returns false if they were already
    /// released through this handle.
    pub fn free(&self) -> bool {
        let lease = self.lease.lock().take();
        match lease {
            Some(lease) => {
                lease.free();
                self.status.mark_freed();
                debug!(session = self.id.0, "branch session freed");
                true
            }
            None => false,
        }
    }

    /// Returns the session to the router's own refcounting without freeing it.
    pub fn hand_back(&self) -> bool {
        let lease = self.lease.lock().take();
        match lease {
            Some(lease) => {
                lease.hand_back();
                debug!(session = self.id.0, "branch session handed back");
                true
            }
            None => false,
        }
    }
}

impl Drop for BranchSession {
    fn drop(&mut self) {
        let Some(lease) = self.lease.get_mut().take() else {
            return;
        };
        match self.status.state() {
            BranchState::PendingFree => {
                lease.free();
                self.status.mark_freed();
            }
            state => {
                warn!(
                    session = self.id.0,
                    ?state,
                    "last handle dropped before branch session was freeable"
                );
                lease.hand_back();
            }
        }
    }
}

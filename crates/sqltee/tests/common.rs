//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sqltee::router::{ConnectionId, RouterSessionId};
use sqltee::{
    ClientInfo, Downstream, OrphanRegistry, Packet, Router, Service, ServiceRegistry,
    SessionContext, SessionStatus, TeeError, TeeFilter, TeeParams, TeeSession, Upstream,
};

/// Destination router that records everything done to it.
///
/// Teardown does not complete inside `close_session`; tests advance it with
/// [`MockRouter::finish_teardown`] to model a destination that finishes on
/// another thread.
#[derive(Default)]
pub struct MockRouter {
    next_id: AtomicU64,
    pub fail_connection: AtomicBool,
    pub fail_session: AtomicBool,
    pub fail_route: AtomicBool,
    pub connections_opened: AtomicUsize,
    pub connections_closed: AtomicUsize,
    pub routed: Mutex<Vec<Packet>>,
    pub closed: Mutex<Vec<RouterSessionId>>,
    pub released: Mutex<Vec<RouterSessionId>>,
    frees: Mutex<HashMap<RouterSessionId, usize>>,
    statuses: Mutex<HashMap<RouterSessionId, Arc<SessionStatus>>>,
}

impl MockRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Detaches the client handle and promotes the session if unreferenced.
    pub fn finish_teardown(&self, session: RouterSessionId) -> bool {
        let status = self.statuses.lock().get(&session).cloned();
        match status {
            Some(status) => {
                status.detach_client();
                status.promote()
            }
            None => false,
        }
    }

    /// Detaches the client handle without promoting.
    pub fn detach(&self, session: RouterSessionId) {
        if let Some(status) = self.statuses.lock().get(&session) {
            status.detach_client();
        }
    }

    pub fn frees_of(&self, session: RouterSessionId) -> usize {
        self.frees.lock().get(&session).copied().unwrap_or(0)
    }

    pub fn total_frees(&self) -> usize {
        self.frees.lock().values().sum()
    }

    pub fn routed_count(&self) -> usize {
        self.routed.lock().len()
    }
}

impl Router for MockRouter {
    fn open_connection(&self, _client: &ClientInfo) -> sqltee::Result<ConnectionId> {
        if self.fail_connection.load(Ordering::SeqCst) {
            return Err(TeeError::RouteFailed {
                reason: "no connection".to_string(),
            });
        }
        self.connections_opened.fetch_add(1, Ordering::SeqCst);
        Ok(ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    fn close_connection(&self, _conn: ConnectionId) {
        self.connections_closed.fetch_add(1, Ordering::SeqCst);
    }

    fn open_session(
        &self,
        _conn: ConnectionId,
        status: Arc<SessionStatus>,
    ) -> sqltee::Result<RouterSessionId> {
        if self.fail_session.load(Ordering::SeqCst) {
            return Err(TeeError::RouteFailed {
                reason: "no backend".to_string(),
            });
        }
        let id = RouterSessionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.statuses.lock().insert(id, status);
        Ok(id)
    }

    fn route_query(&self, _session: RouterSessionId, packet: Packet) -> sqltee::Result<()> {
        if self.fail_route.load(Ordering::SeqCst) {
            return Err(TeeError::RouteFailed {
                reason: "backend gone".to_string(),
            });
        }
        self.routed.lock().push(packet);
        Ok(())
    }

    fn close_session(&self, session: RouterSessionId) {
        self.closed.lock().push(session);
    }

    fn release_session(&self, session: RouterSessionId) {
        self.released.lock().push(session);
    }

    fn free_session(&self, session: RouterSessionId) {
        *self.frees.lock().entry(session).or_insert(0) += 1;
    }
}

/// Main route and reply route that keep every packet.
#[derive(Default)]
pub struct RecordingPipe {
    pub requests: Mutex<Vec<Packet>>,
    pub replies: Mutex<Vec<Packet>>,
}

impl Downstream for RecordingPipe {
    fn route_query(&self, packet: Packet) -> sqltee::Result<()> {
        self.requests.lock().push(packet);
        Ok(())
    }
}

impl Upstream for RecordingPipe {
    fn client_reply(&self, reply: Packet) -> sqltee::Result<()> {
        self.replies.lock().push(reply);
        Ok(())
    }
}

/// A primary service, a branch service backed by a [`MockRouter`], and an
/// isolated orphan registry.
pub struct TestTopology {
    pub registry: Arc<ServiceRegistry>,
    pub primary: Arc<Service>,
    pub branch_router: Arc<MockRouter>,
    pub orphans: Arc<OrphanRegistry>,
}

impl TestTopology {
    pub fn new() -> Self {
        let registry = Arc::new(ServiceRegistry::new());
        let primary = registry.define("primary", MockRouter::new());
        let branch_router = MockRouter::new();
        registry.define("shadow", branch_router.clone());
        Self {
            registry,
            primary,
            branch_router,
            orphans: Arc::new(OrphanRegistry::new()),
        }
    }

    pub fn filter(&self, params: TeeParams) -> TeeFilter {
        TeeFilter::create(
            "dup",
            &params,
            Arc::clone(&self.registry),
            Arc::clone(&self.orphans),
        )
        .unwrap()
    }

    pub fn session(
        &self,
        filter: &TeeFilter,
        client: ClientInfo,
    ) -> (TeeSession, Arc<RecordingPipe>) {
        let pipe = Arc::new(RecordingPipe::default());
        let session = filter
            .new_session(SessionContext {
                pipeline: Arc::clone(&self.primary),
                client,
                downstream: pipe.clone(),
                upstream: pipe.clone(),
            })
            .unwrap();
        (session, pipe)
    }
}

pub fn shadow_params() -> TeeParams {
    TeeParams {
        service: Some("shadow".to_string()),
        ..Default::default()
    }
}

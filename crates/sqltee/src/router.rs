//! Interfaces to the host pipeline and to routable destinations.
//!
//! The tee filter never talks to a backend itself. Requests travel down the
//! primary pipeline through a [`Downstream`], replies come back through an
//! [`Upstream`], and the branch service is driven through its [`Router`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::branch::SessionStatus;
use crate::error::Result;
use crate::packet::Packet;

/// Identifier of a client-side connection handle created on a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Identifier of a router session on a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouterSessionId(pub u64);

/// Attributes of the client whose session is being admitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    /// Source address, when the transport knows it
    pub remote: Option<String>,
    /// Authenticated user name, when known
    pub user: Option<String>,
}

impl ClientInfo {
    /// Client with both attributes known.
    pub fn new(remote: &str, user: &str) -> Self {
        Self {
            remote: Some(remote.to_string()),
            user: Some(user.to_string()),
        }
    }
}

/// A routable destination's session subsystem.
///
/// `open_session` receives the shared [`SessionStatus`] of the new session.
/// The destination advances it (client handle detached, references dropped,
/// `PendingFree`) from whatever context its own teardown runs on.
pub trait Router: Send + Sync {
    /// Creates a client-side connection handle cloned from `client`.
    fn open_connection(&self, client: &ClientInfo) -> Result<ConnectionId>;

    /// Releases a connection handle that never got a session.
    fn close_connection(&self, conn: ConnectionId);

    /// Creates a router session bound to `conn`.
    fn open_session(
        &self,
        conn: ConnectionId,
        status: Arc<SessionStatus>,
    ) -> Result<RouterSessionId>;

    /// Routes one request on `session`.
    fn route_query(&self, session: RouterSessionId, packet: Packet) -> Result<()>;

    /// Closes the session's backend connections. Memory is not released.
    fn close_session(&self, session: RouterSessionId);

    /// Drops one reference; the destination frees the session on its own
    /// once nothing else refers to it.
    fn release_session(&self, session: RouterSessionId);

    /// Frees the router session. Called at most once per session.
    fn free_session(&self, session: RouterSessionId);
}

/// Next component on the primary pipeline.
pub trait Downstream: Send + Sync {
    /// Forwards a request along the main route.
    fn route_query(&self, packet: Packet) -> Result<()>;
}

/// Previous component on the reply path.
pub trait Upstream: Send + Sync {
    /// Forwards a reply towards the client.
    fn client_reply(&self, reply: Packet) -> Result<()>;
}

/// Destination that accepts every request and discards it.
///
/// Teardown completes synchronously inside `close_session`, so sessions reach
/// `PendingFree` as soon as they are closed. Used by `sqltee-check`.
#[derive(Debug, Default)]
pub struct DiscardRouter {
    next_id: AtomicU64,
    sessions: DashMap<RouterSessionId, Arc<SessionStatus>>,
}

impl DiscardRouter {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions not yet freed or released.
    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }
}

impl Router for DiscardRouter {
    fn open_connection(&self, _client: &ClientInfo) -> Result<ConnectionId> {
        Ok(ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed)))
    }

    fn close_connection(&self, _conn: ConnectionId) {}

    fn open_session(
        &self,
        _conn: ConnectionId,
        status: Arc<SessionStatus>,
    ) -> Result<RouterSessionId> {
        let id = RouterSessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sessions.insert(id, status);
        Ok(id)
    }

    fn route_query(&self, session: RouterSessionId, packet: Packet) -> Result<()> {
        debug!(session = session.0, bytes = packet.len(), "discarding request");
        Ok(())
    }

    fn close_session(&self, session: RouterSessionId) {
        if let Some(status) = self.sessions.get(&session) {
            status.detach_client();
            status.promote();
        }
    }

    fn release_session(&self, session: RouterSessionId) {
        self.sessions.remove(&session);
    }

    fn free_session(&self, session: RouterSessionId) {
        self.sessions.remove(&session);
    }
}

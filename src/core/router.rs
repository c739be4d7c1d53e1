//! Session and room routing
//!
//! The [`Router`] keeps one tracked connection per user, the room membership
//! of every tracked connection, and fans payloads out to rooms and users.
//! Transport I/O never happens while the routing lock is held: connections
//! are collected under the lock and closed after it is released.

use bytes::Bytes;
use futures_util::future::join_all;
use log::{debug, info, trace};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::constants::{
    CLOSE_GOING_AWAY, CLOSE_SESSION_REPLACED, DEFAULT_WRITE_WAIT, REASON_ROUTER_SHUTDOWN,
    REASON_SESSION_REPLACED,
};
use crate::core::connection::Connection;

/// Counts describing the routing tables at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub sessions: usize,
    pub users: usize,
    pub rooms: usize,
    pub memberships: usize,
}

#[derive(Default)]
struct RouterState {
    /// connection id -> connection
    sessions: HashMap<String, Arc<Connection>>,
    /// user id -> connection id
    user_sessions: HashMap<String, String>,
    /// room id -> connection id -> connection
    rooms: HashMap<String, HashMap<String, Arc<Connection>>>,
    /// connection id -> room ids
    session_rooms: HashMap<String, HashSet<String>>,
}

impl RouterState {
    /// Remove a connection and every membership it holds
    fn detach(&mut self, connection_id: &str) -> Option<Arc<Connection>> {
        let conn = self.sessions.remove(connection_id)?;

        // A replaced connection must not unmap its successor
        if self
            .user_sessions
            .get(conn.user_id())
            .is_some_and(|current| current == connection_id)
        {
            self.user_sessions.remove(conn.user_id());
        }

        if let Some(memberships) = self.session_rooms.remove(connection_id) {
            for room_id in memberships {
                self.remove_member(&room_id, connection_id);
            }
        }

        Some(conn)
    }

    fn remove_member(&mut self, room_id: &str, connection_id: &str) {
        if let Some(members) = self.rooms.get_mut(room_id) {
            members.remove(connection_id);
            if members.is_empty() {
                self.rooms.remove(room_id);
            }
        }
    }

    fn leave(&mut self, room_id: &str, connection_id: &str) {
        self.remove_member(room_id, connection_id);

        if let Some(memberships) = self.session_rooms.get_mut(connection_id) {
            memberships.remove(room_id);
            if memberships.is_empty() {
                self.session_rooms.remove(connection_id);
            }
        }
    }
}

/// Routes payloads to rooms and users over their single active connection
pub struct Router {
    state: RwLock<RouterState>,
    shutdown_wait: Option<Duration>,
}

impl Router {
    /// Create an empty router
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RouterState::default()),
            shutdown_wait: None,
        }
    }

    /// Create an empty router that waits at most `wait` for close frames to
    /// flush when shutting down
    pub fn with_shutdown_wait(wait: Duration) -> Self {
        Self {
            state: RwLock::new(RouterState::default()),
            shutdown_wait: Some(wait),
        }
    }

    /// Track a connection as its user's only session and start its delivery.
    ///
    /// Any connection previously tracked for the same user is untracked and
    /// closed with "session replaced" once the lock is released.
    pub async fn attach(&self, conn: Arc<Connection>) {
        let previous = {
            let mut state = self.state.write().await;

            let existing_id = state.user_sessions.get(conn.user_id()).cloned();
            let previous = existing_id.and_then(|id| state.detach(&id));

            state
                .sessions
                .insert(conn.id().to_string(), Arc::clone(&conn));
            state
                .user_sessions
                .insert(conn.user_id().to_string(), conn.id().to_string());
            previous
        };

        conn.start();
        info!("Attached connection {} for user {}", conn.id(), conn.user_id());

        if let Some(previous) = previous {
            info!(
                "Replacing connection {} for user {}",
                previous.id(),
                previous.user_id()
            );
            previous.close(CLOSE_SESSION_REPLACED, REASON_SESSION_REPLACED);
        }
    }

    /// Untrack a connection and drop all its memberships. No-op when the
    /// connection is not tracked.
    pub async fn detach(&self, conn: &Connection) {
        let removed = self.state.write().await.detach(conn.id());
        if removed.is_some() {
            debug!("Detached connection {} for user {}", conn.id(), conn.user_id());
        }
    }

    /// Add a tracked connection to a room. Untracked connections are ignored,
    /// since a join can race with a detach or a replacement.
    pub async fn join(&self, room_id: &str, conn: &Connection) {
        let mut state = self.state.write().await;

        let Some(tracked) = state.sessions.get(conn.id()).cloned() else {
            debug!(
                "Ignoring join of room {} by untracked connection {}",
                room_id,
                conn.id()
            );
            return;
        };

        state
            .rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(conn.id().to_string(), tracked);
        state
            .session_rooms
            .entry(conn.id().to_string())
            .or_default()
            .insert(room_id.to_string());
    }

    /// Remove a connection from a room
    pub async fn leave(&self, room_id: &str, conn: &Connection) {
        self.state.write().await.leave(room_id, conn.id());
    }

    /// Send a payload to every member of a room, skipping `exclude_user_id`.
    /// Returns how many members accepted the payload.
    pub async fn broadcast(
        &self,
        room_id: &str,
        payload: impl Into<Bytes>,
        exclude_user_id: Option<&str>,
    ) -> usize {
        let payload = payload.into();
        let exclude_user_id = exclude_user_id.filter(|user| !user.is_empty());
        let state = self.state.read().await;

        let Some(members) = state.rooms.get(room_id) else {
            return 0;
        };

        let delivered = members
            .values()
            .filter(|conn| exclude_user_id.map_or(true, |excluded| conn.user_id() != excluded))
            .filter(|conn| conn.send(payload.clone()).is_ok())
            .count();

        trace!(
            "Broadcast to room {} reached {} of {} members",
            room_id,
            delivered,
            members.len()
        );
        delivered
    }

    /// Send a payload to a user's active connection
    pub async fn notify_user(&self, user_id: &str, payload: impl Into<Bytes>) -> bool {
        let conn = {
            let state = self.state.read().await;
            state
                .user_sessions
                .get(user_id)
                .and_then(|id| state.sessions.get(id))
                .cloned()
        };

        match conn {
            Some(conn) => conn.send(payload).is_ok(),
            None => false,
        }
    }

    /// Untrack every connection and close them with "router shutdown".
    ///
    /// The router is left empty and can keep being used.
    pub async fn close(&self) {
        let connections: Vec<Arc<Connection>> = {
            let mut state = self.state.write().await;
            let drained = std::mem::take(&mut *state);
            drained.sessions.into_values().collect()
        };

        if connections.is_empty() {
            return;
        }

        info!("Shutting down router, closing {} connections", connections.len());
        for conn in &connections {
            conn.close(CLOSE_GOING_AWAY, REASON_ROUTER_SHUTDOWN);
        }

        let wait = self.shutdown_wait.unwrap_or(DEFAULT_WRITE_WAIT);
        let flushed = join_all(connections.iter().map(|conn| conn.closed()));
        if timeout(wait, flushed).await.is_err() {
            debug!("Router shutdown finished before all close frames were flushed");
        }
    }

    /// Connection id currently tracked for a user
    pub async fn active_session(&self, user_id: &str) -> Option<String> {
        self.state.read().await.user_sessions.get(user_id).cloned()
    }

    pub async fn is_tracked(&self, conn: &Connection) -> bool {
        self.state.read().await.sessions.contains_key(conn.id())
    }

    /// Connection ids joined to a room
    pub async fn room_members(&self, room_id: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .rooms
            .get(room_id)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Rooms a connection has joined
    pub async fn rooms_of(&self, connection_id: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .session_rooms
            .get(connection_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> RouterStats {
        let state = self.state.read().await;
        RouterStats {
            sessions: state.sessions.len(),
            users: state.user_sessions.len(),
            rooms: state.rooms.len(),
            memberships: state.session_rooms.values().map(HashSet::len).sum(),
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

// Shared reference to the router
pub type SharedRouter = Arc<Router>;

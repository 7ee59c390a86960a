//! Realtime connection handle
//!
//! A [`Connection`] pairs one live transport with its registry metadata:
//! identity, back-references to user and room, lifecycle state and traffic
//! counters.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::transport::Transport;

/// Opaque connection identifier
pub type ConnectionId = String;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Direction of recorded traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Per-connection traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCounters {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Mutable connection metadata
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub state: ConnectionState,
    pub last_activity_at: DateTime<Utc>,
    pub counters: ConnectionCounters,
}

/// One live client connection
pub struct Connection {
    id: ConnectionId,
    transport: Arc<dyn Transport>,
    user_id: Option<String>,
    room_id: Option<String>,
    created_at: DateTime<Utc>,
    meta: RwLock<ConnectionMeta>,
}

impl Connection {
    /// Create a connection in the `Connecting` state with a fresh id
    pub fn new(
        transport: Arc<dyn Transport>,
        user_id: Option<String>,
        room_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            transport,
            user_id,
            room_id,
            created_at: now,
            meta: RwLock::new(ConnectionMeta {
                state: ConnectionState::Connecting,
                last_activity_at: now,
                counters: ConnectionCounters::default(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn state(&self) -> ConnectionState {
        self.meta.read().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.meta.read().last_activity_at
    }

    pub fn counters(&self) -> ConnectionCounters {
        self.meta.read().counters
    }

    /// Snapshot of the mutable metadata
    pub fn meta(&self) -> ConnectionMeta {
        self.meta.read().clone()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.meta.write().state = state;
    }

    /// Move into `Disconnecting` unless teardown already started.
    ///
    /// Returns `false` when another caller owns the teardown.
    pub(crate) fn begin_disconnect(&self) -> bool {
        let mut meta = self.meta.write();
        match meta.state {
            ConnectionState::Disconnecting | ConnectionState::Disconnected => false,
            ConnectionState::Connecting | ConnectionState::Connected => {
                meta.state = ConnectionState::Disconnecting;
                true
            }
        }
    }

    pub(crate) fn record_activity_at(&self, bytes: u64, direction: Direction, at: DateTime<Utc>) {
        let mut meta = self.meta.write();
        meta.last_activity_at = at;
        match direction {
            Direction::Inbound => {
                meta.counters.messages_received += 1;
                meta.counters.bytes_received += bytes;
            }
            Direction::Outbound => {
                meta.counters.messages_sent += 1;
                meta.counters.bytes_sent += bytes;
            }
        }
    }

    /// Override the activity timestamp, used when replaying or aging connections
    pub fn set_last_activity_at(&self, at: DateTime<Utc>) {
        self.meta.write().last_activity_at = at;
    }

    /// Idle longer than `timeout` as of `now` (strictly greater)
    pub fn is_stale_at(&self, timeout: std::time::Duration, now: DateTime<Utc>) -> bool {
        match (now - self.last_activity_at()).to_std() {
            Ok(idle) => idle > timeout,
            // Activity recorded after `now`
            Err(_) => false,
        }
    }

    /// Connection age in seconds
    pub fn age_seconds(&self) -> i64 {
        (Utc::now() - self.created_at).num_seconds()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("room_id", &self.room_id)
            .field("created_at", &self.created_at)
            .field("meta", &*self.meta.read())
            .finish()
    }
}

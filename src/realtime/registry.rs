//! Connection registry
//!
//! The registry is the single owner of connection membership. `by_id` is the
//! authoritative store; `by_user`, `by_room` and `by_channel` are secondary
//! indexes of connection ids. All maps sit behind one mutex so that removing a
//! connection clears every index in a single critical section. The lock is
//! never held across an await point.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use super::connection::{Connection, ConnectionId, Direction};

type Index = HashMap<String, HashSet<ConnectionId>>;

#[derive(Default)]
struct RegistryInner {
    by_id: HashMap<ConnectionId, Arc<Connection>>,
    by_user: Index,
    by_room: Index,
    by_channel: Index,
}

impl RegistryInner {
    fn remove(&mut self, id: &str) -> Option<Arc<Connection>> {
        let connection = self.by_id.remove(id)?;

        if let Some(user_id) = connection.user_id() {
            discard(&mut self.by_user, user_id, id);
        }
        if let Some(room_id) = connection.room_id() {
            discard(&mut self.by_room, room_id, id);
        }
        self.by_channel.retain(|_, members| {
            members.remove(id);
            !members.is_empty()
        });

        Some(connection)
    }

    fn resolve(&self, index: &Index, key: &str) -> Vec<Arc<Connection>> {
        index
            .get(key)
            .map(|ids| ids.iter().filter_map(|id| self.by_id.get(id).cloned()).collect())
            .unwrap_or_default()
    }
}

fn discard(index: &mut Index, key: &str, id: &str) {
    if let Some(members) = index.get_mut(key) {
        members.remove(id);
        if members.is_empty() {
            index.remove(key);
        }
    }
}

/// Registry of live connections with user, room and channel indexes
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a registry admitting at most `max_connections` connections
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            max_connections,
        }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Register a connection.
    ///
    /// Returns `false` without mutating anything when the registry is full.
    pub fn add(&self, connection: Arc<Connection>) -> bool {
        let mut inner = self.inner.lock();
        if inner.by_id.len() >= self.max_connections {
            return false;
        }

        let id = connection.id().to_string();
        if let Some(user_id) = connection.user_id() {
            inner
                .by_user
                .entry(user_id.to_string())
                .or_default()
                .insert(id.clone());
        }
        if let Some(room_id) = connection.room_id() {
            inner
                .by_room
                .entry(room_id.to_string())
                .or_default()
                .insert(id.clone());
        }
        inner.by_id.insert(id.clone(), connection);

        debug!(connection_id = %id, size = inner.by_id.len(), "Connection added to registry");
        true
    }

    /// Remove a connection from every index. Unknown ids are ignored.
    pub fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        let removed = self.inner.lock().remove(id);
        if removed.is_some() {
            debug!(connection_id = %id, "Connection removed from registry");
        }
        removed
    }

    /// Get connection by id
    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.inner.lock().by_id.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().by_id.contains_key(id)
    }

    /// Number of registered connections
    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every registered id
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.inner.lock().by_id.keys().cloned().collect()
    }

    /// Snapshot of every registered connection
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.lock().by_id.values().cloned().collect()
    }

    /// Add `id` to `channel`. Returns `false` if the id is unknown.
    pub fn subscribe(&self, id: &str, channel: &str) -> bool {
        let mut inner = self.inner.lock();
        if !inner.by_id.contains_key(id) {
            return false;
        }
        inner
            .by_channel
            .entry(channel.to_string())
            .or_default()
            .insert(id.to_string());
        true
    }

    /// Remove `id` from `channel`. Returns `false` if the id is unknown.
    pub fn unsubscribe(&self, id: &str, channel: &str) -> bool {
        let mut inner = self.inner.lock();
        if !inner.by_id.contains_key(id) {
            return false;
        }
        discard(&mut inner.by_channel, channel, id);
        true
    }

    pub fn is_subscribed(&self, id: &str, channel: &str) -> bool {
        self.inner
            .lock()
            .by_channel
            .get(channel)
            .is_some_and(|members| members.contains(id))
    }

    /// Channels a connection belongs to
    pub fn channels_of(&self, id: &str) -> Vec<String> {
        self.inner
            .lock()
            .by_channel
            .iter()
            .filter(|(_, members)| members.contains(id))
            .map(|(channel, _)| channel.clone())
            .collect()
    }

    pub fn connections_for_channel(&self, channel: &str) -> Vec<Arc<Connection>> {
        let inner = self.inner.lock();
        inner.resolve(&inner.by_channel, channel)
    }

    pub fn connections_for_user(&self, user_id: &str) -> Vec<Arc<Connection>> {
        let inner = self.inner.lock();
        inner.resolve(&inner.by_user, user_id)
    }

    pub fn connections_for_room(&self, room_id: &str) -> Vec<Arc<Connection>> {
        let inner = self.inner.lock();
        inner.resolve(&inner.by_room, room_id)
    }

    /// Record traffic for a connection. Unknown ids are ignored.
    pub fn record_activity(&self, id: &str, bytes: u64, direction: Direction) {
        if let Some(connection) = self.get(id) {
            connection.record_activity_at(bytes, direction, Utc::now());
        }
    }

    /// Remove every connection idle longer than `timeout`
    pub fn sweep_stale(&self, timeout: std::time::Duration) -> usize {
        self.drain_stale_at(timeout, Utc::now()).len()
    }

    /// Remove and return every connection idle longer than `timeout` as of `now`
    pub fn drain_stale_at(
        &self,
        timeout: std::time::Duration,
        now: DateTime<Utc>,
    ) -> Vec<Arc<Connection>> {
        let mut inner = self.inner.lock();

        let stale: Vec<ConnectionId> = inner
            .by_id
            .values()
            .filter(|connection| connection.is_stale_at(timeout, now))
            .map(|connection| connection.id().to_string())
            .collect();

        let removed: Vec<Arc<Connection>> = stale.iter().filter_map(|id| inner.remove(id)).collect();
        if !removed.is_empty() {
            info!(removed = removed.len(), "Swept stale connections");
        }
        removed
    }

    /// Connection count per room
    pub fn room_counts(&self) -> HashMap<String, usize> {
        let inner = self.inner.lock();
        inner
            .by_room
            .iter()
            .map(|(room, members)| (room.clone(), members.len()))
            .collect()
    }

    /// Connection count per user
    pub fn user_counts(&self) -> HashMap<String, usize> {
        let inner = self.inner.lock();
        inner
            .by_user
            .iter()
            .map(|(user, members)| (user.clone(), members.len()))
            .collect()
    }

    /// Number of channels with at least one subscriber
    pub fn channel_count(&self) -> usize {
        self.inner.lock().by_channel.len()
    }

    /// Whether `id` appears in any index, including secondary ones
    pub fn references(&self, id: &str) -> bool {
        let inner = self.inner.lock();
        let indexed = |index: &Index| index.values().any(|members| members.contains(id));
        inner.by_id.contains_key(id)
            || indexed(&inner.by_user)
            || indexed(&inner.by_room)
            || indexed(&inner.by_channel)
    }
}

//! Connection manager
//!
//! The manager is the façade the rest of the service talks to. It accepts
//! connections up to the configured capacity, routes personal sends, pushes
//! room broadcasts through the [`MessageBatcher`], runs the heartbeat and
//! stale-cleanup loops, and reports aggregate statistics.
//!
//! Delivery failures are contained at the narrowest scope: a failed write
//! disconnects that one connection and is reported to the caller as a count,
//! never as an error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

use super::{
    batcher::{BatchConfig, ChannelBroadcast, MessageBatcher},
    connection::{Connection, ConnectionId, ConnectionState, Direction},
    history::{HistoryEntry, HistoryTarget, MessageHistory},
    metrics,
    protocol::{room_channel, ServerMessage},
    registry::ConnectionRegistry,
    sink::{NoopStatsSink, StatsSink},
    transport::{Transport, CLOSE_GOING_AWAY, CLOSE_NORMAL},
    RealtimeConfig,
};

/// Running totals kept alongside the registry
#[derive(Debug, Clone, Default)]
struct ConnectionTotals {
    total_connections: u64,
    rejected_connections: u64,
    messages_sent: u64,
    messages_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
    connection_errors: u64,
}

/// Point-in-time statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeStats {
    pub active_connections: usize,
    pub total_connections: u64,
    pub rejected_connections: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_transferred: u64,
    pub connection_errors: u64,
    pub per_room_counts: HashMap<String, usize>,
    pub per_user_counts: HashMap<String, usize>,
    pub channel_count: usize,
    pub pending_messages: usize,
    pub uptime_seconds: i64,
}

/// Outcome of one cleanup pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub reaped: usize,
    pub stats_published: bool,
}

/// Connection errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Connection capacity of {max} reached")]
    CapacityExceeded { max: usize },
    #[error("Server is shutting down")]
    ShuttingDown,
    #[error("Connection handshake failed")]
    HandshakeFailed,
}

/// Delivery half of the manager, shared with the batcher
struct DeliveryCore {
    registry: Arc<ConnectionRegistry>,
    stats: RwLock<ConnectionTotals>,
    history: MessageHistory,
}

impl DeliveryCore {
    /// Write pre-encoded text to a connection.
    ///
    /// Only `Connected` connections are written to. A failed write tears the
    /// connection down.
    async fn send_text(&self, connection: &Arc<Connection>, text: &str) -> bool {
        if !connection.is_connected() {
            return false;
        }

        match connection.transport().send_text(text.to_string()).await {
            Ok(()) => {
                let bytes = text.len() as u64;
                self.registry
                    .record_activity(connection.id(), bytes, Direction::Outbound);
                {
                    let mut stats = self.stats.write();
                    stats.messages_sent += 1;
                    stats.bytes_sent += bytes;
                }
                metrics::record_message_sent();
                true
            }
            Err(e) => {
                warn!(
                    connection_id = %connection.id(),
                    error = %e,
                    "Failed to send message to connection"
                );
                self.stats.write().connection_errors += 1;
                metrics::record_send_error();
                self.teardown(connection, CLOSE_NORMAL, "send failed").await;
                false
            }
        }
    }

    async fn send_to_connection(&self, id: &str, message: &ServerMessage) -> bool {
        let Some(connection) = self.registry.get(id) else {
            return false;
        };

        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!(connection_id = %id, error = %e, "Failed to encode message");
                return false;
            }
        };

        self.send_text(&connection, &text).await
    }

    /// Send the same text to many connections concurrently, returning successes
    async fn fan_out(&self, connections: &[Arc<Connection>], text: &str) -> usize {
        join_all(connections.iter().map(|connection| self.send_text(connection, text)))
            .await
            .into_iter()
            .filter(|delivered| *delivered)
            .count()
    }

    async fn disconnect(&self, id: &str, code: u16, reason: &str) -> bool {
        match self.registry.get(id) {
            Some(connection) => self.teardown(&connection, code, reason).await,
            None => false,
        }
    }

    /// Run the `Disconnecting -> Disconnected` transition.
    ///
    /// Returns `false` if another caller already started it.
    async fn teardown(&self, connection: &Arc<Connection>, code: u16, reason: &str) -> bool {
        if !connection.begin_disconnect() {
            return false;
        }

        if let Err(e) = connection.transport().close(code, reason).await {
            debug!(connection_id = %connection.id(), error = %e, "Transport close failed");
        }

        self.registry.remove(connection.id());
        connection.set_state(ConnectionState::Disconnected);
        metrics::record_disconnection(connection.age_seconds() as f64);

        info!(
            connection_id = %connection.id(),
            user_id = ?connection.user_id(),
            room_id = ?connection.room_id(),
            reason = reason,
            "Connection disconnected"
        );
        true
    }
}

#[async_trait]
impl ChannelBroadcast for DeliveryCore {
    async fn broadcast_to_channel(&self, channel: &str, message: &ServerMessage) -> usize {
        let subscribers = self.registry.connections_for_channel(channel);
        if subscribers.is_empty() {
            debug!(channel = %channel, "No subscribers for channel broadcast");
            return 0;
        }

        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!(channel = %channel, error = %e, "Failed to encode broadcast");
                return 0;
            }
        };

        let delivered = self.fan_out(&subscribers, &text).await;

        let message_count = match message {
            ServerMessage::Batch { count, .. } => *count,
            _ => 1,
        };
        self.history.record(HistoryEntry {
            target: HistoryTarget::Channel(channel.to_string()),
            message_type: message.kind(),
            message_count,
            recipients: delivered,
            timestamp: Utc::now(),
        });

        delivered
    }
}

/// Connection manager
pub struct ConnectionManager {
    config: RealtimeConfig,
    core: Arc<DeliveryCore>,
    batcher: Arc<MessageBatcher>,
    stats_sink: Arc<dyn StatsSink>,
    accepting: AtomicBool,
    started_at: DateTime<Utc>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a manager that discards stats snapshots
    pub fn new(config: RealtimeConfig) -> Self {
        Self::with_stats_sink(config, Arc::new(NoopStatsSink))
    }

    /// Create a manager mirroring stats snapshots to `stats_sink`
    pub fn with_stats_sink(config: RealtimeConfig, stats_sink: Arc<dyn StatsSink>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.max_connections));
        let core = Arc::new(DeliveryCore {
            registry,
            stats: RwLock::new(ConnectionTotals::default()),
            history: MessageHistory::new(config.history_capacity),
        });
        let batcher = Arc::new(MessageBatcher::new(
            BatchConfig {
                batch_size: config.batch_size,
                batch_window: config.batch_window(),
            },
            core.clone(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            core,
            batcher,
            stats_sink,
            accepting: AtomicBool::new(true),
            started_at: Utc::now(),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.core.registry
    }

    pub fn batcher(&self) -> &Arc<MessageBatcher> {
        &self.batcher
    }

    pub fn history(&self) -> &MessageHistory {
        &self.core.history
    }

    /// Whether new connections are admitted
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Number of registered connections
    pub fn connection_count(&self) -> usize {
        self.core.registry.len()
    }

    /// Accept a transport as a new connection.
    ///
    /// At capacity the transport is closed with the configured overload code
    /// and nothing is registered. On success the connection is `Connected`,
    /// subscribed to its room channel, and has been sent
    /// `connection_established`.
    pub async fn connect(
        &self,
        transport: Arc<dyn Transport>,
        user_id: Option<String>,
        room_id: Option<String>,
    ) -> Result<ConnectionId, ConnectError> {
        if !self.is_accepting() {
            if let Err(e) = transport.close(CLOSE_GOING_AWAY, "server shutting down").await {
                debug!(error = %e, "Failed to close transport during shutdown");
            }
            return Err(ConnectError::ShuttingDown);
        }

        let connection = Arc::new(Connection::new(transport.clone(), user_id, room_id));
        let id = connection.id().to_string();

        if !self.core.registry.add(connection.clone()) {
            self.core.stats.write().rejected_connections += 1;
            metrics::record_rejection();
            warn!(
                max_connections = self.config.max_connections,
                "Connection rejected, server at capacity"
            );
            if let Err(e) = transport
                .close(self.config.overload_close_code, "server at capacity")
                .await
            {
                debug!(error = %e, "Failed to close rejected transport");
            }
            return Err(ConnectError::CapacityExceeded {
                max: self.config.max_connections,
            });
        }

        connection.set_state(ConnectionState::Connected);
        self.core.stats.write().total_connections += 1;
        metrics::record_connection();

        // Shutdown may have snapshotted the registry before this add landed
        if !self.is_accepting() {
            self.core
                .teardown(&connection, CLOSE_GOING_AWAY, "server shutting down")
                .await;
            return Err(ConnectError::ShuttingDown);
        }

        if let Some(room_id) = connection.room_id() {
            self.core.registry.subscribe(&id, &room_channel(room_id));
        }

        let established = ServerMessage::ConnectionEstablished {
            connection_id: id.clone(),
            timestamp: Utc::now(),
        };
        if !self.core.send_to_connection(&id, &established).await {
            return Err(ConnectError::HandshakeFailed);
        }

        info!(
            connection_id = %id,
            user_id = ?connection.user_id(),
            room_id = ?connection.room_id(),
            active = self.core.registry.len(),
            "Connection established"
        );
        Ok(id)
    }

    /// Disconnect a connection. Unknown or already-disconnected ids are a no-op.
    pub async fn disconnect(&self, id: &str) {
        self.core.disconnect(id, CLOSE_NORMAL, "disconnected").await;
    }

    /// Send one envelope to one connection.
    ///
    /// Returns `false` if the connection is unknown, not `Connected`, or the
    /// write failed (in which case it has been disconnected).
    pub async fn send_to_connection(&self, id: &str, message: &ServerMessage) -> bool {
        self.core.send_to_connection(id, message).await
    }

    /// Queue an envelope for every connection in a room.
    ///
    /// Returns the room's connection count at call time; delivery happens when
    /// the room channel's batch flushes.
    pub async fn broadcast_to_room(&self, room_id: &str, message: ServerMessage) -> usize {
        let subscribers = self.core.registry.connections_for_room(room_id).len();
        self.batcher.enqueue(&room_channel(room_id), message).await;
        subscribers
    }

    /// Queue an envelope for every subscriber of a channel.
    ///
    /// Returns the channel's subscriber count at call time.
    pub async fn broadcast_to_channel(&self, channel: &str, message: ServerMessage) -> usize {
        let subscribers = self.core.registry.connections_for_channel(channel).len();
        self.batcher.enqueue(channel, message).await;
        subscribers
    }

    /// Send an envelope to every connection of a user, bypassing batching.
    ///
    /// Returns the number of successful sends.
    pub async fn broadcast_to_user(&self, user_id: &str, message: &ServerMessage) -> usize {
        let connections = self.core.registry.connections_for_user(user_id);
        if connections.is_empty() {
            return 0;
        }

        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!(user_id = %user_id, error = %e, "Failed to encode user message");
                return 0;
            }
        };

        let delivered = self.core.fan_out(&connections, &text).await;
        self.core.history.record(HistoryEntry {
            target: HistoryTarget::User(user_id.to_string()),
            message_type: message.kind(),
            message_count: 1,
            recipients: delivered,
            timestamp: Utc::now(),
        });
        delivered
    }

    /// Subscribe a connection to a channel. Returns `false` for unknown ids.
    pub fn subscribe(&self, id: &str, channel: &str) -> bool {
        self.core.registry.subscribe(id, channel)
    }

    /// Unsubscribe a connection from a channel. Returns `false` for unknown ids.
    pub fn unsubscribe(&self, id: &str, channel: &str) -> bool {
        self.core.registry.unsubscribe(id, channel)
    }

    /// Account for one inbound frame of `bytes` bytes
    pub fn record_inbound(&self, id: &str, bytes: u64) {
        if !self.core.registry.contains(id) {
            return;
        }
        self.core.registry.record_activity(id, bytes, Direction::Inbound);
        {
            let mut stats = self.core.stats.write();
            stats.messages_received += 1;
            stats.bytes_received += bytes;
        }
        metrics::record_message_received();
    }

    /// Get statistics
    pub fn stats(&self) -> RealtimeStats {
        let totals = self.core.stats.read().clone();
        let registry = &self.core.registry;

        RealtimeStats {
            active_connections: registry.len(),
            total_connections: totals.total_connections,
            rejected_connections: totals.rejected_connections,
            messages_sent: totals.messages_sent,
            messages_received: totals.messages_received,
            bytes_transferred: totals.bytes_sent + totals.bytes_received,
            connection_errors: totals.connection_errors,
            per_room_counts: registry.room_counts(),
            per_user_counts: registry.user_counts(),
            channel_count: registry.channel_count(),
            pending_messages: self.batcher.total_pending(),
            uptime_seconds: (Utc::now() - self.started_at).num_seconds(),
        }
    }

    /// Send a heartbeat to every connected connection.
    ///
    /// Returns the number delivered. Failed sends disconnect their connection.
    pub async fn heartbeat_tick(&self) -> usize {
        let connections: Vec<Arc<Connection>> = self
            .core
            .registry
            .connections()
            .into_iter()
            .filter(|connection| connection.is_connected())
            .collect();
        if connections.is_empty() {
            return 0;
        }

        let text = match ServerMessage::heartbeat().to_json() {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "Failed to encode heartbeat");
                return 0;
            }
        };
        self.core.fan_out(&connections, &text).await
    }

    /// Reap stale connections and publish a stats snapshot
    pub async fn cleanup_tick(&self) -> CleanupReport {
        let stale = self
            .core
            .registry
            .drain_stale_at(self.config.stale_timeout(), Utc::now());

        for connection in &stale {
            self.core
                .teardown(connection, CLOSE_GOING_AWAY, "connection idle")
                .await;
        }
        if !stale.is_empty() {
            metrics::record_stale_reaped(stale.len());
        }

        let snapshot = self.stats();
        let stats_published = match self.stats_sink.publish(&snapshot).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to publish realtime stats");
                metrics::record_stats_publish_error();
                false
            }
        };

        CleanupReport {
            reaped: stale.len(),
            stats_published,
        }
    }

    /// Spawn the heartbeat and cleanup loops
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("Realtime background loops already running");
            return;
        }

        let heartbeat_every = self.config.heartbeat_interval();
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let delivered = manager.heartbeat_tick().await;
                        debug!(delivered, "Heartbeat sent");
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!("Heartbeat loop stopped");
        }));

        let cleanup_every = self.config.cleanup_interval();
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + cleanup_every, cleanup_every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = manager.cleanup_tick().await;
                        debug!(
                            reaped = report.reaped,
                            stats_published = report.stats_published,
                            "Realtime cleanup pass complete"
                        );
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!("Cleanup loop stopped");
        }));

        info!(
            heartbeat_secs = self.config.heartbeat_interval_secs,
            cleanup_secs = self.config.cleanup_interval_secs,
            "Realtime background loops started"
        );
    }

    /// Stop accepting, stop the loops, flush pending batches and disconnect
    /// every remaining connection.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down realtime connection manager");

        self.shutdown_tx.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background loop ended abnormally");
            }
        }

        let flushed = self.batcher.flush_all().await;

        let ids = self.core.registry.ids();
        let total = ids.len();
        for id in ids {
            self.core
                .disconnect(&id, CLOSE_GOING_AWAY, "server shutting down")
                .await;
        }

        info!(
            flushed_recipients = flushed,
            disconnected = total,
            "Realtime connection manager stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::transport::{ChannelTransport, OutboundFrame, TransportError};
    use crate::realtime::sink::SinkError;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct FailingTransport;

    #[async_trait]
    impl Transport for FailingTransport {
        async fn send_text(&self, _text: String) -> Result<(), TransportError> {
            Err(TransportError::Io("connection reset".to_string()))
        }

        async fn close(&self, _code: u16, _reason: &str) -> Result<(), TransportError> {
            Err(TransportError::Closed)
        }
    }

    struct FailingSink;

    #[async_trait]
    impl StatsSink for FailingSink {
        async fn publish(&self, _stats: &RealtimeStats) -> Result<(), SinkError> {
            Err(SinkError::Publish("cache unavailable".to_string()))
        }
    }

    fn config(max_connections: usize) -> RealtimeConfig {
        RealtimeConfig {
            max_connections,
            batch_window_millis: 20,
            ..Default::default()
        }
    }

    fn transport() -> (Arc<dyn Transport>, mpsc::Receiver<OutboundFrame>) {
        let (transport, rx) = ChannelTransport::new(64);
        (Arc::new(transport), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<OutboundFrame>) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn text_types(frames: &[OutboundFrame]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|frame| match frame {
                OutboundFrame::Text(text) => {
                    let value: serde_json::Value = serde_json::from_str(text).unwrap();
                    Some(value["type"].as_str().unwrap().to_string())
                }
                OutboundFrame::Close { .. } => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_connect_sends_established_and_subscribes_room() {
        let manager = ConnectionManager::new(config(10));
        let (t, mut rx) = transport();

        let id = manager
            .connect(t, Some("u1".to_string()), Some("42".to_string()))
            .await
            .unwrap();

        assert_eq!(manager.connection_count(), 1);
        assert!(manager.registry().is_subscribed(&id, "room:42"));
        assert_eq!(
            manager.registry().get(&id).unwrap().state(),
            ConnectionState::Connected
        );

        let frames = drain(&mut rx);
        assert_eq!(text_types(&frames), vec!["connection_established"]);
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let manager = ConnectionManager::new(config(3));
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (t, rx) = transport();
            receivers.push(rx);
            assert!(manager.connect(t, None, None).await.is_ok());
        }

        let (t, mut rx) = transport();
        let result = manager.connect(t, None, None).await;
        assert!(matches!(result, Err(ConnectError::CapacityExceeded { max: 3 })));
        assert_eq!(manager.connection_count(), 3);
        assert_eq!(
            drain(&mut rx),
            vec![OutboundFrame::Close {
                code: 1013,
                reason: "server at capacity".to_string()
            }]
        );
        assert_eq!(manager.stats().rejected_connections, 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_clears_indexes() {
        let manager = ConnectionManager::new(config(10));
        let (t, mut rx) = transport();
        let id = manager
            .connect(t, Some("u1".to_string()), Some("42".to_string()))
            .await
            .unwrap();
        manager.subscribe(&id, "room:42:checkins");

        manager.disconnect(&id).await;
        manager.disconnect(&id).await;
        manager.disconnect("never-existed").await;

        assert!(!manager.registry().references(&id));
        assert!(!manager.send_to_connection(&id, &ServerMessage::heartbeat()).await);

        let closes: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|frame| matches!(frame, OutboundFrame::Close { .. }))
            .collect();
        assert_eq!(closes.len(), 1);
    }

    #[tokio::test]
    async fn test_send_failure_disconnects() {
        let manager = ConnectionManager::new(config(10));
        let (t, _rx) = transport();
        let id = manager.connect(t, None, None).await.unwrap();

        let failing = Arc::new(Connection::new(Arc::new(FailingTransport), None, None));
        failing.set_state(ConnectionState::Connected);
        let failing_id = failing.id().to_string();
        manager.registry().add(failing);

        assert!(!manager.send_to_connection(&failing_id, &ServerMessage::heartbeat()).await);
        assert!(!manager.registry().contains(&failing_id));
        assert!(manager.send_to_connection(&id, &ServerMessage::heartbeat()).await);
        assert_eq!(manager.stats().connection_errors, 1);
    }

    #[tokio::test]
    async fn test_handshake_failure_leaves_no_trace() {
        let manager = ConnectionManager::new(config(10));
        let result = manager
            .connect(Arc::new(FailingTransport), Some("u1".to_string()), Some("1".to_string()))
            .await;

        assert!(matches!(result, Err(ConnectError::HandshakeFailed)));
        assert!(manager.registry().is_empty());
        assert!(manager.registry().room_counts().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_to_user_bypasses_batching() {
        let manager = ConnectionManager::new(config(10));
        let (t1, mut rx1) = transport();
        let (t2, mut rx2) = transport();
        let (t3, mut rx3) = transport();
        manager.connect(t1, Some("u1".to_string()), Some("1".to_string())).await.unwrap();
        manager.connect(t2, Some("u1".to_string()), Some("2".to_string())).await.unwrap();
        manager.connect(t3, Some("u2".to_string()), Some("1".to_string())).await.unwrap();
        drain(&mut rx1);
        drain(&mut rx2);
        drain(&mut rx3);

        let message = ServerMessage::AdminNotification {
            data: json!({ "notice": "vendor approved" }),
        };
        assert_eq!(manager.broadcast_to_user("u1", &message).await, 2);
        assert_eq!(manager.broadcast_to_user("nobody", &message).await, 0);

        assert_eq!(text_types(&drain(&mut rx1)), vec!["admin_notification"]);
        assert_eq!(text_types(&drain(&mut rx2)), vec!["admin_notification"]);
        assert!(drain(&mut rx3).is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_to_room_returns_count_at_call_time() {
        let manager = ConnectionManager::new(config(10));
        let (t1, _rx1) = transport();
        let (t2, _rx2) = transport();
        manager.connect(t1, None, Some("7".to_string())).await.unwrap();
        manager.connect(t2, None, Some("7".to_string())).await.unwrap();

        let message = ServerMessage::StatsUpdate {
            data: json!({ "checkedIn": 12 }),
            timestamp: Utc::now(),
        };
        assert_eq!(manager.broadcast_to_room("7", message.clone()).await, 2);
        assert_eq!(manager.broadcast_to_room("empty", message).await, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_tick() {
        let manager = ConnectionManager::new(config(10));
        let (t1, mut rx1) = transport();
        let (t2, mut rx2) = transport();
        manager.connect(t1, None, None).await.unwrap();
        manager.connect(t2, None, None).await.unwrap();
        drain(&mut rx1);
        drain(&mut rx2);

        assert_eq!(manager.heartbeat_tick().await, 2);
        assert_eq!(text_types(&drain(&mut rx1)), vec!["heartbeat"]);
        assert_eq!(text_types(&drain(&mut rx2)), vec!["heartbeat"]);
    }

    #[tokio::test]
    async fn test_cleanup_reaps_stale_and_survives_sink_failure() {
        let manager = ConnectionManager::with_stats_sink(config(10), Arc::new(FailingSink));
        let (t1, mut rx1) = transport();
        let (t2, _rx2) = transport();
        let stale = manager.connect(t1, None, Some("1".to_string())).await.unwrap();
        let fresh = manager.connect(t2, None, Some("1".to_string())).await.unwrap();

        manager
            .registry()
            .get(&stale)
            .unwrap()
            .set_last_activity_at(Utc::now() - chrono::Duration::seconds(3600));

        let report = manager.cleanup_tick().await;
        assert_eq!(report.reaped, 1);
        assert!(!report.stats_published);
        assert!(!manager.registry().contains(&stale));
        assert!(manager.registry().contains(&fresh));
        assert!(drain(&mut rx1)
            .iter()
            .any(|frame| matches!(frame, OutboundFrame::Close { code: 1001, .. })));

        // The next pass still runs
        let report = manager.cleanup_tick().await;
        assert_eq!(report.reaped, 0);
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let manager = ConnectionManager::new(config(10));
        let (t1, _rx1) = transport();
        let (t2, _rx2) = transport();
        let id = manager
            .connect(t1, Some("u1".to_string()), Some("42".to_string()))
            .await
            .unwrap();
        manager.connect(t2, Some("u2".to_string()), Some("42".to_string())).await.unwrap();
        manager.record_inbound(&id, 30);

        let stats = manager.stats();
        assert_eq!(stats.active_connections, 2);
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.messages_received, 1);
        assert!(stats.bytes_transferred > 30);
        assert_eq!(stats.per_room_counts.get("42"), Some(&2));
        assert_eq!(stats.per_user_counts.get("u1"), Some(&1));

        let value = serde_json::to_value(&stats).unwrap();
        assert!(value.get("activeConnections").is_some());
        assert!(value.get("perRoomCounts").is_some());
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_and_refuses_new_connections() {
        let manager = Arc::new(ConnectionManager::new(RealtimeConfig {
            batch_window_millis: 60_000,
            ..config(10)
        }));
        manager.start();

        let (t1, mut rx1) = transport();
        manager.connect(t1, None, Some("5".to_string())).await.unwrap();
        drain(&mut rx1);

        manager
            .broadcast_to_room(
                "5",
                ServerMessage::GuestUpdate {
                    data: json!({ "guest": "ana" }),
                    timestamp: Utc::now(),
                },
            )
            .await;

        tokio::time::timeout(Duration::from_secs(5), manager.shutdown())
            .await
            .expect("shutdown should complete");

        assert!(manager.registry().is_empty());
        assert!(!manager.is_accepting());

        let frames = drain(&mut rx1);
        assert_eq!(text_types(&frames), vec!["batch"]);
        assert!(matches!(frames.last(), Some(OutboundFrame::Close { code: 1001, .. })));

        let (t2, mut rx2) = transport();
        let result = manager.connect(t2, None, None).await;
        assert!(matches!(result, Err(ConnectError::ShuttingDown)));
        assert!(matches!(
            drain(&mut rx2).as_slice(),
            [OutboundFrame::Close { code: 1001, .. }]
        ));
    }
}

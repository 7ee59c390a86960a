//! Realtime connection and broadcast layer
//!
//! This module accepts long-lived duplex client connections, groups them into
//! channels, and pushes live updates to them. It supports:
//! - Capacity-limited connection admission
//! - Room and named-channel subscriptions
//! - Per-channel batching of outbound broadcasts
//! - Heartbeats and stale-connection cleanup
//! - Live statistics mirrored to a shared cache
//!
//! # Architecture
//!
//! - **Protocol**: JSON envelopes exchanged with clients
//! - **Transport**: write half of one client connection
//! - **Connection**: one live transport plus its metadata
//! - **Registry**: every connection, indexed by id, user, room and channel
//! - **Batcher**: coalesces channel broadcasts into `batch` envelopes
//! - **Manager**: the façade producers and the WebSocket handler talk to
//! - **Server**: axum WebSocket endpoint
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use event_realtime::realtime::{ConnectionManager, RealtimeConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = Arc::new(ConnectionManager::new(RealtimeConfig::default()));
//!     manager.start();
//!
//!     // Hand `manager` to the router and to event producers
//!
//!     manager.shutdown().await;
//! }
//! ```

pub mod batcher;
pub mod connection;
pub mod history;
pub mod manager;
pub mod metrics;
pub mod notify;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod sink;
pub mod transport;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationErrors};

pub use batcher::{BatchConfig, MessageBatcher};
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use manager::{CleanupReport, ConnectError, ConnectionManager, RealtimeStats};
pub use notify::{EventPublisher, RoomEvent, UserEvent};
pub use protocol::{ClientMessage, ServerMessage};
pub use registry::ConnectionRegistry;
pub use server::websocket_handler;
pub use sink::{NoopStatsSink, RedisStatsSink, StatsSink};
pub use transport::{ChannelTransport, Transport};

/// Realtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Maximum number of concurrent connections
    #[validate(range(min = 1, max = 1_000_000))]
    pub max_connections: usize,
    /// Heartbeat interval in seconds
    #[validate(range(min = 1, max = 3600))]
    pub heartbeat_interval_secs: u64,
    /// Cleanup interval in seconds
    #[validate(range(min = 1, max = 86_400))]
    pub cleanup_interval_secs: u64,
    /// Idle time after which a connection is reaped
    #[validate(range(min = 1, max = 604_800))]
    pub stale_timeout_secs: u64,
    /// Envelopes per channel that trigger an immediate flush
    #[validate(range(min = 1, max = 1000))]
    pub batch_size: usize,
    /// Longest an envelope waits before its channel is flushed
    #[validate(range(min = 1, max = 60_000))]
    pub batch_window_millis: u64,
    /// Outbound frames buffered per connection before it counts as stalled
    #[validate(range(min = 1, max = 65_536))]
    pub max_pending_messages: usize,
    /// Close code sent when rejecting a connection at capacity
    #[validate(range(min = 1000, max = 4999))]
    pub overload_close_code: u16,
    /// Entries kept in the diagnostic history ring
    #[validate(range(max = 10_000))]
    pub history_capacity: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            heartbeat_interval_secs: 30,
            cleanup_interval_secs: 60,
            stale_timeout_secs: 300, // 5 minutes
            batch_size: batcher::DEFAULT_BATCH_SIZE,
            batch_window_millis: 100,
            max_pending_messages: 256,
            overload_close_code: transport::CLOSE_TRY_AGAIN_LATER,
            history_capacity: history::DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl RealtimeConfig {
    pub fn builder() -> RealtimeConfigBuilder {
        RealtimeConfigBuilder::default()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_millis)
    }
}

/// Builder for RealtimeConfig
#[derive(Debug, Clone, Default)]
pub struct RealtimeConfigBuilder {
    config: RealtimeConfig,
}

impl RealtimeConfigBuilder {
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval_secs = interval.as_secs();
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.config.cleanup_interval_secs = interval.as_secs();
        self
    }

    pub fn stale_timeout(mut self, timeout: Duration) -> Self {
        self.config.stale_timeout_secs = timeout.as_secs();
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn batch_window(mut self, window: Duration) -> Self {
        self.config.batch_window_millis = window.as_millis() as u64;
        self
    }

    pub fn max_pending_messages(mut self, max: usize) -> Self {
        self.config.max_pending_messages = max;
        self
    }

    pub fn overload_close_code(mut self, code: u16) -> Self {
        self.config.overload_close_code = code;
        self
    }

    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.config.history_capacity = capacity;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<RealtimeConfig, ValidationErrors> {
        self.config.validate()?;
        Ok(self.config)
    }
}

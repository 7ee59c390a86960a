//! Realtime wire protocol
//!
//! This module defines the JSON envelopes exchanged over a client connection.
//! Every envelope carries a `type` discriminator; inbound frames are decoded
//! once into [`ClientMessage`] and matched exhaustively by the receive loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix for channels derived from a room
pub const ROOM_CHANNEL_PREFIX: &str = "room:";

/// Longest channel name a client may subscribe to
pub const MAX_CHANNEL_NAME_LEN: usize = 128;

/// Message sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keepalive ping, answered with `pong`
    Ping {
        #[serde(default)]
        timestamp: Option<serde_json::Value>,
    },
    /// Join a named channel
    SubscribeChannel { channel: String },
    /// Leave a named channel
    UnsubscribeChannel { channel: String },
}

/// Message sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, strum::IntoStaticStr)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ServerMessage {
    /// First message on every accepted connection
    #[serde(rename_all = "camelCase")]
    ConnectionEstablished {
        connection_id: String,
        timestamp: DateTime<Utc>,
    },
    /// Response to a client ping
    Pong { timestamp: DateTime<Utc> },
    /// Channel subscription confirmed
    Subscribed { channel: String },
    /// Channel unsubscription confirmed
    Unsubscribed { channel: String },
    /// Periodic liveness signal
    Heartbeat { timestamp: DateTime<Utc> },
    /// Coalesced envelopes for one channel, in enqueue order
    Batch {
        messages: Vec<ServerMessage>,
        count: usize,
        timestamp: DateTime<Utc>,
    },
    /// Guest check-in state changed
    CheckinUpdate {
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    /// Aggregate event statistics changed
    StatsUpdate {
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    /// Guest record changed
    GuestUpdate {
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    /// Moderation or administrative notice
    AdminNotification { data: serde_json::Value },
    /// Error message
    Error { message: String },
}

impl ServerMessage {
    /// Wrap an ordered list of envelopes into a single batch envelope
    pub fn batch(messages: Vec<ServerMessage>) -> Self {
        ServerMessage::Batch {
            count: messages.len(),
            messages,
            timestamp: Utc::now(),
        }
    }

    pub fn heartbeat() -> Self {
        ServerMessage::Heartbeat {
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Wire name of this envelope's `type`
    pub fn kind(&self) -> &'static str {
        self.into()
    }

    /// Encode for the wire
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

impl ClientMessage {
    /// Decode an inbound text frame
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

/// Channel a room's connections are subscribed to on accept
pub fn room_channel(room_id: &str) -> String {
    format!("{}{}", ROOM_CHANNEL_PREFIX, room_id)
}

/// Validate the shape of a client-supplied channel name
pub fn validate_channel_name(channel: &str) -> Result<(), ProtocolError> {
    if channel.is_empty() {
        return Err(ProtocolError::InvalidChannel("channel name is empty".to_string()));
    }
    if channel.len() > MAX_CHANNEL_NAME_LEN {
        return Err(ProtocolError::InvalidChannel(format!(
            "channel name exceeds {} bytes",
            MAX_CHANNEL_NAME_LEN
        )));
    }
    let valid = channel
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-' | '.'));
    if !valid {
        return Err(ProtocolError::InvalidChannel(format!(
            "channel name '{}' contains unsupported characters",
            channel
        )));
    }
    Ok(())
}

/// Whether a connection created for `room_id` may join `channel`.
///
/// Only the room channel itself and its `room:{id}:...` sub-channels qualify.
pub fn channel_in_room(room_id: &str, channel: &str) -> bool {
    let base = room_channel(room_id);
    match channel.strip_prefix(base.as_str()) {
        Some("") => true,
        Some(rest) => rest.starts_with(':') && rest.len() > 1,
        None => false,
    }
}

/// Protocol errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid message: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Invalid channel: {0}")]
    InvalidChannel(String),
}

//! Domain event publishing
//!
//! Producers in the wider service (check-in desk, guest list, moderation) hand
//! their events to the manager through these helpers. Room events go through
//! the batcher; user events are delivered straight away.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{manager::ConnectionManager, protocol::ServerMessage};

/// Event addressed to every connection in a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RoomEvent {
    CheckinUpdate(Value),
    StatsUpdate(Value),
    GuestUpdate(Value),
}

impl RoomEvent {
    /// Stamp the event and turn it into its wire envelope
    pub fn into_message(self) -> ServerMessage {
        let timestamp = Utc::now();
        match self {
            RoomEvent::CheckinUpdate(data) => ServerMessage::CheckinUpdate { data, timestamp },
            RoomEvent::StatsUpdate(data) => ServerMessage::StatsUpdate { data, timestamp },
            RoomEvent::GuestUpdate(data) => ServerMessage::GuestUpdate { data, timestamp },
        }
    }
}

/// Event addressed to every connection of one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum UserEvent {
    AdminNotification(Value),
}

impl UserEvent {
    pub fn into_message(self) -> ServerMessage {
        match self {
            UserEvent::AdminNotification(data) => ServerMessage::AdminNotification { data },
        }
    }
}

/// Publisher trait for services that emit realtime events
#[async_trait::async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish to a room, returning the room's connection count
    async fn publish_room_event(&self, room_id: &str, event: RoomEvent) -> usize;

    /// Publish to a user, returning the number of connections reached
    async fn publish_user_event(&self, user_id: &str, event: UserEvent) -> usize;
}

#[async_trait::async_trait]
impl EventPublisher for ConnectionManager {
    async fn publish_room_event(&self, room_id: &str, event: RoomEvent) -> usize {
        let message = event.into_message();
        debug!(room_id = %room_id, event_type = message.kind(), "Publishing room event");
        self.broadcast_to_room(room_id, message).await
    }

    async fn publish_user_event(&self, user_id: &str, event: UserEvent) -> usize {
        let message = event.into_message();
        debug!(user_id = %user_id, event_type = message.kind(), "Publishing user event");
        self.broadcast_to_user(user_id, &message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::transport::{ChannelTransport, OutboundFrame};
    use crate::realtime::RealtimeConfig;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_room_event_decoding() {
        let event: RoomEvent =
            serde_json::from_value(json!({ "type": "checkin_update", "data": { "guestId": 9 } }))
                .unwrap();
        assert_eq!(event, RoomEvent::CheckinUpdate(json!({ "guestId": 9 })));

        let message = event.into_message();
        assert_eq!(message.kind(), "checkin_update");
    }

    #[test]
    fn test_unknown_room_event_rejected() {
        let result: Result<RoomEvent, _> =
            serde_json::from_value(json!({ "type": "vendor_update", "data": {} }));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_publish_user_event() {
        let manager = ConnectionManager::new(RealtimeConfig::default());
        let (transport, mut rx) = ChannelTransport::new(8);
        manager
            .connect(Arc::new(transport), Some("admin-1".to_string()), None)
            .await
            .unwrap();
        rx.try_recv().unwrap();

        let reached = manager
            .publish_user_event(
                "admin-1",
                UserEvent::AdminNotification(json!({ "text": "Doors open" })),
            )
            .await;
        assert_eq!(reached, 1);

        match rx.try_recv().unwrap() {
            OutboundFrame::Text(text) => assert!(text.contains("admin_notification")),
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

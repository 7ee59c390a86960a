//! WebSocket server implementation
//!
//! This module implements the realtime endpoint using Axum's WebSocket support.
//! Each socket is split: a writer task drains the connection's
//! [`ChannelTransport`] into the sink, and the handler task runs the receive
//! loop until the client leaves or the writer stops.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use chrono::Utc;
use futures::{
    sink::{Sink, SinkExt},
    stream::StreamExt,
};
use serde::Deserialize;
use std::{borrow::Cow, sync::Arc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::{
    manager::ConnectionManager,
    protocol::{
        channel_in_room, room_channel, validate_channel_name, ClientMessage, ServerMessage,
    },
    transport::{ChannelTransport, CloseRequest, OutboundFrame, CLOSE_POLICY_VIOLATION},
};
use crate::{api::AppState, auth::AuthError};

/// Query parameters accepted on the upgrade request
#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub token: Option<String>,
}

/// WebSocket endpoint handler for `/ws/room/:room_id`
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
) -> Response {
    info!(room_id = %room_id, "WebSocket connection request");

    if let Err(e) = validate_channel_name(&room_channel(&room_id)) {
        warn!(room_id = %room_id, error = %e, "Rejecting connection for invalid room");
        return ws.on_upgrade(move |socket| reject_socket(socket, e.to_string()));
    }

    let verified = match query.token.as_deref() {
        Some(token) => state.verifier.verify(token).await,
        None => Err(AuthError::MissingToken),
    };

    match verified {
        Ok(claims) => ws.on_upgrade(move |socket| {
            handle_socket(socket, state.manager, claims.user_id, room_id)
        }),
        Err(e) => {
            warn!(room_id = %room_id, error = %e, "WebSocket authentication failed");
            ws.on_upgrade(move |socket| reject_socket(socket, e.to_string()))
        }
    }
}

/// Close a socket that never became a connection
async fn reject_socket(mut socket: WebSocket, reason: String) {
    let frame = CloseFrame {
        code: CLOSE_POLICY_VIOLATION,
        reason: Cow::Owned(reason),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "Failed to send close frame to rejected socket");
    }
}

/// Handle an authenticated WebSocket
async fn handle_socket(
    socket: WebSocket,
    manager: Arc<ConnectionManager>,
    user_id: String,
    room_id: String,
) {
    let (sink, mut receiver) = socket.split();
    let (transport, frames) = ChannelTransport::new(manager.config().max_pending_messages);
    let close_signal = transport.close_signal();
    let mut writer_handle = tokio::spawn(write_frames(
        MessageWriter::new(sink),
        frames,
        close_signal,
    ));

    let connection_id = match manager
        .connect(Arc::new(transport), Some(user_id), Some(room_id.clone()))
        .await
    {
        Ok(id) => id,
        Err(e) => {
            warn!(room_id = %room_id, error = %e, "Connection refused");
            // The writer exits once the close frame is written
            if let Err(e) = writer_handle.await {
                error!(error = %e, "WebSocket writer task failed");
            }
            return;
        }
    };

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let msg = match incoming {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!(connection_id = %connection_id, error = %e, "WebSocket receive error");
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => {
                        manager.record_inbound(&connection_id, text.len() as u64);
                        handle_client_message(&manager, &connection_id, &room_id, &text).await;
                    }
                    Message::Binary(data) => {
                        manager.record_inbound(&connection_id, data.len() as u64);
                        warn!(connection_id = %connection_id, "Received binary message (not supported)");
                        manager
                            .send_to_connection(
                                &connection_id,
                                &ServerMessage::error("Binary messages are not supported"),
                            )
                            .await;
                    }
                    Message::Ping(data) | Message::Pong(data) => {
                        manager.record_inbound(&connection_id, data.len() as u64);
                    }
                    Message::Close(_) => {
                        info!(connection_id = %connection_id, "Client closed connection");
                        break;
                    }
                }
            }
            _ = &mut writer_handle => {
                debug!(connection_id = %connection_id, "WebSocket writer stopped");
                break;
            }
        }
    }

    manager.disconnect(&connection_id).await;
}

/// Drain outbound frames into the socket until closed.
///
/// Queued frames are written before an out-of-band close request, so a close
/// that did not fit in the queue still reaches the client after the backlog.
async fn write_frames<S, E>(
    mut writer: MessageWriter<S>,
    mut frames: mpsc::Receiver<OutboundFrame>,
    mut close_signal: watch::Receiver<Option<CloseRequest>>,
) where
    S: Sink<Message, Error = E> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    loop {
        tokio::select! {
            biased;
            frame = frames.recv() => match frame {
                Some(OutboundFrame::Text(text)) => {
                    if let Err(e) = writer.send_text(text).await {
                        debug!(error = %e, "Failed to write WebSocket frame");
                        return;
                    }
                }
                Some(OutboundFrame::Close { code, reason }) => {
                    close_writer(writer, code, reason).await;
                    return;
                }
                None => break,
            },
            // Only reached while the queue is empty
            changed = close_signal.changed() => {
                if changed.is_ok() && close_signal.borrow().is_some() {
                    break;
                }
            }
        }
    }

    let request = close_signal.borrow().clone();
    if let Some(CloseRequest { code, reason }) = request {
        close_writer(writer, code, reason).await;
    }
}

async fn close_writer<S, E>(writer: MessageWriter<S>, code: u16, reason: String)
where
    S: Sink<Message, Error = E> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    if let Err(e) = writer.close(code, reason).await {
        debug!(error = %e, "Failed to write WebSocket close frame");
    }
}

/// Dispatch one inbound text frame
pub(crate) async fn handle_client_message(
    manager: &ConnectionManager,
    connection_id: &str,
    room_id: &str,
    text: &str,
) {
    let message = match ClientMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(connection_id = %connection_id, error = %e, "Invalid client message");
            manager
                .send_to_connection(
                    connection_id,
                    &ServerMessage::error(format!("Failed to process message: {}", e)),
                )
                .await;
            return;
        }
    };

    let response = match message {
        ClientMessage::Ping { .. } => ServerMessage::Pong {
            timestamp: Utc::now(),
        },
        ClientMessage::SubscribeChannel { channel } => {
            if let Err(e) = validate_channel_name(&channel) {
                ServerMessage::error(e.to_string())
            } else if !channel_in_room(room_id, &channel) {
                warn!(
                    connection_id = %connection_id,
                    room_id = %room_id,
                    channel = %channel,
                    "Subscription outside connection's room refused"
                );
                ServerMessage::error(format!("Channel {} is not part of room {}", channel, room_id))
            } else {
                manager.subscribe(connection_id, &channel);
                info!(connection_id = %connection_id, channel = %channel, "Client subscribed to channel");
                ServerMessage::Subscribed { channel }
            }
        }
        ClientMessage::UnsubscribeChannel { channel } => {
            manager.unsubscribe(connection_id, &channel);
            info!(connection_id = %connection_id, channel = %channel, "Client unsubscribed from channel");
            ServerMessage::Unsubscribed { channel }
        }
    };

    manager.send_to_connection(connection_id, &response).await;
}

/// Message writer for the sending half of a socket
pub struct MessageWriter<S> {
    sink: S,
}

impl<S, E> MessageWriter<S>
where
    S: Sink<Message, Error = E> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    /// Send a text frame
    pub async fn send_text(&mut self, text: String) -> Result<(), std::io::Error> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))
    }

    /// Close the connection
    pub async fn close(mut self, code: u16, reason: String) -> Result<(), std::io::Error> {
        self.sink
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: Cow::Owned(reason),
            })))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::transport::{Transport, CLOSE_GOING_AWAY, CLOSE_TRY_AGAIN_LATER};
    use crate::realtime::RealtimeConfig;

    fn close_code(message: Option<Message>) -> u16 {
        match message {
            Some(Message::Close(Some(frame))) => frame.code,
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_writer_closes_after_backlog_when_queue_was_full() {
        let (transport, frames) = ChannelTransport::new(1);
        let signal = transport.close_signal();
        transport.send_text("backlog".to_string()).await.unwrap();
        transport.close(CLOSE_GOING_AWAY, "slow consumer").await.unwrap();
        drop(transport);

        let (sink, mut written) = futures::channel::mpsc::channel::<Message>(8);
        write_frames(MessageWriter::new(sink), frames, signal).await;

        assert_eq!(written.next().await, Some(Message::Text("backlog".to_string())));
        assert_eq!(close_code(written.next().await), CLOSE_GOING_AWAY);
    }

    #[tokio::test]
    async fn test_writer_closes_while_transport_alive() {
        let (transport, frames) = ChannelTransport::new(1);
        let signal = transport.close_signal();
        transport.send_text("backlog".to_string()).await.unwrap();
        transport.close(CLOSE_TRY_AGAIN_LATER, "at capacity").await.unwrap();

        let (sink, mut written) = futures::channel::mpsc::channel::<Message>(8);
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            write_frames(MessageWriter::new(sink), frames, signal),
        )
        .await
        .expect("writer should stop after the close request");

        assert_eq!(written.next().await, Some(Message::Text("backlog".to_string())));
        assert_eq!(close_code(written.next().await), CLOSE_TRY_AGAIN_LATER);
        drop(transport);
    }

    async fn connected(manager: &ConnectionManager) -> (String, mpsc::Receiver<OutboundFrame>) {
        let (transport, mut rx) = ChannelTransport::new(16);
        let id = manager
            .connect(Arc::new(transport), Some("u1".to_string()), Some("42".to_string()))
            .await
            .unwrap();
        rx.try_recv().unwrap();
        (id, rx)
    }

    fn next_message(rx: &mut mpsc::Receiver<OutboundFrame>) -> ServerMessage {
        match rx.try_recv().unwrap() {
            OutboundFrame::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let manager = ConnectionManager::new(RealtimeConfig::default());
        let (id, mut rx) = connected(&manager).await;

        handle_client_message(&manager, &id, "42", r#"{"type":"ping","timestamp":123}"#).await;
        assert_eq!(next_message(&mut rx).kind(), "pong");
    }

    #[tokio::test]
    async fn test_subscribe_within_room() {
        let manager = ConnectionManager::new(RealtimeConfig::default());
        let (id, mut rx) = connected(&manager).await;

        handle_client_message(
            &manager,
            &id,
            "42",
            r#"{"type":"subscribe_channel","channel":"room:42:checkins"}"#,
        )
        .await;

        assert_eq!(
            next_message(&mut rx),
            ServerMessage::Subscribed {
                channel: "room:42:checkins".to_string()
            }
        );
        assert!(manager.registry().is_subscribed(&id, "room:42:checkins"));

        handle_client_message(
            &manager,
            &id,
            "42",
            r#"{"type":"unsubscribe_channel","channel":"room:42:checkins"}"#,
        )
        .await;
        assert_eq!(next_message(&mut rx).kind(), "unsubscribed");
        assert!(!manager.registry().is_subscribed(&id, "room:42:checkins"));
    }

    #[tokio::test]
    async fn test_subscribe_outside_room_refused() {
        let manager = ConnectionManager::new(RealtimeConfig::default());
        let (id, mut rx) = connected(&manager).await;

        handle_client_message(
            &manager,
            &id,
            "42",
            r#"{"type":"subscribe_channel","channel":"room:7"}"#,
        )
        .await;

        assert_eq!(next_message(&mut rx).kind(), "error");
        assert!(!manager.registry().is_subscribed(&id, "room:7"));
    }

    #[tokio::test]
    async fn test_malformed_message_gets_error_and_connection_survives() {
        let manager = ConnectionManager::new(RealtimeConfig::default());
        let (id, mut rx) = connected(&manager).await;

        handle_client_message(&manager, &id, "42", "{not json").await;
        handle_client_message(&manager, &id, "42", r#"{"type":"launch_rockets"}"#).await;

        assert_eq!(next_message(&mut rx).kind(), "error");
        assert_eq!(next_message(&mut rx).kind(), "error");
        assert!(manager.registry().contains(&id));
    }
}

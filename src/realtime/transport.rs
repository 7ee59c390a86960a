//! Duplex transport abstraction
//!
//! A [`Transport`] is the write half of one client connection. The connection
//! manager owns it exclusively once the connection is accepted; nothing else
//! writes to it.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// Server going away (shutdown, stale connection)
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Policy violation (authentication or authorization failure)
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Try again later (server at capacity)
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Write half of a client connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one text frame
    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    /// Close the transport with a close code and reason
    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// Frame handed to a connection's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Close { code: u16, reason: String },
}

/// Close requested on a transport, delivered outside the frame queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRequest {
    pub code: u16,
    pub reason: String,
}

/// Transport backed by a bounded in-process queue.
///
/// A writer task drains the receiving half into the socket. A full queue means
/// the client is not keeping up and is reported as a write failure. Closing
/// also publishes a [`CloseRequest`] on a watch channel so the writer still
/// learns the close code when the queue has no room for the close frame.
pub struct ChannelTransport {
    tx: mpsc::Sender<OutboundFrame>,
    close_tx: watch::Sender<Option<CloseRequest>>,
    closed: AtomicBool,
}

impl ChannelTransport {
    /// Create a transport with room for `capacity` pending frames
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (close_tx, _) = watch::channel(None);
        (
            Self {
                tx,
                close_tx,
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Subscribe to the close request, taken by the writer task
    pub fn close_signal(&self) -> watch::Receiver<Option<CloseRequest>> {
        self.close_tx.subscribe()
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.tx.try_send(OutboundFrame::Text(text)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.close_tx.send_replace(Some(CloseRequest {
            code,
            reason: reason.to_string(),
        }));

        // In-band copy keeps the close behind frames already queued
        match self.tx.try_send(OutboundFrame::Close {
            code,
            reason: reason.to_string(),
        }) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }
}

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport is closed")]
    Closed,
    #[error("Outbound queue is full")]
    Backpressure,
    #[error("Transport I/O error: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_transport_send() {
        let (transport, mut rx) = ChannelTransport::new(4);
        transport.send_text("hello".to_string()).await.unwrap();

        assert_eq!(rx.recv().await, Some(OutboundFrame::Text("hello".to_string())));
    }

    #[tokio::test]
    async fn test_full_queue_is_backpressure() {
        let (transport, _rx) = ChannelTransport::new(1);
        transport.send_text("a".to_string()).await.unwrap();

        let err = transport.send_text("b".to_string()).await.unwrap_err();
        assert!(matches!(err, TransportError::Backpressure));
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_closed() {
        let (transport, rx) = ChannelTransport::new(4);
        drop(rx);

        let err = transport.send_text("a".to_string()).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn test_close_sends_frame_once() {
        let (transport, mut rx) = ChannelTransport::new(4);
        transport.close(CLOSE_TRY_AGAIN_LATER, "full").await.unwrap();
        transport.close(CLOSE_NORMAL, "again").await.unwrap();

        assert!(transport.is_closed());
        assert_eq!(
            rx.recv().await,
            Some(OutboundFrame::Close {
                code: CLOSE_TRY_AGAIN_LATER,
                reason: "full".to_string()
            })
        );
        assert!(rx.try_recv().is_err());
        assert!(transport.send_text("late".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_close_on_full_queue_still_signals_writer() {
        let (transport, mut rx) = ChannelTransport::new(1);
        let signal = transport.close_signal();
        transport.send_text("pending".to_string()).await.unwrap();

        transport.close(CLOSE_GOING_AWAY, "slow consumer").await.unwrap();

        assert_eq!(
            *signal.borrow(),
            Some(CloseRequest {
                code: CLOSE_GOING_AWAY,
                reason: "slow consumer".to_string()
            })
        );
        assert_eq!(rx.recv().await, Some(OutboundFrame::Text("pending".to_string())));
        assert!(rx.try_recv().is_err());
    }
}

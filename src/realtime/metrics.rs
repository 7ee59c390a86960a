//! Realtime metrics
//!
//! This module provides Prometheus metrics for connection and broadcast
//! monitoring.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Encoder, Histogram,
    HistogramOpts, IntCounter, IntGauge, TextEncoder,
};

lazy_static! {
    /// Active realtime connections
    pub static ref RT_ACTIVE_CONNECTIONS: IntGauge = register_int_gauge!(
        "realtime_active_connections",
        "Number of active realtime connections"
    )
    .unwrap();

    /// Total accepted connections
    pub static ref RT_TOTAL_CONNECTIONS: IntCounter = register_int_counter!(
        "realtime_total_connections",
        "Total number of realtime connections accepted"
    )
    .unwrap();

    /// Connections rejected at capacity
    pub static ref RT_REJECTED_CONNECTIONS: IntCounter = register_int_counter!(
        "realtime_rejected_connections_total",
        "Total number of connections rejected because the server was at capacity"
    )
    .unwrap();

    /// Messages sent to clients
    pub static ref RT_MESSAGES_SENT: IntCounter = register_int_counter!(
        "realtime_messages_sent_total",
        "Total number of messages sent to realtime clients"
    )
    .unwrap();

    /// Messages received from clients
    pub static ref RT_MESSAGES_RECEIVED: IntCounter = register_int_counter!(
        "realtime_messages_received_total",
        "Total number of messages received from realtime clients"
    )
    .unwrap();

    /// Batches flushed
    pub static ref RT_BATCHES_FLUSHED: IntCounter = register_int_counter!(
        "realtime_batches_flushed_total",
        "Total number of channel batches flushed"
    )
    .unwrap();

    /// Envelopes per flushed batch
    pub static ref RT_BATCH_SIZE: Histogram = register_histogram!(HistogramOpts::new(
        "realtime_batch_size",
        "Number of envelopes per flushed batch"
    )
    .buckets(vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0]))
    .unwrap();

    /// Message send errors
    pub static ref RT_SEND_ERRORS: IntCounter = register_int_counter!(
        "realtime_send_errors_total",
        "Total number of errors sending messages to clients"
    )
    .unwrap();

    /// Stale connections reaped by the cleanup loop
    pub static ref RT_STALE_REAPED: IntCounter = register_int_counter!(
        "realtime_stale_connections_reaped_total",
        "Total number of stale connections removed by the cleanup loop"
    )
    .unwrap();

    /// Failed stats publications
    pub static ref RT_STATS_PUBLISH_ERRORS: IntCounter = register_int_counter!(
        "realtime_stats_publish_errors_total",
        "Total number of failures publishing stats to the shared cache"
    )
    .unwrap();

    /// Connection duration histogram
    pub static ref RT_CONNECTION_DURATION: Histogram = register_histogram!(
        "realtime_connection_duration_seconds",
        "Duration of realtime connections in seconds"
    )
    .unwrap();
}

/// Record an accepted connection
pub fn record_connection() {
    RT_ACTIVE_CONNECTIONS.inc();
    RT_TOTAL_CONNECTIONS.inc();
}

/// Record a disconnection
pub fn record_disconnection(duration_secs: f64) {
    RT_ACTIVE_CONNECTIONS.dec();
    RT_CONNECTION_DURATION.observe(duration_secs);
}

/// Record a connection rejected at capacity
pub fn record_rejection() {
    RT_REJECTED_CONNECTIONS.inc();
}

/// Record a message sent
pub fn record_message_sent() {
    RT_MESSAGES_SENT.inc();
}

/// Record a message received
pub fn record_message_received() {
    RT_MESSAGES_RECEIVED.inc();
}

/// Record a flushed batch of `size` envelopes
pub fn record_batch_flushed(size: usize) {
    RT_BATCHES_FLUSHED.inc();
    RT_BATCH_SIZE.observe(size as f64);
}

/// Record a send error
pub fn record_send_error() {
    RT_SEND_ERRORS.inc();
}

/// Record stale connections reaped
pub fn record_stale_reaped(count: usize) {
    RT_STALE_REAPED.inc_by(count as u64);
}

/// Record a failed stats publication
pub fn record_stats_publish_error() {
    RT_STATS_PUBLISH_ERRORS.inc();
}

/// Render every registered metric in the Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let before_total = RT_TOTAL_CONNECTIONS.get();
        record_connection();
        assert!(RT_TOTAL_CONNECTIONS.get() > before_total);
        record_disconnection(3.5);

        let before_batches = RT_BATCHES_FLUSHED.get();
        record_batch_flushed(4);
        assert!(RT_BATCHES_FLUSHED.get() > before_batches);

        let before_reaped = RT_STALE_REAPED.get();
        record_stale_reaped(3);
        assert!(RT_STALE_REAPED.get() >= before_reaped + 3);

        record_rejection();
        record_message_sent();
        record_message_received();
        record_send_error();
        record_stats_publish_error();
    }

    #[test]
    fn test_gather_metrics() {
        record_message_sent();
        let output = gather_metrics();
        assert!(output.contains("realtime_messages_sent_total"));
    }
}

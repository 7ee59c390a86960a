//! Stats sinks
//!
//! The cleanup loop mirrors each `stats()` snapshot to a shared cache so other
//! processes can read live connection counts. The sink is pluggable; the
//! default is a no-op and the production sink writes to Redis.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;

use super::manager::RealtimeStats;

/// Destination for periodic stats snapshots
#[async_trait]
pub trait StatsSink: Send + Sync {
    async fn publish(&self, stats: &RealtimeStats) -> Result<(), SinkError>;
}

/// Sink that discards every snapshot
#[derive(Debug, Clone, Default)]
pub struct NoopStatsSink;

#[async_trait]
impl StatsSink for NoopStatsSink {
    async fn publish(&self, _stats: &RealtimeStats) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Redis-backed sink.
///
/// Each snapshot is stored as JSON under `{prefix}:stats:{instance}` with a
/// TTL, and announced on the `{prefix}:stats` pub/sub channel.
#[derive(Clone)]
pub struct RedisStatsSink {
    connection: ConnectionManager,
    key_prefix: String,
    instance_id: String,
    ttl_secs: u64,
}

impl RedisStatsSink {
    /// Connect to Redis and verify the connection
    pub async fn connect(
        redis_url: &str,
        key_prefix: &str,
        instance_id: &str,
        ttl_secs: u64,
    ) -> Result<Self, SinkError> {
        let client = Client::open(redis_url)
            .map_err(|e| SinkError::Connection(format!("Failed to create Redis client: {}", e)))?;

        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| SinkError::Connection(format!("Failed to connect to Redis: {}", e)))?;

        let mut test_conn = connection.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut test_conn)
            .await
            .map_err(|e| SinkError::Connection(format!("Redis connection test failed: {}", e)))?;

        tracing::info!(prefix = %key_prefix, instance = %instance_id, "Initialized Redis stats sink");

        Ok(Self {
            connection,
            key_prefix: key_prefix.to_string(),
            instance_id: instance_id.to_string(),
            ttl_secs,
        })
    }

    fn stats_key(&self) -> String {
        format!("{}:stats:{}", self.key_prefix, self.instance_id)
    }

    fn stats_channel(&self) -> String {
        format!("{}:stats", self.key_prefix)
    }
}

#[async_trait]
impl StatsSink for RedisStatsSink {
    async fn publish(&self, stats: &RealtimeStats) -> Result<(), SinkError> {
        let payload = serde_json::to_string(stats).map_err(|e| SinkError::Serialization(e.to_string()))?;
        let mut conn = self.connection.clone();

        redis::cmd("SET")
            .arg(self.stats_key())
            .arg(&payload)
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| SinkError::Publish(format!("Failed to store stats snapshot: {}", e)))?;

        redis::cmd("PUBLISH")
            .arg(self.stats_channel())
            .arg(&payload)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| SinkError::Publish(format!("Failed to announce stats snapshot: {}", e)))?;

        Ok(())
    }
}

/// Stats sink errors
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Sink connection error: {0}")]
    Connection(String),
    #[error("Failed to publish stats: {0}")]
    Publish(String),
    #[error("Failed to serialize stats: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_sink_accepts_snapshots() {
        let sink = NoopStatsSink;
        assert!(sink.publish(&RealtimeStats::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_redis_sink_rejects_bad_url() {
        let result = RedisStatsSink::connect("not-a-url", "event-rt", "test", 60).await;
        assert!(matches!(result, Err(SinkError::Connection(_))));
    }
}

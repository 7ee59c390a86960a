//! Per-channel message batching
//!
//! Broadcasts aimed at the same channel within a short window are coalesced
//! into one `batch` envelope. A channel's queue is flushed when it reaches
//! `batch_size` envelopes or when its `batch_window` timer fires, whichever
//! comes first. Envelopes are delivered in enqueue order within a channel.
//!
//! The batcher never holds connection state. It resolves nothing itself and
//! hands every flushed batch to a [`ChannelBroadcast`] implementation, which
//! looks subscribers up at flush time.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::{metrics, protocol::ServerMessage};

/// Default number of envelopes that triggers an immediate flush
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default time an envelope may wait before its channel is flushed
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(100);

/// Channel-level delivery primitive the batcher flushes into
#[async_trait]
pub trait ChannelBroadcast: Send + Sync {
    /// Deliver one envelope to every current subscriber of `channel`.
    ///
    /// Returns the number of subscribers reached.
    async fn broadcast_to_channel(&self, channel: &str, message: &ServerMessage) -> usize;
}

/// Batch thresholds
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub batch_window: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_window: DEFAULT_BATCH_WINDOW,
        }
    }
}

#[derive(Default)]
struct ChannelQueue {
    pending: Vec<ServerMessage>,
    /// Generation of the armed flush timer, if any
    timer: Option<u64>,
    /// Held while a batch taken from this queue is being delivered
    delivery: Arc<tokio::sync::Mutex<()>>,
}

impl ChannelQueue {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.timer.is_none() && Arc::strong_count(&self.delivery) == 1
    }
}

/// Which flush is taking the queue
#[derive(Clone, Copy)]
enum FlushTrigger {
    Explicit,
    Timer(u64),
}

/// Per-channel envelope batcher
pub struct MessageBatcher {
    config: BatchConfig,
    queues: Mutex<HashMap<String, ChannelQueue>>,
    next_generation: Mutex<u64>,
    delivery: Arc<dyn ChannelBroadcast>,
}

impl MessageBatcher {
    /// Create a batcher flushing into `delivery`
    pub fn new(config: BatchConfig, delivery: Arc<dyn ChannelBroadcast>) -> Self {
        Self {
            config: BatchConfig {
                batch_size: config.batch_size.max(1),
                batch_window: config.batch_window,
            },
            queues: Mutex::new(HashMap::new()),
            next_generation: Mutex::new(0),
            delivery,
        }
    }

    pub fn config(&self) -> BatchConfig {
        self.config
    }

    /// Queue an envelope for `channel`.
    ///
    /// Flushes inline when the queue reaches the batch size, otherwise arms the
    /// channel's window timer if none is armed.
    pub async fn enqueue(self: &Arc<Self>, channel: &str, message: ServerMessage) {
        let (flush_now, arm) = {
            let mut queues = self.queues.lock();
            let queue = queues.entry(channel.to_string()).or_default();
            queue.pending.push(message);

            if queue.pending.len() >= self.config.batch_size {
                (true, None)
            } else if queue.timer.is_none() {
                let generation = self.next_generation();
                queue.timer = Some(generation);
                (false, Some(generation))
            } else {
                (false, None)
            }
        };

        if let Some(generation) = arm {
            trace!(channel = %channel, generation, "Arming batch window timer");
            let batcher = Arc::clone(self);
            let channel = channel.to_string();
            let window = self.config.batch_window;
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                batcher.take_and_deliver(&channel, FlushTrigger::Timer(generation)).await;
            });
        }

        if flush_now {
            self.flush(channel).await;
        }
    }

    /// Flush `channel` now, disarming its timer.
    ///
    /// Returns the number of subscribers the batch reached; an empty queue is a
    /// no-op returning 0.
    pub async fn flush(&self, channel: &str) -> usize {
        self.take_and_deliver(channel, FlushTrigger::Explicit).await
    }

    /// Flush every channel with pending envelopes
    pub async fn flush_all(&self) -> usize {
        let channels: Vec<String> = self
            .queues
            .lock()
            .iter()
            .filter(|(_, queue)| !queue.pending.is_empty())
            .map(|(channel, _)| channel.clone())
            .collect();

        let mut reached = 0;
        for channel in channels {
            reached += self.flush(&channel).await;
        }
        reached
    }

    /// Envelopes waiting in `channel`'s queue
    pub fn pending(&self, channel: &str) -> usize {
        self.queues
            .lock()
            .get(channel)
            .map(|queue| queue.pending.len())
            .unwrap_or(0)
    }

    /// Envelopes waiting across all channels
    pub fn total_pending(&self) -> usize {
        self.queues.lock().values().map(|queue| queue.pending.len()).sum()
    }

    pub fn has_armed_timer(&self, channel: &str) -> bool {
        self.queues
            .lock()
            .get(channel)
            .is_some_and(|queue| queue.timer.is_some())
    }

    fn next_generation(&self) -> u64 {
        let mut generation = self.next_generation.lock();
        *generation += 1;
        *generation
    }

    async fn take_and_deliver(&self, channel: &str, trigger: FlushTrigger) -> usize {
        // Serialize deliveries per channel so batches leave in the order they
        // were taken from the queue.
        let delivery = match self.queues.lock().get(channel) {
            Some(queue) => Arc::clone(&queue.delivery),
            None => return 0,
        };
        let guard = delivery.lock().await;

        let messages = {
            let mut queues = self.queues.lock();
            let Some(queue) = queues.get_mut(channel) else {
                return 0;
            };

            match trigger {
                FlushTrigger::Timer(generation) if queue.timer != Some(generation) => {
                    // Superseded by an earlier flush
                    return 0;
                }
                _ => {}
            }

            queue.timer = None;
            std::mem::take(&mut queue.pending)
        };

        let reached = if messages.is_empty() {
            0
        } else {
            let count = messages.len();
            let batch = ServerMessage::batch(messages);
            let reached = self.delivery.broadcast_to_channel(channel, &batch).await;

            metrics::record_batch_flushed(count);
            debug!(channel = %channel, messages = count, subscribers = reached, "Flushed batch");
            reached
        };

        drop(guard);
        drop(delivery);
        self.prune(channel);
        reached
    }

    fn prune(&self, channel: &str) {
        let mut queues = self.queues.lock();
        if queues.get(channel).is_some_and(ChannelQueue::is_idle) {
            queues.remove(channel);
        }
    }
}

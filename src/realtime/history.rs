//! Diagnostic message history
//!
//! A bounded ring of recently delivered broadcasts. Oldest entries are evicted
//! once the ring is full; nothing is persisted.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

/// Default number of entries kept
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// What a recorded broadcast was addressed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum HistoryTarget {
    Channel(String),
    User(String),
}

/// One delivered broadcast
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub target: HistoryTarget,
    pub message_type: &'static str,
    /// Envelopes carried (batch size for channel flushes)
    pub message_count: usize,
    pub recipients: usize,
    pub timestamp: DateTime<Utc>,
}

/// Bounded ring of recent broadcasts
pub struct MessageHistory {
    entries: Mutex<VecDeque<HistoryEntry>>,
    capacity: usize,
}

impl MessageHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY))),
            capacity,
        }
    }

    pub fn record(&self, entry: HistoryEntry) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Most recent entries, newest last, at most `limit`
    pub fn recent(&self, limit: usize) -> Vec<HistoryEntry> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for MessageHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

//! Keyed FIFO dispatch queue with a per-trigger bound.
//!
//! Items are stamped with a global sequence number on push. Each trigger
//! owns its own deque, so the per-trigger bound check and drop-oldest are
//! O(1) in everything but that trigger's backlog; the global FIFO pop scans
//! queue heads for the minimum sequence (O(#triggers)). Global size is
//! unbounded by design — only the per-trigger count is limited.

use std::collections::{HashMap, VecDeque};

use conveyor_types::event::Event;
use conveyor_types::trigger::TriggerDef;

// ---------------------------------------------------------------------------
// QueuedItem
// ---------------------------------------------------------------------------

/// One deferred workflow launch. Owns its trigger snapshot and event until
/// popped.
#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub trigger_id: String,
    pub trigger: TriggerDef,
    pub event: Event,
    seq: u64,
}

// ---------------------------------------------------------------------------
// DispatchQueue
// ---------------------------------------------------------------------------

/// FIFO across triggers, bounded per trigger.
#[derive(Debug, Default)]
pub struct DispatchQueue {
    queues: HashMap<String, VecDeque<QueuedItem>>,
    next_seq: u64,
    len: usize,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// In-queue count for one trigger.
    pub fn trigger_len(&self, trigger_id: &str) -> usize {
        self.queues.get(trigger_id).map(|q| q.len()).unwrap_or(0)
    }

    /// Append an item, evicting that trigger's oldest entry when the bound
    /// is reached. Returns the evicted item, if any.
    pub fn push(
        &mut self,
        trigger_id: &str,
        trigger: TriggerDef,
        event: Event,
        max_queue: usize,
    ) -> Option<QueuedItem> {
        let queue = self.queues.entry(trigger_id.to_string()).or_default();

        let dropped = if queue.len() >= max_queue.max(1) {
            let oldest = queue.pop_front();
            if oldest.is_some() {
                self.len -= 1;
                tracing::warn!(trigger_id, max_queue, "queue full, dropping oldest item");
            }
            oldest
        } else {
            None
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        queue.push_back(QueuedItem {
            trigger_id: trigger_id.to_string(),
            trigger,
            event,
            seq,
        });
        self.len += 1;

        dropped
    }

    /// Pop the globally oldest item (minimum sequence across heads).
    pub fn pop_front(&mut self) -> Option<QueuedItem> {
        let key = self
            .queues
            .iter()
            .filter_map(|(id, q)| q.front().map(|item| (id.clone(), item.seq)))
            .min_by_key(|(_, seq)| *seq)
            .map(|(id, _)| id)?;

        let queue = self.queues.get_mut(&key)?;
        let item = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&key);
        }
        if item.is_some() {
            self.len -= 1;
        }
        item
    }

    /// Drop everything (shutdown path).
    pub fn clear(&mut self) {
        self.queues.clear();
        self.len = 0;
    }
}

//! Bounded outbound queue

use bytes::Bytes;
use std::collections::VecDeque;
use tracing::warn;

/// Default number of payloads held while the socket is unavailable
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 100;

/// Pending outbound payloads, drained FIFO when the socket is writable.
///
/// On overflow the oldest payload is dropped.
#[derive(Debug)]
pub struct SendQueue {
    items: VecDeque<Bytes>,
    capacity: usize,
    dropped: u64,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            dropped: 0,
        }
    }

    /// Append a payload. Returns the payload evicted to make room, if any.
    pub fn push(&mut self, payload: Bytes) -> Option<Bytes> {
        let evicted = if self.items.len() >= self.capacity {
            self.dropped += 1;
            let oldest = self.items.pop_front();
            warn!(
                "Send queue full ({} payloads), dropping oldest ({} bytes)",
                self.capacity,
                oldest.as_ref().map_or(0, |p| p.len())
            );
            oldest
        } else {
            None
        };
        self.items.push_back(payload);
        evicted
    }

    /// Put a payload back at the head after a failed write
    pub fn requeue_front(&mut self, payload: Bytes) {
        if self.items.len() >= self.capacity {
            // The retried payload is older than anything queued behind it
            self.dropped += 1;
            warn!("Send queue full on requeue, dropping retried payload");
            return;
        }
        self.items.push_front(payload);
    }

    pub fn pop(&mut self) -> Option<Bytes> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total payloads dropped because of overflow
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new(DEFAULT_SEND_QUEUE_CAPACITY)
    }
}

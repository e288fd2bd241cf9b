//! Outbound message queue
//!
//! Holds log/telemetry lines produced while the active transport is unusable
//! and flushes them, oldest first, once it comes back.
//!
//! ## Capacity policy
//!
//! - Fixed capacity of [`OUTBOUND_QUEUE_SIZE`] lines (~8 KB RAM)
//! - When full, the oldest line is evicted and `overflow_count` incremented
//! - Lines longer than [`OUTBOUND_MSG_SIZE`] bytes are truncated on a char boundary
//!
//! ```text
//!  enqueue ──► [ oldest | ... | newest ] ──► drain_into(transport)
//!                 ▲ evicted when full          stops when transport unusable
//! ```

use crate::communication::transport::{Route, Transport};
use crate::log_warn;
use heapless::{Deque, String};

/// Queue capacity in number of messages
pub const OUTBOUND_QUEUE_SIZE: usize = 32;

/// Maximum message size in bytes
pub const OUTBOUND_MSG_SIZE: usize = 256;

/// A queued outbound line awaiting a usable transport
pub type PendingMessage = String<OUTBOUND_MSG_SIZE>;

/// Bounded FIFO of pending outbound lines
pub struct OutboundQueue {
    queue: Deque<PendingMessage, OUTBOUND_QUEUE_SIZE>,
    overflow_count: u32,
}

impl OutboundQueue {
    /// Create an empty queue
    pub const fn new() -> Self {
        Self {
            queue: Deque::new(),
            overflow_count: 0,
        }
    }

    /// Append a message
    ///
    /// If the queue is full the oldest message is evicted and
    /// overflow_count is incremented.
    pub fn enqueue(&mut self, msg: &str) {
        if self.queue.is_full() {
            self.queue.pop_front();
            self.overflow_count = self.overflow_count.saturating_add(1);
        }

        let mut line = PendingMessage::new();
        // Cannot fail: the slice is cut to capacity on a char boundary
        let _ = line.push_str(truncate(msg, OUTBOUND_MSG_SIZE));
        let _ = self.queue.push_back(line);
    }

    /// Send queued messages in FIFO order while `transport` is usable
    ///
    /// Stops as soon as the transport reports unusable or a send fails; the
    /// failed message stays at the head of the queue.
    ///
    /// # Returns
    ///
    /// Number of messages delivered
    pub async fn drain_into<T: Transport>(&mut self, transport: &mut T) -> usize {
        let mut sent = 0;

        while transport.is_usable() {
            let Some(msg) = self.queue.pop_front() else {
                break;
            };

            if let Err(e) = transport.send(Route::Log, msg.as_bytes()).await {
                log_warn!("Outbound drain stopped after {} messages: {}", sent, e);
                // A slot was just freed by pop_front
                let _ = self.queue.push_front(msg);
                break;
            }
            sent += 1;
        }

        sent
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Return true if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of messages lost to eviction
    pub fn overflow_count(&self) -> u32 {
        self.overflow_count
    }

    /// Iterate over queued messages, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &PendingMessage> {
        self.queue.iter()
    }

    /// Drop all queued messages
    ///
    /// Does not reset overflow_count.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char
pub(crate) fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

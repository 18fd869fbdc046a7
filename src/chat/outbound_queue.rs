// Outbound queue for messages composed while the transport is down.
// Bounded FIFO; the head is only popped once the far end acknowledged it.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::models::OutgoingMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueuedMessage {
    /// Kept across retries so the far end can recognise a resend.
    pub(crate) request_id: String,
    pub(crate) message: OutgoingMessage,
    pub(crate) queued_at: DateTime<Utc>,
}

pub(crate) struct OutboundQueue {
    queue: VecDeque<QueuedMessage>,
    capacity: usize,
}

impl OutboundQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append a message. Returns its 1-based position, or `None` when full.
    pub(crate) fn enqueue(&mut self, request_id: String, message: OutgoingMessage) -> Option<usize> {
        if self.queue.len() >= self.capacity {
            return None;
        }
        self.queue.push_back(QueuedMessage {
            request_id,
            message,
            queued_at: Utc::now(),
        });
        Some(self.queue.len())
    }

    pub(crate) fn front(&self) -> Option<&QueuedMessage> {
        self.queue.front()
    }

    /// Drop the head after it was acknowledged.
    pub(crate) fn pop_front(&mut self) -> Option<QueuedMessage> {
        self.queue.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

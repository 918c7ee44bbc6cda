//! Dispatch queues
//!
//! Each action class has its own FIFO queue. Producers push whenever they
//! like; the scheduler pops at most one item per tick, so a burst of requests
//! is spread out over time instead of hitting the chat server all at once.

use crate::connection::Connection;
use crate::message::ParsedEvent;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Request to join a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    /// Channel name, sigil optional
    pub channel: String,
}

impl JoinRequest {
    pub fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
        }
    }
}

/// Chat message waiting to be sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Channel name, sigil optional
    pub channel: String,
    /// Message text
    pub text: String,
    /// ID of the message this one replies to
    pub reply_to: Option<String>,
}

impl OutboundMessage {
    pub fn new(channel: &str, text: &str) -> Self {
        Self {
            channel: channel.to_string(),
            text: text.to_string(),
            reply_to: None,
        }
    }

    /// Thread this message under another one
    pub fn in_reply_to(mut self, parent_id: Option<&str>) -> Self {
        self.reply_to = parent_id.map(str::to_string);
        self
    }
}

/// Bounded FIFO queue shared between producers and a scheduler tick
#[derive(Debug)]
pub struct ActionQueue<T> {
    /// Queue name for logging
    name: &'static str,
    /// Pending items, oldest first
    items: Mutex<VecDeque<T>>,
    /// Maximum number of pending items
    capacity: usize,
    /// Number of items dropped because the queue was full
    dropped: AtomicU64,
}

impl<T> ActionQueue<T> {
    /// Create a queue holding at most `capacity` items
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            items: Mutex::new(VecDeque::new()),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Append an item.
    /// Returns false if the item was dropped because the queue is full
    pub fn push(&self, item: T) -> bool {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            drop(items);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("{} queue full ({} items), dropping item", self.name, self.capacity);
            return false;
        }
        items.push_back(item);
        true
    }

    /// Remove and return the oldest item
    pub fn pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Number of pending items
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Number of items dropped on overflow
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Discard every pending item
    pub fn clear(&self) {
        self.items.lock().clear();
    }
}

/// The four queues drained by the scheduler
#[derive(Debug)]
pub struct DispatchQueues {
    /// Connections waiting to connect
    pub connect: Arc<ActionQueue<Arc<Connection>>>,
    /// Channels waiting to be joined
    pub join: Arc<ActionQueue<JoinRequest>>,
    /// Chat messages waiting to be sent
    pub outbound: Arc<ActionQueue<OutboundMessage>>,
    /// Inbound chat events waiting for the command processor
    pub inbound: Arc<ActionQueue<ParsedEvent>>,
}

impl DispatchQueues {
    /// Create the queues, each bounded by `capacity`
    pub fn new(capacity: usize) -> Self {
        Self {
            connect: Arc::new(ActionQueue::new("connect", capacity)),
            join: Arc::new(ActionQueue::new("join", capacity)),
            outbound: Arc::new(ActionQueue::new("outbound", capacity)),
            inbound: Arc::new(ActionQueue::new("inbound", capacity)),
        }
    }

    /// Discard everything pending
    pub fn clear(&self) {
        self.connect.clear();
        self.join.clear();
        self.outbound.clear();
        self.inbound.clear();
    }
}

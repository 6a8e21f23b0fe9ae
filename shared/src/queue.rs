//! Thread-safe FIFO of delivered messages.
//!
//! The network thread pushes, any number of application threads pop.
//! Popping only advances a cursor; the consumed prefix is dropped in one
//! shift once it grows past [`COMPACT_THRESHOLD`], so memory stays bounded
//! without copying on every pop.

use serde::{Deserialize, Serialize};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Consumed entries tolerated before the queue compacts.
pub const COMPACT_THRESHOLD: usize = 64;

/// A payload delivered from a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub peer_id: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct Inner {
    items: Vec<Option<Message>>,
    tail: usize,
}

impl Inner {
    fn pop(&mut self) -> Option<Message> {
        let message = self.items.get_mut(self.tail)?.take();
        self.tail += 1;

        if self.tail > COMPACT_THRESHOLD {
            self.items.drain(..self.tail);
            self.tail = 0;
        }
        message
    }

    fn len(&self) -> usize {
        self.items.len() - self.tail
    }
}

#[derive(Debug, Default)]
pub struct MessageQueue {
    inner: Mutex<Inner>,
    ready: Condvar,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message, doubling storage when full.
    pub fn push(&self, message: Message) {
        let mut inner = self.lock();
        if inner.items.len() == inner.items.capacity() {
            let grow = inner.items.capacity().max(8);
            inner.items.reserve_exact(grow);
        }
        inner.items.push(Some(message));
        drop(inner);
        self.ready.notify_one();
    }

    pub fn pop(&self) -> Option<Message> {
        self.lock().pop()
    }

    /// Pop, blocking up to `timeout` for a message to arrive.
    pub fn wait_pop(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();

        loop {
            if let Some(message) = inner.pop() {
                return Some(message);
            }

            let remaining = deadline.checked_duration_since(Instant::now())?;
            if remaining.is_zero() {
                return None;
            }
            inner = self
                .ready
                .wait_timeout(inner, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every undelivered message.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.items.clear();
        inner.tail = 0;
    }
}

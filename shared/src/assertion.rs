//! Per-peer selective-repeat reliability state.
//!
//! An [`Assertion`] tracks one peer's reliable stream in both directions:
//!
//! ```text
//!  send window                          receive window
//!  tail (oldest unacked)   head         tail (next expected)   head
//!   │                       │            │                      │
//! ──┼───────────────────────┼──▶       ──┼──────────────────────┼──▶
//!   │<── awaiting confirm ─▶│            │<─ out-of-order slots▶│
//! ```
//!
//! Both windows are rings of `capacity` optional owned entries indexed by
//! `sequence % capacity`. The receiver acknowledges cumulatively by naming
//! the lowest sequence it is still missing (an *assertion request*); the
//! sender frees everything below that number and retransmits exactly the
//! named entry. Retransmission is therefore bounded to one datagram per
//! request rather than a full-window replay.
//!
//! The engine never touches a socket. Every operation that transmits takes a
//! send closure so the caller can hold its per-peer mutex across "enqueue +
//! transmit" and keep sequence assignment and transmission order identical.

use crate::envelope::{Body, Envelope, UNRELIABLE};
use crate::error::ReliabilityError;
use log::{debug, warn};
use serde::Serialize;
use std::io;

/// Result of classifying an inbound reliable message.
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    /// The next expected message; hand it to the consumer now, then call
    /// [`Assertion::drain_ready`] for anything it unblocked.
    Deliverable(Body),
    /// Arrived ahead of a gap and is held until the gap fills.
    Buffered,
    /// Already delivered; must not reach the consumer again.
    Duplicate,
}

/// Counters for monitoring a peer's stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AssertionStats {
    pub sent: u64,
    pub retransmitted: u64,
    pub delivered: u64,
    pub buffered: u64,
    pub duplicates: u64,
    pub requests_sent: u64,
}

#[derive(Debug)]
struct Window<T> {
    tail: u32,
    head: u32,
    slots: Vec<Option<T>>,
}

impl<T> Window<T> {
    fn new(capacity: u32) -> Self {
        Self {
            tail: 0,
            head: 0,
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    fn index(&self, sequence: u32) -> usize {
        (sequence % self.capacity()) as usize
    }

    fn span(&self) -> u32 {
        self.head - self.tail
    }

    fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

/// Reliability state for one peer.
#[derive(Debug)]
pub struct Assertion {
    /// Encoded datagrams awaiting confirmation, ready for retransmission.
    send: Window<Box<[u8]>>,
    /// Bodies that arrived ahead of `receive.tail`.
    receive: Window<Body>,
    /// Raised on out-of-order arrival; cleared once a request goes out.
    send_request: bool,
    /// `receive.tail` as last reported to the peer.
    reported_tail: u32,
    stats: AssertionStats,
}

impl Assertion {
    /// Create empty windows holding at most `capacity` entries each.
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            send: Window::new(capacity),
            receive: Window::new(capacity),
            send_request: false,
            reported_tail: 0,
            stats: AssertionStats::default(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.send.capacity()
    }

    /// Assign the next sequence number to `body`, store the encoded datagram
    /// in the send window and return it for transmission.
    ///
    /// Fails with [`ReliabilityError::WindowFull`] when `capacity` messages
    /// are already unacknowledged. That is fatal for the peer: the caller
    /// must disconnect it, never drop the message and carry on.
    pub fn submit_for_send(&mut self, body: Body) -> Result<&[u8], ReliabilityError> {
        let in_flight = self.send.span();
        if in_flight >= self.send.capacity() {
            return Err(ReliabilityError::WindowFull {
                in_flight,
                capacity: self.send.capacity(),
            });
        }

        let sequence = self.send.head;
        if sequence == UNRELIABLE {
            return Err(ReliabilityError::SequenceExhausted);
        }

        let datagram = Envelope::reliable(sequence, body)
            .encode()?
            .into_boxed_slice();
        let index = self.send.index(sequence);
        self.send.head += 1;
        self.stats.sent += 1;

        Ok(&self.send.slots[index].insert(datagram)[..])
    }

    /// Classify an inbound reliable message against the receive window.
    pub fn accept_received(
        &mut self,
        sequence: u32,
        body: Body,
    ) -> Result<Received, ReliabilityError> {
        let tail = self.receive.tail;
        if sequence < tail {
            // The peer missed our acknowledgement; repeat it on the next tick.
            self.send_request = true;
            self.stats.duplicates += 1;
            return Ok(Received::Duplicate);
        }

        let capacity = self.receive.capacity();
        if sequence - tail >= capacity {
            return Err(ReliabilityError::WindowOverflow {
                sequence,
                tail,
                capacity,
            });
        }

        let index = self.receive.index(sequence);
        if sequence == tail {
            // A copy buffered earlier is superseded by this one.
            self.receive.slots[index] = None;
            self.receive.tail += 1;
            self.receive.head = self.receive.head.max(self.receive.tail);
            self.stats.delivered += 1;
            return Ok(Received::Deliverable(body));
        }

        // Duplicates below tail were filtered above, so the only possible
        // occupant of this slot is an earlier copy of the same sequence.
        self.receive.slots[index] = Some(body);
        self.receive.head = self.receive.head.max(sequence + 1);
        self.send_request = true;
        self.stats.buffered += 1;
        Ok(Received::Buffered)
    }

    /// Yield buffered bodies in order starting at `receive.tail`, stopping at
    /// the first hole.
    pub fn drain_ready(&mut self) -> DrainReady<'_> {
        DrainReady { assertion: self }
    }

    /// Emit an assertion request when one was raised by a gap or a
    /// duplicate, or a plain acknowledgement when the tail advanced since the
    /// last report.
    ///
    /// `peer_id` is stamped into the request (client → server only).
    /// Returns whether a datagram was transmitted; `send_request` stays
    /// raised when transmission fails so the next tick retries.
    pub fn tick<F>(&mut self, peer_id: Option<u32>, send: F) -> Result<bool, ReliabilityError>
    where
        F: FnOnce(&[u8]) -> io::Result<usize>,
    {
        let ack_due = self.receive.tail != self.reported_tail;
        if !self.send_request && !ack_due {
            return Ok(false);
        }

        self.acknowledge(peer_id, send)
    }

    /// Unconditionally report `receive.tail` to the peer.
    pub fn acknowledge<F>(&mut self, peer_id: Option<u32>, send: F) -> Result<bool, ReliabilityError>
    where
        F: FnOnce(&[u8]) -> io::Result<usize>,
    {
        let lowest_missing = self.receive.tail;
        let datagram = Envelope::unreliable(Body::AssertionRequest {
            peer_id,
            lowest_missing,
        })
        .encode()?;

        match send(&datagram) {
            Ok(_) => {
                if self.has_gap() {
                    debug!("Requested retransmission from sequence {}", lowest_missing);
                }
                self.send_request = false;
                self.reported_tail = lowest_missing;
                self.stats.requests_sent += 1;
                Ok(true)
            }
            Err(e) => {
                warn!("Failed to send assertion request ({}): {}", lowest_missing, e);
                Ok(false)
            }
        }
    }

    /// Handle the peer's report that it is missing `count`: free every
    /// outbound entry below it and retransmit the entry at `count`.
    ///
    /// Returns whether a retransmission went out.
    pub fn on_assertion_request<F>(&mut self, count: u32, send: F) -> bool
    where
        F: FnOnce(&[u8]) -> io::Result<usize>,
    {
        let confirmed = count.min(self.send.head);
        while self.send.tail < confirmed {
            let index = self.send.index(self.send.tail);
            self.send.slots[index] = None;
            self.send.tail += 1;
        }

        // A stale request (count below tail) names a slot that may already
        // hold a newer sequence.
        if count < self.send.tail || count >= self.send.head {
            return false;
        }
        self.retransmit(count, send)
    }

    /// Resend the oldest unacknowledged entry, if any.
    pub fn retransmit_oldest<F>(&mut self, send: F) -> bool
    where
        F: FnOnce(&[u8]) -> io::Result<usize>,
    {
        if !self.has_pending() {
            return false;
        }
        self.retransmit(self.send.tail, send)
    }

    fn retransmit<F>(&mut self, sequence: u32, send: F) -> bool
    where
        F: FnOnce(&[u8]) -> io::Result<usize>,
    {
        let index = self.send.index(sequence);
        let Some(datagram) = self.send.slots[index].as_deref() else {
            return false;
        };

        match send(datagram) {
            Ok(_) => {
                debug!("Retransmitted sequence {}", sequence);
                self.stats.retransmitted += 1;
                true
            }
            Err(e) => {
                warn!("Failed to retransmit sequence {}: {}", sequence, e);
                false
            }
        }
    }

    /// True while any sent reliable message is unacknowledged.
    pub fn has_pending(&self) -> bool {
        self.send.tail < self.send.head
    }

    /// True while the receive window has a hole below its head.
    pub fn has_gap(&self) -> bool {
        self.receive.tail < self.receive.head
    }

    /// Number of sent messages awaiting acknowledgement.
    pub fn in_flight(&self) -> u32 {
        self.send.span()
    }

    /// Sequence number the next submitted message will take.
    pub fn next_sequence(&self) -> u32 {
        self.send.head
    }

    /// Lowest sequence not yet received in order.
    pub fn next_expected(&self) -> u32 {
        self.receive.tail
    }

    /// Number of out-of-order bodies currently held.
    pub fn buffered(&self) -> usize {
        self.receive.occupied()
    }

    pub fn send_requested(&self) -> bool {
        self.send_request
    }

    pub fn stats(&self) -> AssertionStats {
        self.stats
    }
}

/// Iterator returned by [`Assertion::drain_ready`].
pub struct DrainReady<'a> {
    assertion: &'a mut Assertion,
}

impl Iterator for DrainReady<'_> {
    type Item = Body;

    fn next(&mut self) -> Option<Body> {
        let receive = &mut self.assertion.receive;
        if receive.tail >= receive.head {
            return None;
        }

        let index = receive.index(receive.tail);
        let body = receive.slots[index].take()?;
        receive.tail += 1;
        self.assertion.stats.delivered += 1;
        Some(body)
    }
}

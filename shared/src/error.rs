//! Error and disconnect-reason types shared by the client and server.

use crate::envelope::{MessageKind, HEADER_LEN};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failures while encoding or decoding a datagram.
#[derive(Debug, Error)]
pub enum WireError {
    /// Fewer bytes than a complete header.
    #[error("datagram of {len} bytes is shorter than the {}-byte header", HEADER_LEN)]
    Truncated { len: usize },

    /// Declared body size disagrees with the bytes actually received.
    #[error("declared body size {declared} does not match {actual} received bytes")]
    SizeMismatch { declared: u32, actual: usize },

    /// Kind byte outside the known message kinds.
    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    /// Body length does not fit the layout of its kind.
    #[error("malformed {kind:?} body of {len} bytes")]
    BadBody { kind: MessageKind, len: usize },

    /// Body too large for the 32-bit size field.
    #[error("body of {0} bytes exceeds the size field")]
    Oversized(usize),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Failures raised by the per-peer reliability engine.
///
/// `WindowFull` and `WindowOverflow` are fatal for the peer: the owning
/// session must disconnect it rather than drop the message.
#[derive(Debug, Error)]
pub enum ReliabilityError {
    #[error("send window full: {in_flight} unacknowledged messages (capacity {capacity})")]
    WindowFull { in_flight: u32, capacity: u32 },

    #[error("sequence {sequence} is beyond the receive window (next expected {tail}, capacity {capacity})")]
    WindowOverflow {
        sequence: u32,
        tail: u32,
        capacity: u32,
    },

    #[error("sequence space exhausted")]
    SequenceExhausted,

    #[error(transparent)]
    Wire(#[from] WireError),
}

impl ReliabilityError {
    /// True for the errors that end the peer's session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReliabilityError::WindowFull { .. }
                | ReliabilityError::WindowOverflow { .. }
                | ReliabilityError::SequenceExhausted
        )
    }
}

/// Why a session ended, reported through the disconnect hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The local side asked to close.
    Requested,
    /// The remote side sent a Disconnect.
    Remote,
    /// Too many unacknowledged reliable messages.
    WindowOverflow,
    /// No datagram from the peer within the timeout.
    Timeout,
    /// Removed explicitly by the server.
    Kicked,
    /// The server shut down.
    ServerClosed,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::Requested => "disconnect requested",
            DisconnectReason::Remote => "peer disconnected",
            DisconnectReason::WindowOverflow => "reliable window overflow",
            DisconnectReason::Timeout => "peer timed out",
            DisconnectReason::Kicked => "kicked by server",
            DisconnectReason::ServerClosed => "server closed",
        };
        f.write_str(text)
    }
}

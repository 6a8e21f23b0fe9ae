//! Wire envelope: fixed header plus a kind-specific body.
//!
//! Every datagram is a 9-byte header followed by `size` body bytes:
//!
//! ```text
//! +----------------+----------------+------+----------------------+
//! | size: u32      | sequence: u32  | kind | body (size bytes)    |
//! +----------------+----------------+------+----------------------+
//! ```
//!
//! Integers are little-endian (bincode's fixed-int encoding) regardless of
//! host byte order. A `sequence` of [`UNRELIABLE`] marks a message that
//! bypasses ordering and acknowledgement entirely.
//!
//! | Kind               | Body                                          |
//! |--------------------|-----------------------------------------------|
//! | `Connect`          | empty                                         |
//! | `Accept`           | peer id                                       |
//! | `Custom`           | peer id, payload                              |
//! | `AssertionRequest` | [peer id,] lowest missing sequence            |
//! | `Disconnect`       | peer id                                       |
//!
//! The peer id of an assertion request is present only client → server.

use crate::error::WireError;
use serde::{Deserialize, Serialize};

/// Byte length of the serialised [`Header`].
pub const HEADER_LEN: usize = 9;

/// Sequence value reserved for unreliable messages.
pub const UNRELIABLE: u32 = u32::MAX;

const ID_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MessageKind {
    Connect = 0,
    Accept = 1,
    Custom = 2,
    AssertionRequest = 3,
    Disconnect = 4,
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageKind::Connect),
            1 => Ok(MessageKind::Accept),
            2 => Ok(MessageKind::Custom),
            3 => Ok(MessageKind::AssertionRequest),
            4 => Ok(MessageKind::Disconnect),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

/// Fixed header preceding every body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Length of the body in bytes.
    pub size: u32,
    /// Reliable sequence number, or [`UNRELIABLE`].
    pub sequence: u32,
    pub kind: MessageKind,
}

/// Decoded message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Connect,
    Accept { peer_id: u32 },
    Custom { peer_id: u32, payload: Vec<u8> },
    AssertionRequest { peer_id: Option<u32>, lowest_missing: u32 },
    Disconnect { peer_id: u32 },
}

impl Body {
    pub fn kind(&self) -> MessageKind {
        match self {
            Body::Connect => MessageKind::Connect,
            Body::Accept { .. } => MessageKind::Accept,
            Body::Custom { .. } => MessageKind::Custom,
            Body::AssertionRequest { .. } => MessageKind::AssertionRequest,
            Body::Disconnect { .. } => MessageKind::Disconnect,
        }
    }

    /// Peer id carried by the body, if its kind has one.
    pub fn peer_id(&self) -> Option<u32> {
        match self {
            Body::Connect => None,
            Body::Accept { peer_id }
            | Body::Custom { peer_id, .. }
            | Body::Disconnect { peer_id } => Some(*peer_id),
            Body::AssertionRequest { peer_id, .. } => *peer_id,
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        match self {
            Body::Connect => {}
            Body::Accept { peer_id } | Body::Disconnect { peer_id } => {
                bincode::serialize_into(&mut *out, peer_id)?;
            }
            Body::Custom { peer_id, payload } => {
                bincode::serialize_into(&mut *out, peer_id)?;
                out.extend_from_slice(payload);
            }
            Body::AssertionRequest {
                peer_id,
                lowest_missing,
            } => {
                if let Some(peer_id) = peer_id {
                    bincode::serialize_into(&mut *out, peer_id)?;
                }
                bincode::serialize_into(&mut *out, lowest_missing)?;
            }
        }
        Ok(())
    }

    fn decode(kind: MessageKind, bytes: &[u8]) -> Result<Self, WireError> {
        let bad = || WireError::BadBody {
            kind,
            len: bytes.len(),
        };

        let body = match (kind, bytes.len()) {
            (MessageKind::Connect, 0) => Body::Connect,
            (MessageKind::Accept, ID_LEN) => Body::Accept {
                peer_id: read_u32(bytes)?,
            },
            (MessageKind::Disconnect, ID_LEN) => Body::Disconnect {
                peer_id: read_u32(bytes)?,
            },
            (MessageKind::Custom, len) if len >= ID_LEN => Body::Custom {
                peer_id: read_u32(&bytes[..ID_LEN])?,
                payload: bytes[ID_LEN..].to_vec(),
            },
            (MessageKind::AssertionRequest, ID_LEN) => Body::AssertionRequest {
                peer_id: None,
                lowest_missing: read_u32(bytes)?,
            },
            (MessageKind::AssertionRequest, 8) => Body::AssertionRequest {
                peer_id: Some(read_u32(&bytes[..ID_LEN])?),
                lowest_missing: read_u32(&bytes[ID_LEN..])?,
            },
            _ => return Err(bad()),
        };
        Ok(body)
    }
}

fn read_u32(bytes: &[u8]) -> Result<u32, WireError> {
    Ok(bincode::deserialize(bytes)?)
}

/// A complete datagram: sequence value plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sequence: u32,
    pub body: Body,
}

impl Envelope {
    pub fn unreliable(body: Body) -> Self {
        Self {
            sequence: UNRELIABLE,
            body,
        }
    }

    pub fn reliable(sequence: u32, body: Body) -> Self {
        Self { sequence, body }
    }

    pub fn is_reliable(&self) -> bool {
        self.sequence != UNRELIABLE
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Serialise header and body into a single datagram.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut body = Vec::new();
        self.body.encode_into(&mut body)?;
        let size = u32::try_from(body.len()).map_err(|_| WireError::Oversized(body.len()))?;

        let header = Header {
            size,
            sequence: self.sequence,
            kind: self.kind(),
        };

        let mut datagram = Vec::with_capacity(HEADER_LEN + body.len());
        bincode::serialize_into(&mut datagram, &header)?;
        datagram.extend_from_slice(&body);
        Ok(datagram)
    }

    /// Parse a datagram, rejecting anything whose declared size does not
    /// match the bytes received.
    pub fn decode(datagram: &[u8]) -> Result<Self, WireError> {
        if datagram.len() < HEADER_LEN {
            return Err(WireError::Truncated {
                len: datagram.len(),
            });
        }

        // Checked first so an unknown kind is reported as such rather than
        // as an opaque codec error.
        MessageKind::try_from(datagram[HEADER_LEN - 1])?;
        let header: Header = bincode::deserialize(&datagram[..HEADER_LEN])?;

        let body = &datagram[HEADER_LEN..];
        if body.len() != header.size as usize {
            return Err(WireError::SizeMismatch {
                declared: header.size,
                actual: body.len(),
            });
        }

        Ok(Self {
            sequence: header.sequence,
            body: Body::decode(header.kind, body)?,
        })
    }
}

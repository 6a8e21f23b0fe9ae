//! Protocol building blocks shared by the client and the server.
//!
//! - [`envelope`]: wire header, message kinds and bodies
//! - [`assertion`]: per-peer selective-repeat windows
//! - [`queue`]: FIFO handing delivered payloads to the application
//! - [`transport`]: datagram primitives over `std::net::UdpSocket`
//! - [`simulator`]: loss and duplication injection for tests and demos
//! - [`config`]: client and server settings
//! - [`error`]: error enums and disconnect reasons
//! - [`chat`]: line framing used by the relay binaries

pub mod assertion;
pub mod chat;
pub mod config;
pub mod envelope;
pub mod error;
pub mod queue;
pub mod simulator;
pub mod transport;

pub use assertion::{Assertion, AssertionStats, Received};
pub use config::{ClientConfig, ServerConfig};
pub use envelope::{Body, Envelope, Header, MessageKind, HEADER_LEN, UNRELIABLE};
pub use error::{DisconnectReason, ReliabilityError, WireError};
pub use queue::{Message, MessageQueue};
pub use transport::Transport;

/// Unacknowledged reliable messages a peer may have in flight.
pub const WINDOW_CAPACITY: u32 = 256;

/// Largest payload that fits a Custom body in one default-sized datagram.
pub const MAX_PAYLOAD: usize = max_payload(config::DEFAULT_BUFFER_CAPACITY);

/// Largest Custom payload a peer receiving into `buffer_capacity` bytes
/// can decode. The body carries a 4-byte peer id ahead of the payload.
pub const fn max_payload(buffer_capacity: usize) -> usize {
    buffer_capacity.saturating_sub(HEADER_LEN + 4)
}

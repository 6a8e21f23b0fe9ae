//! # Message Server Library
//!
//! This library provides the server side of the reliable UDP messaging
//! protocol. It accepts client sessions on a single socket, keeps an
//! independent reliable stream to and from every client, and hands
//! delivered payloads to the application in arrival order.
//!
//! ## Core Responsibilities
//!
//! ### Client Registry
//! Handles the complete lifecycle of client sessions including:
//! - Connection establishment and id assignment
//! - Accept policy through an application hook
//! - Explicit disconnects, kicks and idle timeouts
//! - Disconnect notification with the reason
//!
//! ### Reliable Streams
//! Every client owns its own sequence space. Reliable messages from a client
//! are delivered to the application exactly once and in order; missing
//! sequences are requested back from the client. Reliable messages to a
//! client stay buffered until the client acknowledges them.
//!
//! ### Unreliable Traffic
//! Messages sent outside the reliable stream are delivered as soon as they
//! arrive, or not at all, and never wait behind a gap.
//!
//! ## Architecture Design
//!
//! ### One Network Thread
//! All receiving, acknowledgement and retransmission happens on one thread
//! per server. Application threads only submit messages and drain the
//! delivery queue; each client's window has its own lock, so a send to one
//! client never waits on traffic from another.
//!
//! ### Bounded Windows
//! A client that stops acknowledging fills its send window; the next send is
//! rejected and the client is disconnected rather than growing memory
//! without bound.
//!
//! ## Module Organization
//!
//! ### Client Manager Module (`client_manager`)
//! Tracks connected clients and their per-client state:
//! - Slot table with a fixed capacity
//! - Address lookup and activity timestamps
//! - Pending disconnects and timeout detection
//! - Recipient selection for sends
//!
//! ### Network Module (`network`)
//! Handles the socket and protocol dispatch:
//! - Datagram decoding and validation
//! - Handshake, acknowledgement and retransmission
//! - Delivery queue and the public send API
//! - Orderly shutdown
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::client_manager::Recipients;
//! use server::network::{Server, ServerHooks};
//! use shared::ServerConfig;
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::new("127.0.0.1:8080".parse()?);
//!     let hooks = ServerHooks::new().on_disconnect(|id, reason| {
//!         println!("client {} left: {}", id, reason);
//!     });
//!     let server = Server::initialize(config, hooks)?;
//!
//!     // Echo every message back to everyone but its sender.
//!     while server.exists() {
//!         if let Some(message) = server.wait_message(Duration::from_millis(100)) {
//!             server.send(Recipients::AllExcept(&[message.peer_id]), &message.data, true)?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod network;

//! # Message Client Library
//!
//! Client side of the reliable UDP messaging protocol. A [`network::Client`]
//! connects to one server, then runs a session thread that receives,
//! acknowledges and retransmits while the application sends and polls.
//!
//! ## Session Lifecycle
//! `Connecting` blocks in [`network::Client::initialize`] until the server
//! accepts and assigns an id, or the connect timeout expires. `Connected`
//! runs the session thread. [`network::Client::close`] moves to
//! `Disconnecting`: a reliable Disconnect is queued behind any unconfirmed
//! messages, and the thread keeps servicing retransmission until the server
//! confirms all of them or the linger timeout expires.
//!
//! ## Delivery Guarantees
//! Reliable messages arrive exactly once and in send order. Unreliable
//! messages skip ordering entirely and may be lost.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::Client;
//! use shared::ClientConfig;
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new("127.0.0.1:8080".parse()?);
//!     let client = Client::initialize(config, None)?;
//!
//!     client.send(b"hello", true)?;
//!     if let Some(message) = client.wait_message(Duration::from_secs(1)) {
//!         println!("{} bytes from the server", message.data.len());
//!     }
//!
//!     client.close();
//!     Ok(())
//! }
//! ```

pub mod network;

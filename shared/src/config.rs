//! Session configuration for both ends of the connection.

use crate::WINDOW_CAPACITY;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Receive buffer size; one datagram never exceeds it.
pub const DEFAULT_BUFFER_CAPACITY: usize = 2048;
pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server_addr: SocketAddr,
    pub buffer_capacity: usize,
    pub window_capacity: u32,
    /// How long the handshake may wait for an Accept.
    pub connect_timeout: Duration,
    /// Upper bound of each blocking receive.
    pub poll_timeout: Duration,
    /// Interval of acknowledgements and oldest-entry retransmission sent
    /// even when idle.
    pub keepalive_interval: Duration,
    /// Longest a closing session keeps retransmitting its Disconnect.
    pub linger_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            window_capacity: WINDOW_CAPACITY,
            connect_timeout: Duration::from_secs(2),
            poll_timeout: Duration::from_millis(20),
            keepalive_interval: Duration::from_millis(250),
            linger_timeout: Duration::from_secs(1),
        }
    }
}

impl ClientConfig {
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub max_clients: usize,
    pub buffer_capacity: usize,
    pub window_capacity: u32,
    pub poll_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Silence after which a client is dropped.
    pub client_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            max_clients: 32,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            window_capacity: WINDOW_CAPACITY,
            poll_timeout: Duration::from_millis(20),
            keepalive_interval: Duration::from_millis(250),
            client_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Self::default()
        }
    }
}

//! Datagram transport abstraction.
//!
//! Sessions only need three primitives from the network: send a datagram,
//! receive one with a bounded wait, and report the bound address. The
//! standard `UdpSocket` provides them directly; [`crate::simulator`] wraps
//! any transport to inject loss for testing.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

pub trait Transport: Send + Sync + 'static {
    fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Receive one datagram, returning a timeout error once the configured
    /// poll interval elapses without traffic.
    fn recv_from(&self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Transport for UdpSocket {
    fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, datagram, addr)
    }

    fn recv_from(&self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buffer)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Bind a UDP socket whose receives block at most `poll_timeout`.
pub fn bind<A: ToSocketAddrs>(addr: A, poll_timeout: Duration) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr)?;
    // A zero duration would mean "block forever" to the OS.
    let poll_timeout = poll_timeout.max(Duration::from_millis(1));
    socket.set_read_timeout(Some(poll_timeout))?;
    Ok(socket)
}

/// Unspecified local address of the same family as `remote`.
pub fn any_local_for(remote: SocketAddr) -> SocketAddr {
    match remote {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    }
}

/// True for the errors a timed-out receive produces.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// True for receive errors caused by an earlier send to a closed port
/// (reported asynchronously on some platforms); the loop keeps going.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
    )
}

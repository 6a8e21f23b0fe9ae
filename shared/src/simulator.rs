//! Fault-injecting transport for exercising the reliability engine.
//!
//! [`LossyTransport`] wraps another [`Transport`] and, on the send path,
//! drops datagrams with probability `loss_rate`, duplicates them with
//! probability `duplicate_rate`, or drops whatever an explicit filter
//! selects. Receives pass straight through. The RNG is seeded so a failing
//! run can be replayed.

use crate::transport::Transport;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Fault model. Probabilities are clamped to `[0.0, 1.0]` and NaN counts as 0.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulatorConfig {
    pub loss_rate: f64,
    pub duplicate_rate: f64,
    pub seed: u64,
}

/// Returns true for datagrams that should be dropped.
pub type DropFilter = Box<dyn FnMut(&[u8]) -> bool + Send>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatorStats {
    pub sent: u64,
    pub dropped: u64,
    pub duplicated: u64,
}

pub struct LossyTransport<T> {
    inner: T,
    loss_rate: f64,
    duplicate_rate: f64,
    rng: Mutex<StdRng>,
    filter: Mutex<Option<DropFilter>>,
    sent: AtomicU64,
    dropped: AtomicU64,
    duplicated: AtomicU64,
}

fn probability(rate: f64) -> f64 {
    if rate.is_nan() {
        0.0
    } else {
        rate.clamp(0.0, 1.0)
    }
}

impl<T: Transport> LossyTransport<T> {
    pub fn new(inner: T, config: SimulatorConfig) -> Self {
        Self {
            inner,
            loss_rate: probability(config.loss_rate),
            duplicate_rate: probability(config.duplicate_rate),
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
            filter: Mutex::new(None),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            duplicated: AtomicU64::new(0),
        }
    }

    /// Pass-through wrapper that drops only what `filter` selects.
    pub fn with_filter<F>(inner: T, filter: F) -> Self
    where
        F: FnMut(&[u8]) -> bool + Send + 'static,
    {
        let transport = Self::new(inner, SimulatorConfig::default());
        transport.set_filter(filter);
        transport
    }

    pub fn set_filter<F>(&self, filter: F)
    where
        F: FnMut(&[u8]) -> bool + Send + 'static,
    {
        *self.filter.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(filter));
    }

    pub fn stats(&self) -> SimulatorStats {
        SimulatorStats {
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            duplicated: self.duplicated.load(Ordering::Relaxed),
        }
    }

    fn roll(&self, probability: f64) -> bool {
        probability > 0.0
            && self
                .rng
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .gen_bool(probability)
    }

    fn filtered(&self, datagram: &[u8]) -> bool {
        self.filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .map_or(false, |filter| filter(datagram))
    }
}

impl<T: Transport> Transport for LossyTransport<T> {
    fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.sent.fetch_add(1, Ordering::Relaxed);

        if self.filtered(datagram) || self.roll(self.loss_rate) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Simulator dropped {} byte datagram to {}", datagram.len(), addr);
            // The sender cannot observe loss on the wire.
            return Ok(datagram.len());
        }

        let len = self.inner.send_to(datagram, addr)?;
        if self.roll(self.duplicate_rate) {
            self.duplicated.fetch_add(1, Ordering::Relaxed);
            self.inner.send_to(datagram, addr)?;
        }
        Ok(len)
    }

    fn recv_from(&self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buffer)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport;
    use assert_approx_eq::assert_approx_eq;
    use std::net::UdpSocket;
    use std::time::Duration;

    fn pair() -> (UdpSocket, UdpSocket, SocketAddr) {
        let a = transport::bind("127.0.0.1:0", Duration::from_millis(50)).unwrap();
        let b = transport::bind("127.0.0.1:0", Duration::from_millis(50)).unwrap();
        let b_addr = b.local_addr().unwrap();
        (a, b, b_addr)
    }

    #[test]
    fn test_default_is_pass_through() {
        let (a, b, b_addr) = pair();
        let lossy = LossyTransport::new(a, SimulatorConfig::default());

        lossy.send_to(b"hello", b_addr).unwrap();
        let mut buffer = [0u8; 16];
        let (len, _) = b.recv_from(&mut buffer).unwrap();
        assert_eq!(&buffer[..len], b"hello");
        assert_eq!(lossy.stats().dropped, 0);
    }

    #[test]
    fn test_filter_drops_selected() {
        let (a, b, b_addr) = pair();
        let lossy = LossyTransport::with_filter(a, |datagram| datagram == b"drop");

        assert_eq!(lossy.send_to(b"drop", b_addr).unwrap(), 4);
        lossy.send_to(b"keep", b_addr).unwrap();

        let mut buffer = [0u8; 16];
        let (len, _) = b.recv_from(&mut buffer).unwrap();
        assert_eq!(&buffer[..len], b"keep");

        let stats = lossy.stats();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn test_loss_rate_is_respected() {
        let (a, _b, b_addr) = pair();
        let lossy = LossyTransport::new(
            a,
            SimulatorConfig {
                loss_rate: 0.25,
                duplicate_rate: 0.0,
                seed: 7,
            },
        );

        let total = 4000;
        for _ in 0..total {
            lossy.send_to(b"x", b_addr).unwrap();
        }

        let ratio = lossy.stats().dropped as f64 / total as f64;
        assert_approx_eq!(ratio, 0.25, 0.05);
    }

    #[test]
    fn test_full_loss_and_clamping() {
        let (a, _b, b_addr) = pair();
        let lossy = LossyTransport::new(
            a,
            SimulatorConfig {
                loss_rate: 7.0,
                duplicate_rate: -1.0,
                seed: 1,
            },
        );

        for _ in 0..10 {
            lossy.send_to(b"x", b_addr).unwrap();
        }
        let stats = lossy.stats();
        assert_eq!(stats.dropped, 10);
        assert_eq!(stats.duplicated, 0);
    }

    #[test]
    fn test_nan_rates_disable_faults() {
        let (a, b, b_addr) = pair();
        let lossy = LossyTransport::new(
            a,
            SimulatorConfig {
                loss_rate: f64::NAN,
                duplicate_rate: f64::NAN,
                seed: 5,
            },
        );

        for _ in 0..10 {
            lossy.send_to(b"x", b_addr).unwrap();
        }
        let mut buffer = [0u8; 16];
        for _ in 0..10 {
            assert!(b.recv_from(&mut buffer).is_ok());
        }
        assert_eq!(lossy.stats(), SimulatorStats {
            sent: 10,
            dropped: 0,
            duplicated: 0,
        });
    }

    #[test]
    fn test_duplication() {
        let (a, b, b_addr) = pair();
        let lossy = LossyTransport::new(
            a,
            SimulatorConfig {
                loss_rate: 0.0,
                duplicate_rate: 1.0,
                seed: 3,
            },
        );

        lossy.send_to(b"twice", b_addr).unwrap();
        let mut buffer = [0u8; 16];
        for _ in 0..2 {
            let (len, _) = b.recv_from(&mut buffer).unwrap();
            assert_eq!(&buffer[..len], b"twice");
        }
        assert_eq!(lossy.stats().duplicated, 1);
    }
}

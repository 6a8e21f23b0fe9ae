//! Client network layer: handshake, session thread and reliable send API

use log::{debug, error, info, warn};
use shared::transport::{self, Transport};
use shared::{
    Assertion, AssertionStats, Body, ClientConfig, DisconnectReason, Envelope, Message,
    MessageKind, MessageQueue, Received, ReliabilityError, WireError,
};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Called once on the network thread when the session ends.
pub type DisconnectHook = Box<dyn Fn(DisconnectReason) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("no Accept from {addr} within {timeout:?}")]
    ConnectTimeout { addr: SocketAddr, timeout: Duration },

    #[error("server answered Connect with {0:?}")]
    HandshakeMismatch(MessageKind),

    #[error("session is not connected")]
    NotConnected,

    #[error("payload of {len} bytes exceeds the {max}-byte datagram limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("reliable window overflowed; session closed")]
    WindowOverflow,

    #[error(transparent)]
    Reliability(#[from] ReliabilityError),

    #[error(transparent)]
    Wire(#[from] WireError),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct Status {
    state: SessionState,
    reason: Option<DisconnectReason>,
    closing_since: Option<Instant>,
}

impl Status {
    /// Records why the session ends. The first reason wins.
    fn end(&mut self, reason: DisconnectReason) -> bool {
        if self.reason.is_some() {
            return false;
        }
        self.reason = Some(reason);
        self.state = SessionState::Disconnecting;
        if reason == DisconnectReason::Requested {
            self.closing_since = Some(Instant::now());
        }
        true
    }
}

/// State shared between the client handle and its network thread
struct Shared {
    transport: Box<dyn Transport>,
    server_addr: SocketAddr,
    id: u32,
    assertion: Mutex<Assertion>,
    queue: MessageQueue,
    status: Mutex<Status>,
    config: ClientConfig,
    hook: Option<DisconnectHook>,
}

impl Shared {
    fn transmit(&self, datagram: &[u8]) -> bool {
        match self.transport.send_to(datagram, self.server_addr) {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to send datagram to {}: {}", self.server_addr, e);
                false
            }
        }
    }

    fn end(&self, reason: DisconnectReason) -> bool {
        lock(&self.status).end(reason)
    }

    /// Loop condition: run until the session ends, then linger while the
    /// Disconnect or earlier messages remain unacknowledged.
    fn keep_running(&self) -> bool {
        let status = lock(&self.status);
        match status.reason {
            None => true,
            Some(DisconnectReason::Requested) => {
                if !lock(&self.assertion).has_pending() {
                    return false;
                }
                let lingering = status
                    .closing_since
                    .map_or(Duration::ZERO, |since| since.elapsed());
                if lingering >= self.config.linger_timeout {
                    warn!(
                        "Server did not confirm disconnect within {:?}, closing anyway",
                        self.config.linger_timeout
                    );
                    return false;
                }
                true
            }
            Some(_) => false,
        }
    }

    /// Main loop of the network thread
    fn run(self: Arc<Self>) {
        let mut buffer = vec![0u8; self.config.buffer_capacity];
        let mut last_keepalive = Instant::now();

        while self.keep_running() {
            match self.transport.recv_from(&mut buffer) {
                Ok((len, addr)) => self.on_datagram(addr, &buffer[..len]),
                Err(e) if transport::is_timeout(&e) => {}
                Err(e) if transport::is_transient(&e) => {
                    debug!("Transient receive error: {}", e);
                }
                Err(e) => {
                    error!("Error receiving datagram: {}", e);
                    thread::sleep(self.config.poll_timeout);
                }
            }

            let ticked = lock(&self.assertion).tick(Some(self.id), |datagram| {
                self.transport.send_to(datagram, self.server_addr)
            });
            if let Err(e) = ticked {
                error!("Failed to build assertion request: {}", e);
            }

            if last_keepalive.elapsed() >= self.config.keepalive_interval {
                last_keepalive = Instant::now();
                self.keepalive();
            }
        }

        let reason = {
            let mut status = lock(&self.status);
            status.state = SessionState::Disconnected;
            status.reason.unwrap_or(DisconnectReason::Requested)
        };

        if reason == DisconnectReason::WindowOverflow {
            self.notify_disconnect();
        }

        info!("Disconnected from server: {}", reason);
        if let Some(hook) = &self.hook {
            hook(reason);
        }
    }

    /// Best-effort unreliable Disconnect so the server frees the slot now
    /// instead of waiting out its client timeout.
    fn notify_disconnect(&self) {
        match Envelope::unreliable(Body::Disconnect { peer_id: self.id }).encode() {
            Ok(datagram) => {
                self.transmit(&datagram);
            }
            Err(e) => error!("Failed to encode Disconnect: {}", e),
        }
    }

    /// Reports the receive tail and resends the oldest unconfirmed message
    fn keepalive(&self) {
        let mut assertion = lock(&self.assertion);
        let send = |datagram: &[u8]| self.transport.send_to(datagram, self.server_addr);

        if let Err(e) = assertion.acknowledge(Some(self.id), send) {
            error!("Failed to build acknowledgement: {}", e);
        }
        assertion.retransmit_oldest(send);
    }

    fn on_datagram(&self, addr: SocketAddr, datagram: &[u8]) {
        if addr != self.server_addr {
            debug!("Ignoring datagram from {}", addr);
            return;
        }

        let envelope = match Envelope::decode(datagram) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed datagram: {}", e);
                return;
            }
        };

        match envelope.body {
            Body::AssertionRequest { lowest_missing, .. } => {
                lock(&self.assertion).on_assertion_request(lowest_missing, |datagram| {
                    self.transport.send_to(datagram, self.server_addr)
                });
            }
            Body::Custom { .. } | Body::Disconnect { .. } => self.on_message(envelope),
            // Late answers to a repeated Connect.
            Body::Accept { .. } | Body::Connect => {
                debug!("Ignoring {:?} from server", envelope.kind());
            }
        }
    }

    fn on_message(&self, envelope: Envelope) {
        if envelope.body.peer_id() != Some(self.id) {
            warn!(
                "Dropping message addressed to {:?}, our id is {}",
                envelope.body.peer_id(),
                self.id
            );
            return;
        }

        if !envelope.is_reliable() {
            self.dispatch(envelope.body);
            return;
        }

        let sequence = envelope.sequence;
        let ready = {
            let mut assertion = lock(&self.assertion);
            match assertion.accept_received(sequence, envelope.body) {
                Ok(Received::Deliverable(body)) => {
                    let mut ready = vec![body];
                    ready.extend(assertion.drain_ready());
                    ready
                }
                Ok(Received::Buffered) => {
                    debug!(
                        "Buffered sequence {} (expecting {})",
                        sequence,
                        assertion.next_expected()
                    );
                    return;
                }
                Ok(Received::Duplicate) => {
                    debug!("Dropped duplicate sequence {}", sequence);
                    return;
                }
                Err(e) => {
                    drop(assertion);
                    error!("{}", e);
                    self.end(DisconnectReason::WindowOverflow);
                    return;
                }
            }
        };

        for body in ready {
            self.dispatch(body);
        }
    }

    fn dispatch(&self, body: Body) {
        match body {
            Body::Custom { peer_id, payload } => self.queue.push(Message {
                peer_id,
                data: payload,
            }),
            Body::Disconnect { .. } => {
                info!("Server closed the session");
                self.end(DisconnectReason::Remote);
            }
            other => warn!("Unexpected {:?} from server", other.kind()),
        }
    }
}

/// Sends Connect until the server answers, returning the assigned id.
///
/// Connect is repeated every keepalive interval so one lost datagram does
/// not cost the whole timeout.
fn handshake(transport: &dyn Transport, config: &ClientConfig) -> Result<u32, ClientError> {
    let connect = Envelope::unreliable(Body::Connect).encode()?;
    let mut buffer = vec![0u8; config.buffer_capacity];
    let deadline = Instant::now() + config.connect_timeout;
    let mut last_attempt: Option<Instant> = None;

    info!("Connecting to {}...", config.server_addr);

    while Instant::now() < deadline {
        if last_attempt.map_or(true, |at| at.elapsed() >= config.keepalive_interval) {
            transport.send_to(&connect, config.server_addr)?;
            last_attempt = Some(Instant::now());
        }

        let (len, from) = match transport.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(e) if transport::is_timeout(&e) || transport::is_transient(&e) => continue,
            Err(e) => return Err(e.into()),
        };

        if from != config.server_addr {
            debug!("Ignoring datagram from {} during handshake", from);
            continue;
        }

        match Envelope::decode(&buffer[..len]) {
            Ok(Envelope {
                body: Body::Accept { peer_id },
                ..
            }) => {
                info!("Connected! Client ID: {}", peer_id);
                return Ok(peer_id);
            }
            Ok(envelope) => return Err(ClientError::HandshakeMismatch(envelope.kind())),
            Err(e) => warn!("Dropping malformed datagram during handshake: {}", e),
        }
    }

    Err(ClientError::ConnectTimeout {
        addr: config.server_addr,
        timeout: config.connect_timeout,
    })
}

/// Client session with one server
///
/// Every method takes `&self`, so the client can be shared across threads
/// behind an `Arc`. Dropping the client closes it.
pub struct Client {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.shared.id)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connects to `config.server_addr` and starts the session thread.
    ///
    /// Blocks for up to `config.connect_timeout` waiting for the server to
    /// accept.
    pub fn initialize(
        config: ClientConfig,
        on_disconnect: Option<DisconnectHook>,
    ) -> Result<Self, ClientError> {
        let socket = transport::bind(
            transport::any_local_for(config.server_addr),
            config.poll_timeout,
        )?;
        Self::with_transport(socket, config, on_disconnect)
    }

    /// Connects over an already bound transport.
    pub fn with_transport<T: Transport>(
        transport: T,
        config: ClientConfig,
        on_disconnect: Option<DisconnectHook>,
    ) -> Result<Self, ClientError> {
        let local_addr = transport.local_addr()?;
        let id = handshake(&transport, &config)?;

        let shared = Arc::new(Shared {
            transport: Box::new(transport),
            server_addr: config.server_addr,
            id,
            assertion: Mutex::new(Assertion::new(config.window_capacity)),
            queue: MessageQueue::new(),
            status: Mutex::new(Status {
                state: SessionState::Connected,
                reason: None,
                closing_since: None,
            }),
            config,
            hook: on_disconnect,
        });

        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("client-{}-network", id))
                .spawn(move || shared.run())?
        };

        Ok(Client {
            shared,
            local_addr,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Sends `data` to the server.
    ///
    /// Reliable messages are numbered and transmitted under the window lock,
    /// so concurrent callers get strictly increasing sequences in
    /// transmission order. A full window ends the session with
    /// [`DisconnectReason::WindowOverflow`]. Payloads that would not fit the
    /// server's receive buffer are refused with
    /// [`ClientError::PayloadTooLarge`].
    pub fn send(&self, data: &[u8], reliable: bool) -> Result<(), ClientError> {
        if self.state() != SessionState::Connected {
            return Err(ClientError::NotConnected);
        }

        let max = shared::max_payload(self.shared.config.buffer_capacity);
        if data.len() > max {
            return Err(ClientError::PayloadTooLarge {
                len: data.len(),
                max,
            });
        }

        let body = Body::Custom {
            peer_id: self.shared.id,
            payload: data.to_vec(),
        };

        if !reliable {
            let datagram = Envelope::unreliable(body).encode()?;
            self.shared.transmit(&datagram);
            return Ok(());
        }

        let overflow = {
            let mut assertion = lock(&self.shared.assertion);
            match assertion.submit_for_send(body) {
                Ok(datagram) => {
                    self.shared.transmit(datagram);
                    return Ok(());
                }
                Err(e) if e.is_fatal() => e,
                Err(e) => return Err(e.into()),
            }
        };

        error!("{}", overflow);
        self.shared.end(DisconnectReason::WindowOverflow);
        Err(ClientError::WindowOverflow)
    }

    /// Next delivered message, if one is waiting.
    pub fn poll_message(&self) -> Option<Message> {
        self.shared.queue.pop()
    }

    /// Like [`poll_message`](Self::poll_message) but waits up to `timeout`.
    pub fn wait_message(&self, timeout: Duration) -> Option<Message> {
        self.shared.queue.wait_pop(timeout)
    }

    /// Ends the session.
    ///
    /// Submits a reliable Disconnect, then blocks while the session thread
    /// retransmits until the server has confirmed everything sent, or for at
    /// most `linger_timeout`. Idempotent.
    pub fn close(&self) {
        let Some(handle) = lock(&self.thread).take() else {
            return;
        };

        // The Disconnect is in the window before the thread can observe
        // Requested, so it lingers until the Disconnect is confirmed.
        let mut status = lock(&self.shared.status);
        if status.end(DisconnectReason::Requested) {
            info!("Disconnecting from server...");
            let submitted = lock(&self.shared.assertion)
                .submit_for_send(Body::Disconnect {
                    peer_id: self.shared.id,
                })
                .map(|datagram| self.shared.transmit(datagram));
            if let Err(e) = submitted {
                warn!("Could not queue Disconnect: {}", e);
            }
        }
        drop(status);

        if handle.join().is_err() {
            error!("Client network thread panicked");
        }
    }

    /// Id assigned by the server.
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        lock(&self.shared.status).state
    }

    /// True while a sent reliable message is unacknowledged.
    pub fn has_pending(&self) -> bool {
        lock(&self.shared.assertion).has_pending()
    }

    pub fn stats(&self) -> AssertionStats {
        lock(&self.shared.assertion).stats()
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.shared.server_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

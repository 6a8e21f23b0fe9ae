//! Server network layer handling UDP datagrams and per-client reliability

use crate::client_manager::{ClientManager, Recipients, SharedAssertion};
use log::{debug, error, info, warn};
use shared::transport::{self, Transport};
use shared::{
    AssertionStats, Body, DisconnectReason, Envelope, Message, MessageKind, MessageQueue,
    Received, ReliabilityError, ServerConfig, WireError,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Decides whether a connection attempt from an address is accepted.
pub type AcceptHook = Box<dyn Fn(SocketAddr) -> bool + Send + Sync>;

/// Notified once per removed client, with the reason.
pub type DisconnectHook = Box<dyn Fn(u32, DisconnectReason) + Send + Sync>;

/// Policy callbacks run on the network thread; they must not block.
#[derive(Default)]
pub struct ServerHooks {
    accept: Option<AcceptHook>,
    disconnect: Option<DisconnectHook>,
}

impl ServerHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_accept<F>(mut self, hook: F) -> Self
    where
        F: Fn(SocketAddr) -> bool + Send + Sync + 'static,
    {
        self.accept = Some(Box::new(hook));
        self
    }

    pub fn on_disconnect<F>(mut self, hook: F) -> Self
    where
        F: Fn(u32, DisconnectReason) + Send + Sync + 'static,
    {
        self.disconnect = Some(Box::new(hook));
        self
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown client {0}")]
    UnknownClient(u32),

    #[error("payload of {len} bytes exceeds the {max}-byte datagram limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("client {0} exceeded its reliable window and was disconnected")]
    WindowOverflow(u32),

    #[error("server is closed")]
    Closed,

    #[error(transparent)]
    Reliability(#[from] ReliabilityError),

    #[error(transparent)]
    Wire(#[from] WireError),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the server handle and its network thread
struct Shared {
    transport: Arc<dyn Transport>,
    clients: Mutex<ClientManager>,
    queue: MessageQueue,
    running: AtomicBool,
    config: ServerConfig,
    hooks: ServerHooks,
}

impl Shared {
    fn transmit(&self, datagram: &[u8], addr: SocketAddr) -> bool {
        match self.transport.send_to(datagram, addr) {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to send datagram to {}: {}", addr, e);
                false
            }
        }
    }

    fn send_control(&self, body: Body, addr: SocketAddr) {
        match Envelope::unreliable(body).encode() {
            Ok(datagram) => {
                self.transmit(&datagram, addr);
            }
            Err(e) => error!("Failed to encode control message for {}: {}", addr, e),
        }
    }

    /// Main loop of the network thread
    fn run(self: Arc<Self>) {
        let mut buffer = vec![0u8; self.config.buffer_capacity];
        let mut last_refresh = Instant::now();

        info!("Server started successfully");

        while self.running.load(Ordering::Acquire) {
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

            self.tick_clients();

            if last_refresh.elapsed() >= self.config.keepalive_interval {
                last_refresh = Instant::now();
                self.refresh_clients();
                self.check_timeouts();
            }

            self.reap();
        }

        self.shutdown();
        info!("Server shutting down");
    }

    fn on_datagram(&self, addr: SocketAddr, datagram: &[u8]) {
        let envelope = match Envelope::decode(datagram) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed datagram from {}: {}", addr, e);
                return;
            }
        };

        match envelope.body {
            Body::Connect => self.on_connect(addr),
            Body::AssertionRequest { lowest_missing, .. } => {
                let touched = lock(&self.clients).touch(addr);
                let Some((_, window)) = touched else {
                    debug!("Ignoring assertion request from unregistered {}", addr);
                    return;
                };
                lock(&window).on_assertion_request(lowest_missing, |datagram| {
                    self.transport.send_to(datagram, addr)
                });
            }
            Body::Accept { .. } => warn!("Unexpected Accept from {}", addr),
            Body::Custom { .. } | Body::Disconnect { .. } => self.on_message(addr, envelope),
        }
    }

    /// Registers a new address, or re-sends Accept to a known one whose
    /// first Accept was lost
    fn on_connect(&self, addr: SocketAddr) {
        let (active, known) = {
            let mut clients = lock(&self.clients);
            (
                clients.touch(addr).map(|(client_id, _)| client_id),
                clients.find_client_by_addr(addr),
            )
        };

        if let Some(client_id) = active {
            debug!("Repeated Connect from {}, re-sending Accept", addr);
            self.send_control(Body::Accept { peer_id: client_id }, addr);
            return;
        }
        if known.is_some() {
            debug!("Ignoring Connect from {} while its old session closes", addr);
            return;
        }

        if let Some(accept) = &self.hooks.accept {
            if !accept(addr) {
                warn!("Connection from {} rejected by accept policy", addr);
                return;
            }
        }

        let added = lock(&self.clients).add_client(addr);
        match added {
            Some(client_id) => self.send_control(Body::Accept { peer_id: client_id }, addr),
            None => warn!(
                "Registration failed for {}: all {} slots in use",
                addr, self.config.max_clients
            ),
        }
    }

    fn on_message(&self, addr: SocketAddr, envelope: Envelope) {
        let touched = lock(&self.clients).touch(addr);
        let Some((client_id, window)) = touched else {
            // A retransmitted Disconnect whose acknowledgement was lost
            // after the slot was reaped.
            if envelope.is_reliable() && envelope.kind() == MessageKind::Disconnect {
                debug!("Acknowledging late Disconnect from {}", addr);
                self.send_control(
                    Body::AssertionRequest {
                        peer_id: None,
                        lowest_missing: envelope.sequence.wrapping_add(1),
                    },
                    addr,
                );
                return;
            }
            warn!("Dropping {:?} from unregistered {}", envelope.kind(), addr);
            return;
        };

        if envelope.body.peer_id() != Some(client_id) {
            warn!(
                "Dropping message from client {} stamped with id {:?}",
                client_id,
                envelope.body.peer_id()
            );
            return;
        }

        if !envelope.is_reliable() {
            self.dispatch(client_id, addr, &window, envelope.body);
            return;
        }

        let sequence = envelope.sequence;
        let ready = {
            let mut assertion = lock(&window);
            match assertion.accept_received(sequence, envelope.body) {
                Ok(Received::Deliverable(body)) => {
                    let mut ready = vec![body];
                    ready.extend(assertion.drain_ready());
                    ready
                }
                Ok(Received::Buffered) => {
                    debug!(
                        "Client {}: buffered sequence {} (expecting {})",
                        client_id,
                        sequence,
                        assertion.next_expected()
                    );
                    return;
                }
                Ok(Received::Duplicate) => {
                    debug!("Client {}: dropped duplicate sequence {}", client_id, sequence);
                    return;
                }
                Err(e) => {
                    drop(assertion);
                    error!("Client {}: {}", client_id, e);
                    self.kick(client_id, DisconnectReason::WindowOverflow);
                    return;
                }
            }
        };

        for body in ready {
            self.dispatch(client_id, addr, &window, body);
        }
    }

    fn dispatch(&self, client_id: u32, addr: SocketAddr, window: &SharedAssertion, body: Body) {
        match body {
            Body::Custom { payload, .. } => self.queue.push(Message {
                peer_id: client_id,
                data: payload,
            }),
            Body::Disconnect { .. } => {
                info!("Client {} requested disconnect", client_id);
                // Confirm the Disconnect itself so the client stops lingering.
                let acked = lock(window).acknowledge(None, |datagram| {
                    self.transport.send_to(datagram, addr)
                });
                if let Err(e) = acked {
                    error!("Failed to acknowledge disconnect of client {}: {}", client_id, e);
                }
                lock(&self.clients).mark_disconnect(client_id, DisconnectReason::Remote);
            }
            other => warn!("Unexpected {:?} from client {}", other.kind(), client_id),
        }
    }

    /// Sends gap requests and acknowledgements that became due
    fn tick_clients(&self) {
        let targets = lock(&self.clients).recipients(Recipients::ALL);
        for (client_id, addr, window) in targets {
            let ticked = lock(&window).tick(None, |datagram| self.transport.send_to(datagram, addr));
            if let Err(e) = ticked {
                error!("Client {}: failed to build assertion request: {}", client_id, e);
            }
        }
    }

    /// Retransmits each client's oldest unacknowledged message
    fn refresh_clients(&self) {
        let targets = lock(&self.clients).recipients(Recipients::ALL);
        for (_, addr, window) in targets {
            lock(&window).retransmit_oldest(|datagram| self.transport.send_to(datagram, addr));
        }
    }

    fn check_timeouts(&self) {
        let timed_out = lock(&self.clients).check_timeouts(self.config.client_timeout);
        for client_id in timed_out {
            warn!("Client {} timed out", client_id);
        }
    }

    /// Schedules a server-initiated removal and notifies the client
    fn kick(&self, client_id: u32, reason: DisconnectReason) -> bool {
        let addr = {
            let mut clients = lock(&self.clients);
            if !clients.mark_disconnect(client_id, reason) {
                return false;
            }
            clients.get(client_id).map(|client| client.addr)
        };

        if let Some(addr) = addr {
            self.send_control(Body::Disconnect { peer_id: client_id }, addr);
        }
        true
    }

    /// Removes clients scheduled for removal and runs the disconnect hook
    fn reap(&self) {
        let removed = lock(&self.clients).take_pending_disconnects();
        for (client, reason) in removed {
            if let Some(hook) = &self.hooks.disconnect {
                hook(client.id, reason);
            }
        }
    }

    fn shutdown(&self) {
        let clients = lock(&self.clients).drain();
        for client in clients {
            self.send_control(Body::Disconnect { peer_id: client.id }, client.addr);
            if let Some(hook) = &self.hooks.disconnect {
                hook(client.id, DisconnectReason::ServerClosed);
            }
        }
    }
}

/// Server endpoint owning one socket and its network thread
///
/// Every method takes `&self`; wrap the server in an `Arc` to send from
/// several threads. Dropping the server closes it.
pub struct Server {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Binds `config.bind_addr` and starts the network thread.
    pub fn initialize(config: ServerConfig, hooks: ServerHooks) -> Result<Self, ServerError> {
        let socket = transport::bind(config.bind_addr, config.poll_timeout)?;
        Self::with_transport(socket, config, hooks)
    }

    /// Starts the server over an already bound transport.
    ///
    /// The transport's receive must time out after roughly
    /// `config.poll_timeout` so the loop keeps ticking.
    pub fn with_transport<T: Transport>(
        transport: T,
        config: ServerConfig,
        hooks: ServerHooks,
    ) -> Result<Self, ServerError> {
        let local_addr = transport.local_addr()?;
        info!("Server listening on {}", local_addr);

        let shared = Arc::new(Shared {
            transport: Arc::new(transport),
            clients: Mutex::new(ClientManager::new(
                config.max_clients,
                config.window_capacity,
            )),
            queue: MessageQueue::new(),
            running: AtomicBool::new(true),
            config,
            hooks,
        });

        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("server-network".to_string())
                .spawn(move || shared.run())?
        };

        Ok(Server {
            shared,
            local_addr,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Sends `data` to the selected clients.
    ///
    /// Each recipient's own window assigns the sequence number for a
    /// reliable send. A recipient whose window is full is disconnected with
    /// [`DisconnectReason::WindowOverflow`]; for a single-client send that is
    /// also reported as an error. Returns how many clients the message was
    /// handed to.
    pub fn send(
        &self,
        recipients: Recipients<'_>,
        data: &[u8],
        reliable: bool,
    ) -> Result<usize, ServerError> {
        if !self.exists() {
            return Err(ServerError::Closed);
        }

        let max = shared::max_payload(self.shared.config.buffer_capacity);
        if data.len() > max {
            return Err(ServerError::PayloadTooLarge {
                len: data.len(),
                max,
            });
        }

        let targets = lock(&self.shared.clients).recipients(recipients);
        if let Recipients::Only(ids) = recipients {
            for client_id in ids {
                if !targets.iter().any(|(id, _, _)| id == client_id) {
                    if targets.is_empty() {
                        return Err(ServerError::UnknownClient(*client_id));
                    }
                    warn!("Skipping unknown client {}", client_id);
                }
            }
        }

        let mut handed = 0;
        let mut overflowed = Vec::new();

        for (client_id, addr, window) in targets {
            let body = Body::Custom {
                peer_id: client_id,
                payload: data.to_vec(),
            };

            if !reliable {
                let datagram = Envelope::unreliable(body).encode()?;
                self.shared.transmit(&datagram, addr);
                handed += 1;
                continue;
            }

            let mut assertion = lock(&window);
            match assertion.submit_for_send(body) {
                Ok(datagram) => {
                    // Lost first transmissions are recovered by the gap-fill
                    // cycle; the message stays in the window either way.
                    self.shared.transmit(datagram, addr);
                    handed += 1;
                }
                Err(e) if e.is_fatal() => {
                    error!("Client {}: {}", client_id, e);
                    overflowed.push(client_id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        for client_id in &overflowed {
            self.shared.kick(*client_id, DisconnectReason::WindowOverflow);
        }

        match recipients {
            Recipients::Only([client_id]) if !overflowed.is_empty() => {
                Err(ServerError::WindowOverflow(*client_id))
            }
            _ => Ok(handed),
        }
    }

    /// Sends to a single client.
    pub fn send_to(&self, client_id: u32, data: &[u8], reliable: bool) -> Result<(), ServerError> {
        self.send(Recipients::Only(&[client_id]), data, reliable)
            .map(|_| ())
    }

    /// Sends to every connected client.
    pub fn broadcast(&self, data: &[u8], reliable: bool) -> Result<usize, ServerError> {
        self.send(Recipients::ALL, data, reliable)
    }

    /// Removes a client, notifying it with an unreliable Disconnect.
    pub fn disconnect(&self, client_id: u32) -> Result<(), ServerError> {
        if self.shared.kick(client_id, DisconnectReason::Kicked) {
            Ok(())
        } else {
            Err(ServerError::UnknownClient(client_id))
        }
    }

    /// Next delivered message from any client, if one is waiting.
    pub fn poll_message(&self) -> Option<Message> {
        self.shared.queue.pop()
    }

    /// Like [`poll_message`](Self::poll_message) but waits up to `timeout`.
    pub fn wait_message(&self, timeout: Duration) -> Option<Message> {
        self.shared.queue.wait_pop(timeout)
    }

    /// Stops the network thread after notifying every client.
    ///
    /// Idempotent; the disconnect hook sees
    /// [`DisconnectReason::ServerClosed`] for each remaining client.
    pub fn close(&self) {
        let Some(handle) = lock(&self.thread).take() else {
            return;
        };

        self.shared.running.store(false, Ordering::Release);
        if handle.join().is_err() {
            error!("Server network thread panicked");
        }
    }

    /// True while the network thread is running.
    pub fn exists(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
            && lock(&self.thread)
                .as_ref()
                .map_or(false, |handle| !handle.is_finished())
    }

    pub fn is_connected(&self, client_id: u32) -> bool {
        lock(&self.shared.clients)
            .get(client_id)
            .map_or(false, |client| client.is_active())
    }

    pub fn client_ids(&self) -> Vec<u32> {
        lock(&self.shared.clients)
            .get_client_addrs()
            .into_iter()
            .map(|(client_id, _)| client_id)
            .collect()
    }

    pub fn client_count(&self) -> usize {
        lock(&self.shared.clients).len()
    }

    /// Stream counters for one client.
    pub fn stats(&self, client_id: u32) -> Option<AssertionStats> {
        let window = lock(&self.shared.clients)
            .get(client_id)
            .map(|client| Arc::clone(&client.assertion))?;
        let stats = lock(&window).stats();
        Some(stats)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::UNRELIABLE;
    use std::net::UdpSocket;
    use std::sync::mpsc;

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            max_clients: 2,
            poll_timeout: Duration::from_millis(5),
            keepalive_interval: Duration::from_millis(50),
            ..ServerConfig::default()
        }
    }

    /// A bare socket speaking the wire protocol by hand
    struct RawPeer {
        socket: UdpSocket,
        server: SocketAddr,
    }

    impl RawPeer {
        fn new(server: SocketAddr) -> Self {
            let socket = transport::bind("127.0.0.1:0", Duration::from_millis(200)).unwrap();
            Self { socket, server }
        }

        fn send(&self, sequence: u32, body: Body) {
            let datagram = Envelope::reliable(sequence, body).encode().unwrap();
            self.socket.send_to(&datagram, self.server).unwrap();
        }

        fn recv(&self) -> Option<Envelope> {
            let mut buffer = [0u8; 2048];
            let (len, _) = self.socket.recv_from(&mut buffer).ok()?;
            Some(Envelope::decode(&buffer[..len]).unwrap())
        }

        /// Next datagram of `kind`, skipping acknowledgements and the like
        fn recv_kind(&self, kind: MessageKind) -> Option<Envelope> {
            for _ in 0..20 {
                let envelope = self.recv()?;
                if envelope.kind() == kind {
                    return Some(envelope);
                }
            }
            None
        }

        fn connect(&self) -> u32 {
            self.send(UNRELIABLE, Body::Connect);
            match self.recv_kind(MessageKind::Accept).map(|e| e.body) {
                Some(Body::Accept { peer_id }) => peer_id,
                other => panic!("expected Accept, got {:?}", other),
            }
        }
    }

    fn custom(peer_id: u32, text: &str) -> Body {
        Body::Custom {
            peer_id,
            payload: text.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_connect_assigns_ids() {
        let server = Server::initialize(test_config(), ServerHooks::new()).unwrap();

        let first = RawPeer::new(server.local_addr());
        let second = RawPeer::new(server.local_addr());

        let id1 = first.connect();
        let id2 = second.connect();
        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
        assert_eq!(server.client_count(), 2);
        assert!(server.is_connected(id1));

        // A repeated Connect keeps the same id.
        assert_eq!(first.connect(), id1);
        assert_eq!(server.client_count(), 2);
    }

    #[test]
    fn test_full_server_ignores_connect() {
        let mut config = test_config();
        config.max_clients = 1;
        let server = Server::initialize(config, ServerHooks::new()).unwrap();

        RawPeer::new(server.local_addr()).connect();

        let late = RawPeer::new(server.local_addr());
        late.send(UNRELIABLE, Body::Connect);
        assert!(late.recv().is_none());
        assert_eq!(server.client_count(), 1);
    }

    #[test]
    fn test_accept_policy_rejects() {
        let hooks = ServerHooks::new().on_accept(|_| false);
        let server = Server::initialize(test_config(), hooks).unwrap();

        let peer = RawPeer::new(server.local_addr());
        peer.send(UNRELIABLE, Body::Connect);
        assert!(peer.recv().is_none());
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn test_out_of_order_messages_delivered_in_order() {
        let server = Server::initialize(test_config(), ServerHooks::new()).unwrap();
        let peer = RawPeer::new(server.local_addr());
        let id = peer.connect();

        peer.send(0, custom(id, "a"));
        peer.send(2, custom(id, "c"));

        // The gap at 1 is reported.
        match peer.recv_kind(MessageKind::AssertionRequest).map(|e| e.body) {
            Some(Body::AssertionRequest {
                peer_id: None,
                lowest_missing,
            }) => assert!(lowest_missing <= 1),
            other => panic!("expected assertion request, got {:?}", other),
        }

        peer.send(1, custom(id, "b"));
        peer.send(1, custom(id, "b"));

        let mut received = Vec::new();
        while let Some(message) = server.wait_message(Duration::from_millis(300)) {
            assert_eq!(message.peer_id, id);
            received.push(message.data);
        }
        assert_eq!(received, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_unreliable_bypasses_gap() {
        let server = Server::initialize(test_config(), ServerHooks::new()).unwrap();
        let peer = RawPeer::new(server.local_addr());
        let id = peer.connect();

        peer.send(1, custom(id, "held"));
        peer.send(UNRELIABLE, custom(id, "now"));

        let message = server.wait_message(Duration::from_secs(1)).unwrap();
        assert_eq!(message.data, b"now");
        assert!(server.poll_message().is_none());
    }

    #[test]
    fn test_malformed_and_unregistered_datagrams_dropped() {
        let server = Server::initialize(test_config(), ServerHooks::new()).unwrap();
        let peer = RawPeer::new(server.local_addr());

        peer.socket.send_to(&[1, 2, 3], server.local_addr()).unwrap();
        peer.send(0, custom(1, "stranger"));
        assert!(server.wait_message(Duration::from_millis(100)).is_none());

        // The loop is still serving.
        assert_eq!(peer.connect(), 1);
        assert!(server.exists());
    }

    #[test]
    fn test_disconnect_message_runs_hook() {
        let (tx, rx) = mpsc::channel();
        let hooks = ServerHooks::new().on_disconnect(move |client_id, reason| {
            tx.send((client_id, reason)).unwrap();
        });
        let server = Server::initialize(test_config(), hooks).unwrap();
        let peer = RawPeer::new(server.local_addr());
        let id = peer.connect();

        peer.send(0, Body::Disconnect { peer_id: id });

        // The Disconnect is acknowledged with the next expected sequence.
        match peer.recv_kind(MessageKind::AssertionRequest).map(|e| e.body) {
            Some(Body::AssertionRequest { lowest_missing, .. }) => assert_eq!(lowest_missing, 1),
            other => panic!("expected acknowledgement, got {:?}", other),
        }

        let (client_id, reason) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(client_id, id);
        assert_eq!(reason, DisconnectReason::Remote);
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn test_late_disconnect_is_acknowledged() {
        let server = Server::initialize(test_config(), ServerHooks::new()).unwrap();
        let peer = RawPeer::new(server.local_addr());
        let id = peer.connect();

        peer.send(0, Body::Disconnect { peer_id: id });
        assert!(peer.recv_kind(MessageKind::AssertionRequest).is_some());

        let deadline = Instant::now() + Duration::from_secs(1);
        while server.client_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(server.client_count(), 0);

        // The first acknowledgement went missing and the peer retries.
        peer.send(0, Body::Disconnect { peer_id: id });
        match peer.recv_kind(MessageKind::AssertionRequest).map(|e| e.body) {
            Some(Body::AssertionRequest {
                peer_id: None,
                lowest_missing,
            }) => assert_eq!(lowest_missing, 1),
            other => panic!("expected acknowledgement, got {:?}", other),
        }

        let stranger = RawPeer::new(server.local_addr());
        stranger.send(3, Body::Disconnect { peer_id: 9 });
        match stranger.recv().map(|e| e.body) {
            Some(Body::AssertionRequest { lowest_missing, .. }) => assert_eq!(lowest_missing, 4),
            other => panic!("expected acknowledgement, got {:?}", other),
        }

        // Other unregistered traffic still gets no answer.
        stranger.send(UNRELIABLE, Body::Disconnect { peer_id: 9 });
        stranger.send(0, custom(9, "stranger"));
        assert!(stranger.recv().is_none());
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn test_oversized_payload_refused() {
        let server = Server::initialize(test_config(), ServerHooks::new()).unwrap();
        let peer = RawPeer::new(server.local_addr());
        let id = peer.connect();

        let oversized = vec![0u8; shared::MAX_PAYLOAD + 1];
        assert!(matches!(
            server.send_to(id, &oversized, true),
            Err(ServerError::PayloadTooLarge { max, .. }) if max == shared::MAX_PAYLOAD
        ));
        assert!(matches!(
            server.broadcast(&oversized, false),
            Err(ServerError::PayloadTooLarge { .. })
        ));
        assert!(server.is_connected(id));

        // Nothing entered the window, so the next message takes sequence 0.
        server.send_to(id, b"fits", true).unwrap();
        let envelope = peer.recv_kind(MessageKind::Custom).unwrap();
        assert_eq!(envelope.sequence, 0);
        assert_eq!(envelope.body, custom(id, "fits"));
    }

    #[test]
    fn test_send_to_unknown_client() {
        let server = Server::initialize(test_config(), ServerHooks::new()).unwrap();
        assert!(matches!(
            server.send_to(42, b"hello", true),
            Err(ServerError::UnknownClient(42))
        ));
        assert!(matches!(
            server.disconnect(42),
            Err(ServerError::UnknownClient(42))
        ));
    }

    #[test]
    fn test_reliable_send_reaches_peer() {
        let server = Server::initialize(test_config(), ServerHooks::new()).unwrap();
        let peer = RawPeer::new(server.local_addr());
        let id = peer.connect();

        server.send_to(id, b"first", true).unwrap();
        server.send_to(id, b"second", true).unwrap();

        let first = peer.recv_kind(MessageKind::Custom).unwrap();
        let second = peer.recv_kind(MessageKind::Custom).unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
        assert_eq!(second.body, custom(id, "second"));
    }

    #[test]
    fn test_send_window_overflow_disconnects_client() {
        let mut config = test_config();
        config.window_capacity = 2;
        let (tx, rx) = mpsc::channel();
        let hooks = ServerHooks::new().on_disconnect(move |client_id, reason| {
            tx.send((client_id, reason)).unwrap();
        });
        let server = Server::initialize(config, hooks).unwrap();
        let peer = RawPeer::new(server.local_addr());
        let id = peer.connect();

        // The peer never acknowledges, so the third message overflows.
        server.send_to(id, b"1", true).unwrap();
        server.send_to(id, b"2", true).unwrap();
        assert!(matches!(
            server.send_to(id, b"3", true),
            Err(ServerError::WindowOverflow(_))
        ));

        let (client_id, reason) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(client_id, id);
        assert_eq!(reason, DisconnectReason::WindowOverflow);
        assert!(peer.recv_kind(MessageKind::Disconnect).is_some());
    }

    #[test]
    fn test_close_notifies_clients() {
        let (tx, rx) = mpsc::channel();
        let hooks = ServerHooks::new().on_disconnect(move |_, reason| {
            tx.send(reason).unwrap();
        });
        let server = Server::initialize(test_config(), hooks).unwrap();
        let peer = RawPeer::new(server.local_addr());
        peer.connect();

        server.close();
        assert!(!server.exists());
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), DisconnectReason::ServerClosed);
        assert!(peer.recv_kind(MessageKind::Disconnect).is_some());
        assert!(matches!(server.broadcast(b"late", false), Err(ServerError::Closed)));

        // Closing twice is harmless.
        server.close();
    }
}

//! Client registration table for the server
//!
//! This module tracks every connected client, including:
//! - Registration lifecycle (connect, disconnect, timeout, kick)
//! - Id assignment and address lookup
//! - Ownership of each client's reliability state
//! - Capacity enforcement over a fixed number of slots
//!
//! The table itself is guarded by the server's registry mutex. Each client's
//! [`Assertion`] sits behind its own mutex so that sending to one client
//! never waits on registry changes or on another client's window.

use log::info;
use shared::{Assertion, DisconnectReason};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Handle to one client's reliability state.
pub type SharedAssertion = Arc<Mutex<Assertion>>;

/// A registered client
///
/// Each client maintains:
/// - Connection metadata (ID, address, last activity)
/// - Its reliable send and receive windows
/// - A pending-disconnect reason once removal has been decided
#[derive(Debug)]
pub struct Client {
    /// Unique client identifier assigned by the server
    pub id: u32,
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// Last time we received any datagram from this client
    pub last_seen: Instant,
    /// Reliability windows for this client's stream
    pub assertion: SharedAssertion,
    /// Set once the client is scheduled for removal
    pub pending_disconnect: Option<DisconnectReason>,
}

impl Client {
    /// Creates a new client with empty windows of the given capacity
    pub fn new(id: u32, addr: SocketAddr, window_capacity: u32) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            assertion: Arc::new(Mutex::new(Assertion::new(window_capacity))),
            pending_disconnect: None,
        }
    }

    /// Checks if the client has exceeded the connection timeout
    ///
    /// Returns true if no datagrams have been received from this client
    /// within the specified timeout duration.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }

    pub fn is_active(&self) -> bool {
        self.pending_disconnect.is_none()
    }
}

/// Delivery target selection for [`ClientManager::recipients`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipients<'a> {
    /// Exactly these clients
    Only(&'a [u32]),
    /// Every active client except these
    AllExcept(&'a [u32]),
}

impl Recipients<'static> {
    /// Every active client
    pub const ALL: Self = Recipients::AllExcept(&[]);
}

impl Recipients<'_> {
    pub fn includes(&self, client_id: u32) -> bool {
        match self {
            Recipients::Only(ids) => ids.contains(&client_id),
            Recipients::AllExcept(ignore) => !ignore.contains(&client_id),
        }
    }
}

/// Fixed-capacity registry of connected clients
///
/// Slots are reused: a removed client's slot is cleared and handed to the
/// next connection from a new address. Ids are never reused.
pub struct ClientManager {
    /// Registration slots, `None` when free
    slots: Vec<Option<Client>>,
    /// Next available client ID for new connections
    next_client_id: u32,
    /// Capacity of each new client's reliability windows
    window_capacity: u32,
}

impl ClientManager {
    /// Creates a new client manager with the specified capacity limit
    ///
    /// Client IDs start from 1 and increment for each new connection.
    pub fn new(max_clients: usize, window_capacity: u32) -> Self {
        Self {
            slots: (0..max_clients).map(|_| None).collect(),
            next_client_id: 1,
            window_capacity,
        }
    }

    /// Registers a client from a new address
    ///
    /// Returns Some(client_id) if successful, None if every slot is taken.
    /// Callers check [`find_client_by_addr`](Self::find_client_by_addr)
    /// first; an address is registered at most once.
    pub fn add_client(&mut self, addr: SocketAddr) -> Option<u32> {
        let slot = self.slots.iter_mut().find(|slot| slot.is_none())?;

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        info!("Client {} connected from {}", client_id, addr);
        *slot = Some(Client::new(client_id, addr, self.window_capacity));

        Some(client_id)
    }

    /// Removes a client and returns its registration
    ///
    /// Dropping the returned client frees every buffered message in its
    /// windows.
    pub fn remove_client(&mut self, client_id: u32) -> Option<Client> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| matches!(slot, Some(client) if client.id == client_id))?;

        let client = slot.take();
        if let Some(client) = &client {
            info!("Client {} disconnected", client.id);
        }
        client
    }

    fn clients(&self) -> impl Iterator<Item = &Client> {
        self.slots.iter().flatten()
    }

    fn clients_mut(&mut self) -> impl Iterator<Item = &mut Client> {
        self.slots.iter_mut().flatten()
    }

    pub fn get(&self, client_id: u32) -> Option<&Client> {
        self.clients().find(|client| client.id == client_id)
    }

    fn get_mut(&mut self, client_id: u32) -> Option<&mut Client> {
        self.clients_mut().find(|client| client.id == client_id)
    }

    /// Finds a client ID by network address
    ///
    /// Used to associate incoming datagrams with existing registrations.
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<u32> {
        self.clients()
            .find(|client| client.addr == addr)
            .map(|client| client.id)
    }

    /// Looks up an active client by address and records activity
    ///
    /// Returns the id and a handle to the client's windows so the caller
    /// can release the registry before locking them.
    pub fn touch(&mut self, addr: SocketAddr) -> Option<(u32, SharedAssertion)> {
        let client = self
            .clients_mut()
            .find(|client| client.addr == addr && client.is_active())?;
        client.last_seen = Instant::now();
        Some((client.id, Arc::clone(&client.assertion)))
    }

    /// Schedules a client for removal on the next reap
    ///
    /// The first reason recorded wins. Returns false for unknown clients.
    pub fn mark_disconnect(&mut self, client_id: u32, reason: DisconnectReason) -> bool {
        match self.get_mut(client_id) {
            Some(client) => {
                client.pending_disconnect.get_or_insert(reason);
                true
            }
            None => false,
        }
    }

    /// Removes every client scheduled for removal
    pub fn take_pending_disconnects(&mut self) -> Vec<(Client, DisconnectReason)> {
        let mut removed = Vec::new();
        for slot in self.slots.iter_mut() {
            let Some(reason) = slot.as_ref().and_then(|client| client.pending_disconnect)
            else {
                continue;
            };
            if let Some(client) = slot.take() {
                info!("Client {} disconnected ({})", client.id, reason);
                removed.push((client, reason));
            }
        }
        removed
    }

    /// Schedules silent clients for removal
    ///
    /// Returns the ids newly marked. They are removed by the next
    /// [`take_pending_disconnects`](Self::take_pending_disconnects).
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<u32> {
        let timed_out: Vec<u32> = self
            .clients()
            .filter(|client| client.is_active() && client.is_timed_out(timeout))
            .map(|client| client.id)
            .collect();

        for client_id in &timed_out {
            self.mark_disconnect(*client_id, DisconnectReason::Timeout);
        }

        timed_out
    }

    /// Active clients selected by `recipients`, with their windows
    pub fn recipients(
        &self,
        recipients: Recipients<'_>,
    ) -> Vec<(u32, SocketAddr, SharedAssertion)> {
        self.clients()
            .filter(|client| client.is_active() && recipients.includes(client.id))
            .map(|client| (client.id, client.addr, Arc::clone(&client.assertion)))
            .collect()
    }

    /// Removes every client, for shutdown
    pub fn drain(&mut self) -> Vec<Client> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }

    /// Gets all client IDs and their network addresses
    pub fn get_client_addrs(&self) -> Vec<(u32, SocketAddr)> {
        self.clients()
            .map(|client| (client.id, client.addr))
            .collect()
    }

    /// Returns the number of registered clients
    pub fn len(&self) -> usize {
        self.clients().count()
    }

    /// Returns true if no clients are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

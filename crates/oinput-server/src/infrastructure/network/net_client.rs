//! Connected clients and the registry that holds them.
//!
//! A [`NetClient`] is created when a connection completes its handshake and
//! is keyed by `"<ip>:<data_port>"`.  A second handshake with the same key
//! does not create a new entry: the existing client keeps its id and
//! counters and takes the new transport, mode and flags.
//!
//! # Channel choice
//!
//! | mode            | high-rate events (Move, Update) | discrete events                |
//! |-----------------|---------------------------------|--------------------------------|
//! | V1              | binary over UDP                 | binary over UDP                |
//! | V2, V3          | binary over UDP                 | binary over TCP (UDP fallback) |
//! | Legacy          | legacy text over UDP            | legacy text over UDP           |
//! | TacTile         | tactile text over UDP           | tactile text over UDP          |
//! | StreamIn        | nothing                         | nothing                        |

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use oinput_core::protocol::ascii::{legacy_packet, tactile_packet};
use oinput_core::protocol::packet::encode_event_into;
use oinput_core::{DataMode, Event, Handshake, ServiceTypeMask, EVENT_PACKET_SIZE};
use tracing::{debug, info};
use uuid::Uuid;

use super::transport::{ClientTransport, ControlStatus};

/// Registry key for a client: `"<ip>:<data_port>"`.
pub fn client_key(address: IpAddr, data_port: u16) -> String {
    format!("{address}:{data_port}")
}

// ── Per-event packet cache ────────────────────────────────────────────────────

/// Serialized forms of one event, built on first use.
///
/// Fan-out to many clients encodes each format at most once.
pub struct OutgoingPackets<'a> {
    event: &'a Event,
    binary: Option<Box<[u8; EVENT_PACKET_SIZE]>>,
    legacy: Option<Option<String>>,
    tactile: Option<Option<String>>,
}

impl<'a> OutgoingPackets<'a> {
    pub fn new(event: &'a Event) -> Self {
        Self {
            event,
            binary: None,
            legacy: None,
            tactile: None,
        }
    }

    pub fn event(&self) -> &Event {
        self.event
    }

    pub fn binary(&mut self) -> &[u8] {
        let event = self.event;
        self.binary.get_or_insert_with(|| {
            let mut buf = Box::new([0u8; EVENT_PACKET_SIZE]);
            encode_event_into(event, &mut buf);
            buf
        })
        .as_slice()
    }

    pub fn legacy(&mut self) -> Option<&[u8]> {
        let event = self.event;
        self.legacy
            .get_or_insert_with(|| legacy_packet(event))
            .as_deref()
            .map(str::as_bytes)
    }

    pub fn tactile(&mut self) -> Option<&[u8]> {
        let event = self.event;
        self.tactile
            .get_or_insert_with(|| tactile_packet(event))
            .as_deref()
            .map(str::as_bytes)
    }
}

// ── NetClient ─────────────────────────────────────────────────────────────────

/// Outcome of delivering one event to one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Filtered out, or the mode has no encoding for the event.
    Skipped,
    Sent,
    /// A send failed.  A reliable-channel failure also marks the client
    /// disconnected.
    Failed,
}

/// Server-side state of one connected consumer.
pub struct NetClient {
    id: Uuid,
    key: String,
    address: IpAddr,
    data_port: u16,
    mode: DataMode,
    flags: u32,
    mask: ServiceTypeMask,
    transport: Box<dyn ClientTransport>,
    connected: bool,
    last_activity: Instant,
    events_sent: u64,
}

impl std::fmt::Debug for NetClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetClient")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("mode", &self.mode)
            .field("flags", &self.flags)
            .field("connected", &self.connected)
            .finish_non_exhaustive()
    }
}

/// Service-type filter a handshake selects.  Only V3 carries one.
fn mask_for(handshake: &Handshake) -> ServiceTypeMask {
    match handshake.mode {
        DataMode::V3 => ServiceTypeMask::from_flags(handshake.flags),
        _ => ServiceTypeMask::ALL,
    }
}

impl NetClient {
    pub fn new(address: IpAddr, handshake: Handshake, transport: Box<dyn ClientTransport>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: client_key(address, handshake.data_port),
            address,
            data_port: handshake.data_port,
            mode: handshake.mode,
            flags: handshake.flags,
            mask: mask_for(&handshake),
            transport,
            connected: true,
            last_activity: Instant::now(),
            events_sent: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn data_port(&self) -> u16 {
        self.data_port
    }

    pub fn mode(&self) -> DataMode {
        self.mode
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn mask(&self) -> ServiceTypeMask {
        self.mask
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn events_sent(&self) -> u64 {
        self.events_sent
    }

    pub fn mark_disconnected(&mut self) {
        self.connected = false;
    }

    /// Replaces transport, mode and flags after a repeated handshake.
    ///
    /// The old transport is closed.
    pub fn reconnect(&mut self, handshake: Handshake, transport: Box<dyn ClientTransport>) {
        if handshake.mode != self.mode {
            info!("client {} switched mode {} -> {}", self.key, self.mode, handshake.mode);
        }
        self.transport.close();
        self.transport = transport;
        self.mode = handshake.mode;
        self.flags = handshake.flags;
        self.mask = mask_for(&handshake);
        self.connected = true;
        self.last_activity = Instant::now();
    }

    /// `true` if this client wants `event` at all.
    pub fn accepts(&self, event: &Event) -> bool {
        self.connected && self.mode.receives_events() && self.mask.accepts(event.service_type)
    }

    /// Sends `packets` in the format and on the channel this client's mode
    /// calls for.
    pub fn deliver(&mut self, packets: &mut OutgoingPackets<'_>) -> Delivery {
        if !self.accepts(packets.event()) {
            return Delivery::Skipped;
        }

        let discrete = !packets.event().event_type.is_high_rate();
        let result = match self.mode {
            DataMode::V2 | DataMode::V3 if discrete && self.transport.has_reliable() => {
                let sent = self.transport.send_reliable(packets.binary());
                if sent.is_err() {
                    self.connected = false;
                }
                sent
            }
            DataMode::V1 | DataMode::V2 | DataMode::V3 => {
                self.transport.send_unreliable(packets.binary())
            }
            DataMode::Legacy => match packets.legacy() {
                Some(bytes) => self.transport.send_unreliable(bytes),
                None => return Delivery::Skipped,
            },
            DataMode::TacTile => match packets.tactile() {
                Some(bytes) => self.transport.send_unreliable(bytes),
                None => return Delivery::Skipped,
            },
            DataMode::StreamIn => return Delivery::Skipped,
        };

        match result {
            Ok(()) => {
                self.events_sent += 1;
                self.last_activity = Instant::now();
                Delivery::Sent
            }
            Err(e) => {
                debug!("send to client {} failed: {e}", self.key);
                Delivery::Failed
            }
        }
    }

    /// Checks the control socket.  Returns `false` if the client left.
    pub fn check_control(&mut self, now: Instant) -> bool {
        match self.transport.poll_control() {
            ControlStatus::Idle => {}
            ControlStatus::Activity => self.last_activity = now,
            ControlStatus::DisconnectRequested | ControlStatus::Closed => self.connected = false,
        }
        self.connected
    }

    /// `true` if nothing was heard from or delivered to the client for
    /// longer than `timeout`.
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_activity) > timeout
    }

    /// Reads at most one pushed event packet.
    pub fn recv_datagram(&mut self, buf: &mut [u8]) -> std::io::Result<Option<usize>> {
        let received = self.transport.recv_datagram(buf)?;
        if received.is_some() {
            self.last_activity = Instant::now();
        }
        Ok(received)
    }

    pub fn close(&mut self) {
        self.transport.close();
        self.connected = false;
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// All connected clients, keyed by `"ip:port"`.
///
/// Only the main tick touches the registry, so it needs no lock.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<String, NetClient>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client or refreshes the one already under the same key.
    ///
    /// Returns the client's id and `true` if it was newly created.
    pub fn upsert(
        &mut self,
        address: IpAddr,
        handshake: Handshake,
        transport: Box<dyn ClientTransport>,
    ) -> (Uuid, bool) {
        let key = client_key(address, handshake.data_port);
        match self.clients.get_mut(&key) {
            Some(existing) => {
                existing.reconnect(handshake, transport);
                (existing.id(), false)
            }
            None => {
                let client = NetClient::new(address, handshake, transport);
                let id = client.id();
                self.clients.insert(key, client);
                (id, true)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&NetClient> {
        self.clients.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut NetClient> {
        self.clients.get_mut(key)
    }

    pub fn find_by_id(&self, id: Uuid) -> Option<&NetClient> {
        self.clients.values().find(|c| c.id() == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetClient> {
        self.clients.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NetClient> {
        self.clients.values_mut()
    }

    /// Removes and closes every client no longer connected.
    ///
    /// Returns the removed clients' keys.
    pub fn remove_disconnected(&mut self) -> Vec<String> {
        let gone: Vec<String> = self
            .clients
            .iter()
            .filter(|(_, c)| !c.is_connected())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &gone {
            if let Some(mut client) = self.clients.remove(key) {
                client.close();
            }
        }
        gone
    }

    /// Closes and removes every client.
    pub fn clear(&mut self) {
        for (_, mut client) in self.clients.drain() {
            client.close();
        }
    }
}

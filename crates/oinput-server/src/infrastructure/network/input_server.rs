//! InputServer: accepts consumers and fans drained events out to them.
//!
//! Everything here runs on the main tick and never blocks:
//!
//! 1. [`InputServer::accept_pending`] takes every waiting TCP connection and
//!    starts a [`PendingHandshake`] for it.
//! 2. [`InputServer::advance_handshakes`] moves each pending handshake along
//!    and registers the ones that completed.
//! 3. [`InputServer::poll_stream_in`] reads one pushed packet per stream-in
//!    client and writes it into the event queue.
//! 4. [`InputServer::check_clients`] and [`InputServer::reap_disconnected`]
//!    drop clients that left or went silent.
//! 5. [`InputServer::handle_event`] is called once per drained event.

use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use oinput_core::{decode_event, DataMode, Event, EventQueue, Handshake};
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::handshake::{HandshakeProgress, PendingHandshake};
use super::net_client::{client_key, ClientRegistry, Delivery, NetClient, OutgoingPackets};
use super::transport::{ClientTransport, SocketTransport, DATAGRAM_BUFFER_SIZE};
use crate::infrastructure::storage::config::ServerConfig;

/// Error type for network operations.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("bind failed on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("could not open channels for client {addr}: {source}")]
    ClientSetup {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("listener error: {0}")]
    Listener(#[from] std::io::Error),
}

/// Settings the server needs from the config file.
#[derive(Debug, Clone)]
pub struct InputServerConfig {
    pub listen_addr: SocketAddr,
    pub handshake_timeout: Duration,
    pub check_for_disconnected_clients: bool,
    pub client_idle_timeout: Option<Duration>,
    /// Trace every outgoing event.
    pub show_event_stream: bool,
    /// Trace discrete (non Move/Update) outgoing events.
    pub show_event_messages: bool,
}

impl Default for InputServerConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for InputServerConfig {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            listen_addr: SocketAddr::new(cfg.listen_ip, cfg.port),
            handshake_timeout: cfg.handshake_timeout(),
            check_for_disconnected_clients: cfg.check_for_disconnected_clients,
            client_idle_timeout: cfg.client_idle_timeout(),
            show_event_stream: cfg.show_event_stream,
            show_event_messages: cfg.show_event_messages,
        }
    }
}

/// Snapshot of the outgoing stream.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamStats {
    /// Events handled per second over the last completed window.
    pub events_per_sec: f64,
    /// Events handled since start, skipped ones excluded.
    pub events_handled: u64,
    /// Packets sent to clients since start.
    pub packets_sent: u64,
    /// Events lost to buffer overflow, as last reported.
    pub events_dropped: u64,
}

const STATS_WINDOW: Duration = Duration::from_secs(1);

pub struct InputServer {
    listener: TcpListener,
    config: InputServerConfig,
    pending: Vec<PendingHandshake>,
    clients: ClientRegistry,
    stats: StreamStats,
    window_start: Instant,
    window_events: u64,
    recv_buf: Box<[u8; DATAGRAM_BUFFER_SIZE]>,
}

impl InputServer {
    /// Binds the handshake listener and switches it to non-blocking mode.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::BindFailed`] if the address is in use or not
    /// available.  The caller decides whether to retry or exit.
    pub fn bind(config: InputServerConfig) -> Result<Self, NetworkError> {
        let addr = config.listen_addr;
        let listener =
            TcpListener::bind(addr).map_err(|source| NetworkError::BindFailed { addr, source })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| NetworkError::BindFailed { addr, source })?;

        info!("input server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            config,
            pending: Vec::new(),
            clients: ClientRegistry::new(),
            stats: StreamStats::default(),
            window_start: Instant::now(),
            window_events: 0,
            recv_buf: Box::new([0u8; DATAGRAM_BUFFER_SIZE]),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn config(&self) -> &InputServerConfig {
        &self.config
    }

    /// Accepts every connection waiting on the listener.
    ///
    /// Returns how many were accepted.
    pub fn accept_pending(&mut self) -> usize {
        let mut accepted = 0;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    match PendingHandshake::new(stream, peer, self.config.handshake_timeout) {
                        Ok(pending) => {
                            debug!("connection from {peer}, waiting for handshake");
                            self.pending.push(pending);
                            accepted += 1;
                        }
                        Err(e) => warn!("dropping connection from {peer}: {e}"),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
        accepted
    }

    /// Connections still waiting for their handshake.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Advances every pending handshake and registers those that completed.
    ///
    /// Returns how many clients were registered or refreshed.
    pub fn advance_handshakes(&mut self, now: Instant) -> usize {
        let mut registered = 0;
        for pending in std::mem::take(&mut self.pending) {
            let peer = pending.peer();
            match pending.advance(now) {
                (HandshakeProgress::Pending, Some(pending)) => self.pending.push(pending),
                (HandshakeProgress::Pending, None) => {}
                (HandshakeProgress::Complete(handshake, stream), _) => {
                    match self.create_client(peer.ip(), handshake, Some(stream)) {
                        Ok(_) => registered += 1,
                        Err(e) => warn!("{e}"),
                    }
                }
                (HandshakeProgress::Rejected(e), _) => {
                    warn!("handshake from {peer} rejected: {e}");
                }
                (HandshakeProgress::TimedOut, _) => {
                    warn!("handshake from {peer} timed out");
                }
                (HandshakeProgress::Closed, _) => {
                    debug!("{peer} closed before sending a handshake");
                }
            }
        }
        registered
    }

    /// Opens the client's channels and registers it.
    ///
    /// A client already registered under the same key is closed first, so
    /// its stream-in socket releases the data port before the new one binds.
    /// If the new channels then fail to open, the old entry stays
    /// disconnected and is reaped on the next pass.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ClientSetup`] if a socket could not be opened,
    /// e.g. a stream-in data port already in use.
    pub fn create_client(
        &mut self,
        address: IpAddr,
        handshake: Handshake,
        control: Option<TcpStream>,
    ) -> Result<Uuid, NetworkError> {
        let addr = SocketAddr::new(address, handshake.data_port);
        if let Some(existing) = self.clients.get_mut(&client_key(address, handshake.data_port)) {
            existing.close();
        }
        let transport = SocketTransport::open(control, addr, handshake.mode == DataMode::StreamIn)
            .map_err(|source| NetworkError::ClientSetup { addr, source })?;
        Ok(self.create_client_with_transport(address, handshake, Box::new(transport)))
    }

    /// Registers a client over an already-open transport.
    ///
    /// A client with the same `address:data_port` key is updated in place.
    pub fn create_client_with_transport(
        &mut self,
        address: IpAddr,
        handshake: Handshake,
        transport: Box<dyn ClientTransport>,
    ) -> Uuid {
        let (id, created) = self.clients.upsert(address, handshake, transport);
        if created {
            info!(
                "client {address}:{} registered ({}, flags {:#x})",
                handshake.data_port, handshake.mode, handshake.flags
            );
        } else {
            info!("client {address}:{} reconnected", handshake.data_port);
        }
        id
    }

    /// Reads at most one pushed packet per stream-in client into `queue`.
    ///
    /// Returns how many events were injected.
    pub fn poll_stream_in(&mut self, queue: &EventQueue) -> usize {
        let mut injected = 0;
        let buf = &mut self.recv_buf[..];
        for client in self.clients.iter_mut() {
            if client.mode() != DataMode::StreamIn || !client.is_connected() {
                continue;
            }
            match client.recv_datagram(buf) {
                Ok(Some(n)) => match decode_event(&buf[..n]) {
                    Ok(event) => {
                        queue.push(&event);
                        injected += 1;
                    }
                    Err(e) => warn!("bad packet from stream-in client {}: {e}", client.key()),
                },
                Ok(None) => {}
                Err(e) => {
                    debug!("stream-in receive from {} failed: {e}", client.key());
                    client.mark_disconnected();
                }
            }
        }
        injected
    }

    /// Marks clients that closed, sent `data_off` or went silent.
    ///
    /// Does nothing unless `check_for_disconnected_clients` is set.
    pub fn check_clients(&mut self, now: Instant) {
        if !self.config.check_for_disconnected_clients {
            return;
        }
        let idle_timeout = self.config.client_idle_timeout;
        for client in self.clients.iter_mut() {
            if !client.check_control(now) {
                continue;
            }
            if let Some(timeout) = idle_timeout {
                if client.is_idle(now, timeout) {
                    info!("client {} idle for over {timeout:?}", client.key());
                    client.mark_disconnected();
                }
            }
        }
    }

    /// Removes every client marked disconnected.  Returns how many.
    pub fn reap_disconnected(&mut self) -> usize {
        let removed = self.clients.remove_disconnected();
        for key in &removed {
            info!("client {key} disconnected");
        }
        removed.len()
    }

    /// Sends one drained event to every client that wants it.
    ///
    /// Processed events are skipped.  Each wire format is built at most once.
    /// Returns how many clients it was sent to.
    pub fn handle_event(&mut self, event: &Event) -> usize {
        if event.is_processed() {
            return 0;
        }

        if self.config.show_event_stream
            || (self.config.show_event_messages && !event.event_type.is_high_rate())
        {
            trace!(
                "event {:?}/{:?} source {} pos {:?}",
                event.service_type,
                event.event_type,
                event.source_id,
                event.position
            );
        }

        let mut packets = OutgoingPackets::new(event);
        let mut sent = 0;
        for client in self.clients.iter_mut() {
            if client.deliver(&mut packets) == Delivery::Sent {
                sent += 1;
            }
        }

        self.stats.events_handled += 1;
        self.stats.packets_sent += sent as u64;
        self.window_events += 1;
        sent
    }

    /// Closes the stats window once a second has passed.
    ///
    /// Returns the fresh snapshot when a window closed, `None` otherwise.
    pub fn update_stats(&mut self, now: Instant, dropped: u64) -> Option<StreamStats> {
        self.stats.events_dropped = dropped;
        let elapsed = now.duration_since(self.window_start);
        if elapsed < STATS_WINDOW {
            return None;
        }
        self.stats.events_per_sec = self.window_events as f64 / elapsed.as_secs_f64();
        self.window_events = 0;
        self.window_start = now;
        Some(self.stats)
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn clients(&self) -> impl Iterator<Item = &NetClient> {
        self.clients.iter()
    }

    /// Looks up a client by its `"ip:port"` key.
    pub fn client(&self, key: &str) -> Option<&NetClient> {
        self.clients.get(key)
    }

    pub fn client_by_id(&self, id: Uuid) -> Option<&NetClient> {
        self.clients.find_by_id(id)
    }

    /// Closes every client and abandons pending handshakes.
    pub fn shutdown(&mut self) {
        self.pending.clear();
        self.clients.clear();
        info!("input server shut down");
    }
}

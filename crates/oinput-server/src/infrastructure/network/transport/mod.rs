//! Per-client transports.
//!
//! Every connected client has up to three channels:
//!
//! - the **control** TCP socket the handshake arrived on.  V2 and V3 clients
//!   receive discrete events here; every client may send `data_off` or close
//!   it to leave.
//! - an outgoing **UDP** socket sending datagrams to `client_ip:data_port`.
//! - for stream-in clients, an inbound UDP socket bound to `0.0.0.0:data_port`
//!   that the client pushes binary event packets into.
//!
//! # Testability
//!
//! The [`ClientTransport`] trait lets the server be tested without real
//! sockets; tests use [`mock::MockTransport`].

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, UdpSocket};

use oinput_core::protocol::handshake::is_disconnect_command;
use oinput_core::EVENT_PACKET_SIZE;

pub mod mock;

/// Size of the buffer used for inbound stream-in datagrams.
pub const DATAGRAM_BUFFER_SIZE: usize = EVENT_PACKET_SIZE;

/// What a non-blocking look at the control socket found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlStatus {
    /// Nothing to read.
    Idle,
    /// The client sent something other than a disconnect request.
    Activity,
    /// The client asked to leave (`data_off`).
    DisconnectRequested,
    /// The peer closed the socket or it failed.
    Closed,
}

/// The channels of one connected client.
pub trait ClientTransport: Send {
    /// `true` if a control socket is available for reliable sends.
    fn has_reliable(&self) -> bool;

    /// Sends `bytes` on the control socket.
    fn send_reliable(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Sends `bytes` as one UDP datagram to the client's data port.
    fn send_unreliable(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Checks the control socket without blocking.
    fn poll_control(&mut self) -> ControlStatus;

    /// Reads at most one inbound datagram into `buf` without blocking.
    ///
    /// Returns `Ok(None)` if nothing is waiting or the client has no inbound
    /// channel.
    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    /// Shuts down and releases every channel.
    fn close(&mut self);
}

/// Socket-backed transport used in production.
#[derive(Debug)]
pub struct SocketTransport {
    control: Option<TcpStream>,
    outbound: UdpSocket,
    data_addr: SocketAddr,
    inbound: Option<UdpSocket>,
}

impl SocketTransport {
    /// Opens the outgoing UDP socket for a client listening on `data_addr`.
    ///
    /// With `stream_in` set, also binds `0.0.0.0:<data_port>` for the client
    /// to push events into.  `control` is switched to non-blocking mode.
    ///
    /// # Errors
    ///
    /// Returns the I/O error of any socket that could not be set up.
    pub fn open(
        control: Option<TcpStream>,
        data_addr: SocketAddr,
        stream_in: bool,
    ) -> io::Result<Self> {
        if let Some(stream) = &control {
            stream.set_nonblocking(true)?;
            // Small fixed-size packets; do not wait to coalesce them.
            stream.set_nodelay(true)?;
        }

        let unspecified: SocketAddr = if data_addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let outbound = UdpSocket::bind(unspecified)?;
        outbound.set_nonblocking(true)?;

        let inbound = if stream_in {
            let mut bind_addr = unspecified;
            bind_addr.set_port(data_addr.port());
            let socket = UdpSocket::bind(bind_addr)?;
            socket.set_nonblocking(true)?;
            Some(socket)
        } else {
            None
        };

        Ok(Self {
            control,
            outbound,
            data_addr,
            inbound,
        })
    }

    pub fn data_addr(&self) -> SocketAddr {
        self.data_addr
    }
}

impl ClientTransport for SocketTransport {
    fn has_reliable(&self) -> bool {
        self.control.is_some()
    }

    fn send_reliable(&mut self, bytes: &[u8]) -> io::Result<()> {
        match &mut self.control {
            Some(stream) => stream.write_all(bytes),
            None => Err(io::Error::new(ErrorKind::NotConnected, "no control socket")),
        }
    }

    fn send_unreliable(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.outbound.send_to(bytes, self.data_addr) {
            Ok(_) => Ok(()),
            // A full send buffer drops the datagram, like the network would.
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn poll_control(&mut self) -> ControlStatus {
        let Some(stream) = &mut self.control else {
            return ControlStatus::Idle;
        };
        let mut buf = [0u8; 64];
        match stream.read(&mut buf) {
            Ok(0) => ControlStatus::Closed,
            Ok(n) => {
                if is_disconnect_command(&String::from_utf8_lossy(&buf[..n])) {
                    ControlStatus::DisconnectRequested
                } else {
                    ControlStatus::Activity
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => ControlStatus::Idle,
            Err(e) if e.kind() == ErrorKind::Interrupted => ControlStatus::Idle,
            Err(_) => ControlStatus::Closed,
        }
    }

    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let Some(socket) = &self.inbound else {
            return Ok(None);
        };
        match socket.recv_from(buf) {
            Ok((n, _src)) => Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.control.take() {
            // The peer may already be gone.
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.inbound = None;
    }
}

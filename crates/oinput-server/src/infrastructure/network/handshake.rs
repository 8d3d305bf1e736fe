//! Pending handshakes on freshly accepted connections.
//!
//! An accepted [`TcpStream`] is switched to non-blocking mode and wrapped in
//! a [`PendingHandshake`].  The main tick calls [`PendingHandshake::advance`]
//! once per tick; it reads whatever has arrived and, as soon as the socket
//! has nothing more to give, parses the buffered text.  A connection that
//! sends nothing before its deadline times out.  No call here ever blocks.

use std::io::{ErrorKind, Read};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use oinput_core::protocol::handshake::MAX_HANDSHAKE_LEN;
use oinput_core::{parse_handshake, Handshake, HandshakeError};

/// Result of advancing a pending handshake by one tick.
#[derive(Debug)]
pub enum HandshakeProgress {
    /// Nothing usable yet; try again next tick.
    Pending,
    /// A valid handshake arrived.  The stream is handed back for use as the
    /// client's control socket.
    Complete(Handshake, TcpStream),
    /// The text did not parse.  The stream has been shut down.
    Rejected(HandshakeError),
    /// The deadline passed first.  The stream has been shut down.
    TimedOut,
    /// The peer closed the connection before sending a handshake.
    Closed,
}

/// A connection waiting for its handshake line.
#[derive(Debug)]
pub struct PendingHandshake {
    stream: TcpStream,
    peer: SocketAddr,
    buf: Vec<u8>,
    deadline: Instant,
}

impl PendingHandshake {
    /// Wraps an accepted stream, giving it `timeout` to send its handshake.
    ///
    /// # Errors
    ///
    /// Fails if the stream cannot be switched to non-blocking mode.
    pub fn new(stream: TcpStream, peer: SocketAddr, timeout: Duration) -> std::io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            peer,
            buf: Vec::with_capacity(64),
            deadline: Instant::now() + timeout,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Reads what is available and decides whether the handshake is done.
    ///
    /// Consumes `self`; a [`HandshakeProgress::Pending`] result comes with
    /// the handshake to keep.
    pub fn advance(mut self, now: Instant) -> (HandshakeProgress, Option<Self>) {
        let mut chunk = [0u8; 128];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    if self.buf.is_empty() {
                        return (HandshakeProgress::Closed, None);
                    }
                    // Sent its line and hung up; still worth parsing.
                    break;
                }
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    if self.buf.len() > MAX_HANDSHAKE_LEN {
                        return (self.reject(HandshakeError::TooLong), None);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return (HandshakeProgress::Closed, None),
            }
        }

        if self.buf.is_empty() {
            if now >= self.deadline {
                self.shutdown();
                return (HandshakeProgress::TimedOut, None);
            }
            return (HandshakeProgress::Pending, Some(self));
        }

        let text = String::from_utf8_lossy(&self.buf).into_owned();
        match parse_handshake(&text) {
            Ok(handshake) => (HandshakeProgress::Complete(handshake, self.stream), None),
            Err(e) => (self.reject(e), None),
        }
    }

    fn reject(self, err: HandshakeError) -> HandshakeProgress {
        self.shutdown();
        HandshakeProgress::Rejected(err)
    }

    fn shutdown(&self) {
        // The peer may already be gone.
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oinput_core::DataMode;
    use std::io::Write;
    use std::net::TcpListener;

    fn accept_pair(timeout: Duration) -> (PendingHandshake, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        (PendingHandshake::new(server, peer, timeout).unwrap(), client)
    }

    fn settle() {
        std::thread::sleep(Duration::from_millis(50));
    }

    #[test]
    fn test_pending_until_data_arrives() {
        let (pending, _client) = accept_pair(Duration::from_secs(5));

        let (progress, next) = pending.advance(Instant::now());

        assert!(matches!(progress, HandshakeProgress::Pending));
        assert!(next.is_some());
    }

    #[test]
    fn test_valid_line_completes_with_stream() {
        let (pending, mut client) = accept_pair(Duration::from_secs(5));
        client.write_all(b"omicronV3_data_on,9001,3").unwrap();
        settle();

        let (progress, next) = pending.advance(Instant::now());

        assert!(next.is_none());
        match progress {
            HandshakeProgress::Complete(hs, _stream) => {
                assert_eq!(hs.mode, DataMode::V3);
                assert_eq!(hs.data_port, 9001);
                assert_eq!(hs.flags, 3);
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_literal_is_rejected_and_socket_closed() {
        let (pending, mut client) = accept_pair(Duration::from_secs(5));
        client.write_all(b"bogus_handshake,1").unwrap();
        settle();

        let (progress, _) = pending.advance(Instant::now());

        assert!(matches!(
            progress,
            HandshakeProgress::Rejected(HandshakeError::UnknownLiteral(_))
        ));
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(client.read(&mut buf).unwrap(), 0, "peer sees EOF");
    }

    #[test]
    fn test_silent_connection_times_out() {
        let (pending, mut client) = accept_pair(Duration::from_millis(10));

        let later = Instant::now() + Duration::from_millis(20);
        let (progress, next) = pending.advance(later);

        assert!(matches!(progress, HandshakeProgress::TimedOut));
        assert!(next.is_none());
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_peer_hanging_up_early_is_closed() {
        let (pending, client) = accept_pair(Duration::from_secs(5));
        drop(client);
        settle();

        let (progress, _) = pending.advance(Instant::now());

        assert!(matches!(progress, HandshakeProgress::Closed));
    }

    #[test]
    fn test_oversized_input_is_rejected() {
        let (pending, mut client) = accept_pair(Duration::from_secs(5));
        client.write_all(&[b'x'; MAX_HANDSHAKE_LEN + 10]).unwrap();
        settle();

        let (progress, _) = pending.advance(Instant::now());

        assert!(matches!(
            progress,
            HandshakeProgress::Rejected(HandshakeError::TooLong)
        ));
    }
}

//! Recording transport for unit and integration tests.
//!
//! Clones share state, so a test keeps one clone for inspection and hands
//! the other to the server.

use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{ClientTransport, ControlStatus};

#[derive(Debug, Default)]
struct MockState {
    has_reliable: bool,
    fail_reliable: bool,
    reliable: Vec<Vec<u8>>,
    unreliable: Vec<Vec<u8>>,
    control: VecDeque<ControlStatus>,
    inbound: VecDeque<Vec<u8>>,
    closed: bool,
}

/// A [`ClientTransport`] that records every packet instead of sending it.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Transport with only the unreliable channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport with a working control socket.
    pub fn with_reliable() -> Self {
        let mock = Self::default();
        mock.state().has_reliable = true;
        mock
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    /// Makes every subsequent reliable send fail.
    pub fn fail_reliable_sends(&self) {
        self.state().fail_reliable = true;
    }

    /// Queues what the next `poll_control` calls report.
    pub fn push_control(&self, status: ControlStatus) {
        self.state().control.push_back(status);
    }

    /// Queues a datagram for `recv_datagram`.
    pub fn push_datagram(&self, bytes: &[u8]) {
        self.state().inbound.push_back(bytes.to_vec());
    }

    pub fn reliable_packets(&self) -> Vec<Vec<u8>> {
        self.state().reliable.clone()
    }

    pub fn unreliable_packets(&self) -> Vec<Vec<u8>> {
        self.state().unreliable.clone()
    }

    /// Every packet sent on either channel.
    pub fn total_sent(&self) -> usize {
        let state = self.state();
        state.reliable.len() + state.unreliable.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

impl ClientTransport for MockTransport {
    fn has_reliable(&self) -> bool {
        let state = self.state();
        state.has_reliable && !state.closed
    }

    fn send_reliable(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.state();
        if !state.has_reliable || state.fail_reliable {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "mock reliable failure"));
        }
        state.reliable.push(bytes.to_vec());
        Ok(())
    }

    fn send_unreliable(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.state().unreliable.push(bytes.to_vec());
        Ok(())
    }

    fn poll_control(&mut self) -> ControlStatus {
        self.state().control.pop_front().unwrap_or(ControlStatus::Idle)
    }

    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let Some(datagram) = self.state().inbound.pop_front() else {
            return Ok(None);
        };
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok(Some(n))
    }

    fn close(&mut self) {
        self.state().closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_records_packets_across_clones() {
        let inspect = MockTransport::with_reliable();
        let mut transport = inspect.clone();

        transport.send_reliable(b"tcp").unwrap();
        transport.send_unreliable(b"udp").unwrap();

        assert_eq!(inspect.reliable_packets(), vec![b"tcp".to_vec()]);
        assert_eq!(inspect.unreliable_packets(), vec![b"udp".to_vec()]);
        assert_eq!(inspect.total_sent(), 2);
    }

    #[test]
    fn test_mock_without_reliable_channel_rejects_reliable_send() {
        let mut transport = MockTransport::new();
        assert!(!transport.has_reliable());
        assert!(transport.send_reliable(b"x").is_err());
    }

    #[test]
    fn test_mock_replays_control_script_then_idles() {
        let mut transport = MockTransport::new();
        transport.push_control(ControlStatus::DisconnectRequested);

        assert_eq!(transport.poll_control(), ControlStatus::DisconnectRequested);
        assert_eq!(transport.poll_control(), ControlStatus::Idle);
    }

    #[test]
    fn test_mock_delivers_one_datagram_per_call() {
        let mut transport = MockTransport::new();
        transport.push_datagram(&[1, 2, 3]);
        transport.push_datagram(&[4]);

        let mut buf = [0u8; 8];
        assert_eq!(transport.recv_datagram(&mut buf).unwrap(), Some(3));
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(transport.recv_datagram(&mut buf).unwrap(), Some(1));
        assert_eq!(transport.recv_datagram(&mut buf).unwrap(), None);
    }
}

//! Network infrastructure for the relay.
//!
//! # Sub-modules
//!
//! - **`input_server`** – the handshake listener and the per-tick fan-out of
//!   drained events to every client.
//! - **`handshake`** – non-blocking per-connection handshake state, advanced
//!   once per tick until it completes, fails or times out.
//! - **`net_client`** – a registered consumer, the channel it gets each event
//!   on, and the registry keyed by `ip:data_port`.
//! - **`transport`** – the sockets behind a client, behind a trait so the
//!   server can be tested with a recording mock.

pub mod handshake;
pub mod input_server;
pub mod net_client;
pub mod transport;

pub use input_server::{InputServer, InputServerConfig, NetworkError, StreamStats};

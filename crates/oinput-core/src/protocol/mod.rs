//! Wire formats: the binary event packet, the ASCII telemetry lines, and the
//! handshake that selects between them.

pub mod ascii;
pub mod handshake;
pub mod packet;

pub use handshake::{parse_handshake, DataMode, Handshake, HandshakeError};
pub use packet::{decode_event, encode_event, encode_event_into, ProtocolError};

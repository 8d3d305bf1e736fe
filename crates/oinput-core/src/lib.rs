//! # oinput-core
//!
//! Shared library for the oinput event relay: the input event model, the
//! bounded ring buffer producers write into, and the wire formats used to
//! ship events to remote consumers.
//!
//! This crate opens no sockets and spawns no threads.  The server crate
//! builds the service scheduler and the network fan-out on top of it.
//!
//! # Architecture overview
//!
//! Many independent input sources ("services") produce events: a motion
//! capture tracker reports rigid-body poses, a touch table reports fingers,
//! a gamepad reports axes.  They all write the same [`Event`] shape into one
//! [`EventBuffer`].  Once per tick the server drains the buffer and sends
//! each event to every connected client in the format that client asked for.
//!
//! - **`domain`** – the [`Event`] type and its enums.
//! - **`buffer`** – the fixed-capacity, overwrite-on-full ring buffer and
//!   the shared [`EventQueue`] handle producers lock around their writes.
//! - **`protocol`** – the 512-byte binary packet, the legacy and tactile
//!   text lines, and handshake parsing.

pub mod buffer;
pub mod domain;
pub mod protocol;

pub use buffer::{EventBuffer, EventQueue, DEFAULT_MAX_EVENTS};
pub use domain::event::{
    Event, EventError, EventType, ExtraDataType, Quaternion, ServiceType, ServiceTypeMask,
};
pub use protocol::handshake::{parse_handshake, DataMode, Handshake, HandshakeError};
pub use protocol::packet::{decode_event, encode_event, ProtocolError, EVENT_PACKET_SIZE};

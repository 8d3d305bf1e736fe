//! Fixed-size binary event packet.
//!
//! Wire format (all fields little-endian, 512 bytes total):
//! ```text
//! offset  field
//!      0  u32 timestamp
//!      4  u32 source_id
//!      8  u32 device_tag
//!     12  u32 service_type
//!     16  u32 event_type
//!     20  u32 flags
//!     24  f32 pos_x, f32 pos_y, f32 pos_z
//!     36  f32 quat_w, f32 quat_x, f32 quat_y, f32 quat_z
//!     52  u32 extra_data_type
//!     56  u32 extra_data_items
//!     60  u32 extra_data_mask
//!     64  u8[448] extra_data, zero-padded
//! ```
//! Existing clients read this layout directly, so it must stay bit-exact.

use thiserror::Error;

use crate::domain::event::{
    Event, EventError, EventType, ExtraDataType, Quaternion, ServiceType,
};

/// Total size of one binary event packet.
pub const EVENT_PACKET_SIZE: usize = 512;

/// Size of the fixed header preceding the extra-data payload.
pub const EVENT_HEADER_SIZE: usize = 64;

/// Errors that can occur while decoding a binary event packet.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the fixed header.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    #[error("unknown service type: {0}")]
    UnknownServiceType(u32),

    #[error("unknown event type: {0}")]
    UnknownEventType(u32),

    #[error("unknown extra data type: {0}")]
    UnknownExtraDataType(u32),

    /// The header declares more extra data than the packet carries.
    #[error("malformed extra data: {0}")]
    MalformedExtraData(#[from] EventError),
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes `event` into a freshly allocated 512-byte packet.
///
/// # Examples
///
/// ```rust
/// use oinput_core::domain::event::{Event, EventType, ServiceType};
/// use oinput_core::protocol::packet::{decode_event, encode_event, EVENT_PACKET_SIZE};
///
/// let mut evt = Event::new(EventType::Move, ServiceType::Pointer);
/// evt.set_position(0.25, 0.75, 0.0);
/// let bytes = encode_event(&evt);
/// assert_eq!(bytes.len(), EVENT_PACKET_SIZE);
/// assert_eq!(decode_event(&bytes).unwrap(), evt);
/// ```
pub fn encode_event(event: &Event) -> [u8; EVENT_PACKET_SIZE] {
    let mut buf = [0u8; EVENT_PACKET_SIZE];
    encode_event_into(event, &mut buf);
    buf
}

/// Encodes `event` into `buf`, overwriting all 512 bytes.
///
/// Lets the relay serialize into one reused scratch buffer per tick.
pub fn encode_event_into(event: &Event, buf: &mut [u8; EVENT_PACKET_SIZE]) {
    let mut w = Writer { buf, pos: 0 };

    w.u32(event.timestamp);
    w.u32(event.source_id);
    w.u32(event.device_tag);
    w.u32(event.service_type as u32);
    w.u32(event.event_type as u32);
    w.u32(event.flags);
    for c in event.position {
        w.f32(c);
    }
    let q = event.orientation;
    w.f32(q.w);
    w.f32(q.x);
    w.f32(q.y);
    w.f32(q.z);
    w.u32(event.extra_data_type() as u32);
    w.u32(event.extra_data_items());
    w.u32(event.extra_data_mask);

    debug_assert_eq!(w.pos, EVENT_HEADER_SIZE);

    let payload = event.extra_data();
    w.buf[EVENT_HEADER_SIZE..EVENT_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    w.buf[EVENT_HEADER_SIZE + payload.len()..].fill(0);
}

/// Decodes one event from the beginning of `bytes`.
///
/// Accepts datagrams shorter than 512 bytes as long as they hold the header
/// and the declared payload; stream-in producers are not required to pad.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the header is truncated, an enum field holds
/// an unknown value, or the declared payload exceeds what is present.
pub fn decode_event(bytes: &[u8]) -> Result<Event, ProtocolError> {
    if bytes.len() < EVENT_HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: EVENT_HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let mut r = Reader { buf: bytes, pos: 0 };
    let mut event = Event::default();

    event.timestamp = r.u32();
    event.source_id = r.u32();
    event.device_tag = r.u32();

    let raw = r.u32();
    event.service_type =
        ServiceType::try_from(raw).map_err(|_| ProtocolError::UnknownServiceType(raw))?;
    let raw = r.u32();
    event.event_type = EventType::try_from(raw).map_err(|_| ProtocolError::UnknownEventType(raw))?;

    event.flags = r.u32();
    event.position = [r.f32(), r.f32(), r.f32()];
    event.orientation = Quaternion::new(r.f32(), r.f32(), r.f32(), r.f32());

    let raw = r.u32();
    let data_type =
        ExtraDataType::try_from(raw).map_err(|_| ProtocolError::UnknownExtraDataType(raw))?;
    let items = r.u32();
    let mask = r.u32();

    let payload = &bytes[EVENT_HEADER_SIZE..bytes.len().min(EVENT_PACKET_SIZE)];
    event.set_extra_data_raw(data_type, items, mask, payload)?;

    Ok(event)
}

// ── Cursor helpers ────────────────────────────────────────────────────────────

struct Writer<'a> {
    buf: &'a mut [u8; EVENT_PACKET_SIZE],
    pos: usize,
}

impl Writer<'_> {
    fn u32(&mut self, v: u32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&v.to_le_bytes());
        self.pos += 4;
    }

    fn f32(&mut self, v: f32) {
        self.u32(v.to_bits());
    }
}

/// Reads fields from a slice already checked to hold the full header.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn u32(&mut self) -> u32 {
        let b = &self.buf[self.pos..self.pos + 4];
        self.pos += 4;
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    fn f32(&mut self) -> f32 {
        f32::from_bits(self.u32())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

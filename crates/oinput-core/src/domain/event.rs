//! The input event: one timestamped sample from one source of one service.
//!
//! Every producer in the relay (motion-capture trackers, touch tables,
//! gamepads, speech recognisers, remote stream-in clients) writes the same
//! [`Event`] shape into the shared ring buffer.  The shape mirrors the fixed
//! binary packet described in [`crate::protocol::packet`] field for field, so
//! encoding is a straight copy.
//!
//! # Extra data
//!
//! Besides position and orientation, an event may carry a small typed payload
//! (an array of floats, ints, 3-vectors, or a string).  The payload lives in a
//! fixed inline array so that events can be stored in a pre-allocated arena
//! without any heap traffic.  Its size is bounded by what fits in one wire
//! packet after the 64-byte header: [`EXTRA_DATA_CAPACITY`] bytes.

use std::sync::OnceLock;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::packet::{EVENT_HEADER_SIZE, EVENT_PACKET_SIZE};

/// Maximum number of extra-data bytes an event can carry.
pub const EXTRA_DATA_CAPACITY: usize = EVENT_PACKET_SIZE - EVENT_HEADER_SIZE;

/// Mask selecting the emitting service id from a device tag.
pub const DEVICE_TAG_SERVICE_ID_MASK: u32 = 0x0000_ffff;
/// Mask selecting the user id from a device tag.
pub const DEVICE_TAG_USER_ID_MASK: u32 = 0xffff_0000;
/// Bit offset of the user id inside a device tag.
pub const DEVICE_TAG_USER_ID_OFFSET: u32 = 16;

/// Errors raised when building an event.
#[derive(Debug, Error, PartialEq)]
pub enum EventError {
    /// The payload does not fit in the inline extra-data area.
    #[error("extra data needs {needed} bytes, capacity is {capacity}")]
    ExtraDataOverflow { needed: usize, capacity: usize },

    /// Fewer source bytes were supplied than the declared payload needs.
    #[error("extra data declares {needed} bytes but only {available} were supplied")]
    ShortPayload { needed: usize, available: usize },
}

// ── Service types ─────────────────────────────────────────────────────────────

/// The class of service an event comes from.  Each class produces events
/// with the same field layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ServiceType {
    Pointer = 0,
    Mocap = 1,
    Keyboard = 2,
    Controller = 3,
    Ui = 4,
    Generic = 5,
    Brain = 6,
    Wand = 7,
    Speech = 8,
}

impl ServiceType {
    /// Every service type, in wire order.
    pub const ALL: [ServiceType; 9] = [
        ServiceType::Pointer,
        ServiceType::Mocap,
        ServiceType::Keyboard,
        ServiceType::Controller,
        ServiceType::Ui,
        ServiceType::Generic,
        ServiceType::Brain,
        ServiceType::Wand,
        ServiceType::Speech,
    ];

    /// The single-bit mask selecting this type in a [`ServiceTypeMask`].
    pub fn mask_bit(self) -> u32 {
        1 << (self as u32)
    }
}

impl TryFrom<u32> for ServiceType {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        ServiceType::ALL
            .into_iter()
            .find(|t| *t as u32 == value)
            .ok_or(())
    }
}

/// Bitmask of [`ServiceType`]s a network client wants delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTypeMask(pub u32);

impl ServiceTypeMask {
    /// Accepts every service type.
    pub const ALL: ServiceTypeMask = ServiceTypeMask(u32::MAX);

    /// Builds a mask from a list of service types.
    pub fn from_types(types: &[ServiceType]) -> Self {
        Self(types.iter().fold(0, |acc, t| acc | t.mask_bit()))
    }

    /// Interprets a handshake flags word.  Zero means "no preference", which
    /// is the same as accepting everything.
    pub fn from_flags(flags: u32) -> Self {
        if flags == 0 {
            Self::ALL
        } else {
            Self(flags)
        }
    }

    /// Returns `true` if events of `service_type` pass this filter.
    pub fn accepts(self, service_type: ServiceType) -> bool {
        self.0 & service_type.mask_bit() != 0
    }
}

impl Default for ServiceTypeMask {
    fn default() -> Self {
        Self::ALL
    }
}

// ── Event types ───────────────────────────────────────────────────────────────

/// What happened to the source of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum EventType {
    Select = 0,
    Toggle = 1,
    ChangeValue = 2,
    Update = 3,
    Move = 4,
    Down = 5,
    Up = 6,
    /// A tracked object appeared.  Also used as "connect".
    Trace = 7,
    /// A tracked object was lost.  Also used as "disconnect".
    Untrace = 8,
    Click = 9,
    Zoom = 15,
    Split = 18,
    Rotate = 21,
    Null = 666,
}

impl EventType {
    pub const CONNECT: EventType = EventType::Trace;
    pub const DISCONNECT: EventType = EventType::Untrace;

    /// `true` for the continuous, high-rate event kinds (Move and Update).
    ///
    /// These are delivered on the drop-tolerant channel; everything else is
    /// a discrete state transition.
    pub fn is_high_rate(self) -> bool {
        matches!(self, EventType::Move | EventType::Update)
    }
}

impl TryFrom<u32> for EventType {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EventType::Select),
            1 => Ok(EventType::Toggle),
            2 => Ok(EventType::ChangeValue),
            3 => Ok(EventType::Update),
            4 => Ok(EventType::Move),
            5 => Ok(EventType::Down),
            6 => Ok(EventType::Up),
            7 => Ok(EventType::Trace),
            8 => Ok(EventType::Untrace),
            9 => Ok(EventType::Click),
            15 => Ok(EventType::Zoom),
            18 => Ok(EventType::Split),
            21 => Ok(EventType::Rotate),
            666 => Ok(EventType::Null),
            _ => Err(()),
        }
    }
}

/// Generic event flag bits.
pub mod flags {
    pub const LEFT: u32 = 1 << 0;
    pub const BUTTON1: u32 = 1 << 0;
    pub const RIGHT: u32 = 1 << 1;
    pub const BUTTON2: u32 = 1 << 1;
    pub const MIDDLE: u32 = 1 << 2;
    pub const BUTTON3: u32 = 1 << 2;
    pub const CTRL: u32 = 1 << 3;
    pub const ALT: u32 = 1 << 4;
    pub const SHIFT: u32 = 1 << 5;
    pub const BUTTON4: u32 = 1 << 6;
    pub const BUTTON5: u32 = 1 << 7;
    pub const BUTTON6: u32 = 1 << 8;
    pub const BUTTON7: u32 = 1 << 9;
    pub const BUTTON_UP: u32 = 1 << 10;
    pub const BUTTON_DOWN: u32 = 1 << 11;
    pub const BUTTON_LEFT: u32 = 1 << 12;
    pub const BUTTON_RIGHT: u32 = 1 << 13;
    /// Set by a filter stage that has fully handled the event.
    pub const PROCESSED: u32 = 1 << 14;
    pub const BUTTON8: u32 = 1 << 15;
    pub const BUTTON9: u32 = 1 << 16;
    /// Event targets a single endpoint rather than being broadcast.
    pub const EXCLUSIVE: u32 = 1 << 17;
    /// First bit available for application-defined flags.
    pub const USER: u32 = 1 << 18;
}

// ── Extra data ────────────────────────────────────────────────────────────────

/// Element type of an event's extra-data payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u32)]
pub enum ExtraDataType {
    #[default]
    Null = 0,
    FloatArray = 1,
    IntArray = 2,
    Vector3Array = 3,
    String = 4,
}

impl ExtraDataType {
    /// Payload size in bytes for `items` elements of this type.
    pub fn payload_size(self, items: usize) -> usize {
        match self {
            ExtraDataType::Null => 0,
            ExtraDataType::FloatArray | ExtraDataType::IntArray => items * 4,
            ExtraDataType::Vector3Array => items * 12,
            ExtraDataType::String => items,
        }
    }
}

impl TryFrom<u32> for ExtraDataType {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ExtraDataType::Null),
            1 => Ok(ExtraDataType::FloatArray),
            2 => Ok(ExtraDataType::IntArray),
            3 => Ok(ExtraDataType::Vector3Array),
            4 => Ok(ExtraDataType::String),
            _ => Err(()),
        }
    }
}

// ── Geometry ──────────────────────────────────────────────────────────────────

/// Orientation quaternion.  Serialized in `w, x, y, z` order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion {
        w: 1.0,
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(w: f32, x: f32, y: f32, z: f32) -> Self {
        Self { w, x, y, z }
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

// ── Timestamps ────────────────────────────────────────────────────────────────

static CLOCK_ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Milliseconds elapsed on a monotonic clock since the first call in this
/// process, truncated to the 32 bits carried on the wire.
pub fn timestamp_ms() -> u32 {
    let origin = CLOCK_ORIGIN.get_or_init(Instant::now);
    origin.elapsed().as_millis() as u32
}

// ── Event ─────────────────────────────────────────────────────────────────────

/// One input sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Monotonic millisecond counter at the time the event was produced.
    pub timestamp: u32,
    /// Identifies the originating object within its service (a rigid body,
    /// a touch point, a controller index).
    pub source_id: u32,
    /// Low 16 bits: emitting service id.  High 16 bits: user id.
    pub device_tag: u32,
    pub service_type: ServiceType,
    pub event_type: EventType,
    /// Bitmask of [`flags`].
    pub flags: u32,
    pub position: [f32; 3],
    pub orientation: Quaternion,
    extra_data_type: ExtraDataType,
    extra_data_items: u32,
    /// Opaque bitmask forwarded untouched between producer and consumer.
    pub extra_data_mask: u32,
    extra_data: [u8; EXTRA_DATA_CAPACITY],
}

impl Default for Event {
    fn default() -> Self {
        Self {
            timestamp: 0,
            source_id: 0,
            device_tag: 0,
            service_type: ServiceType::Generic,
            event_type: EventType::Null,
            flags: 0,
            position: [0.0; 3],
            orientation: Quaternion::IDENTITY,
            extra_data_type: ExtraDataType::Null,
            extra_data_items: 0,
            extra_data_mask: 0,
            extra_data: [0; EXTRA_DATA_CAPACITY],
        }
    }
}

impl Event {
    /// Creates a fresh event of the given kind, stamped with the current time.
    pub fn new(event_type: EventType, service_type: ServiceType) -> Self {
        let mut evt = Self::default();
        evt.reset(event_type, service_type, 0, 0, 0);
        evt
    }

    /// Clears every field and re-initialises the event in place.
    ///
    /// Producers call this on the slot returned by
    /// [`crate::buffer::EventBuffer::write_head`], which may hold stale data
    /// from an earlier lap of the ring.
    pub fn reset(
        &mut self,
        event_type: EventType,
        service_type: ServiceType,
        source_id: u32,
        service_id: u16,
        user_id: u16,
    ) {
        self.timestamp = timestamp_ms();
        self.source_id = source_id;
        self.set_device_tag(service_id, user_id);
        self.service_type = service_type;
        self.event_type = event_type;
        self.flags = 0;
        self.position = [0.0; 3];
        self.orientation = Quaternion::IDENTITY;
        self.clear_extra_data();
    }

    /// Packs `service_id` and `user_id` into [`Event::device_tag`].
    pub fn set_device_tag(&mut self, service_id: u16, user_id: u16) {
        self.device_tag = ((user_id as u32) << DEVICE_TAG_USER_ID_OFFSET) | service_id as u32;
    }

    pub fn service_id(&self) -> u16 {
        (self.device_tag & DEVICE_TAG_SERVICE_ID_MASK) as u16
    }

    pub fn user_id(&self) -> u16 {
        ((self.device_tag & DEVICE_TAG_USER_ID_MASK) >> DEVICE_TAG_USER_ID_OFFSET) as u16
    }

    /// `true` if this event comes from `source_id` of a service of type `service_type`.
    pub fn is_from(&self, service_type: ServiceType, source_id: u32) -> bool {
        self.service_type == service_type && self.source_id == source_id
    }

    pub fn is_processed(&self) -> bool {
        self.flags & flags::PROCESSED != 0
    }

    /// Marks the event as handled so later stages skip forwarding it.
    pub fn set_processed(&mut self) {
        self.flags |= flags::PROCESSED;
    }

    pub fn is_flag_set(&self, flag: u32) -> bool {
        self.flags & flag == flag
    }

    pub fn set_position(&mut self, x: f32, y: f32, z: f32) {
        self.position = [x, y, z];
    }

    pub fn set_orientation(&mut self, orientation: Quaternion) {
        self.orientation = orientation;
    }

    // ── Extra data accessors ──────────────────────────────────────────────────

    pub fn extra_data_type(&self) -> ExtraDataType {
        self.extra_data_type
    }

    pub fn extra_data_items(&self) -> u32 {
        self.extra_data_items
    }

    /// Number of meaningful bytes in the payload.
    pub fn extra_data_size(&self) -> usize {
        self.extra_data_type
            .payload_size(self.extra_data_items as usize)
    }

    /// The meaningful portion of the payload.
    pub fn extra_data(&self) -> &[u8] {
        &self.extra_data[..self.extra_data_size()]
    }

    pub fn clear_extra_data(&mut self) {
        self.extra_data_type = ExtraDataType::Null;
        self.extra_data_items = 0;
        self.extra_data_mask = 0;
        self.extra_data.fill(0);
    }

    /// Replaces the payload with raw bytes of the given type.
    ///
    /// `bytes` must be at least as long as the declared payload; any bytes
    /// beyond it are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::ExtraDataOverflow`] if the declared payload does
    /// not fit; the event is left unchanged.
    pub fn set_extra_data_raw(
        &mut self,
        data_type: ExtraDataType,
        items: u32,
        mask: u32,
        bytes: &[u8],
    ) -> Result<(), EventError> {
        let needed = data_type.payload_size(items as usize);
        if needed > EXTRA_DATA_CAPACITY {
            return Err(EventError::ExtraDataOverflow {
                needed,
                capacity: EXTRA_DATA_CAPACITY,
            });
        }
        if bytes.len() < needed {
            return Err(EventError::ShortPayload {
                needed,
                available: bytes.len(),
            });
        }
        self.extra_data.fill(0);
        self.extra_data[..needed].copy_from_slice(&bytes[..needed]);
        self.extra_data_type = data_type;
        self.extra_data_items = items;
        self.extra_data_mask = mask;
        Ok(())
    }

    /// Stores an array of floats.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::ExtraDataOverflow`] if more than 112 values are given.
    pub fn set_extra_data_floats(&mut self, values: &[f32]) -> Result<(), EventError> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.set_extra_data_raw(ExtraDataType::FloatArray, values.len() as u32, 0, &bytes)
    }

    /// Stores an array of ints.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::ExtraDataOverflow`] if more than 112 values are given.
    pub fn set_extra_data_ints(&mut self, values: &[i32]) -> Result<(), EventError> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.set_extra_data_raw(ExtraDataType::IntArray, values.len() as u32, 0, &bytes)
    }

    /// Stores an array of 3-vectors.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::ExtraDataOverflow`] if more than 37 vectors are given.
    pub fn set_extra_data_vectors(&mut self, values: &[[f32; 3]]) -> Result<(), EventError> {
        let bytes: Vec<u8> = values
            .iter()
            .flat_map(|v| v.iter().flat_map(|c| c.to_le_bytes()))
            .collect();
        self.set_extra_data_raw(ExtraDataType::Vector3Array, values.len() as u32, 0, &bytes)
    }

    /// Stores a UTF-8 string.  `items` is the byte length.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::ExtraDataOverflow`] if the string is longer than
    /// [`EXTRA_DATA_CAPACITY`] bytes.
    pub fn set_extra_data_string(&mut self, value: &str) -> Result<(), EventError> {
        self.set_extra_data_raw(
            ExtraDataType::String,
            value.len() as u32,
            0,
            value.as_bytes(),
        )
    }

    /// Reads float `index` from a float-array payload.
    pub fn extra_data_float(&self, index: usize) -> Option<f32> {
        if self.extra_data_type != ExtraDataType::FloatArray {
            return None;
        }
        self.word(index).map(f32::from_le_bytes)
    }

    /// Reads int `index` from an int-array payload.
    pub fn extra_data_int(&self, index: usize) -> Option<i32> {
        if self.extra_data_type != ExtraDataType::IntArray {
            return None;
        }
        self.word(index).map(i32::from_le_bytes)
    }

    /// Reads vector `index` from a vector-array payload.
    pub fn extra_data_vector(&self, index: usize) -> Option<[f32; 3]> {
        if self.extra_data_type != ExtraDataType::Vector3Array
            || index >= self.extra_data_items as usize
        {
            return None;
        }
        let base = index * 12;
        let component = |off: usize| {
            let b = &self.extra_data[base + off..base + off + 4];
            f32::from_le_bytes([b[0], b[1], b[2], b[3]])
        };
        Some([component(0), component(4), component(8)])
    }

    /// Reads a string payload.  Invalid UTF-8 yields `None`.
    pub fn extra_data_str(&self) -> Option<&str> {
        if self.extra_data_type != ExtraDataType::String {
            return None;
        }
        std::str::from_utf8(self.extra_data()).ok()
    }

    /// Numeric value `index` of a float or int payload, as `f32`.
    ///
    /// Used by the ASCII formats, which print numeric payloads regardless of
    /// whether the producer stored floats or ints.
    pub fn extra_data_number(&self, index: usize) -> f32 {
        self.extra_data_float(index)
            .or_else(|| self.extra_data_int(index).map(|v| v as f32))
            .unwrap_or(0.0)
    }

    fn word(&self, index: usize) -> Option<[u8; 4]> {
        if index >= self.extra_data_items as usize {
            return None;
        }
        let off = index * 4;
        let b = &self.extra_data[off..off + 4];
        Some([b[0], b[1], b[2], b[3]])
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_packs_service_and_user_id_into_device_tag() {
        let mut evt = Event::default();
        evt.reset(EventType::Down, ServiceType::Pointer, 7, 0x0012, 0x0003);

        assert_eq!(evt.device_tag, 0x0003_0012);
        assert_eq!(evt.service_id(), 0x12);
        assert_eq!(evt.user_id(), 3);
        assert_eq!(evt.source_id, 7);
    }

    #[test]
    fn test_reset_clears_stale_payload_and_flags() {
        let mut evt = Event::new(EventType::Move, ServiceType::Pointer);
        evt.set_extra_data_floats(&[1.0, 2.0]).unwrap();
        evt.set_processed();

        evt.reset(EventType::Up, ServiceType::Mocap, 1, 1, 0);

        assert_eq!(evt.extra_data_type(), ExtraDataType::Null);
        assert_eq!(evt.extra_data_items(), 0);
        assert!(!evt.is_processed());
    }

    #[test]
    fn test_float_payload_reads_back() {
        let mut evt = Event::new(EventType::Update, ServiceType::Controller);
        evt.set_extra_data_floats(&[0.5, -1.25, 3.0]).unwrap();

        assert_eq!(evt.extra_data_items(), 3);
        assert_eq!(evt.extra_data_size(), 12);
        assert_eq!(evt.extra_data_float(1), Some(-1.25));
        assert_eq!(evt.extra_data_float(3), None);
        assert_eq!(evt.extra_data_int(0), None, "type mismatch must yield None");
    }

    #[test]
    fn test_vector_payload_reads_back() {
        let mut evt = Event::new(EventType::Update, ServiceType::Mocap);
        evt.set_extra_data_vectors(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]])
            .unwrap();

        assert_eq!(evt.extra_data_size(), 24);
        assert_eq!(evt.extra_data_vector(1), Some([4.0, 5.0, 6.0]));
    }

    #[test]
    fn test_string_payload_reads_back() {
        let mut evt = Event::new(EventType::Select, ServiceType::Speech);
        evt.set_extra_data_string("lights on").unwrap();

        assert_eq!(evt.extra_data_str(), Some("lights on"));
        assert_eq!(evt.extra_data_items(), 9);
    }

    #[test]
    fn test_oversized_payload_is_rejected_and_event_unchanged() {
        let mut evt = Event::new(EventType::Update, ServiceType::Brain);
        evt.set_extra_data_ints(&[1, 2]).unwrap();

        let too_many = vec![0.0f32; EXTRA_DATA_CAPACITY / 4 + 1];
        let result = evt.set_extra_data_floats(&too_many);

        assert_eq!(
            result,
            Err(EventError::ExtraDataOverflow {
                needed: EXTRA_DATA_CAPACITY + 4,
                capacity: EXTRA_DATA_CAPACITY
            })
        );
        assert_eq!(evt.extra_data_int(1), Some(2));
    }

    #[test]
    fn test_payload_filling_capacity_exactly_is_accepted() {
        let mut evt = Event::new(EventType::Update, ServiceType::Generic);
        let values = vec![1.0f32; EXTRA_DATA_CAPACITY / 4];
        assert!(evt.set_extra_data_floats(&values).is_ok());
    }

    #[test]
    fn test_service_type_mask_filters() {
        let mask = ServiceTypeMask::from_types(&[ServiceType::Pointer, ServiceType::Mocap]);
        assert!(mask.accepts(ServiceType::Pointer));
        assert!(mask.accepts(ServiceType::Mocap));
        assert!(!mask.accepts(ServiceType::Speech));
        assert_eq!(mask, ServiceTypeMask(3));
    }

    #[test]
    fn test_zero_flags_mask_accepts_everything() {
        let mask = ServiceTypeMask::from_flags(0);
        assert!(ServiceType::ALL.iter().all(|t| mask.accepts(*t)));
    }

    #[test]
    fn test_service_type_from_wire_value() {
        assert_eq!(ServiceType::try_from(8), Ok(ServiceType::Speech));
        assert_eq!(ServiceType::try_from(9), Err(()));
    }

    #[test]
    fn test_event_type_aliases_and_rates() {
        assert_eq!(EventType::CONNECT, EventType::Trace);
        assert_eq!(EventType::try_from(21), Ok(EventType::Rotate));
        assert!(EventType::Move.is_high_rate());
        assert!(!EventType::Down.is_high_rate());
    }

    #[test]
    fn test_timestamp_is_monotonic() {
        let a = timestamp_ms();
        let b = timestamp_ms();
        assert!(b >= a);
    }
}

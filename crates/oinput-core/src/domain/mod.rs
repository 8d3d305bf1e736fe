//! Domain entities for the event relay.
//!
//! Pure data types with no sockets, threads or clocks beyond a monotonic
//! millisecond counter.

pub mod event;

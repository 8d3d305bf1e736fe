//! Text wire formats for legacy and tactile clients.
//!
//! Both formats emit one line per event with no terminator other than a
//! trailing space.  Floats are printed with six decimals, which is what the
//! deployed parsers on the receiving side expect.
//!
//! Legacy:
//! ```text
//! Pointer     0:<type>,<id>,<x>,<y>[,<w>,<h> | ,<g1>,<g2>,<g3>,<g4>[,<g5>[,<g6>]]]
//! Mocap       1:<id>,<x>,<y>,<z>,<qx>,<qy>,<qz>,<qw>
//! Controller  3:<id>,<int>,<int>,...
//! Generic     5:<id>
//! Brain       6:<id>,<12 ints>
//! Wand        7:<type>,<id>,<flags>,<float>,<float>,...
//! ```
//! Tactile (pointer events only):
//! ```text
//! <timestamp>:q:<id>,<x>,<y>[,<w>,<h>,<gesture>,1.0]
//! ```

use std::fmt::Write as _;

use crate::domain::event::{Event, EventType, ServiceType};

/// Number of channels a brain-sensor packet always carries.
const BRAIN_CHANNELS: usize = 12;

/// Tactile gesture codes.
const TACTILE_DOWN: u32 = 0;
const TACTILE_MOVE: u32 = 1;
const TACTILE_UP: u32 = 2;

/// Formats `event` for a legacy text client.
///
/// Returns `None` for service types the legacy format has no encoding for;
/// such events are simply not sent to legacy clients.
pub fn legacy_packet(event: &Event) -> Option<String> {
    let mut out = String::with_capacity(128);
    // Writing into a String cannot fail.
    let _ = write!(out, "{}:", event.service_type as u32);

    let items = event.extra_data_items() as usize;

    match event.service_type {
        ServiceType::Pointer => {
            let _ = write!(
                out,
                "{},{},{:.6},{:.6}",
                event.event_type as u32, event.source_id, event.position[0], event.position[1]
            );
            if items == 2 {
                push_floats(&mut out, event, 0..2);
            } else {
                push_floats(&mut out, event, 0..4);
                match event.event_type {
                    EventType::Rotate => push_floats(&mut out, event, 4..5),
                    EventType::Split => push_floats(&mut out, event, 4..6),
                    _ => {}
                }
            }
            out.push(' ');
        }
        ServiceType::Mocap => {
            let [x, y, z] = event.position;
            let q = event.orientation;
            let _ = write!(
                out,
                "{},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6} ",
                event.source_id, x, y, z, q.x, q.y, q.z, q.w
            );
        }
        ServiceType::Controller => {
            let _ = write!(out, "{},", event.source_id);
            for i in 0..items {
                let sep = if i + 1 < items { ',' } else { ' ' };
                let _ = write!(out, "{}{}", event.extra_data_number(i) as i32, sep);
            }
        }
        ServiceType::Wand => {
            let _ = write!(
                out,
                "{},{},{},",
                event.event_type as u32, event.source_id, event.flags
            );
            for i in 0..items {
                let sep = if i + 1 < items { ',' } else { ' ' };
                let _ = write!(out, "{:.6}{}", event.extra_data_number(i), sep);
            }
        }
        ServiceType::Brain => {
            let _ = write!(out, "{}", event.source_id);
            for i in 0..BRAIN_CHANNELS {
                let _ = write!(out, ",{}", event.extra_data_number(i) as i32);
            }
        }
        ServiceType::Generic => {
            let _ = write!(out, "{}", event.source_id);
        }
        _ => return None,
    }

    Some(out)
}

/// Formats `event` for a tactile touch client.
///
/// Only pointer events have a tactile encoding.
pub fn tactile_packet(event: &Event) -> Option<String> {
    if event.service_type != ServiceType::Pointer {
        return None;
    }

    let mut out = String::with_capacity(96);
    let _ = write!(
        out,
        "{}:q:{},{:.6},{:.6}",
        event.timestamp, event.source_id, event.position[0], event.position[1]
    );

    if event.extra_data_items() == 2 {
        let gesture = match event.event_type {
            EventType::Down => TACTILE_DOWN,
            EventType::Up => TACTILE_UP,
            _ => TACTILE_MOVE,
        };
        push_floats(&mut out, event, 0..2);
        let _ = write!(out, ",{gesture},1.0");
    }
    out.push(' ');

    Some(out)
}

fn push_floats(out: &mut String, event: &Event, range: std::ops::Range<usize>) {
    for i in range {
        let _ = write!(out, ",{:.6}", event.extra_data_number(i));
    }
}

//! Handshake literals and the protocol generation they select.
//!
//! A client opens a TCP connection to the server and sends one ASCII line:
//!
//! ```text
//! <literal>,<data_port>[,<flags>]
//! ```
//!
//! The literal picks a [`DataMode`].  `data_port` is where the client listens
//! for UDP event datagrams (or, for stream-in clients, where it will send
//! them from).  Only the V3 literal carries a `flags` field.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const HANDSHAKE_DATA_ON: &str = "data_on";
pub const HANDSHAKE_OMICRON: &str = "omicron_data_on";
pub const HANDSHAKE_OMICRON_V2: &str = "omicronV2_data_on";
pub const HANDSHAKE_OMICRON_V3: &str = "omicronV3_data_on";
pub const HANDSHAKE_STREAM_IN: &str = "omicron_data_in";
pub const HANDSHAKE_LEGACY: &str = "omicron_legacy_data_on";
pub const HANDSHAKE_TACTILE: &str = "tactile_data_on";

/// Text a connected client sends on its control socket before leaving.
pub const DISCONNECT_COMMAND: &str = "data_off";

/// Longest handshake line the server will buffer before giving up.
pub const MAX_HANDSHAKE_LEN: usize = 256;

/// Wire protocol negotiated by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataMode {
    /// Binary packets over UDP only.
    V1,
    /// Binary packets; discrete events also on the TCP control socket.
    V2,
    /// As V2, plus a client flags word selecting service types.
    V3,
    /// Client pushes binary packets to the server over UDP.
    StreamIn,
    /// Legacy ASCII lines over UDP.
    Legacy,
    /// Tactile ASCII touch lines over UDP.
    TacTile,
}

impl DataMode {
    /// `true` for modes that deliver discrete events on the control socket.
    pub fn has_reliable_channel(self) -> bool {
        matches!(self, DataMode::V2 | DataMode::V3)
    }

    /// `false` only for stream-in clients, which send rather than receive.
    pub fn receives_events(self) -> bool {
        self != DataMode::StreamIn
    }

    /// The literal that selects this mode.
    pub fn literal(self) -> &'static str {
        match self {
            DataMode::V1 => HANDSHAKE_OMICRON,
            DataMode::V2 => HANDSHAKE_OMICRON_V2,
            DataMode::V3 => HANDSHAKE_OMICRON_V3,
            DataMode::StreamIn => HANDSHAKE_STREAM_IN,
            DataMode::Legacy => HANDSHAKE_LEGACY,
            DataMode::TacTile => HANDSHAKE_TACTILE,
        }
    }

    fn from_literal(literal: &str) -> Option<Self> {
        match literal {
            HANDSHAKE_DATA_ON | HANDSHAKE_OMICRON => Some(DataMode::V1),
            HANDSHAKE_OMICRON_V2 => Some(DataMode::V2),
            HANDSHAKE_OMICRON_V3 => Some(DataMode::V3),
            HANDSHAKE_STREAM_IN => Some(DataMode::StreamIn),
            HANDSHAKE_LEGACY => Some(DataMode::Legacy),
            HANDSHAKE_TACTILE => Some(DataMode::TacTile),
            _ => None,
        }
    }
}

impl fmt::Display for DataMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataMode::V1 => "omicron",
            DataMode::V2 => "omicronV2",
            DataMode::V3 => "omicronV3",
            DataMode::StreamIn => "stream-in",
            DataMode::Legacy => "legacy",
            DataMode::TacTile => "tactile",
        };
        f.write_str(name)
    }
}

/// A successfully parsed handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub mode: DataMode,
    pub data_port: u16,
    /// Client flags.  Always 0 unless `mode` is [`DataMode::V3`].
    pub flags: u32,
}

/// Reasons a handshake line is rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("empty handshake")]
    Empty,

    #[error("unknown handshake literal: {0:?}")]
    UnknownLiteral(String),

    #[error("missing data port")]
    MissingPort,

    #[error("invalid data port: {0:?}")]
    InvalidPort(String),

    #[error("handshake longer than {MAX_HANDSHAKE_LEN} bytes")]
    TooLong,
}

/// Parses one handshake line.
///
/// Surrounding whitespace and NUL padding are ignored.  The literal must
/// match exactly.  A V3 flags field that is missing or not a number is
/// treated as 0.
///
/// # Errors
///
/// Returns [`HandshakeError`] if the literal is unknown or the data port is
/// missing or not a valid `u16`.
///
/// # Examples
///
/// ```rust
/// use oinput_core::protocol::handshake::{parse_handshake, DataMode};
///
/// let hs = parse_handshake("omicronV3_data_on,9001,3").unwrap();
/// assert_eq!(hs.mode, DataMode::V3);
/// assert_eq!(hs.data_port, 9001);
/// assert_eq!(hs.flags, 3);
/// ```
pub fn parse_handshake(line: &str) -> Result<Handshake, HandshakeError> {
    let line = line.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    if line.is_empty() {
        return Err(HandshakeError::Empty);
    }

    let mut fields = line.split(',').map(str::trim);

    let literal = fields.next().unwrap_or_default();
    let mode = DataMode::from_literal(literal)
        .ok_or_else(|| HandshakeError::UnknownLiteral(literal.to_string()))?;

    let port_field = fields
        .next()
        .filter(|f| !f.is_empty())
        .ok_or(HandshakeError::MissingPort)?;
    let data_port = port_field
        .parse::<u16>()
        .map_err(|_| HandshakeError::InvalidPort(port_field.to_string()))?;

    let flags = match mode {
        DataMode::V3 => fields.next().and_then(|f| f.parse().ok()).unwrap_or(0),
        _ => 0,
    };

    Ok(Handshake {
        mode,
        data_port,
        flags,
    })
}

/// `true` if `text` received on an established control socket asks the
/// server to drop the client.
pub fn is_disconnect_command(text: &str) -> bool {
    text.trim_matches(|c: char| c.is_whitespace() || c == '\0')
        .starts_with(DISCONNECT_COMMAND)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_v1_handshake() {
        let hs = parse_handshake("omicron_data_on,9000").unwrap();
        assert_eq!(
            hs,
            Handshake {
                mode: DataMode::V1,
                data_port: 9000,
                flags: 0
            }
        );
    }

    #[test]
    fn test_parse_v3_handshake_with_flags() {
        let hs = parse_handshake("omicronV3_data_on,9001,3").unwrap();
        assert_eq!(hs.mode, DataMode::V3);
        assert_eq!(hs.data_port, 9001);
        assert_eq!(hs.flags, 3);
    }

    #[test]
    fn test_parse_v3_without_flags_defaults_to_zero() {
        let hs = parse_handshake("omicronV3_data_on,9001").unwrap();
        assert_eq!(hs.flags, 0);

        let hs = parse_handshake("omicronV3_data_on,9001,abc").unwrap();
        assert_eq!(hs.flags, 0);
    }

    #[test]
    fn test_flags_ignored_outside_v3() {
        let hs = parse_handshake("omicronV2_data_on,9002,7").unwrap();
        assert_eq!(hs.mode, DataMode::V2);
        assert_eq!(hs.flags, 0);
    }

    #[test]
    fn test_parse_unknown_literal_is_rejected() {
        assert_eq!(
            parse_handshake("bogus_handshake,1"),
            Err(HandshakeError::UnknownLiteral("bogus_handshake".into()))
        );
    }

    #[test]
    fn test_old_data_on_literal_selects_v1() {
        assert_eq!(parse_handshake("data_on,7000").unwrap().mode, DataMode::V1);
    }

    #[test]
    fn test_every_literal_maps_to_its_mode() {
        let cases = [
            (HANDSHAKE_OMICRON_V2, DataMode::V2),
            (HANDSHAKE_STREAM_IN, DataMode::StreamIn),
            (HANDSHAKE_LEGACY, DataMode::Legacy),
            (HANDSHAKE_TACTILE, DataMode::TacTile),
        ];
        for (literal, mode) in cases {
            let hs = parse_handshake(&format!("{literal},1234")).unwrap();
            assert_eq!(hs.mode, mode, "literal {literal}");
            assert_eq!(mode.literal(), literal);
        }
    }

    #[test]
    fn test_literal_prefix_does_not_match() {
        assert!(matches!(
            parse_handshake("omicron_data_onX,9000"),
            Err(HandshakeError::UnknownLiteral(_))
        ));
    }

    #[test]
    fn test_trailing_nul_and_newline_are_trimmed() {
        let hs = parse_handshake("omicron_data_on,9000\r\n\0\0").unwrap();
        assert_eq!(hs.data_port, 9000);
    }

    #[test]
    fn test_missing_or_bad_port_is_rejected() {
        assert_eq!(
            parse_handshake("omicron_data_on"),
            Err(HandshakeError::MissingPort)
        );
        assert_eq!(
            parse_handshake("omicron_data_on,"),
            Err(HandshakeError::MissingPort)
        );
        assert_eq!(
            parse_handshake("omicron_data_on,70000"),
            Err(HandshakeError::InvalidPort("70000".into()))
        );
    }

    #[test]
    fn test_empty_handshake_is_rejected() {
        assert_eq!(parse_handshake(" \0"), Err(HandshakeError::Empty));
    }

    #[test]
    fn test_mode_channel_properties() {
        assert!(DataMode::V2.has_reliable_channel());
        assert!(DataMode::V3.has_reliable_channel());
        assert!(!DataMode::V1.has_reliable_channel());
        assert!(!DataMode::StreamIn.receives_events());
        assert!(DataMode::Legacy.receives_events());
    }

    #[test]
    fn test_disconnect_command_detection() {
        assert!(is_disconnect_command("data_off\0"));
        assert!(!is_disconnect_command("data_on,1"));
    }
}

//! Control tokens carried in-band on streaming links
//!
//! Heartbeats and the admission refusal share the media link, so the three
//! tokens below are literal byte strings that can never be confused with an
//! MPEG-TS payload. They are part of the deployed wire protocol and must not
//! change between peers.

use bytes::Bytes;

/// Heartbeat probe. Either side may send it; the receiver replies with
/// [`PONG`] and must not forward it to the media pipe.
pub const PING: &[u8] = b"__AKITA_ADS_PING__";

/// Heartbeat reply to [`PING`].
pub const PONG: &[u8] = b"__AKITA_ADS_PONG__";

/// Sent once, best-effort, to a consumer refused for capacity before its
/// link is torn down.
pub const CAPACITY_EXCEEDED: &[u8] = b"MAX_CLIENTS_REACHED";

/// A recognized control message.
///
/// Any payload that is not one of these is media data and goes to the
/// subprocess pipe verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Ping,
    Pong,
    CapacityExceeded,
}

impl ControlMessage {
    /// Classify an inbound payload. Returns `None` for media data.
    pub fn classify(payload: &[u8]) -> Option<ControlMessage> {
        match payload {
            PING => Some(ControlMessage::Ping),
            PONG => Some(ControlMessage::Pong),
            CAPACITY_EXCEEDED => Some(ControlMessage::CapacityExceeded),
            _ => None,
        }
    }

    /// The wire bytes for this message.
    pub fn to_bytes(self) -> Bytes {
        match self {
            ControlMessage::Ping => Bytes::from_static(PING),
            ControlMessage::Pong => Bytes::from_static(PONG),
            ControlMessage::CapacityExceeded => Bytes::from_static(CAPACITY_EXCEEDED),
        }
    }
}

/// The PING token as a sendable payload.
pub fn ping() -> Bytes {
    Bytes::from_static(PING)
}

/// The PONG token as a sendable payload.
pub fn pong() -> Bytes {
    Bytes::from_static(PONG)
}

/// The capacity refusal token as a sendable payload.
pub fn capacity_exceeded() -> Bytes {
    Bytes::from_static(CAPACITY_EXCEEDED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_tokens() {
        assert_eq!(
            ControlMessage::classify(b"__AKITA_ADS_PING__"),
            Some(ControlMessage::Ping)
        );
        assert_eq!(
            ControlMessage::classify(b"__AKITA_ADS_PONG__"),
            Some(ControlMessage::Pong)
        );
        assert_eq!(
            ControlMessage::classify(b"MAX_CLIENTS_REACHED"),
            Some(ControlMessage::CapacityExceeded)
        );
    }

    #[test]
    fn test_media_is_not_control() {
        // MPEG-TS packets start with a 0x47 sync byte
        assert_eq!(ControlMessage::classify(&[0x47, 0x00, 0x11]), None);
        assert_eq!(ControlMessage::classify(b""), None);
        // A prefix of a token is still media
        assert_eq!(ControlMessage::classify(b"__AKITA_ADS_PIN"), None);
        // A token with trailing bytes is media
        assert_eq!(ControlMessage::classify(b"__AKITA_ADS_PING__x"), None);
    }

    #[test]
    fn test_round_trip() {
        for msg in [
            ControlMessage::Ping,
            ControlMessage::Pong,
            ControlMessage::CapacityExceeded,
        ] {
            assert_eq!(ControlMessage::classify(&msg.to_bytes()), Some(msg));
        }
    }
}

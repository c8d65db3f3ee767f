//! Control-frame codec.
//!
//! The connection layer never looks inside application payloads. It only
//! needs to build subscribe/unsubscribe requests and to tell liveness probes
//! and their acknowledgments apart from everything else.

use serde::{Deserialize, Serialize};
use tracing::error;

/// Classification of an inbound frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// A liveness probe from the peer.
    Probe,
    /// An acknowledgment of a liveness probe.
    ProbeAck,
    /// Anything else; handed to the application untouched.
    Data,
}

/// Encodes the control frames the connection layer emits.
pub trait MessageCodec: Send + Sync + 'static {
    /// Frame asking the peer to start delivering `channel`.
    fn encode_subscribe(&self, channel: &str) -> Vec<u8>;
    /// Frame asking the peer to stop delivering `channel`.
    fn encode_unsubscribe(&self, channel: &str) -> Vec<u8>;
    /// Liveness probe.
    fn encode_probe(&self) -> Vec<u8>;
    /// Acknowledgment of a liveness probe.
    fn encode_probe_ack(&self) -> Vec<u8>;
    /// Classify an inbound frame.
    fn classify(&self, frame: &[u8]) -> FrameKind;
}

/// JSON control frames tagged by `type`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// `{"type":"subscribe","channel":"..."}`
    Subscribe {
        /// Channel identifier.
        channel: String,
    },
    /// `{"type":"unsubscribe","channel":"..."}`
    Unsubscribe {
        /// Channel identifier.
        channel: String,
    },
    /// `{"type":"ping"}`
    Ping,
    /// `{"type":"pong"}`
    Pong,
}

impl ControlMessage {
    fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|e| {
            error!(error = %e, "failed to encode control message");
            Vec::new()
        })
    }
}

/// Default codec speaking [`ControlMessage`] JSON.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode_subscribe(&self, channel: &str) -> Vec<u8> {
        ControlMessage::Subscribe {
            channel: channel.to_owned(),
        }
        .to_bytes()
    }

    fn encode_unsubscribe(&self, channel: &str) -> Vec<u8> {
        ControlMessage::Unsubscribe {
            channel: channel.to_owned(),
        }
        .to_bytes()
    }

    fn encode_probe(&self) -> Vec<u8> {
        ControlMessage::Ping.to_bytes()
    }

    fn encode_probe_ack(&self) -> Vec<u8> {
        ControlMessage::Pong.to_bytes()
    }

    fn classify(&self, frame: &[u8]) -> FrameKind {
        match serde_json::from_slice::<ControlMessage>(frame) {
            Ok(ControlMessage::Ping) => FrameKind::Probe,
            Ok(ControlMessage::Pong) => FrameKind::ProbeAck,
            _ => FrameKind::Data,
        }
    }
}

/// Parse a frame produced by [`JsonCodec`], if it is a control message.
#[must_use]
pub fn decode_control(frame: &[u8]) -> Option<ControlMessage> {
    serde_json::from_slice(frame).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_wire_format() {
        let bytes = JsonCodec.encode_subscribe("rooms.a");
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "subscribe");
        assert_eq!(value["channel"], "rooms.a");
    }

    #[test]
    fn unsubscribe_decodes() {
        let bytes = JsonCodec.encode_unsubscribe("rooms.b");
        assert_eq!(
            decode_control(&bytes),
            Some(ControlMessage::Unsubscribe {
                channel: "rooms.b".into()
            })
        );
    }

    #[test]
    fn probe_frames_classify() {
        let codec = JsonCodec;
        assert_eq!(codec.classify(&codec.encode_probe()), FrameKind::Probe);
        assert_eq!(codec.classify(&codec.encode_probe_ack()), FrameKind::ProbeAck);
    }

    #[test]
    fn application_payloads_are_data() {
        let codec = JsonCodec;
        assert_eq!(codec.classify(br#"{"type":"chat","text":"hi"}"#), FrameKind::Data);
        assert_eq!(codec.classify(b"not json"), FrameKind::Data);
        assert_eq!(codec.classify(b""), FrameKind::Data);
        assert_eq!(codec.classify(&codec.encode_subscribe("x")), FrameKind::Data);
    }

    #[test]
    fn ping_has_no_extra_fields() {
        assert_eq!(JsonCodec.encode_probe(), br#"{"type":"ping"}"#.to_vec());
    }
}

//! Relay wire frames.
//!
//! Frames are JSON sent as binary WebSocket frames (UTF-8 bytes). The relay
//! treats `data` as opaque; carriers put a serialized envelope there.

use mesh_core::MeshId;
use serde::{Deserialize, Serialize};

/// Maximum frame size (1MB). Larger frames are dropped by both ends.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RelayFrame {
    /// Client wants deliveries for `topic`
    Subscribe { topic: MeshId },
    Unsubscribe { topic: MeshId },
    /// Client publishes `data` to every subscriber of `topic`
    Publish { topic: MeshId, data: String },
    /// Relay hands a published payload to a subscriber
    Deliver { topic: MeshId, data: String },
}

impl RelayFrame {
    /// Serialize to UTF-8 JSON bytes for sending as a binary WebSocket frame.
    pub fn to_binary(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Try to parse a frame from binary data.
    ///
    /// Returns None if the data is not UTF-8 JSON or not a known frame.
    pub fn from_binary(data: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(data).ok()?;
        serde_json::from_str(text).ok()
    }

    pub fn topic(&self) -> MeshId {
        match self {
            Self::Subscribe { topic }
            | Self::Unsubscribe { topic }
            | Self::Publish { topic, .. }
            | Self::Deliver { topic, .. } => *topic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic() -> MeshId {
        MeshId::for_name("lobby")
    }

    #[test]
    fn test_publish_wire_format() {
        let frame = RelayFrame::Publish {
            topic: topic(),
            data: "{}".to_string(),
        };
        let json: serde_json::Value =
            serde_json::from_slice(&frame.to_binary().unwrap()).unwrap();

        assert_eq!(json["type"], "publish");
        assert_eq!(json["topic"], topic().to_string());
        assert_eq!(json["data"], "{}");
    }

    #[test]
    fn test_parse_subscribe() {
        let raw = format!(r#"{{"type":"subscribe","topic":"{}"}}"#, topic());
        let frame = RelayFrame::from_binary(raw.as_bytes()).unwrap();
        assert_eq!(frame, RelayFrame::Subscribe { topic: topic() });
        assert_eq!(frame.topic(), topic());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let raw = format!(r#"{{"type":"handshake","topic":"{}"}}"#, topic());
        assert!(RelayFrame::from_binary(raw.as_bytes()).is_none());
    }

    #[test]
    fn test_non_utf8_rejected() {
        assert!(RelayFrame::from_binary(&[0xff, 0xfe, 0x00]).is_none());
    }

    #[test]
    fn test_zero_topic_rejected() {
        let raw = r#"{"type":"unsubscribe","topic":"0000000000000000"}"#;
        assert!(RelayFrame::from_binary(raw.as_bytes()).is_none());
    }
}

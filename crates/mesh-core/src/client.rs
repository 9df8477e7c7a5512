//! Application-facing notifications.
//!
//! The engine reports peer lifecycle, messages, clock estimates, and
//! rejections through the `Client` trait. `EventLog` is a ready-made client
//! that records everything as `MeshEvent`s, for tests and for relaying
//! events elsewhere (the daemon prints them as JSON lines).

use crate::clock_sync::SyncInfo;
use crate::membership::ChannelInfo;
use crate::mesh_id::MeshId;
use serde::Serialize;

/// Why our hello was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectReason {
    /// Our policy for the channel differs from the existing members'
    BadChannelInfo,
    /// Our address is already used by someone else
    AddressExists,
    ChannelFull,
}

/// Callbacks the application implements.
pub trait Client {
    fn on_peer_joined(&mut self, channel: &ChannelInfo, address: &str, hello_data: &str);
    fn on_peer_missing(&mut self, channel: &ChannelInfo, address: &str);
    fn on_peer_returned(&mut self, channel: &ChannelInfo, address: &str);
    fn on_peer_left(&mut self, channel: &ChannelInfo, address: &str);
    fn on_peer_sync(&mut self, channel: &ChannelInfo, address: &str, sync: &SyncInfo);
    /// `to` is a channel id, or our own id for direct messages.
    fn on_client_message(&mut self, from_address: &str, to: MeshId, ms_since_sent: i64, payload: &str);
    fn on_join_rejected(&mut self, channel: &ChannelInfo, reason: RejectReason);
}

/// Serializable record of one notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MeshEvent {
    #[serde(rename_all = "camelCase")]
    PeerJoined {
        channel: String,
        address: String,
        hello_data: String,
    },
    PeerMissing { channel: String, address: String },
    PeerReturned { channel: String, address: String },
    PeerLeft { channel: String, address: String },
    PeerSync {
        channel: String,
        address: String,
        sync: SyncInfo,
    },
    #[serde(rename_all = "camelCase")]
    ClientMessage {
        from_address: String,
        to: MeshId,
        ms_since_sent: i64,
        payload: String,
    },
    JoinRejected { channel: String, reason: RejectReason },
}

/// Client that records every notification in order.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<MeshEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[MeshEvent] {
        &self.events
    }

    /// Take everything recorded so far.
    pub fn drain(&mut self) -> Vec<MeshEvent> {
        std::mem::take(&mut self.events)
    }
}

impl Client for EventLog {
    fn on_peer_joined(&mut self, channel: &ChannelInfo, address: &str, hello_data: &str) {
        self.events.push(MeshEvent::PeerJoined {
            channel: channel.name.clone(),
            address: address.to_string(),
            hello_data: hello_data.to_string(),
        });
    }

    fn on_peer_missing(&mut self, channel: &ChannelInfo, address: &str) {
        self.events.push(MeshEvent::PeerMissing {
            channel: channel.name.clone(),
            address: address.to_string(),
        });
    }

    fn on_peer_returned(&mut self, channel: &ChannelInfo, address: &str) {
        self.events.push(MeshEvent::PeerReturned {
            channel: channel.name.clone(),
            address: address.to_string(),
        });
    }

    fn on_peer_left(&mut self, channel: &ChannelInfo, address: &str) {
        self.events.push(MeshEvent::PeerLeft {
            channel: channel.name.clone(),
            address: address.to_string(),
        });
    }

    fn on_peer_sync(&mut self, channel: &ChannelInfo, address: &str, sync: &SyncInfo) {
        self.events.push(MeshEvent::PeerSync {
            channel: channel.name.clone(),
            address: address.to_string(),
            sync: *sync,
        });
    }

    fn on_client_message(&mut self, from_address: &str, to: MeshId, ms_since_sent: i64, payload: &str) {
        self.events.push(MeshEvent::ClientMessage {
            from_address: from_address.to_string(),
            to,
            ms_since_sent,
            payload: payload.to_string(),
        });
    }

    fn on_join_rejected(&mut self, channel: &ChannelInfo, reason: RejectReason) {
        self.events.push(MeshEvent::JoinRejected {
            channel: channel.name.clone(),
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::ChannelPolicy;

    #[test]
    fn test_event_log_records_in_order_and_drains() {
        let lobby = ChannelInfo::new("lobby", ChannelPolicy::default());
        let mut log = EventLog::new();
        log.on_peer_joined(&lobby, "bob", "{}");
        log.on_peer_missing(&lobby, "bob");
        log.on_join_rejected(&lobby, RejectReason::ChannelFull);

        assert_eq!(log.events().len(), 3);
        assert!(matches!(log.events()[1], MeshEvent::PeerMissing { .. }));
        assert_eq!(log.drain().len(), 3);
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_event_json_shape() {
        let event = MeshEvent::PeerJoined {
            channel: "lobby".into(),
            address: "bob".into(),
            hello_data: "hi".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"peerJoined\""));
        assert!(json.contains("\"helloData\":\"hi\""));

        let rejected = MeshEvent::JoinRejected {
            channel: "lobby".into(),
            reason: RejectReason::BadChannelInfo,
        };
        let json = serde_json::to_string(&rejected).unwrap();
        assert!(json.contains("\"reason\":\"badChannelInfo\""));
    }
}

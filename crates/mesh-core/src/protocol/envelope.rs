//! Envelope: the wire-level unit exchanged through a carrier.
//!
//! Wire format (JSON, camelCase):
//! `{"destination":"…","senderId":"…","sequenceNumber":1,"type":"ping",
//!   "sentTimestamp":1000,"receiptTimestamp":0,"payload":""}`
//!
//! `receiptTimestamp` is only ever filled in by the receiving side.

use crate::mesh_id::MeshId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EnvelopeError>;

/// Closed set of message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Announce presence on a channel and ask for a reply
    Hello,
    /// Answer to a hello; no further reply expected
    HelloReply,
    HelloRejectedBadInfo,
    HelloRejectedAddressExists,
    HelloRejectedChannelFull,
    Goodbye,
    Ping,
    ClockSync,
    Application,
}

impl MessageKind {
    /// True for the three rejection variants.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            MessageKind::HelloRejectedBadInfo
                | MessageKind::HelloRejectedAddressExists
                | MessageKind::HelloRejectedChannelFull
        )
    }
}

/// A single message on the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Channel id or, for direct messages, the recipient's peer id
    pub destination: MeshId,
    pub sender_id: MeshId,
    /// Starts at 1 and increases by one per (sender, destination)
    pub sequence_number: u64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub sent_timestamp: u64,
    #[serde(default)]
    pub receipt_timestamp: u64,
    #[serde(default)]
    pub payload: String,
}

impl Envelope {
    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse from JSON bytes.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// True when addressed to a single peer rather than a channel.
    pub fn is_direct_to(&self, peer: MeshId) -> bool {
        self.destination == peer
    }
}

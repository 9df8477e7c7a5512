//! Payload bodies carried inside an envelope's opaque `payload` string.

use super::envelope::Result;
use crate::membership::ChannelInfo;
use serde::{Deserialize, Serialize};

/// Body of hello, hello-reply, and all three rejections.
///
/// Carries the channel policy the sender believes applies, so a recipient
/// can always report exactly which channel triggered a rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    pub address: String,
    pub channel: ChannelInfo,
    #[serde(default)]
    pub hello_data: String,
}

impl HelloPayload {
    pub fn new(address: &str, channel: &ChannelInfo, hello_data: &str) -> Self {
        Self {
            address: address.to_string(),
            channel: channel.clone(),
            hello_data: hello_data.to_string(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Four timestamps filled in across a three-leg clock-sync exchange.
///
/// Zero marks a slot as unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub t0: u64,
    pub t1: u64,
    pub t2: u64,
    pub t3: u64,
}

impl SyncPayload {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// An empty payload string is the originator's first leg.
    pub fn decode(payload: &str) -> Result<Self> {
        if payload.is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(payload)?)
    }

    pub fn is_complete(&self) -> bool {
        self.t0 != 0 && self.t1 != 0 && self.t2 != 0 && self.t3 != 0
    }
}

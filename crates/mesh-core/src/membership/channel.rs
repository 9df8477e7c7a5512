//! Channels and their membership policy.

use crate::mesh_id::ChannelId;
use serde::{Deserialize, Serialize};

/// Timing and capacity rules every participant of a channel must share.
///
/// All durations are milliseconds; zero disables the feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPolicy {
    /// Silence after which a peer is dropped (0 = never)
    pub drop_ms: u64,
    /// Ping and hello-retry interval (0 = non-tracking channel)
    pub ping_ms: u64,
    /// Silence after which a peer is reported missing (0 = never)
    pub missing_ms: u64,
    /// Clock-sync interval (0 = no sync)
    pub sync_ms: u64,
    /// Group size cap including ourselves (0 = unlimited)
    pub max_peers: u32,
}

impl Default for ChannelPolicy {
    fn default() -> Self {
        Self {
            drop_ms: 15_000,
            ping_ms: 3_000,
            missing_ms: 5_000,
            sync_ms: 10_000,
            max_peers: 0,
        }
    }
}

impl ChannelPolicy {
    /// Raw relay only: no hello, ping, timeout, or sync.
    pub fn non_tracking() -> Self {
        Self {
            drop_ms: 0,
            ping_ms: 0,
            missing_ms: 0,
            sync_ms: 0,
            max_peers: 0,
        }
    }

    pub fn is_tracking_membership(&self) -> bool {
        self.ping_ms > 0
    }

    pub fn reports_missing(&self) -> bool {
        self.missing_ms > 0
    }

    pub fn is_syncing_clocks(&self) -> bool {
        self.sync_ms > 0 && self.ping_ms > 0
    }
}

/// Channel identity plus policy, as announced in hellos.
///
/// Wire format: `{"name":"lobby","id":"…","dropMs":15000,"pingMs":3000,…}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub name: String,
    pub id: ChannelId,
    #[serde(flatten)]
    pub policy: ChannelPolicy,
}

impl ChannelInfo {
    /// Channel whose id is derived from its name.
    pub fn new(name: &str, policy: ChannelPolicy) -> Self {
        Self {
            name: name.to_string(),
            id: ChannelId::for_name(name),
            policy,
        }
    }

    pub fn with_id(name: &str, id: ChannelId, policy: ChannelPolicy) -> Self {
        Self {
            name: name.to_string(),
            id,
            policy,
        }
    }
}

/// A channel the local participant belongs to.
#[derive(Debug, Clone)]
pub struct Channel {
    pub info: ChannelInfo,
    /// What we announce about ourselves in hellos on this channel
    pub local_hello_data: String,
}

impl Channel {
    pub fn new(info: ChannelInfo, local_hello_data: String) -> Self {
        Self {
            info,
            local_hello_data,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.info.id
    }

    pub fn policy(&self) -> &ChannelPolicy {
        &self.info.policy
    }
}

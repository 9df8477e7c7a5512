//! Remote participants.

use crate::clock_sync::ClockSync;
use crate::mesh_id::PeerId;

/// A remote participant, shared by every channel it is on.
///
/// Liveness timestamps and the clock estimate live here rather than per
/// channel: silence and drift belong to the remote process.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    /// Application-level identity, learned from the first hello
    pub address: Option<String>,
    pub last_heard_at: Option<u64>,
    pub last_sent_at: Option<u64>,
    pub clock: ClockSync,
}

impl Peer {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            address: None,
            last_heard_at: None,
            last_sent_at: None,
            clock: ClockSync::new(),
        }
    }

    /// Address for notifications, falling back to the hex id.
    pub fn display_address(&self) -> String {
        self.address.clone().unwrap_or_else(|| self.id.to_string())
    }

    /// True if nothing has been sent to this peer for `interval_ms`.
    pub fn needs_ping(&self, now_ms: u64, interval_ms: u64) -> bool {
        match self.last_sent_at {
            Some(sent) => now_ms.saturating_sub(sent) >= interval_ms,
            None => true,
        }
    }
}

//! One peer's handshake and liveness state on one channel.
//!
//! The handshake state is never stored; it is derived from the fields here
//! plus the owning peer's last-heard time and the channel policy:
//!
//! `Unknown -> HelloSent -> (Confirmed | HelloTimedOut)`,
//! `Confirmed -> (Missing ->)? Dropped`

use super::channel::ChannelPolicy;
use crate::mesh_id::{ChannelId, PeerId};

/// Unique key of a channel/peer pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelPeerKey {
    pub channel: ChannelId,
    pub peer: PeerId,
}

impl ChannelPeerKey {
    pub fn new(channel: ChannelId, peer: PeerId) -> Self {
        Self { channel, peer }
    }
}

/// Derived handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPeerState {
    Unknown,
    HelloSent,
    HelloTimedOut,
    Confirmed,
    Missing,
    Dropped,
}

/// Outcome of checking an inbound sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqCheck {
    Accepted,
    /// Not greater than the last accepted number: reordered or duplicated
    Stale { last_validated: u64 },
}

#[derive(Debug, Clone)]
pub struct ChannelPeer {
    pub key: ChannelPeerKey,
    /// Hello data the peer announced here; `None` until the handshake completes
    pub hello_data: Option<String>,
    pub first_hello_sent_at: Option<u64>,
    pub last_hello_sent_at: Option<u64>,
    pub last_validated_seq: u64,
    pub missing_notified: bool,
}

impl ChannelPeer {
    pub fn new(key: ChannelPeerKey) -> Self {
        Self {
            key,
            hello_data: None,
            first_hello_sent_at: None,
            last_hello_sent_at: None,
            last_validated_seq: 0,
            missing_notified: false,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.hello_data.is_some()
    }

    pub fn record_hello_sent(&mut self, now_ms: u64) {
        self.first_hello_sent_at.get_or_insert(now_ms);
        self.last_hello_sent_at = Some(now_ms);
    }

    /// Accept strictly increasing sequence numbers, gaps included.
    pub fn validate_seq(&mut self, seq: u64) -> SeqCheck {
        if seq <= self.last_validated_seq {
            return SeqCheck::Stale {
                last_validated: self.last_validated_seq,
            };
        }
        self.last_validated_seq = seq;
        SeqCheck::Accepted
    }

    /// True if we owe this peer a hello.
    ///
    /// Retries wait `ping_ms` since we last heard from the peer or last
    /// sent it a hello, whichever is later.
    pub fn should_send_hello(
        &self,
        policy: &ChannelPolicy,
        last_heard_at: Option<u64>,
        now_ms: u64,
    ) -> bool {
        if !policy.is_tracking_membership() || self.is_confirmed() {
            return false;
        }
        if self.first_hello_sent_at.is_none() {
            return true;
        }
        let reference = last_heard_at.max(self.last_hello_sent_at).unwrap_or(0);
        now_ms.saturating_sub(reference) >= policy.ping_ms
    }

    /// True if a hello went out and no answer came within `drop_ms`.
    ///
    /// Never true when `drop_ms` is zero: such channels keep retrying.
    pub fn hello_timed_out(&self, policy: &ChannelPolicy, now_ms: u64) -> bool {
        if self.is_confirmed() || policy.drop_ms == 0 {
            return false;
        }
        match self.first_hello_sent_at {
            Some(first) => now_ms.saturating_sub(first) >= policy.drop_ms,
            None => false,
        }
    }

    pub fn is_missing(&self, policy: &ChannelPolicy, last_heard_at: Option<u64>, now_ms: u64) -> bool {
        if !policy.is_tracking_membership() || !policy.reports_missing() {
            return false;
        }
        match last_heard_at {
            Some(heard) => now_ms.saturating_sub(heard) >= policy.missing_ms,
            None => false,
        }
    }

    /// Hard drop, whether or not "missing" was reported first.
    pub fn has_timed_out(&self, policy: &ChannelPolicy, last_heard_at: Option<u64>, now_ms: u64) -> bool {
        if policy.drop_ms == 0 {
            return false;
        }
        match last_heard_at {
            Some(heard) => now_ms.saturating_sub(heard) >= policy.drop_ms,
            None => false,
        }
    }

    /// Where this pairing stands at `now_ms`; the scheduler acts on it.
    ///
    /// An unconfirmed pairing also times out once the peer itself has been
    /// silent for `drop_ms`.
    pub fn state(&self, policy: &ChannelPolicy, last_heard_at: Option<u64>, now_ms: u64) -> ChannelPeerState {
        if !self.is_confirmed() {
            if self.hello_timed_out(policy, now_ms) || self.has_timed_out(policy, last_heard_at, now_ms) {
                ChannelPeerState::HelloTimedOut
            } else if self.first_hello_sent_at.is_some() {
                ChannelPeerState::HelloSent
            } else {
                ChannelPeerState::Unknown
            }
        } else if self.has_timed_out(policy, last_heard_at, now_ms) {
            ChannelPeerState::Dropped
        } else if self.is_missing(policy, last_heard_at, now_ms) {
            ChannelPeerState::Missing
        } else {
            ChannelPeerState::Confirmed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ChannelPolicy {
        ChannelPolicy {
            drop_ms: 15_000,
            ping_ms: 3_000,
            missing_ms: 5_000,
            sync_ms: 0,
            max_peers: 0,
        }
    }

    fn pairing() -> ChannelPeer {
        ChannelPeer::new(ChannelPeerKey::new(ChannelId::from(10), PeerId::from(20)))
    }

    // ==================== Sequence validation ====================

    #[test]
    fn test_seq_accepts_increasing_and_skips() {
        let mut cp = pairing();
        assert_eq!(cp.validate_seq(1), SeqCheck::Accepted);
        assert_eq!(cp.validate_seq(2), SeqCheck::Accepted);
        assert_eq!(cp.validate_seq(7), SeqCheck::Accepted);
        assert_eq!(cp.last_validated_seq, 7);
    }

    #[test]
    fn test_seq_rejects_duplicate_and_older() {
        let mut cp = pairing();
        cp.validate_seq(5);
        assert_eq!(cp.validate_seq(5), SeqCheck::Stale { last_validated: 5 });
        assert_eq!(cp.validate_seq(3), SeqCheck::Stale { last_validated: 5 });
        // A stale number never lowers the watermark
        assert_eq!(cp.last_validated_seq, 5);
        assert_eq!(cp.validate_seq(6), SeqCheck::Accepted);
    }

    // ==================== Hello ====================

    #[test]
    fn test_should_send_hello_only_when_tracking_and_unconfirmed() {
        let mut cp = pairing();
        assert!(cp.should_send_hello(&policy(), None, 0));
        assert!(!cp.should_send_hello(&ChannelPolicy::non_tracking(), None, 0));
        cp.hello_data = Some(String::new());
        assert!(!cp.should_send_hello(&policy(), None, 0));
    }

    #[test]
    fn test_hello_retry_waits_ping_interval() {
        let mut cp = pairing();
        cp.record_hello_sent(1_000);
        assert!(!cp.should_send_hello(&policy(), None, 3_999));
        assert!(cp.should_send_hello(&policy(), None, 4_000));
        // Hearing from the peer pushes the retry out
        assert!(!cp.should_send_hello(&policy(), Some(3_500), 4_000));
        cp.record_hello_sent(4_000);
        assert_eq!(cp.first_hello_sent_at, Some(1_000));
    }

    #[test]
    fn test_hello_timed_out() {
        let mut cp = pairing();
        assert!(!cp.hello_timed_out(&policy(), 100_000));
        cp.record_hello_sent(1_000);
        assert!(!cp.hello_timed_out(&policy(), 15_999));
        assert!(cp.hello_timed_out(&policy(), 16_000));
        assert_eq!(cp.state(&policy(), None, 16_000), ChannelPeerState::HelloTimedOut);
        cp.hello_data = Some(String::new());
        assert!(!cp.hello_timed_out(&policy(), 16_000));
    }

    // ==================== Liveness ====================

    #[test]
    fn test_missing_then_dropped() {
        let mut cp = pairing();
        cp.hello_data = Some("hi".into());
        let heard = Some(1_000);
        assert_eq!(cp.state(&policy(), heard, 5_999), ChannelPeerState::Confirmed);
        assert!(cp.is_missing(&policy(), heard, 6_000));
        assert_eq!(cp.state(&policy(), heard, 6_000), ChannelPeerState::Missing);
        assert!(!cp.has_timed_out(&policy(), heard, 15_999));
        assert!(cp.has_timed_out(&policy(), heard, 16_000));
        assert_eq!(cp.state(&policy(), heard, 16_000), ChannelPeerState::Dropped);
    }

    #[test]
    fn test_never_heard_is_never_missing_or_dropped() {
        let cp = pairing();
        assert!(!cp.is_missing(&policy(), None, 1_000_000));
        assert!(!cp.has_timed_out(&policy(), None, 1_000_000));
    }

    #[test]
    fn test_zero_drop_keeps_pending_handshake() {
        let never_expire = ChannelPolicy {
            drop_ms: 0,
            ..policy()
        };
        let mut cp = pairing();
        cp.record_hello_sent(1_000);

        assert!(!cp.hello_timed_out(&never_expire, 1_001));
        assert!(!cp.hello_timed_out(&never_expire, 10_000_000));
        assert_eq!(
            cp.state(&never_expire, Some(1_000), 10_000_000),
            ChannelPeerState::HelloSent
        );
        // Still retried on the ping interval
        assert!(cp.should_send_hello(&never_expire, Some(1_000), 4_000));
    }

    #[test]
    fn test_silent_unconfirmed_peer_times_out() {
        let mut cp = pairing();
        cp.record_hello_sent(10_000);
        // Hello is recent, but the peer went quiet long before it
        assert!(!cp.hello_timed_out(&policy(), 16_000));
        assert_eq!(cp.state(&policy(), Some(1_000), 16_000), ChannelPeerState::HelloTimedOut);
        assert_eq!(cp.state(&policy(), Some(1_000), 15_999), ChannelPeerState::HelloSent);
    }

    #[test]
    fn test_zero_timers_disable_reports() {
        let cp = pairing();
        let lenient = ChannelPolicy {
            drop_ms: 0,
            missing_ms: 0,
            ..policy()
        };
        assert!(!cp.is_missing(&lenient, Some(0), 1_000_000));
        assert!(!cp.has_timed_out(&lenient, Some(0), 1_000_000));
    }
}

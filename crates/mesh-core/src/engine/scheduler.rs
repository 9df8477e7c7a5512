//! Per-tick scheduling: timeouts, hello retries, pings, clock sync.

use super::MeshEngine;
use crate::carrier::Carrier;
use crate::client::Client;
use crate::membership::{ChannelPeerKey, ChannelPeerState};
use crate::mesh_id::{ChannelId, PeerId};
use crate::protocol::MessageKind;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

/// Peers covered by one ping: a broadcast on `channel` when more than one
/// peer is listed, otherwise a direct send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingGroup {
    pub channel: ChannelId,
    pub peers: Vec<PeerId>,
}

/// Group peers that need a ping so that as few pings as possible go out.
///
/// Channels are ranked by how many pending peers they hold (ties by id) and
/// each peer is assigned to the first ranked channel it belongs to.
pub fn batch_pings(pending: &BTreeMap<PeerId, Vec<ChannelId>>) -> Vec<PingGroup> {
    let mut by_channel: BTreeMap<ChannelId, Vec<PeerId>> = BTreeMap::new();
    for (peer, channels) in pending {
        for channel in channels {
            by_channel.entry(*channel).or_default().push(*peer);
        }
    }

    let mut ranked: Vec<(ChannelId, Vec<PeerId>)> = by_channel.into_iter().collect();
    ranked.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.cmp(&b.0)));

    let mut assigned = HashSet::new();
    ranked
        .into_iter()
        .filter_map(|(channel, peers)| {
            let peers: Vec<PeerId> = peers.into_iter().filter(|p| assigned.insert(*p)).collect();
            (!peers.is_empty()).then_some(PingGroup { channel, peers })
        })
        .collect()
}

enum Expiry {
    /// Never confirmed; the app never heard of it
    Silent,
    Missing,
    Dropped,
}

impl<C: Carrier, A: Client> MeshEngine<C, A> {
    pub(super) fn run_schedule(&mut self, now_ms: u64) {
        self.expire_pairings(now_ms);
        self.retry_hellos(now_ms);
        self.send_pings(now_ms);
        self.start_clock_syncs(now_ms);
    }

    fn expire_pairings(&mut self, now_ms: u64) {
        let mut actions = Vec::new();
        for cp in self.registry.channel_peers() {
            let Some(channel) = self.registry.channel(cp.key.channel) else {
                continue;
            };
            let policy = channel.policy();
            if !policy.is_tracking_membership() {
                continue;
            }
            let last_heard = self.registry.peer(cp.key.peer).and_then(|p| p.last_heard_at);
            let action = match cp.state(policy, last_heard, now_ms) {
                ChannelPeerState::HelloTimedOut => Some(Expiry::Silent),
                ChannelPeerState::Dropped => Some(Expiry::Dropped),
                ChannelPeerState::Missing if !cp.missing_notified => Some(Expiry::Missing),
                _ => None,
            };
            if let Some(action) = action {
                actions.push((cp.key, action));
            }
        }

        for (key, action) in actions {
            let address = self
                .registry
                .peer(key.peer)
                .map(|p| p.display_address())
                .unwrap_or_else(|| key.peer.to_string());
            match action {
                Expiry::Silent => {
                    debug!("Handshake with {} on {} timed out", key.peer, key.channel);
                    self.registry.remove_channel_peer(key);
                }
                Expiry::Missing => {
                    if let Some(cp) = self.registry.channel_peer_mut(key) {
                        cp.missing_notified = true;
                    }
                    if let Some(info) = self.registry.channel(key.channel).map(|c| c.info.clone()) {
                        info!("Peer {} is missing from {}", address, info.name);
                        self.client.on_peer_missing(&info, &address);
                    }
                }
                Expiry::Dropped => {
                    self.notify_left(key.channel, &address, true);
                    self.registry.remove_channel_peer(key);
                }
            }
        }
    }

    fn retry_hellos(&mut self, now_ms: u64) {
        let due: Vec<ChannelPeerKey> = self
            .registry
            .channel_peers()
            .filter(|cp| {
                let Some(channel) = self.registry.channel(cp.key.channel) else {
                    return false;
                };
                let last_heard = self.registry.peer(cp.key.peer).and_then(|p| p.last_heard_at);
                cp.should_send_hello(channel.policy(), last_heard, now_ms)
            })
            .map(|cp| cp.key)
            .collect();
        for key in due {
            debug!("Sending hello to {} on {}", key.peer, key.channel);
            self.send_hello_to(key, MessageKind::Hello);
        }
    }

    fn send_pings(&mut self, now_ms: u64) {
        let mut pending: BTreeMap<PeerId, Vec<ChannelId>> = BTreeMap::new();
        for cp in self.registry.channel_peers().filter(|cp| cp.is_confirmed()) {
            let Some(channel) = self.registry.channel(cp.key.channel) else {
                continue;
            };
            let policy = channel.policy();
            if !policy.is_tracking_membership() {
                continue;
            }
            let needs_ping = self
                .registry
                .peer(cp.key.peer)
                .is_some_and(|peer| peer.needs_ping(now_ms, policy.ping_ms));
            if needs_ping {
                pending.entry(cp.key.peer).or_default().push(cp.key.channel);
            }
        }
        if pending.is_empty() {
            return;
        }

        for group in batch_pings(&pending) {
            match group.peers.as_slice() {
                [peer] => {
                    debug!("Pinging {} directly", peer);
                    self.send_envelope(*peer, MessageKind::Ping, String::new());
                }
                peers => {
                    debug!("Pinging {} peers on {}", peers.len(), group.channel);
                    self.send_envelope(group.channel, MessageKind::Ping, String::new());
                }
            }
        }
    }

    fn start_clock_syncs(&mut self, now_ms: u64) {
        let due: Vec<PeerId> = self
            .registry
            .peers()
            .filter(|peer| {
                self.sync_interval_for(peer.id)
                    .is_some_and(|interval| peer.clock.needs_sync(now_ms, interval))
            })
            .map(|peer| peer.id)
            .collect();
        for peer in due {
            debug!("Starting clock sync with {}", peer);
            self.send_envelope(peer, MessageKind::ClockSync, String::new());
            if let Some(peer) = self.registry.peer_mut(peer) {
                peer.clock.begin_round(now_ms);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> PeerId {
        PeerId::from(n)
    }

    #[test]
    fn test_batch_prefers_largest_channel() {
        let x = ChannelId::from(100);
        let y = ChannelId::from(200);
        let mut pending = BTreeMap::new();
        pending.insert(id(1), vec![x]);
        pending.insert(id(2), vec![x, y]);
        pending.insert(id(3), vec![y]);
        pending.insert(id(4), vec![x]);

        let groups = batch_pings(&pending);
        assert_eq!(
            groups,
            vec![
                PingGroup {
                    channel: x,
                    peers: vec![id(1), id(2), id(4)]
                },
                PingGroup {
                    channel: y,
                    peers: vec![id(3)]
                },
            ]
        );
    }

    #[test]
    fn test_batch_separate_channels() {
        let x = ChannelId::from(100);
        let z = ChannelId::from(300);
        let mut pending = BTreeMap::new();
        pending.insert(id(1), vec![x]);
        pending.insert(id(2), vec![x]);
        pending.insert(id(3), vec![z]);

        let groups = batch_pings(&pending);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].channel, x);
        assert_eq!(groups[0].peers, vec![id(1), id(2)]);
        assert_eq!(groups[1].peers, vec![id(3)]);
    }

    #[test]
    fn test_batch_drops_emptied_groups() {
        let x = ChannelId::from(100);
        let y = ChannelId::from(200);
        let mut pending = BTreeMap::new();
        pending.insert(id(1), vec![x, y]);
        pending.insert(id(2), vec![x, y]);

        let groups = batch_pings(&pending);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].channel, x);
    }

    #[test]
    fn test_batch_empty() {
        assert!(batch_pings(&BTreeMap::new()).is_empty());
    }
}

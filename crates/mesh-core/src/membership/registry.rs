//! Registry: indexed channels, peers, and the pairings between them.
//!
//! Peers are stored once, keyed by id, with a secondary index from address
//! to id. Pairings refer to channels and peers by key only. Every add and
//! remove keeps the indices consistent: no pairing ever outlives its
//! channel or its peer, and a peer with no pairings left is removed.

use super::channel::{Channel, ChannelInfo};
use super::channel_peer::{ChannelPeer, ChannelPeerKey};
use super::peer::Peer;
use crate::mesh_id::{ChannelId, PeerId};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Channel already exists: {0}")]
    ChannelExists(ChannelId),

    #[error("Unknown channel: {0}")]
    UnknownChannel(ChannelId),

    #[error("The main channel cannot be removed")]
    MainChannel,

    #[error("Address {address} already belongs to peer {owner}")]
    AddressTaken { address: String, owner: PeerId },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Default)]
pub struct Registry {
    main_channel: Option<ChannelId>,
    channels: HashMap<ChannelId, Channel>,
    peers: HashMap<PeerId, Peer>,
    peers_by_address: HashMap<String, PeerId>,
    /// Ordered by (channel, peer) so per-channel lookups are range scans
    channel_peers: BTreeMap<ChannelPeerKey, ChannelPeer>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all state, including the main channel.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    // ==================== Channels ====================

    /// Add a channel we participate in, with the hello data we announce on it.
    pub fn add_channel(&mut self, info: ChannelInfo, local_hello_data: String) -> Result<&Channel> {
        let id = info.id;
        if self.channels.contains_key(&id) {
            warn!("Channel {} ({}) already exists", info.name, id);
            return Err(RegistryError::ChannelExists(id));
        }
        debug!("Added channel {} ({})", info.name, id);
        Ok(&*self
            .channels
            .entry(id)
            .or_insert_with(|| Channel::new(info, local_hello_data)))
    }

    /// Add the channel that was joined, and remember it as the main one.
    pub fn add_main_channel(&mut self, info: ChannelInfo, local_hello_data: String) -> Result<&Channel> {
        let id = info.id;
        if self.channels.contains_key(&id) {
            return Err(RegistryError::ChannelExists(id));
        }
        self.main_channel = Some(id);
        self.add_channel(info, local_hello_data)
    }

    /// Remove a channel and every pairing on it.
    ///
    /// Returns the removed pairings so the caller can notify about confirmed ones.
    pub fn remove_channel(&mut self, id: ChannelId) -> Result<Vec<ChannelPeer>> {
        if self.main_channel == Some(id) {
            error!("Refusing to remove main channel {}", id);
            return Err(RegistryError::MainChannel);
        }
        if self.channels.remove(&id).is_none() {
            return Err(RegistryError::UnknownChannel(id));
        }
        let keys: Vec<_> = self.keys_for_channel(id).collect();
        let removed = keys
            .into_iter()
            .filter_map(|key| self.remove_channel_peer(key))
            .collect();
        debug!("Removed channel {}", id);
        Ok(removed)
    }

    pub fn main_channel_id(&self) -> Option<ChannelId> {
        self.main_channel
    }

    pub fn main_channel(&self) -> Option<&Channel> {
        self.main_channel.and_then(|id| self.channels.get(&id))
    }

    pub fn is_main_channel(&self, id: ChannelId) -> bool {
        self.main_channel == Some(id)
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    // ==================== Peers ====================

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn peer_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    pub fn peer_by_address(&self, address: &str) -> Option<&Peer> {
        self.peers_by_address
            .get(address)
            .and_then(|id| self.peers.get(id))
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Look up a peer by the address it is listed under.
    ///
    /// Peers that never announced an address are listed by their hex id;
    /// that form resolves here too.
    pub fn peer_by_display_address(&self, address: &str) -> Option<&Peer> {
        self.peer_by_address(address).or_else(|| {
            let id: PeerId = address.parse().ok()?;
            self.peers.get(&id).filter(|peer| peer.address.is_none())
        })
    }

    /// Assign or change a peer's address, keeping the address index in step.
    pub fn set_peer_address(&mut self, id: PeerId, address: &str) -> Result<()> {
        if let Some(&owner) = self.peers_by_address.get(address) {
            if owner != id {
                return Err(RegistryError::AddressTaken {
                    address: address.to_string(),
                    owner,
                });
            }
        }
        let Some(peer) = self.peers.get_mut(&id) else {
            return Ok(());
        };
        if let Some(old) = peer.address.replace(address.to_string()) {
            self.peers_by_address.remove(&old);
        }
        self.peers_by_address.insert(address.to_string(), id);
        Ok(())
    }

    /// Remove a peer and all of its pairings.
    pub fn remove_peer(&mut self, id: PeerId) -> Option<(Peer, Vec<ChannelPeer>)> {
        let keys: Vec<_> = self
            .channel_peers
            .keys()
            .filter(|key| key.peer == id)
            .copied()
            .collect();
        let pairings = keys
            .iter()
            .filter_map(|key| self.channel_peers.remove(key))
            .collect();
        let peer = self.peers.remove(&id)?;
        if let Some(address) = &peer.address {
            self.peers_by_address.remove(address);
        }
        debug!("Removed peer {}", id);
        Some((peer, pairings))
    }

    // ==================== Pairings ====================

    /// Pair a peer with a channel, creating the peer if needed.
    ///
    /// Idempotent: an existing pairing is returned untouched. Returns `None`
    /// if the channel is unknown.
    pub fn add_channel_peer(&mut self, channel: ChannelId, peer: PeerId) -> Option<&mut ChannelPeer> {
        if !self.channels.contains_key(&channel) {
            warn!("Cannot pair peer {} with unknown channel {}", peer, channel);
            return None;
        }
        self.peers.entry(peer).or_insert_with(|| Peer::new(peer));
        let key = ChannelPeerKey::new(channel, peer);
        Some(
            self.channel_peers
                .entry(key)
                .or_insert_with(|| ChannelPeer::new(key)),
        )
    }

    pub fn channel_peer(&self, key: ChannelPeerKey) -> Option<&ChannelPeer> {
        self.channel_peers.get(&key)
    }

    pub fn channel_peer_mut(&mut self, key: ChannelPeerKey) -> Option<&mut ChannelPeer> {
        self.channel_peers.get_mut(&key)
    }

    /// Remove a pairing; the peer goes too if this was its last one.
    pub fn remove_channel_peer(&mut self, key: ChannelPeerKey) -> Option<ChannelPeer> {
        let removed = self.channel_peers.remove(&key)?;
        if !self.channel_peers.keys().any(|k| k.peer == key.peer) {
            if let Some(peer) = self.peers.remove(&key.peer) {
                if let Some(address) = &peer.address {
                    self.peers_by_address.remove(address);
                }
                debug!("Peer {} has no channels left, removed", key.peer);
            }
        }
        Some(removed)
    }

    pub fn channel_peers(&self) -> impl Iterator<Item = &ChannelPeer> {
        self.channel_peers.values()
    }

    pub fn channel_peer_keys(&self) -> Vec<ChannelPeerKey> {
        self.channel_peers.keys().copied().collect()
    }

    pub fn channel_peers_for_peer(&self, peer: PeerId) -> Vec<&ChannelPeer> {
        self.channel_peers
            .values()
            .filter(|cp| cp.key.peer == peer)
            .collect()
    }

    pub fn channels_for_peer(&self, peer: PeerId) -> Vec<ChannelId> {
        self.channel_peers
            .keys()
            .filter(|key| key.peer == peer)
            .map(|key| key.channel)
            .collect()
    }

    pub fn peers_for_channel(&self, channel: ChannelId) -> Vec<PeerId> {
        self.keys_for_channel(channel).map(|key| key.peer).collect()
    }

    fn keys_for_channel(&self, channel: ChannelId) -> impl Iterator<Item = ChannelPeerKey> + '_ {
        let start = ChannelPeerKey::new(channel, PeerId::from(0));
        let end = ChannelPeerKey::new(channel, PeerId::from(u64::MAX));
        self.channel_peers.range(start..=end).map(|(key, _)| *key)
    }

    /// Check that no pairing dangles and both peer indices agree.
    pub fn is_consistent(&self) -> bool {
        let edges_ok = self.channel_peers.keys().all(|key| {
            self.channels.contains_key(&key.channel) && self.peers.contains_key(&key.peer)
        });
        let peers_paired = self
            .peers
            .keys()
            .all(|id| self.channel_peers.keys().any(|key| key.peer == *id));
        let addresses_ok = self
            .peers_by_address
            .iter()
            .all(|(address, id)| {
                self.peers
                    .get(id)
                    .is_some_and(|peer| peer.address.as_deref() == Some(address.as_str()))
            })
            && self
                .peers
                .values()
                .filter(|peer| peer.address.is_some())
                .count()
                == self.peers_by_address.len();
        let main_ok = self
            .main_channel
            .is_none_or(|id| self.channels.contains_key(&id));
        edges_ok && peers_paired && addresses_ok && main_ok
    }
}

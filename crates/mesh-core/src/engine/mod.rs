//! MeshEngine: the protocol orchestrator.
//!
//! Owns the registry, sequence counters, and clock estimators, and is driven
//! entirely by the caller: `update` drains the carrier's inbound queue,
//! then runs the timeout, hello-retry, ping, and clock-sync passes. Nothing
//! here blocks or spawns; all I/O goes through the `Carrier`.
//!
//! - `dispatch`: inbound envelope handling by message kind
//! - `handshake`: hellos, conflict checks, rejections
//! - `scheduler`: per-tick timeout scan, ping batching, sync rounds

mod dispatch;
mod handshake;
mod scheduler;

pub use scheduler::{PingGroup, batch_pings};

use crate::carrier::{Carrier, CarrierEvent};
use crate::client::Client;
use crate::clock::Clock;
use crate::clock_sync::SyncInfo;
use crate::config::EngineConfig;
use crate::error::{MeshError, Result};
use crate::membership::{ChannelInfo, ChannelPeerKey, Registry};
use crate::mesh_id::{ChannelId, MeshId, PeerId};
use crate::protocol::{Envelope, MessageKind};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Where an application message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Every peer on a channel we belong to
    Channel(ChannelId),
    /// A single peer, by application address (hex id if it never announced one)
    Address(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinState {
    Idle,
    /// Waiting for the carrier to report the network join
    Joining,
    Joined,
}

/// Protocol engine over carrier `C`, reporting to client `A`.
pub struct MeshEngine<C: Carrier, A: Client> {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    carrier: C,
    client: A,
    local_id: PeerId,
    address: String,
    state: JoinState,
    pending_join: Option<(ChannelInfo, String)>,
    registry: Registry,
    /// Last sequence number used per destination
    sequences: HashMap<MeshId, u64>,
    /// Carrier events polled but not yet dispatched
    inbound: VecDeque<CarrierEvent>,
}

impl<C: Carrier, A: Client> MeshEngine<C, A> {
    pub fn new(config: EngineConfig, clock: Arc<dyn Clock>, carrier: C, client: A) -> Self {
        let local_id = config.local_id.unwrap_or_else(PeerId::generate);
        let address = config
            .address
            .clone()
            .unwrap_or_else(|| local_id.to_string());
        Self {
            config,
            clock,
            carrier,
            client,
            local_id,
            address,
            state: JoinState::Idle,
            pending_join: None,
            registry: Registry::new(),
            sequences: HashMap::new(),
            inbound: VecDeque::new(),
        }
    }

    // ==================== Identity ====================

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn local_address(&self) -> &str {
        &self.address
    }

    pub fn is_joined(&self) -> bool {
        self.state == JoinState::Joined
    }

    pub fn main_channel(&self) -> Option<&ChannelInfo> {
        self.registry.main_channel().map(|channel| &channel.info)
    }

    /// Main channel plus every subchannel.
    pub fn channels(&self) -> Vec<&ChannelInfo> {
        let mut channels: Vec<_> = self.registry.channels().map(|c| &c.info).collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));
        channels
    }

    pub fn local_hello_data(&self, channel: ChannelId) -> Option<&str> {
        self.registry
            .channel(channel)
            .map(|c| c.local_hello_data.as_str())
    }

    // ==================== Membership ====================

    /// Join the mesh through `channel`, which becomes the main channel.
    ///
    /// Connection failures from the carrier are returned here; the join
    /// itself completes when the carrier reports it during `update`.
    pub fn join(&mut self, channel: ChannelInfo, hello_data: impl Into<String>) -> Result<()> {
        if self.state != JoinState::Idle {
            return Err(MeshError::AlreadyJoined);
        }
        let hello_data = hello_data.into();
        self.carrier.join(&channel, self.local_id, &hello_data)?;
        info!(
            "Joining {} as {} ({})",
            channel.name, self.address, self.local_id
        );
        self.pending_join = Some((channel, hello_data));
        self.state = JoinState::Joining;
        Ok(())
    }

    /// Carrier-facing: the network join completed.
    pub fn on_network_joined(&mut self) {
        let Some((channel, hello_data)) = self.pending_join.take() else {
            debug!("Network joined without a pending join, ignoring");
            return;
        };
        let channel_id = channel.id;
        let tracking = channel.policy.is_tracking_membership();
        if let Err(e) = self.registry.add_main_channel(channel, hello_data) {
            error!("Failed to register main channel: {}", e);
            return;
        }
        self.state = JoinState::Joined;
        info!("Joined mesh as {}", self.address);
        if tracking {
            self.broadcast_hello(channel_id);
        }
    }

    pub fn add_subchannel(&mut self, channel: ChannelInfo, hello_data: impl Into<String>) -> Result<()> {
        self.require_joined()?;
        let channel_id = channel.id;
        let tracking = channel.policy.is_tracking_membership();
        let name = channel.name.clone();
        self.registry.add_channel(channel, hello_data.into())?;
        if let Err(e) = self.carrier.listen(channel_id) {
            let _ = self.registry.remove_channel(channel_id);
            return Err(e.into());
        }
        info!("Added subchannel {}", name);
        if tracking {
            self.broadcast_hello(channel_id);
        }
        Ok(())
    }

    /// Leave a subchannel, telling its members goodbye.
    pub fn remove_subchannel(&mut self, channel: ChannelId) -> Result<()> {
        self.require_joined()?;
        if self.registry.is_main_channel(channel) {
            return Err(crate::membership::RegistryError::MainChannel.into());
        }
        if self.registry.channel(channel).is_none() {
            return Err(MeshError::UnknownChannel(channel));
        }
        self.send_envelope(channel, MessageKind::Goodbye, String::new());
        self.carrier.stop_listening(channel);
        self.registry.remove_channel(channel)?;
        info!("Removed subchannel {}", channel);
        Ok(())
    }

    /// Say goodbye, disconnect, and forget all mesh state.
    ///
    /// The goodbye is best effort: the carrier may tear the connection down
    /// before it is delivered.
    pub fn leave(&mut self) {
        if self.state == JoinState::Idle {
            return;
        }
        if let Some(main) = self.registry.main_channel_id() {
            self.send_envelope(main, MessageKind::Goodbye, String::new());
        }
        self.carrier.leave();
        self.registry.clear();
        self.sequences.clear();
        self.inbound.clear();
        self.pending_join = None;
        self.state = JoinState::Idle;
        info!("Left mesh");
    }

    // ==================== Queries ====================

    /// Addresses of peers that completed the handshake on `channel`.
    pub fn peer_addresses(&self, channel: ChannelId) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .registry
            .peers_for_channel(channel)
            .into_iter()
            .filter(|peer| {
                self.registry
                    .channel_peer(ChannelPeerKey::new(channel, *peer))
                    .is_some_and(|cp| cp.is_confirmed() || !self.is_tracking(channel))
            })
            .filter_map(|peer| self.registry.peer(peer).map(|p| p.display_address()))
            .collect();
        addresses.sort();
        addresses
    }

    pub fn peer_ids_for_channel(&self, channel: ChannelId) -> Vec<PeerId> {
        self.registry.peers_for_channel(channel)
    }

    pub fn peer_hello_data(&self, channel: ChannelId, address: &str) -> Option<&str> {
        let peer = self.registry.peer_by_display_address(address)?;
        self.registry
            .channel_peer(ChannelPeerKey::new(channel, peer.id))?
            .hello_data
            .as_deref()
    }

    pub fn peer_sync_info(&self, address: &str) -> Option<SyncInfo> {
        self.registry.peer_by_display_address(address)?.clock.info()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn client(&self) -> &A {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut A {
        &mut self.client
    }

    pub fn carrier(&self) -> &C {
        &self.carrier
    }

    pub fn carrier_mut(&mut self) -> &mut C {
        &mut self.carrier
    }

    // ==================== Sending ====================

    /// Send an application payload to a channel or a single peer.
    pub fn send(&mut self, destination: Destination, payload: impl Into<String>) -> Result<()> {
        self.require_joined()?;
        let target = match destination {
            Destination::Channel(id) => {
                if self.registry.channel(id).is_none() {
                    return Err(MeshError::UnknownChannel(id));
                }
                id
            }
            Destination::Address(address) => match self.registry.peer_by_display_address(&address) {
                Some(peer) => peer.id,
                None => return Err(MeshError::UnknownAddress(address)),
            },
        };
        self.send_envelope(target, MessageKind::Application, payload.into());
        Ok(())
    }

    // ==================== Driving ====================

    /// Drive the protocol: dispatch queued inbound traffic, then run the
    /// timeout, hello, ping, and clock-sync passes.
    pub fn update(&mut self) {
        self.inbound.extend(self.carrier.poll());

        let limit = match self.config.max_inbound_per_update {
            0 => usize::MAX,
            n => n,
        };
        let mut handled = 0;
        while handled < limit {
            let Some(event) = self.inbound.pop_front() else {
                break;
            };
            handled += 1;
            match event {
                CarrierEvent::Joined => self.on_network_joined(),
                CarrierEvent::Message(envelope) => self.on_received_message(envelope),
                CarrierEvent::Disconnected { reason } => {
                    error!("Carrier disconnected: {}", reason);
                }
            }
        }

        if self.state == JoinState::Joined {
            let now = self.clock.now_ms();
            self.run_schedule(now);
        }
        debug_assert!(self.registry.is_consistent());
    }

    fn require_joined(&self) -> Result<()> {
        match self.state {
            JoinState::Joined => Ok(()),
            _ => Err(MeshError::NotJoined),
        }
    }

    fn is_tracking(&self, channel: ChannelId) -> bool {
        self.registry
            .channel(channel)
            .is_some_and(|c| c.policy().is_tracking_membership())
    }

    /// Stamp, sequence, and hand an envelope to the carrier.
    fn send_envelope(&mut self, destination: MeshId, kind: MessageKind, payload: String) {
        let now = self.clock.now_ms();
        let seq = self.sequences.entry(destination).or_insert(0);
        *seq += 1;
        let envelope = Envelope {
            destination,
            sender_id: self.local_id,
            sequence_number: *seq,
            kind,
            sent_timestamp: now,
            receipt_timestamp: 0,
            payload,
        };
        self.carrier.send(&envelope);
        self.touch_sent(destination, now);
    }

    /// Record that everyone reached by `destination` was just sent to.
    fn touch_sent(&mut self, destination: MeshId, now_ms: u64) {
        if self.registry.channel(destination).is_some() {
            for peer in self.registry.peers_for_channel(destination) {
                if let Some(peer) = self.registry.peer_mut(peer) {
                    peer.last_sent_at = Some(now_ms);
                }
            }
        } else if let Some(peer) = self.registry.peer_mut(destination) {
            peer.last_sent_at = Some(now_ms);
        } else {
            debug!("Sent to {} which is neither a channel nor a known peer", destination);
        }
    }

    /// Notify `left` for a removed pairing if the app ever saw it join.
    fn notify_left(&mut self, channel: ChannelId, address: &str, was_confirmed: bool) {
        if !was_confirmed {
            return;
        }
        if let Some(info) = self.registry.channel(channel).map(|c| c.info.clone()) {
            info!("Peer {} left {}", address, info.name);
            self.client.on_peer_left(&info, address);
        }
    }
}

//! Hello handshake and conflict resolution.
//!
//! A hello is broadcast when we join a tracking channel. Each member that
//! accepts it pairs with the sender and answers with a direct hello-reply;
//! the sender pairs on the reply. A member that finds a conflict answers
//! with one of three rejections instead, and the sender retracts.

use super::MeshEngine;
use crate::carrier::Carrier;
use crate::client::{Client, RejectReason};
use crate::membership::{ChannelInfo, ChannelPeerKey};
use crate::mesh_id::{ChannelId, PeerId};
use crate::protocol::{Envelope, HelloPayload, MessageKind};
use tracing::{debug, info, warn};

impl RejectReason {
    fn message_kind(self) -> MessageKind {
        match self {
            RejectReason::BadChannelInfo => MessageKind::HelloRejectedBadInfo,
            RejectReason::AddressExists => MessageKind::HelloRejectedAddressExists,
            RejectReason::ChannelFull => MessageKind::HelloRejectedChannelFull,
        }
    }

    fn from_message_kind(kind: MessageKind) -> Option<Self> {
        match kind {
            MessageKind::HelloRejectedBadInfo => Some(RejectReason::BadChannelInfo),
            MessageKind::HelloRejectedAddressExists => Some(RejectReason::AddressExists),
            MessageKind::HelloRejectedChannelFull => Some(RejectReason::ChannelFull),
            _ => None,
        }
    }
}

impl<C: Carrier, A: Client> MeshEngine<C, A> {
    /// Our hello payload for a channel, or `None` if we are not on it.
    fn local_hello(&self, channel: ChannelId) -> Option<String> {
        let channel = self.registry.channel(channel)?;
        let payload = HelloPayload::new(&self.address, &channel.info, &channel.local_hello_data);
        match payload.encode() {
            Ok(body) => Some(body),
            Err(e) => {
                warn!("Failed to encode hello for {}: {}", channel.info.name, e);
                None
            }
        }
    }

    pub(super) fn broadcast_hello(&mut self, channel: ChannelId) {
        if let Some(body) = self.local_hello(channel) {
            debug!("Broadcasting hello on {}", channel);
            self.send_envelope(channel, MessageKind::Hello, body);
        }
    }

    /// Send a hello or hello-reply directly to one peer.
    pub(super) fn send_hello_to(&mut self, key: ChannelPeerKey, kind: MessageKind) {
        let Some(body) = self.local_hello(key.channel) else {
            return;
        };
        self.send_envelope(key.peer, kind, body);
        let now = self.clock.now_ms();
        if let Some(cp) = self.registry.channel_peer_mut(key) {
            cp.record_hello_sent(now);
        }
    }

    pub(super) fn handle_hello(&mut self, envelope: &Envelope) {
        let sender = envelope.sender_id;
        let hello = match HelloPayload::decode(&envelope.payload) {
            Ok(hello) => hello,
            Err(e) => {
                warn!("Dropping {:?} from {}: {}", envelope.kind, sender, e);
                return;
            }
        };
        let channel_id = hello.channel.id;
        let Some(local_info) = self.registry.channel(channel_id).map(|c| c.info.clone()) else {
            debug!("Hello from {} for channel {} we are not on", sender, hello.channel.name);
            return;
        };
        if !local_info.policy.is_tracking_membership() {
            debug!("Hello on non-tracking channel {}, ignoring", local_info.name);
            return;
        }

        if let Err(reason) = self.check_hello(envelope, &hello, &local_info) {
            self.reject(sender, &local_info, reason);
            return;
        }

        let key = ChannelPeerKey::new(channel_id, sender);
        let Some(cp) = self.registry.add_channel_peer(channel_id, sender) else {
            return;
        };
        let newly_confirmed = !cp.is_confirmed();
        cp.hello_data = Some(hello.hello_data.clone());

        if let Err(e) = self.registry.set_peer_address(sender, &hello.address) {
            warn!("Could not record address for {}: {}", sender, e);
        }
        if let Some(peer) = self.registry.peer_mut(sender) {
            peer.last_heard_at = Some(envelope.receipt_timestamp);
        }

        if newly_confirmed {
            info!("Peer {} joined {}", hello.address, local_info.name);
            self.client
                .on_peer_joined(&local_info, &hello.address, &hello.hello_data);
        }
        if envelope.kind == MessageKind::Hello {
            self.send_hello_to(key, MessageKind::HelloReply);
        }
    }

    /// Decide whether a hello may be accepted.
    ///
    /// An address conflict also removes the offending peer.
    fn check_hello(
        &mut self,
        envelope: &Envelope,
        hello: &HelloPayload,
        local_info: &ChannelInfo,
    ) -> Result<(), RejectReason> {
        let sender = envelope.sender_id;
        if hello.channel.policy != local_info.policy {
            warn!(
                "Peer {} announced a different policy for {}",
                hello.address, local_info.name
            );
            return Err(RejectReason::BadChannelInfo);
        }

        let address_taken = hello.address == self.address
            || self
                .registry
                .peer_by_address(&hello.address)
                .is_some_and(|owner| owner.id != sender)
            || self
                .registry
                .peer(sender)
                .and_then(|peer| peer.address.as_deref())
                .is_some_and(|known| known != hello.address);
        if address_taken {
            warn!(
                "Address conflict: {} claims {} on {}",
                sender, hello.address, local_info.name
            );
            self.drop_peer(sender);
            return Err(RejectReason::AddressExists);
        }

        let max_peers = local_info.policy.max_peers as usize;
        if envelope.kind == MessageKind::Hello && max_peers > 0 {
            let key = ChannelPeerKey::new(local_info.id, sender);
            let already_member = self
                .registry
                .channel_peer(key)
                .is_some_and(|cp| cp.is_confirmed());
            let members = self
                .registry
                .peers_for_channel(local_info.id)
                .into_iter()
                .filter(|peer| {
                    self.registry
                        .channel_peer(ChannelPeerKey::new(local_info.id, *peer))
                        .is_some_and(|cp| cp.is_confirmed())
                })
                .count();
            if !already_member && members + 1 >= max_peers {
                warn!("Channel {} is full, refusing {}", local_info.name, hello.address);
                return Err(RejectReason::ChannelFull);
            }
        }
        Ok(())
    }

    /// Remove a peer everywhere, telling the app about confirmed pairings.
    fn drop_peer(&mut self, peer: PeerId) {
        let Some(address) = self.registry.peer(peer).map(|p| p.display_address()) else {
            return;
        };
        let pairings: Vec<_> = self
            .registry
            .channel_peers_for_peer(peer)
            .into_iter()
            .map(|cp| (cp.key.channel, cp.is_confirmed()))
            .collect();
        for (channel, was_confirmed) in pairings {
            self.notify_left(channel, &address, was_confirmed);
        }
        self.registry.remove_peer(peer);
    }

    fn reject(&mut self, to: PeerId, local_info: &ChannelInfo, reason: RejectReason) {
        // A half-open pairing with the rejected peer must not linger
        let key = ChannelPeerKey::new(local_info.id, to);
        if self
            .registry
            .channel_peer(key)
            .is_some_and(|cp| !cp.is_confirmed())
        {
            self.registry.remove_channel_peer(key);
        }
        if let Some(body) = self.local_hello(local_info.id) {
            info!("Rejecting {} on {}: {:?}", to, local_info.name, reason);
            self.send_envelope(to, reason.message_kind(), body);
        }
    }

    pub(super) fn handle_rejection(&mut self, envelope: &Envelope) {
        let Some(reason) = RejectReason::from_message_kind(envelope.kind) else {
            return;
        };
        let hello = match HelloPayload::decode(&envelope.payload) {
            Ok(hello) => hello,
            Err(e) => {
                warn!("Dropping rejection from {}: {}", envelope.sender_id, e);
                return;
            }
        };
        let channel_id = hello.channel.id;
        let Some(local_info) = self.registry.channel(channel_id).map(|c| c.info.clone()) else {
            debug!("Rejection for channel {} we already left", hello.channel.name);
            return;
        };

        warn!(
            "Join of {} rejected by {}: {:?}",
            local_info.name, hello.address, reason
        );
        self.client.on_join_rejected(&local_info, reason);

        if self.registry.is_main_channel(channel_id) {
            // The app decides whether to leave the mesh entirely
            self.registry
                .remove_channel_peer(ChannelPeerKey::new(channel_id, envelope.sender_id));
            return;
        }
        self.carrier.stop_listening(channel_id);
        if let Err(e) = self.registry.remove_channel(channel_id) {
            warn!("Failed to retract {}: {}", local_info.name, e);
        }
    }
}

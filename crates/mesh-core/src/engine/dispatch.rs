//! Inbound envelope handling.

use super::MeshEngine;
use crate::carrier::Carrier;
use crate::client::Client;
use crate::clock_sync::SyncSample;
use crate::membership::{ChannelPeerKey, SeqCheck};
use crate::mesh_id::PeerId;
use crate::protocol::{Envelope, MessageKind, SyncPayload};
use tracing::{debug, info, trace, warn};

impl<C: Carrier, A: Client> MeshEngine<C, A> {
    /// Carrier-facing: handle one inbound envelope.
    ///
    /// Must be called on the thread that calls `update`; carriers that
    /// receive off-thread queue envelopes for `poll` instead.
    pub fn on_received_message(&mut self, mut envelope: Envelope) {
        if envelope.sender_id == self.local_id {
            trace!("Ignoring echo of our own {:?}", envelope.kind);
            return;
        }
        if !self.is_joined() {
            debug!("Not joined, dropping {:?} from {}", envelope.kind, envelope.sender_id);
            return;
        }

        let now = self.clock.now_ms();
        if envelope.receipt_timestamp == 0 {
            envelope.receipt_timestamp = now;
        }
        self.mark_heard(envelope.sender_id, now);

        let key = ChannelPeerKey::new(envelope.destination, envelope.sender_id);
        if let Some(cp) = self.registry.channel_peer_mut(key) {
            if let SeqCheck::Stale { last_validated } = cp.validate_seq(envelope.sequence_number) {
                // Delivered anyway: the fabric does not promise ordering
                warn!(
                    "Out-of-order {:?} from {} on {}: seq {} <= {}",
                    envelope.kind,
                    envelope.sender_id,
                    envelope.destination,
                    envelope.sequence_number,
                    last_validated
                );
            }
        }

        if envelope.kind.is_rejection() && !envelope.is_direct_to(self.local_id) {
            warn!(
                "Rejection from {} broadcast to {}, ignoring",
                envelope.sender_id, envelope.destination
            );
            return;
        }

        match envelope.kind {
            MessageKind::Application => self.handle_application(&envelope),
            MessageKind::Hello | MessageKind::HelloReply => self.handle_hello(&envelope),
            MessageKind::HelloRejectedBadInfo
            | MessageKind::HelloRejectedAddressExists
            | MessageKind::HelloRejectedChannelFull => self.handle_rejection(&envelope),
            MessageKind::Goodbye => self.handle_goodbye(&envelope),
            MessageKind::Ping => self.handle_ping(&envelope),
            MessageKind::ClockSync => self.handle_clock_sync(&envelope),
        }
    }

    /// Refresh liveness for a peer and announce its return where it was missing.
    fn mark_heard(&mut self, peer_id: PeerId, now_ms: u64) {
        let Some(peer) = self.registry.peer_mut(peer_id) else {
            return;
        };
        peer.last_heard_at = Some(now_ms);
        let address = peer.display_address();

        let returned: Vec<_> = self
            .registry
            .channel_peers_for_peer(peer_id)
            .into_iter()
            .filter(|cp| cp.missing_notified)
            .map(|cp| cp.key)
            .collect();
        for key in returned {
            if let Some(cp) = self.registry.channel_peer_mut(key) {
                cp.missing_notified = false;
            }
            if let Some(info) = self.registry.channel(key.channel).map(|c| c.info.clone()) {
                info!("Peer {} returned to {}", address, info.name);
                self.client.on_peer_returned(&info, &address);
            }
        }
    }

    fn handle_application(&mut self, envelope: &Envelope) {
        let sender = envelope.sender_id;
        let direct = envelope.is_direct_to(self.local_id);
        let channel_policy = self
            .registry
            .channel(envelope.destination)
            .map(|c| *c.policy());

        if !direct && channel_policy.is_none() {
            debug!("Message for channel {} we are not on", envelope.destination);
            return;
        }

        if self.registry.peer(sender).is_none() {
            match channel_policy {
                Some(policy) if !policy.is_tracking_membership() => {
                    // Raw relay channels have no handshake; learn senders as they speak
                    self.registry.add_channel_peer(envelope.destination, sender);
                    if let Some(peer) = self.registry.peer_mut(sender) {
                        peer.last_heard_at = Some(envelope.receipt_timestamp);
                    }
                }
                _ => {
                    warn!(
                        "Message from unknown sender {} to {}, dropping",
                        sender, envelope.destination
                    );
                    return;
                }
            }
        }

        let syncing = if direct {
            self.sync_interval_for(sender).is_some()
        } else {
            channel_policy.is_some_and(|p| p.is_syncing_clocks())
        };
        let Some(peer) = self.registry.peer(sender) else {
            return;
        };
        let offset = if syncing {
            peer.clock.offset_ms().map(|o| o.round() as i64).unwrap_or(0)
        } else {
            0
        };
        // Sender's timestamp is on its clock; local + offset = peer
        let ms_since_sent =
            envelope.receipt_timestamp as i64 - envelope.sent_timestamp as i64 + offset;
        let address = peer.display_address();
        self.client
            .on_client_message(&address, envelope.destination, ms_since_sent, &envelope.payload);
    }

    fn handle_goodbye(&mut self, envelope: &Envelope) {
        let sender = envelope.sender_id;
        let Some(address) = self.registry.peer(sender).map(|p| p.display_address()) else {
            debug!("Goodbye from unknown peer {}", sender);
            return;
        };

        if self.registry.is_main_channel(envelope.destination) {
            let confirmed: Vec<_> = self
                .registry
                .channel_peers_for_peer(sender)
                .into_iter()
                .map(|cp| (cp.key.channel, cp.is_confirmed()))
                .collect();
            for (channel, was_confirmed) in confirmed {
                self.notify_left(channel, &address, was_confirmed);
            }
            self.registry.remove_peer(sender);
            return;
        }

        let key = ChannelPeerKey::new(envelope.destination, sender);
        let was_confirmed = self
            .registry
            .channel_peer(key)
            .map(|cp| cp.is_confirmed());
        if let Some(was_confirmed) = was_confirmed {
            self.notify_left(key.channel, &address, was_confirmed);
            self.registry.remove_channel_peer(key);
        }
    }

    fn handle_ping(&mut self, envelope: &Envelope) {
        let sender = envelope.sender_id;
        if envelope.is_direct_to(self.local_id) {
            if self.registry.peer(sender).is_none() {
                warn!("Direct ping from unknown peer {}", sender);
            }
            return;
        }
        if !self.is_tracking(envelope.destination) {
            return;
        }
        let key = ChannelPeerKey::new(envelope.destination, sender);
        if self.registry.channel_peer(key).is_none() {
            // Missed their hello; pair up so the scheduler retries ours
            warn!(
                "Ping from unpaired peer {} on {}, starting handshake",
                sender, envelope.destination
            );
            self.registry.add_channel_peer(envelope.destination, sender);
            if let Some(peer) = self.registry.peer_mut(sender) {
                peer.last_heard_at = Some(envelope.receipt_timestamp);
            }
        }
    }

    fn handle_clock_sync(&mut self, envelope: &Envelope) {
        let sender = envelope.sender_id;
        if self.registry.peer(sender).is_none() {
            warn!("Clock sync from unknown peer {}", sender);
            return;
        }
        let Some(interval) = self.sync_interval_for(sender) else {
            debug!("Clock sync from {} with no syncing channel in common", sender);
            return;
        };
        let mut payload = match SyncPayload::decode(&envelope.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Dropping clock sync from {}: {}", sender, e);
                return;
            }
        };
        let now = envelope.receipt_timestamp;

        let sample = if payload.t0 == 0 {
            // First hop: we are the respondent
            payload.t0 = envelope.sent_timestamp;
            payload.t1 = envelope.receipt_timestamp;
            self.send_sync(sender, &payload);
            return;
        } else if payload.t2 == 0 {
            // Back at the originator: close the loop and share the quartet
            payload.t2 = envelope.sent_timestamp;
            payload.t3 = envelope.receipt_timestamp;
            self.send_sync(sender, &payload);
            SyncSample::from_quartet(&payload)
        } else if payload.is_complete() {
            SyncSample::from_quartet(&payload).mirrored()
        } else {
            warn!("Incomplete clock sync quartet from {}: {:?}", sender, payload);
            return;
        };

        let Some(peer) = self.registry.peer_mut(sender) else {
            return;
        };
        let info = peer.clock.record(sample, now, interval);
        let address = peer.display_address();
        debug!(
            "Clock sync with {}: offset {:.1}ms, lag {:.1}ms ({} samples)",
            address, info.offset_ms, info.lag_ms, info.samples
        );

        let channels: Vec<_> = self
            .registry
            .channel_peers_for_peer(sender)
            .into_iter()
            .filter(|cp| cp.is_confirmed())
            .filter_map(|cp| self.registry.channel(cp.key.channel))
            .filter(|c| c.policy().is_syncing_clocks())
            .map(|c| c.info.clone())
            .collect();
        for channel in channels {
            self.client.on_peer_sync(&channel, &address, &info);
        }
    }

    fn send_sync(&mut self, to: PeerId, payload: &SyncPayload) {
        match payload.encode() {
            Ok(body) => self.send_envelope(to, MessageKind::ClockSync, body),
            Err(e) => warn!("Failed to encode clock sync for {}: {}", to, e),
        }
    }

    /// Shortest sync interval among syncing channels where the peer is confirmed.
    pub(super) fn sync_interval_for(&self, peer: PeerId) -> Option<u64> {
        self.registry
            .channel_peers_for_peer(peer)
            .into_iter()
            .filter(|cp| cp.is_confirmed())
            .filter_map(|cp| self.registry.channel(cp.key.channel))
            .filter(|c| c.policy().is_syncing_clocks())
            .map(|c| c.policy().sync_ms)
            .min()
    }
}

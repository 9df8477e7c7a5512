//! In-process pub/sub bus.
//!
//! Every `LoopbackCarrier` created from the same `LoopbackBus` shares one set
//! of topics. Publishing copies the envelope into the inbox of each
//! subscriber (the publisher included, if subscribed); `poll` drains the
//! inbox. Endpoints can be taken offline to simulate a dead or partitioned
//! peer, and every publish is logged for assertions.

use super::{Carrier, CarrierError, CarrierEvent, Result};
use crate::membership::ChannelInfo;
use crate::mesh_id::{ChannelId, MeshId, PeerId};
use crate::protocol::Envelope;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct BusState {
    /// Topic -> subscribed endpoints
    subscriptions: HashMap<MeshId, BTreeSet<PeerId>>,
    inboxes: HashMap<PeerId, VecDeque<Envelope>>,
    offline: HashSet<PeerId>,
    sent: Vec<Envelope>,
}

/// Shared handle to an in-process bus.
#[derive(Debug, Clone, Default)]
pub struct LoopbackBus {
    state: Arc<Mutex<BusState>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new carrier attached to this bus.
    pub fn carrier(&self) -> LoopbackCarrier {
        LoopbackCarrier {
            bus: self.clone(),
            endpoint: None,
            topics: HashSet::new(),
            pending: Vec::new(),
        }
    }

    /// Drop all traffic to and from `endpoint` while offline.
    pub fn set_offline(&self, endpoint: PeerId, offline: bool) {
        let mut state = self.lock();
        if offline {
            state.offline.insert(endpoint);
        } else {
            state.offline.remove(&endpoint);
        }
    }

    /// Every envelope handed to the bus so far, offline senders included.
    pub fn sent_log(&self) -> Vec<Envelope> {
        self.lock().sent.clone()
    }

    pub fn clear_sent_log(&self) {
        self.lock().sent.clear();
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn subscribe(&self, endpoint: PeerId, topic: MeshId) {
        self.lock()
            .subscriptions
            .entry(topic)
            .or_default()
            .insert(endpoint);
    }

    fn unsubscribe(&self, endpoint: PeerId, topic: MeshId) {
        let mut state = self.lock();
        if let Some(subscribers) = state.subscriptions.get_mut(&topic) {
            subscribers.remove(&endpoint);
            if subscribers.is_empty() {
                state.subscriptions.remove(&topic);
            }
        }
    }

    fn publish(&self, envelope: &Envelope) {
        let mut state = self.lock();
        state.sent.push(envelope.clone());
        if state.offline.contains(&envelope.sender_id) {
            trace!("Sender {} offline, dropping", envelope.sender_id);
            return;
        }
        let targets: Vec<PeerId> = state
            .subscriptions
            .get(&envelope.destination)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter(|id| !state.offline.contains(*id))
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        for target in targets {
            state
                .inboxes
                .entry(target)
                .or_default()
                .push_back(envelope.clone());
        }
    }

    fn drain(&self, endpoint: PeerId) -> Vec<Envelope> {
        self.lock()
            .inboxes
            .get_mut(&endpoint)
            .map(|inbox| inbox.drain(..).collect())
            .unwrap_or_default()
    }

    fn detach(&self, endpoint: PeerId) {
        self.lock().inboxes.remove(&endpoint);
    }
}

/// Queue-and-poll carrier over a `LoopbackBus`.
#[derive(Debug)]
pub struct LoopbackCarrier {
    bus: LoopbackBus,
    endpoint: Option<PeerId>,
    topics: HashSet<MeshId>,
    pending: Vec<CarrierEvent>,
}

impl LoopbackCarrier {
    pub fn bus(&self) -> &LoopbackBus {
        &self.bus
    }

    fn subscribe(&mut self, endpoint: PeerId, topic: MeshId) {
        self.bus.subscribe(endpoint, topic);
        self.topics.insert(topic);
    }
}

impl Carrier for LoopbackCarrier {
    fn join(&mut self, channel: &ChannelInfo, local_id: PeerId, _local_hello_data: &str) -> Result<()> {
        if self.endpoint.is_some() {
            return Err(CarrierError::ConnectionFailed("already joined".into()));
        }
        self.endpoint = Some(local_id);
        self.subscribe(local_id, local_id);
        self.subscribe(local_id, channel.id);
        debug!("Loopback endpoint {} joined {}", local_id, channel.name);
        // Joining completes on the next poll, like a networked carrier
        self.pending.push(CarrierEvent::Joined);
        Ok(())
    }

    fn listen(&mut self, channel: ChannelId) -> Result<()> {
        let endpoint = self.endpoint.ok_or(CarrierError::Closed)?;
        self.subscribe(endpoint, channel);
        Ok(())
    }

    fn stop_listening(&mut self, channel: ChannelId) {
        if let Some(endpoint) = self.endpoint {
            self.bus.unsubscribe(endpoint, channel);
            self.topics.remove(&channel);
        }
    }

    fn send(&mut self, envelope: &Envelope) {
        if self.endpoint.is_none() {
            debug!("Loopback carrier not joined, dropping {:?}", envelope.kind);
            return;
        }
        self.bus.publish(envelope);
    }

    fn leave(&mut self) {
        let Some(endpoint) = self.endpoint.take() else {
            return;
        };
        for topic in self.topics.drain() {
            self.bus.unsubscribe(endpoint, topic);
        }
        self.bus.detach(endpoint);
        self.pending.clear();
    }

    fn poll(&mut self) -> Vec<CarrierEvent> {
        let mut events = std::mem::take(&mut self.pending);
        if let Some(endpoint) = self.endpoint {
            events.extend(self.bus.drain(endpoint).into_iter().map(CarrierEvent::Message));
        }
        events
    }
}

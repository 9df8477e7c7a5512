//! Carrier trait: the pub/sub transport the engine rides on.
//!
//! A carrier subscribes topics, publishes envelopes, and buffers whatever
//! arrives until the engine polls it. Inbound traffic never reaches the
//! engine from the carrier's own threads: carriers queue it, and
//! `MeshEngine::update` drains the queue on the caller's thread.
//!
//! Implementations:
//! - `LoopbackCarrier`: in-process bus for tests and single-process meshes
//! - `WebSocketCarrier` (mesh-daemon): client of the WebSocket relay

pub mod loopback;

pub use loopback::{LoopbackBus, LoopbackCarrier};

use crate::membership::ChannelInfo;
use crate::mesh_id::{ChannelId, PeerId};
use crate::protocol::Envelope;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CarrierError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Carrier is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, CarrierError>;

/// Something the carrier has buffered for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CarrierEvent {
    /// The network join requested by `Carrier::join` completed
    Joined,
    /// An envelope arrived on a subscribed topic
    Message(Envelope),
    /// The underlying connection went away
    Disconnected { reason: String },
}

/// Transport adapter consumed by the engine.
pub trait Carrier {
    /// Connect and subscribe to the main channel and to `local_id`, the
    /// implied direct channel. Must eventually yield `CarrierEvent::Joined`.
    fn join(&mut self, channel: &ChannelInfo, local_id: PeerId, local_hello_data: &str) -> Result<()>;

    fn listen(&mut self, channel: ChannelId) -> Result<()>;

    fn stop_listening(&mut self, channel: ChannelId);

    /// Best-effort publish to `envelope.destination`. Transient failures are
    /// logged by the carrier, never returned.
    fn send(&mut self, envelope: &Envelope);

    fn leave(&mut self);

    /// Drain everything buffered since the last poll, in arrival order.
    fn poll(&mut self) -> Vec<CarrierEvent>;
}

//! Channel/peer data model and the registry that indexes it.
//!
//! - `Channel`: a named group with a membership policy
//! - `Peer`: a remote participant, shared across channels
//! - `ChannelPeer`: one peer's handshake and liveness state on one channel
//! - `Registry`: indexes all three and keeps them consistent

pub mod channel;
pub mod channel_peer;
pub mod peer;
pub mod registry;

pub use channel::{Channel, ChannelInfo, ChannelPolicy};
pub use channel_peer::{ChannelPeer, ChannelPeerKey, ChannelPeerState, SeqCheck};
pub use peer::Peer;
pub use registry::{Registry, RegistryError};

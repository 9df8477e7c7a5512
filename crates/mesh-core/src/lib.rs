//! mesh-core: peer discovery and session membership over any pub/sub fabric.
//!
//! This crate provides:
//! - The channel/peer data model and its consistency-preserving registry
//! - The hello handshake with policy, address, and capacity conflict checks
//! - Liveness tracking with missing/returned/left notifications and batched pings
//! - NTP-style clock synchronization smoothed by an interval-aware EWMA
//! - The `Carrier` and `Client` seams, plus an in-process loopback carrier

pub mod carrier;
pub mod client;
pub mod clock;
pub mod clock_sync;
pub mod config;
pub mod engine;
pub mod error;
pub mod membership;
pub mod mesh_id;
pub mod protocol;

pub use carrier::{Carrier, CarrierError, CarrierEvent, LoopbackBus, LoopbackCarrier};
pub use client::{Client, EventLog, MeshEvent, RejectReason};
pub use clock::{Clock, ManualClock, SystemClock};
pub use clock_sync::{ClockSync, SyncInfo};
pub use config::EngineConfig;
pub use engine::{Destination, MeshEngine};
pub use error::MeshError;
pub use membership::{ChannelInfo, ChannelPolicy, Registry};
pub use mesh_id::{ChannelId, MeshId, MeshIdError, PeerId};
pub use protocol::{Envelope, MessageKind};

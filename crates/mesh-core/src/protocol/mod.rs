//! Wire protocol for mesh peers.
//!
//! - Envelope: the unit every carrier moves, with its closed set of type tags
//! - Payloads: hello-family and clock-sync bodies carried inside the envelope

pub mod envelope;
pub mod payload;

pub use envelope::{Envelope, EnvelopeError, MessageKind};
pub use payload::{HelloPayload, SyncPayload};

//! Errors returned by the engine API.
//!
//! Steady-state protocol conditions (timeouts, rejections, stale messages)
//! are client notifications, not errors. These cover misuse of the API and
//! carrier connection failures.

use crate::carrier::CarrierError;
use crate::membership::RegistryError;
use crate::mesh_id::MeshId;
use crate::protocol::EnvelopeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Not joined to a mesh")]
    NotJoined,

    #[error("Already joined or joining")]
    AlreadyJoined,

    #[error("Unknown channel: {0}")]
    UnknownChannel(MeshId),

    #[error("No peer with address {0}")]
    UnknownAddress(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Carrier error: {0}")]
    Carrier(#[from] CarrierError),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EnvelopeError),
}

pub type Result<T> = std::result::Result<T, MeshError>;

//! Engine configuration.

use crate::mesh_id::PeerId;

/// Explicit configuration handed to `MeshEngine::new`.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Fixed local id (random when `None`)
    pub local_id: Option<PeerId>,
    /// Application-level address (hex id when `None`)
    pub address: Option<String>,
    /// Most inbound envelopes dispatched per `update` (0 = no limit)
    pub max_inbound_per_update: usize,
}

impl EngineConfig {
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }

    pub fn local_id(mut self, id: PeerId) -> Self {
        self.local_id = Some(id);
        self
    }
}

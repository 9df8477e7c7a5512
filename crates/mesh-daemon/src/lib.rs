//! mesh-daemon library: the WebSocket relay and the carrier that rides it.
//!
//! The binary wires these into `relay` and `peer` subcommands; integration
//! tests drive them directly.

pub mod connection;
pub mod frame;
pub mod relay;
pub mod ws_carrier;

pub use connection::{ConnectionEvent, RelayConnection};
pub use frame::{MAX_FRAME_SIZE, RelayFrame};
pub use relay::RelayServer;
pub use ws_carrier::WebSocketCarrier;

//! Network Layer
//!
//! Lockstep synchronization between peers. Peers exchange commands and
//! seals, execute a tick only when everyone's input for it is known, and
//! compare state hashes to catch divergence.
//! This layer is **non-deterministic**; all world logic runs through `world/`.

pub mod protocol;
pub mod peer;
pub mod transport;
pub mod lockstep;
pub mod ws;
pub mod node;

pub use lockstep::{LockstepSession, StepOutcome, SyncConfig, SyncError, SyncStats};
pub use node::{run_node, NodeConfig, NodeError, NodeReport};
pub use peer::{Peer, PeerState};
pub use protocol::{Frame, LeaveReason, NetMessage};
pub use transport::{LoopbackNetwork, LoopbackTransport, Transport, TransportError};
pub use ws::WsTransport;

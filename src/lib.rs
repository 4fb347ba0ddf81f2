//! # RTS Lockstep
//!
//! Deterministic simulation and peer-to-peer lockstep synchronization for a
//! real-time strategy engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        RTS LOCKSTEP                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── fixed.rs    - Q16.16 fixed-point arithmetic             │
//! │  ├── vec2.rs     - 2D vector with fixed-point                │
//! │  ├── rng.rs      - Seeded generator and session seeds        │
//! │  └── hash.rs     - State hashing for desync detection        │
//! │                                                              │
//! │  stream/         - Byte-exact state codec                    │
//! │  ├── writer.rs   - Little-endian writer, records             │
//! │  └── reader.rs   - Bounds-checked reader                     │
//! │                                                              │
//! │  world/          - World simulation (deterministic)          │
//! │  ├── registry.rs - Object ownership and ids                  │
//! │  ├── object.rs   - Units, structures, projectiles            │
//! │  ├── sim.rs      - Tick pipeline                             │
//! │  ├── save.rs     - Save and load                             │
//! │  └── replay.rs   - Command log with checkpoints              │
//! │                                                              │
//! │  network/        - Networking (non-deterministic)            │
//! │  ├── protocol.rs - Message types and framing                 │
//! │  ├── peer.rs     - Peer state machine                        │
//! │  ├── lockstep.rs - Tick synchronization                      │
//! │  ├── ws.rs       - WebSocket transport                       │
//! │  └── node.rs     - Fixed-rate peer driver                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism Guarantee
//!
//! The `core/`, `stream/` and `world/` modules are deterministic:
//! - No floating-point arithmetic in world logic
//! - No HashMap (uses BTreeMap for sorted iteration)
//! - No system time dependencies
//! - All randomness from the seeded generator
//!
//! Given the same seed and the same command stream, every peer produces
//! **identical state** and therefore identical state hashes.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod stream;
pub mod world;
pub mod network;

// Re-export commonly used types
pub use core::fixed::{Fixed, FIXED_ONE, FIXED_HALF, FIXED_SCALE};
pub use core::vec2::FixedVec2;
pub use core::rng::DeterministicRng;
pub use core::hash::StateHash;
pub use world::{Action, Command, ObjectId, Simulation};
pub use network::{LockstepSession, SyncConfig, SyncError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

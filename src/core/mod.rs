//! Core deterministic primitives.
//!
//! Everything here produces identical results on every platform. The world
//! simulation and the wire formats are built on top of these types.

pub mod fixed;
pub mod vec2;
pub mod rng;
pub mod hash;

// Re-export core types
pub use fixed::{Fixed, FIXED_ONE, FIXED_HALF, FIXED_SCALE};
pub use vec2::FixedVec2;
pub use rng::{DeterministicRng, RandomState, STATE_BYTES};
pub use hash::{StateHash, hash_with_domain};

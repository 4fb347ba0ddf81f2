//! Deterministic world.
//!
//! The registry owns every object, references are ids re-resolved on each
//! access, and [`Simulation`] threads the registry, the random generator and
//! the houses through every tick.

pub mod id;
pub mod reference;
pub mod registry;
pub mod object;
pub mod house;
pub mod command;
pub mod events;
pub mod sim;
pub mod save;
pub mod replay;

pub use command::{Action, Command};
pub use events::{RejectReason, SimEvent, SimEventKind};
pub use house::HouseState;
pub use id::ObjectId;
pub use object::{Attacker, Movable, Producer, SimObject, UnitKind};
pub use reference::ObjectRef;
pub use registry::ObjectRegistry;
pub use replay::{Replay, ReplayRecorder};
pub use save::SaveError;
pub use sim::{Simulation, TickResult, WorldSnapshot};

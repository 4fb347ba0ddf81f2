//! Simulation Events
//!
//! Events generated during a tick, for collaborators (UI, audio, replays).
//! They are outputs only: nothing in the simulation reads them back.

use serde::{Deserialize, Serialize};

use super::id::ObjectId;
use super::object::UnitKind;

/// Why a command had no effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Payload did not decode as an action.
    MalformedPayload,
    /// Issuing player has no house.
    UnknownHouse,
    /// Issuing house is already defeated.
    HouseDefeated,
    /// Subject or target is not a live object.
    UnknownObject,
    /// Subject belongs to another house.
    NotOwner,
    /// Subject lacks the capability the action needs.
    WrongObjectType,
    /// Target is not something that can be attacked.
    InvalidTarget,
    /// Factory already has a job.
    ProducerBusy,
    /// Not enough credits.
    InsufficientCredits,
}

/// Event payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimEventKind {
    /// A factory finished a unit.
    UnitProduced {
        /// House that built it.
        house: u8,
        /// New unit.
        unit: ObjectId,
        /// Archetype.
        kind: UnitKind,
    },
    /// A unit fired.
    ShotFired {
        /// Shooter.
        source: ObjectId,
        /// Intended victim.
        target: ObjectId,
        /// New projectile.
        projectile: ObjectId,
    },
    /// A projectile reached its target.
    ProjectileImpact {
        /// Target that was reached.
        target: ObjectId,
        /// Whether the hit roll succeeded.
        hit: bool,
        /// Damage dealt (0 on a miss).
        damage: i32,
    },
    /// An object ran out of health.
    ObjectDestroyed {
        /// Destroyed object.
        id: ObjectId,
        /// Its house.
        owner: u8,
    },
    /// A house lost its last object.
    HouseDefeated {
        /// Defeated house.
        house: u8,
    },
    /// A command was ignored.
    CommandRejected {
        /// Issuing player.
        player: u8,
        /// Command sequence.
        sequence: u32,
        /// Why.
        reason: RejectReason,
    },
}

/// An event with the tick it happened in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimEvent {
    /// Tick that produced the event.
    pub tick: u32,
    /// What happened.
    pub kind: SimEventKind,
}

impl SimEvent {
    /// Create a new event.
    pub fn new(tick: u32, kind: SimEventKind) -> Self {
        Self { tick, kind }
    }
}

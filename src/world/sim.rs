//! Simulation Context
//!
//! [`Simulation`] is the explicit "current game": it owns the tick counter,
//! the random generator, the object registry and the houses, and is passed
//! to everything that reads or changes them. There is no global state.
//!
//! # Determinism
//!
//! `advance` is a pure function of the context and the commands it is
//! given:
//! - commands are applied in `(player, sequence)` order
//! - objects are visited in ascending id order
//! - all arithmetic is fixed-point
//! - all randomness comes from the context's generator

use serde::Serialize;
use tracing::debug;
#[cfg(feature = "debug-tracing")]
use tracing::trace;

use crate::core::hash::{hash_with_domain, StateHash, WORLD_DOMAIN};
use crate::core::fixed::FIXED_ONE;
use crate::core::rng::DeterministicRng;
use crate::core::vec2::FixedVec2;
use crate::stream::CodecError;

use super::command::{Action, Command};
use super::events::{RejectReason, SimEvent, SimEventKind};
use super::house::HouseState;
use super::id::ObjectId;
use super::object::{
    Attacker, Movable, Producer, Projectile, SimObject, Structure, StructureKind, Unit, UnitKind,
    IMPACT_RADIUS,
};
use super::reference::ObjectRef;
use super::registry::ObjectRegistry;
use super::save;

/// Ticks between refinery payouts.
pub const INCOME_INTERVAL: u32 = 30;

/// Base positions for the first houses, in map cells.
const SPAWN_POINTS: [(i32, i32); 4] = [(-40, -40), (40, 40), (-40, 40), (40, -40)];

/// Result of one tick.
#[derive(Debug, Default)]
pub struct TickResult {
    /// Tick that was executed.
    pub tick: u32,
    /// Events generated during the tick.
    pub events: Vec<SimEvent>,
}

/// The complete deterministic world.
#[derive(Clone, Debug)]
pub struct Simulation {
    pub(crate) tick: u32,
    pub(crate) rng: DeterministicRng,
    pub(crate) registry: ObjectRegistry,
    pub(crate) houses: Vec<HouseState>,
}

impl Simulation {
    /// Create an empty world with one house per name.
    ///
    /// # Panics
    ///
    /// Panics with more than 256 houses.
    pub fn new(seed: u64, house_names: &[&str]) -> Self {
        assert!(house_names.len() <= 256, "at most 256 houses");
        let houses = house_names
            .iter()
            .enumerate()
            .map(|(i, name)| HouseState::new(i as u8, *name))
            .collect();

        Self {
            tick: 0,
            rng: DeterministicRng::new(seed),
            registry: ObjectRegistry::new(),
            houses,
        }
    }

    pub(crate) fn from_parts(
        tick: u32,
        rng: DeterministicRng,
        registry: ObjectRegistry,
        houses: Vec<HouseState>,
    ) -> Self {
        Self {
            tick,
            rng,
            registry,
            houses,
        }
    }

    /// Place every house's starting base: a factory, a refinery, three
    /// infantry and a tank.
    pub fn setup_skirmish(&mut self) {
        for index in 0..self.houses.len() {
            let owner = index as u8;
            let base = match SPAWN_POINTS.get(index) {
                Some(&(x, y)) => FixedVec2::from_ints(x, y),
                None => self.rng.random_position(),
            };

            self.registry
                .register(SimObject::Structure(Structure::new(owner, StructureKind::Factory, base)));
            self.registry.register(SimObject::Structure(Structure::new(
                owner,
                StructureKind::Refinery,
                base.add(FixedVec2::from_ints(3, 0)).clamp_to_map(),
            )));

            for kind in [UnitKind::Infantry, UnitKind::Infantry, UnitKind::Infantry, UnitKind::Tank] {
                let position = self.rally_point(base);
                self.registry.register(SimObject::Unit(Unit::new(owner, kind, position)));
            }
        }
    }

    /// Next tick to execute. Also the number of ticks executed so far.
    pub fn tick(&self) -> u32 {
        self.tick
    }

    /// The random generator.
    pub fn rng(&self) -> &DeterministicRng {
        &self.rng
    }

    /// All objects.
    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    /// All houses, indexed by player.
    pub fn houses(&self) -> &[HouseState] {
        &self.houses
    }

    /// One house.
    pub fn house(&self, index: u8) -> Option<&HouseState> {
        self.houses.get(index as usize)
    }

    /// Run one tick with the commands scheduled for it.
    pub fn advance(&mut self, commands: &[Command]) -> TickResult {
        let tick = self.tick;
        let mut events = Vec::new();

        let mut ordered: Vec<&Command> = commands.iter().collect();
        ordered.sort_by_key(|c| c.order_key());
        for cmd in ordered {
            if let Err(reason) = self.apply_command(cmd) {
                debug!(tick, player = cmd.player, sequence = cmd.sequence, ?reason, "command rejected");
                events.push(SimEvent::new(
                    tick,
                    SimEventKind::CommandRejected {
                        player: cmd.player,
                        sequence: cmd.sequence,
                        reason,
                    },
                ));
            }
        }

        self.run_income(tick);
        self.run_production(tick, &mut events);
        self.run_units(tick, &mut events);
        self.run_projectiles(tick, &mut events);
        self.remove_destroyed(tick, &mut events);

        self.tick += 1;

        #[cfg(feature = "debug-tracing")]
        trace!(tick, objects = self.registry.len(), events = events.len(), "tick complete");

        TickResult { tick, events }
    }

    /// Validate and apply one command.
    ///
    /// Rejection leaves the world untouched.
    pub fn apply_command(&mut self, cmd: &Command) -> Result<(), RejectReason> {
        let action = cmd.action().map_err(|_| RejectReason::MalformedPayload)?;
        let house = self.houses.get(cmd.player as usize).ok_or(RejectReason::UnknownHouse)?;
        if house.defeated {
            return Err(RejectReason::HouseDefeated);
        }
        let subject = self.registry.get(action.subject()).ok_or(RejectReason::UnknownObject)?;
        if subject.owner() != cmd.player {
            return Err(RejectReason::NotOwner);
        }

        match action {
            Action::Move { unit, to } => {
                let unit = self.unit_mut(unit)?;
                unit.attack_target.clear();
                unit.destination = Some(to.clamp_to_map());
            }
            Action::Attack { unit, target } => {
                let victim = self.registry.get(target).ok_or(RejectReason::UnknownObject)?;
                if target == unit || !victim.is_targetable() || victim.owner() == cmd.player {
                    return Err(RejectReason::InvalidTarget);
                }
                let unit = self.unit_mut(unit)?;
                unit.destination = None;
                unit.attack_target.set(target);
            }
            Action::Stop { unit } => {
                self.unit_mut(unit)?.stop();
            }
            Action::Produce { factory, kind } => {
                let producer = self
                    .registry
                    .get_mut(factory)
                    .and_then(|o| o.as_producer_mut())
                    .ok_or(RejectReason::WrongObjectType)?;
                if producer.job().is_some() {
                    return Err(RejectReason::ProducerBusy);
                }
                if !self.houses[cmd.player as usize].try_spend(kind.cost()) {
                    return Err(RejectReason::InsufficientCredits);
                }
                producer.start(kind);
            }
        }
        Ok(())
    }

    /// SHA-256 of the canonical world encoding.
    pub fn state_hash(&self) -> StateHash {
        hash_with_domain(WORLD_DOMAIN, &save::encode_world(self))
    }

    /// Replace this world with a decoded one. On error nothing changes.
    pub fn restore(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        *self = save::decode_world(bytes)?;
        Ok(())
    }

    /// Read-only view for rendering and other collaborators.
    pub fn snapshot(&self) -> WorldSnapshot {
        WorldSnapshot {
            tick: self.tick,
            objects: self
                .registry
                .iter()
                .map(|(id, object)| ObjectView {
                    id,
                    object: object.clone(),
                })
                .collect(),
            houses: self.houses.clone(),
        }
    }

    // =========================================================================
    // TICK PHASES
    // =========================================================================

    fn unit_mut(&mut self, id: ObjectId) -> Result<&mut Unit, RejectReason> {
        match self.registry.get_mut(id) {
            Some(SimObject::Unit(unit)) => Ok(unit),
            Some(_) => Err(RejectReason::WrongObjectType),
            None => Err(RejectReason::UnknownObject),
        }
    }

    fn rally_point(&mut self, origin: FixedVec2) -> FixedVec2 {
        let dx = self.rng.next_fixed_range(-2 * FIXED_ONE, 2 * FIXED_ONE);
        let dy = self.rng.next_fixed_range(-2 * FIXED_ONE, 2 * FIXED_ONE);
        origin.add(FixedVec2::new(dx, dy)).clamp_to_map()
    }

    fn run_income(&mut self, tick: u32) {
        if tick == 0 || tick % INCOME_INTERVAL != 0 {
            return;
        }
        for (_, object) in self.registry.iter() {
            if let SimObject::Structure(s) = object {
                if let Some(house) = self.houses.get_mut(s.owner as usize) {
                    house.credits = house.credits.saturating_add(s.kind.income());
                }
            }
        }
    }

    fn run_production(&mut self, tick: u32, events: &mut Vec<SimEvent>) {
        for id in self.registry.ids() {
            let Some(object) = self.registry.get_mut(id) else {
                continue;
            };
            let owner = object.owner();
            let origin = object.position();
            let Some(kind) = object.as_producer_mut().and_then(|p| p.advance_job()) else {
                continue;
            };

            let position = self.rally_point(origin);
            let Some(unit) = self.registry.register(SimObject::Unit(Unit::new(owner, kind, position))) else {
                continue;
            };
            if let Some(house) = self.houses.get_mut(owner as usize) {
                house.units_built += 1;
            }
            events.push(SimEvent::new(tick, SimEventKind::UnitProduced { house: owner, unit, kind }));
        }
    }

    fn run_units(&mut self, tick: u32, events: &mut Vec<SimEvent>) {
        for id in self.registry.ids() {
            // Resolving through the stored reference clears it if the target is gone.
            let (target_pos, owner) = match self.registry.get(id) {
                Some(SimObject::Unit(unit)) => (
                    unit.attack_target.resolve(&self.registry).map(SimObject::position),
                    unit.owner,
                ),
                _ => continue,
            };

            let Some(SimObject::Unit(unit)) = self.registry.get_mut(id) else {
                continue;
            };
            unit.reload();

            let mut shot = None;
            if let Some(target_pos) = target_pos {
                if unit.position.within(target_pos, unit.range()) {
                    if unit.weapon_ready() {
                        shot = Some((unit.fire(&mut self.rng), unit.attack_target.id(), unit.position));
                    }
                } else {
                    unit.step_toward(target_pos);
                }
            } else if let Some(destination) = unit.destination {
                if unit.step_toward(destination) {
                    unit.destination = None;
                }
            }

            if let Some((shot, target, position)) = shot {
                let Some(projectile) = self.registry.register(SimObject::Projectile(Projectile {
                    owner,
                    source: ObjectRef::new(id),
                    target: ObjectRef::new(target),
                    position,
                    damage: shot.damage,
                    accuracy: shot.accuracy,
                })) else {
                    continue;
                };
                events.push(SimEvent::new(
                    tick,
                    SimEventKind::ShotFired {
                        source: id,
                        target,
                        projectile,
                    },
                ));
            }
        }
    }

    fn run_projectiles(&mut self, tick: u32, events: &mut Vec<SimEvent>) {
        for id in self.registry.ids() {
            let target_pos = match self.registry.get(id) {
                Some(SimObject::Projectile(p)) => p.target.resolve(&self.registry).map(SimObject::position),
                _ => continue,
            };

            // Target vanished: the shot fizzles.
            let Some(target_pos) = target_pos else {
                self.registry.release(id);
                continue;
            };

            let Some(SimObject::Projectile(p)) = self.registry.get_mut(id) else {
                continue;
            };
            p.step_toward(target_pos);
            if !p.position.within(target_pos, IMPACT_RADIUS) {
                continue;
            }

            let (damage, accuracy, target) = (p.damage, p.accuracy, p.target.id());
            self.registry.release(id);

            let hit = self.rng.next_bool(accuracy);
            let dealt = if hit { damage } else { 0 };
            if let Some(victim) = self.registry.get_mut(target) {
                victim.apply_damage(dealt);
            }
            events.push(SimEvent::new(
                tick,
                SimEventKind::ProjectileImpact {
                    target,
                    hit,
                    damage: dealt,
                },
            ));
        }
    }

    fn remove_destroyed(&mut self, tick: u32, events: &mut Vec<SimEvent>) {
        let destroyed: Vec<(ObjectId, u8, bool)> = self
            .registry
            .iter()
            .filter(|(_, o)| matches!(o.health(), Some(h) if h <= 0))
            .map(|(id, o)| (id, o.owner(), matches!(o, SimObject::Unit(_))))
            .collect();

        let mut affected = Vec::new();
        for (id, owner, is_unit) in destroyed {
            self.registry.release(id);
            if is_unit {
                if let Some(house) = self.houses.get_mut(owner as usize) {
                    house.units_lost += 1;
                }
            }
            if !affected.contains(&owner) {
                affected.push(owner);
            }
            events.push(SimEvent::new(tick, SimEventKind::ObjectDestroyed { id, owner }));
        }

        // Only houses that just lost something can have become defeated.
        affected.sort_unstable();
        for owner in affected {
            let alive = self
                .registry
                .iter()
                .any(|(_, o)| o.owner() == owner && o.is_targetable());
            if let Some(house) = self.houses.get_mut(owner as usize) {
                if !alive && !house.defeated {
                    house.defeated = true;
                    events.push(SimEvent::new(tick, SimEventKind::HouseDefeated { house: owner }));
                }
            }
        }
    }
}

/// One object in a [`WorldSnapshot`].
#[derive(Clone, Debug, Serialize)]
pub struct ObjectView {
    /// Handle.
    pub id: ObjectId,
    /// Object state.
    #[serde(flatten)]
    pub object: SimObject,
}

/// Post-tick state handed to collaborators.
#[derive(Clone, Debug, Serialize)]
pub struct WorldSnapshot {
    /// Next tick to execute.
    pub tick: u32,
    /// Live objects in id order.
    pub objects: Vec<ObjectView>,
    /// House bookkeeping.
    pub houses: Vec<HouseState>,
}

impl WorldSnapshot {
    /// Serialize for debugging or external tools.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// TESTS
// =============================================================================

//! Simulation Objects
//!
//! A closed set of object variants. Behavior is split into capability traits
//! ([`Movable`], [`Attacker`], [`Producer`]) that each variant opts into, and
//! the tick code asks an object for a capability instead of checking its type.

use serde::{Deserialize, Serialize};

use crate::core::fixed::{Fixed, FIXED_ONE};
use crate::core::rng::DeterministicRng;
use crate::core::vec2::FixedVec2;
use crate::stream::{CodecError, Decode, Encode, StreamReader, StreamWriter};

use super::reference::ObjectRef;

/// Record tag of a [`Unit`].
pub const UNIT_TAG: u16 = 1;
/// Record tag of a [`Structure`].
pub const STRUCTURE_TAG: u16 = 2;
/// Record tag of a [`Projectile`].
pub const PROJECTILE_TAG: u16 = 3;

/// Distance per tick covered by projectiles.
pub const PROJECTILE_SPEED: Fixed = FIXED_ONE;

/// Projectiles closer than this to their target have arrived.
pub const IMPACT_RADIUS: Fixed = FIXED_ONE / 2;

// =============================================================================
// CAPABILITIES
// =============================================================================

/// Something that travels across the map.
pub trait Movable {
    /// Current position.
    fn position(&self) -> FixedVec2;

    /// Distance covered per tick.
    fn speed(&self) -> Fixed;

    /// Teleport to `position`.
    fn set_position(&mut self, position: FixedVec2);

    /// Advance one tick toward `target`. Returns true once it is reached.
    fn step_toward(&mut self, target: FixedVec2) -> bool {
        let next = self.position().step_toward(target, self.speed()).clamp_to_map();
        self.set_position(next);
        next == target
    }
}

/// Something with a weapon.
pub trait Attacker {
    /// What the weapon is aimed at.
    fn attack_target(&self) -> &ObjectRef;

    /// Maximum firing distance.
    fn range(&self) -> Fixed;

    /// Whether the weapon can fire this tick.
    fn weapon_ready(&self) -> bool;

    /// Let one tick of reload time pass.
    fn reload(&mut self);

    /// Fire: start the cooldown and roll the shot.
    fn fire(&mut self, rng: &mut DeterministicRng) -> Shot;
}

/// Something that builds units.
pub trait Producer {
    /// Job in progress, if any.
    fn job(&self) -> Option<&ProductionJob>;

    /// Queue a unit. Returns false if the producer is busy or cannot build it.
    fn start(&mut self, kind: UnitKind) -> bool;

    /// Let one tick of build time pass. Returns the finished unit kind.
    fn advance_job(&mut self) -> Option<UnitKind>;
}

/// A rolled shot, carried by the projectile until impact.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Shot {
    /// Damage on hit.
    pub damage: i32,
    /// Hit probability in `[0, FIXED_ONE]`.
    pub accuracy: Fixed,
}

// =============================================================================
// UNIT KINDS
// =============================================================================

/// Unit archetypes and their stat tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum UnitKind {
    /// Cheap, short-ranged.
    Infantry = 0,
    /// Durable front-line unit.
    Tank = 1,
    /// Long-ranged, slow, inaccurate.
    Artillery = 2,
}

impl UnitKind {
    /// All kinds, in tag order.
    pub const ALL: [UnitKind; 3] = [UnitKind::Infantry, UnitKind::Tank, UnitKind::Artillery];

    /// Decode from a tag byte.
    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    /// Health of a freshly built unit.
    pub const fn max_health(self) -> i32 {
        match self {
            UnitKind::Infantry => 50,
            UnitKind::Tank => 160,
            UnitKind::Artillery => 70,
        }
    }

    /// Distance per tick.
    pub const fn speed(self) -> Fixed {
        match self {
            UnitKind::Infantry => FIXED_ONE / 8,
            UnitKind::Tank => FIXED_ONE / 5,
            UnitKind::Artillery => FIXED_ONE / 10,
        }
    }

    /// Weapon range.
    pub const fn range(self) -> Fixed {
        match self {
            UnitKind::Infantry => 4 * FIXED_ONE,
            UnitKind::Tank => 5 * FIXED_ONE,
            UnitKind::Artillery => 9 * FIXED_ONE,
        }
    }

    /// Guaranteed damage per hit.
    pub const fn base_damage(self) -> i32 {
        match self {
            UnitKind::Infantry => 6,
            UnitKind::Tank => 18,
            UnitKind::Artillery => 25,
        }
    }

    /// Extra random damage per hit, inclusive upper bound.
    pub const fn damage_spread(self) -> u32 {
        match self {
            UnitKind::Infantry => 4,
            UnitKind::Tank => 6,
            UnitKind::Artillery => 10,
        }
    }

    /// Ticks between shots.
    pub const fn cooldown(self) -> u16 {
        match self {
            UnitKind::Infantry => 20,
            UnitKind::Tank => 30,
            UnitKind::Artillery => 60,
        }
    }

    /// Hit probability.
    pub const fn accuracy(self) -> Fixed {
        match self {
            UnitKind::Infantry => FIXED_ONE * 3 / 4,
            UnitKind::Tank => FIXED_ONE * 17 / 20,
            UnitKind::Artillery => FIXED_ONE * 3 / 5,
        }
    }

    /// Credits charged when production starts.
    pub const fn cost(self) -> u32 {
        match self {
            UnitKind::Infantry => 100,
            UnitKind::Tank => 400,
            UnitKind::Artillery => 350,
        }
    }

    /// Ticks from order to completion.
    pub const fn build_ticks(self) -> u16 {
        match self {
            UnitKind::Infantry => 60,
            UnitKind::Tank => 150,
            UnitKind::Artillery => 120,
        }
    }
}

impl Encode for UnitKind {
    fn encode(&self, w: &mut StreamWriter) {
        w.write_u8(*self as u8);
    }
}

impl Decode for UnitKind {
    fn decode(r: &mut StreamReader<'_>) -> Result<Self, CodecError> {
        let tag = r.read_u8()?;
        Self::from_index(tag).ok_or(CodecError::UnknownTag {
            context: "unit kind",
            tag: tag as u16,
        })
    }
}

/// Building archetypes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StructureKind {
    /// Builds units.
    Factory = 0,
    /// Generates credits for its house.
    Refinery = 1,
}

impl StructureKind {
    /// Health when placed.
    pub const fn max_health(self) -> i32 {
        match self {
            StructureKind::Factory => 500,
            StructureKind::Refinery => 300,
        }
    }

    /// Credits granted every income interval.
    pub const fn income(self) -> u32 {
        match self {
            StructureKind::Factory => 0,
            StructureKind::Refinery => 25,
        }
    }
}

impl Encode for StructureKind {
    fn encode(&self, w: &mut StreamWriter) {
        w.write_u8(*self as u8);
    }
}

impl Decode for StructureKind {
    fn decode(r: &mut StreamReader<'_>) -> Result<Self, CodecError> {
        match r.read_u8()? {
            0 => Ok(StructureKind::Factory),
            1 => Ok(StructureKind::Refinery),
            tag => Err(CodecError::UnknownTag {
                context: "structure kind",
                tag: tag as u16,
            }),
        }
    }
}

// =============================================================================
// VARIANTS
// =============================================================================

/// A mobile combat unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    /// Owning house index.
    pub owner: u8,
    /// Archetype.
    pub kind: UnitKind,
    /// Position on the map.
    pub position: FixedVec2,
    /// Where the unit is walking to.
    pub destination: Option<FixedVec2>,
    /// What the unit is chasing.
    pub attack_target: ObjectRef,
    /// Remaining health.
    pub health: i32,
    /// Ticks until the weapon is ready.
    pub cooldown: u16,
}

impl Unit {
    /// A fresh, idle unit.
    pub fn new(owner: u8, kind: UnitKind, position: FixedVec2) -> Self {
        Self {
            owner,
            kind,
            position,
            destination: None,
            attack_target: ObjectRef::none(),
            health: kind.max_health(),
            cooldown: 0,
        }
    }

    /// Drop any move or attack order.
    pub fn stop(&mut self) {
        self.destination = None;
        self.attack_target.clear();
    }
}

impl Movable for Unit {
    fn position(&self) -> FixedVec2 {
        self.position
    }

    fn speed(&self) -> Fixed {
        self.kind.speed()
    }

    fn set_position(&mut self, position: FixedVec2) {
        self.position = position;
    }
}

impl Attacker for Unit {
    fn attack_target(&self) -> &ObjectRef {
        &self.attack_target
    }

    fn range(&self) -> Fixed {
        self.kind.range()
    }

    fn weapon_ready(&self) -> bool {
        self.cooldown == 0
    }

    fn reload(&mut self) {
        self.cooldown = self.cooldown.saturating_sub(1);
    }

    fn fire(&mut self, rng: &mut DeterministicRng) -> Shot {
        self.cooldown = self.kind.cooldown();
        let spread = rng.next_int(self.kind.damage_spread() + 1) as i32;
        Shot {
            damage: self.kind.base_damage() + spread,
            accuracy: self.kind.accuracy(),
        }
    }
}

impl Encode for Unit {
    fn encode(&self, w: &mut StreamWriter) {
        w.write_u8(self.owner);
        self.kind.encode(w);
        w.write_vec2(self.position);
        w.write_option(self.destination.as_ref());
        self.attack_target.encode(w);
        w.write_i32(self.health);
        w.write_u16(self.cooldown);
    }
}

impl Decode for Unit {
    fn decode(r: &mut StreamReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            owner: r.read_u8()?,
            kind: UnitKind::decode(r)?,
            position: r.read_vec2()?,
            destination: r.read_option()?,
            attack_target: ObjectRef::decode(r)?,
            health: r.read_i32()?,
            cooldown: r.read_u16()?,
        })
    }
}

/// A unit under construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionJob {
    /// What is being built.
    pub kind: UnitKind,
    /// Ticks left until it rolls out.
    pub remaining: u16,
}

impl Encode for ProductionJob {
    fn encode(&self, w: &mut StreamWriter) {
        self.kind.encode(w);
        w.write_u16(self.remaining);
    }
}

impl Decode for ProductionJob {
    fn decode(r: &mut StreamReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            kind: UnitKind::decode(r)?,
            remaining: r.read_u16()?,
        })
    }
}

/// A stationary building.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Structure {
    /// Owning house index.
    pub owner: u8,
    /// Archetype.
    pub kind: StructureKind,
    /// Position on the map.
    pub position: FixedVec2,
    /// Remaining health.
    pub health: i32,
    /// Unit under construction.
    pub production: Option<ProductionJob>,
}

impl Structure {
    /// A freshly placed building.
    pub fn new(owner: u8, kind: StructureKind, position: FixedVec2) -> Self {
        Self {
            owner,
            kind,
            position,
            health: kind.max_health(),
            production: None,
        }
    }
}

impl Producer for Structure {
    fn job(&self) -> Option<&ProductionJob> {
        self.production.as_ref()
    }

    fn start(&mut self, kind: UnitKind) -> bool {
        if self.kind != StructureKind::Factory || self.production.is_some() {
            return false;
        }
        self.production = Some(ProductionJob {
            kind,
            remaining: kind.build_ticks(),
        });
        true
    }

    fn advance_job(&mut self) -> Option<UnitKind> {
        let job = self.production.as_mut()?;
        job.remaining = job.remaining.saturating_sub(1);
        if job.remaining == 0 {
            let kind = job.kind;
            self.production = None;
            Some(kind)
        } else {
            None
        }
    }
}

impl Encode for Structure {
    fn encode(&self, w: &mut StreamWriter) {
        w.write_u8(self.owner);
        self.kind.encode(w);
        w.write_vec2(self.position);
        w.write_i32(self.health);
        w.write_option(self.production.as_ref());
    }
}

impl Decode for Structure {
    fn decode(r: &mut StreamReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            owner: r.read_u8()?,
            kind: StructureKind::decode(r)?,
            position: r.read_vec2()?,
            health: r.read_i32()?,
            production: r.read_option()?,
        })
    }
}

/// A shot in flight.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Projectile {
    /// House of the shooter.
    pub owner: u8,
    /// Who fired it. May be gone by impact time.
    pub source: ObjectRef,
    /// What it homes in on. The projectile fizzles once this is gone.
    pub target: ObjectRef,
    /// Position on the map.
    pub position: FixedVec2,
    /// Damage on hit.
    pub damage: i32,
    /// Hit probability.
    pub accuracy: Fixed,
}

impl Movable for Projectile {
    fn position(&self) -> FixedVec2 {
        self.position
    }

    fn speed(&self) -> Fixed {
        PROJECTILE_SPEED
    }

    fn set_position(&mut self, position: FixedVec2) {
        self.position = position;
    }
}

impl Encode for Projectile {
    fn encode(&self, w: &mut StreamWriter) {
        w.write_u8(self.owner);
        self.source.encode(w);
        self.target.encode(w);
        w.write_vec2(self.position);
        w.write_i32(self.damage);
        w.write_fixed(self.accuracy);
    }
}

impl Decode for Projectile {
    fn decode(r: &mut StreamReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            owner: r.read_u8()?,
            source: ObjectRef::decode(r)?,
            target: ObjectRef::decode(r)?,
            position: r.read_vec2()?,
            damage: r.read_i32()?,
            accuracy: r.read_fixed()?,
        })
    }
}

// =============================================================================
// SIM OBJECT
// =============================================================================

/// Any object owned by the registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SimObject {
    /// Mobile combat unit.
    Unit(Unit),
    /// Building.
    Structure(Structure),
    /// Shot in flight.
    Projectile(Projectile),
}

impl SimObject {
    /// Owning house index.
    pub fn owner(&self) -> u8 {
        match self {
            SimObject::Unit(u) => u.owner,
            SimObject::Structure(s) => s.owner,
            SimObject::Projectile(p) => p.owner,
        }
    }

    /// Position on the map.
    pub fn position(&self) -> FixedVec2 {
        match self {
            SimObject::Unit(u) => u.position,
            SimObject::Structure(s) => s.position,
            SimObject::Projectile(p) => p.position,
        }
    }

    /// Remaining health. Projectiles cannot be damaged.
    pub fn health(&self) -> Option<i32> {
        match self {
            SimObject::Unit(u) => Some(u.health),
            SimObject::Structure(s) => Some(s.health),
            SimObject::Projectile(_) => None,
        }
    }

    /// Whether this object can be shot at.
    pub fn is_targetable(&self) -> bool {
        self.health().is_some()
    }

    /// Subtract health. Returns true if the object is now destroyed.
    pub fn apply_damage(&mut self, amount: i32) -> bool {
        let health = match self {
            SimObject::Unit(u) => &mut u.health,
            SimObject::Structure(s) => &mut s.health,
            SimObject::Projectile(_) => return false,
        };
        *health = health.saturating_sub(amount);
        *health <= 0
    }

    /// Short type name for events and logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            SimObject::Unit(_) => "unit",
            SimObject::Structure(_) => "structure",
            SimObject::Projectile(_) => "projectile",
        }
    }

    /// Record tag used in save files.
    pub fn tag(&self) -> u16 {
        match self {
            SimObject::Unit(_) => UNIT_TAG,
            SimObject::Structure(_) => STRUCTURE_TAG,
            SimObject::Projectile(_) => PROJECTILE_TAG,
        }
    }

    /// Movement capability.
    pub fn as_movable_mut(&mut self) -> Option<&mut dyn Movable> {
        match self {
            SimObject::Unit(u) => Some(u),
            SimObject::Projectile(p) => Some(p),
            SimObject::Structure(_) => None,
        }
    }

    /// Weapon capability.
    pub fn as_attacker(&self) -> Option<&dyn Attacker> {
        match self {
            SimObject::Unit(u) => Some(u),
            _ => None,
        }
    }

    /// Mutable weapon capability.
    pub fn as_attacker_mut(&mut self) -> Option<&mut dyn Attacker> {
        match self {
            SimObject::Unit(u) => Some(u),
            _ => None,
        }
    }

    /// Production capability.
    pub fn as_producer_mut(&mut self) -> Option<&mut dyn Producer> {
        match self {
            SimObject::Structure(s) if s.kind == StructureKind::Factory => Some(s),
            _ => None,
        }
    }

    /// Every reference field, for load-time validation.
    pub fn references(&self) -> Vec<&ObjectRef> {
        match self {
            SimObject::Unit(u) => vec![&u.attack_target],
            SimObject::Structure(_) => Vec::new(),
            SimObject::Projectile(p) => vec![&p.source, &p.target],
        }
    }
}

/// Written as a tagged record, so unknown or mis-sized objects are rejected.
impl Encode for SimObject {
    fn encode(&self, w: &mut StreamWriter) {
        w.write_record(self.tag(), |w| match self {
            SimObject::Unit(u) => u.encode(w),
            SimObject::Structure(s) => s.encode(w),
            SimObject::Projectile(p) => p.encode(w),
        });
    }
}

impl Decode for SimObject {
    fn decode(r: &mut StreamReader<'_>) -> Result<Self, CodecError> {
        let (tag, mut body) = r.read_record_header()?;
        let object = match tag {
            UNIT_TAG => SimObject::Unit(Unit::decode(&mut body)?),
            STRUCTURE_TAG => SimObject::Structure(Structure::decode(&mut body)?),
            PROJECTILE_TAG => SimObject::Projectile(Projectile::decode(&mut body)?),
            other => {
                return Err(CodecError::UnknownTag {
                    context: "object",
                    tag: other,
                })
            }
        };
        body.finish("object record")?;
        Ok(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{decode_from_slice, encode_to_vec};
    use crate::world::id::ObjectId;

    #[test]
    fn test_unit_moves_and_arrives() {
        let mut unit = Unit::new(0, UnitKind::Tank, FixedVec2::ZERO);
        let target = FixedVec2::from_ints(1, 0);

        let mut arrived = false;
        for _ in 0..10 {
            if unit.step_toward(target) {
                arrived = true;
                break;
            }
        }
        assert!(arrived);
        assert_eq!(unit.position, target);
    }

    #[test]
    fn test_fire_rolls_within_spread() {
        let mut rng = DeterministicRng::new(5);
        let mut unit = Unit::new(0, UnitKind::Artillery, FixedVec2::ZERO);
        assert!(unit.weapon_ready());

        let shot = unit.fire(&mut rng);
        assert!(!unit.weapon_ready());
        assert!(shot.damage >= 25 && shot.damage <= 35);

        for _ in 0..UnitKind::Artillery.cooldown() {
            unit.reload();
        }
        assert!(unit.weapon_ready());
    }

    #[test]
    fn test_factory_production() {
        let mut factory = Structure::new(1, StructureKind::Factory, FixedVec2::ZERO);
        assert!(factory.start(UnitKind::Infantry));
        assert!(!factory.start(UnitKind::Tank));

        let mut finished = None;
        for _ in 0..UnitKind::Infantry.build_ticks() {
            finished = factory.advance_job();
        }
        assert_eq!(finished, Some(UnitKind::Infantry));
        assert!(factory.job().is_none());

        let mut refinery = SimObject::Structure(Structure::new(1, StructureKind::Refinery, FixedVec2::ZERO));
        assert!(refinery.as_producer_mut().is_none());
    }

    #[test]
    fn test_damage() {
        let mut obj = SimObject::Unit(Unit::new(0, UnitKind::Infantry, FixedVec2::ZERO));
        assert!(!obj.apply_damage(10));
        assert_eq!(obj.health(), Some(40));
        assert!(obj.apply_damage(40));
    }

    #[test]
    fn test_object_records_round_trip() {
        let mut unit = Unit::new(2, UnitKind::Tank, FixedVec2::from_ints(-3, 7));
        unit.destination = Some(FixedVec2::from_ints(10, 10));
        unit.attack_target.set(ObjectId::from_raw(9));
        unit.cooldown = 4;

        let mut factory = Structure::new(1, StructureKind::Factory, FixedVec2::from_ints(5, 5));
        factory.start(UnitKind::Artillery);

        let projectile = Projectile {
            owner: 0,
            source: ObjectRef::new(ObjectId::from_raw(3)),
            target: ObjectRef::none(),
            position: FixedVec2::from_ints(1, 1),
            damage: 12,
            accuracy: FIXED_ONE / 2,
        };

        for object in [
            SimObject::Unit(unit),
            SimObject::Structure(factory),
            SimObject::Projectile(projectile),
        ] {
            let bytes = encode_to_vec(&object);
            assert_eq!(decode_from_slice::<SimObject>(&bytes).unwrap(), object);
        }
    }

    #[test]
    fn test_unknown_object_tag() {
        let mut w = StreamWriter::new();
        w.write_record(42, |w| w.write_u8(0));
        let err = decode_from_slice::<SimObject>(&w.into_bytes()).unwrap_err();
        assert_eq!(err, CodecError::UnknownTag { context: "object", tag: 42 });
    }

    #[test]
    fn test_bad_unit_kind() {
        let unit = SimObject::Unit(Unit::new(0, UnitKind::Infantry, FixedVec2::ZERO));
        let mut bytes = encode_to_vec(&unit);
        // tag u16 + len u32 + owner u8, then the kind byte
        bytes[7] = 9;
        let err = decode_from_slice::<SimObject>(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::UnknownTag { context: "unit kind", tag: 9 }));
    }
}

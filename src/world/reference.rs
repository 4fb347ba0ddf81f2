//! Weak object references.
//!
//! An [`ObjectRef`] stores nothing but an id. Every access goes back through
//! the [`ObjectRegistry`], and the first failed lookup rewrites the stored id
//! to NONE so later lookups short-circuit. Releasing an object therefore
//! never needs to find the references pointing at it.

use std::cell::Cell;

use serde::{Deserialize, Serialize};

use super::id::ObjectId;
use super::object::SimObject;
use super::registry::ObjectRegistry;
use crate::stream::{CodecError, Decode, Encode, StreamReader, StreamWriter};

/// Non-owning, self-healing link to a simulation object.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    id: Cell<ObjectId>,
}

impl ObjectRef {
    /// A reference to nothing.
    pub fn none() -> Self {
        Self::default()
    }

    /// A reference to `id`. Nothing is checked until the first resolve.
    pub fn new(id: ObjectId) -> Self {
        Self { id: Cell::new(id) }
    }

    /// Stored id. May name an object that has since been released.
    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id.get()
    }

    /// Whether the reference has been cleared (or never set).
    #[inline]
    pub fn is_none(&self) -> bool {
        self.id.get().is_none()
    }

    /// Point at another object.
    pub fn set(&self, id: ObjectId) {
        self.id.set(id);
    }

    /// Drop the link.
    pub fn clear(&self) {
        self.id.set(ObjectId::NONE);
    }

    /// Look the referent up, clearing the reference if it is gone.
    ///
    /// # Panics
    ///
    /// Panics if the stored id was never allocated by `registry`: the
    /// reference belongs to a different world.
    pub fn resolve<'r>(&self, registry: &'r ObjectRegistry) -> Option<&'r SimObject> {
        let id = self.live_id(registry)?;
        let found = registry.get(id);
        if found.is_none() {
            self.clear();
        }
        found
    }

    /// Mutable variant of [`resolve`](Self::resolve).
    pub fn resolve_mut<'r>(&self, registry: &'r mut ObjectRegistry) -> Option<&'r mut SimObject> {
        let id = self.live_id(registry)?;
        if !registry.contains(id) {
            self.clear();
            return None;
        }
        registry.get_mut(id)
    }

    fn live_id(&self, registry: &ObjectRegistry) -> Option<ObjectId> {
        let id = self.id.get();
        if id.is_none() {
            return None;
        }
        assert!(
            id < registry.next_id(),
            "reference to {} was not allocated by this registry (next id {})",
            id,
            registry.next_id()
        );
        Some(id)
    }
}

impl std::fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectRef({})", self.id.get())
    }
}

impl From<ObjectId> for ObjectRef {
    fn from(id: ObjectId) -> Self {
        Self::new(id)
    }
}

/// Saved as the raw id, NONE included.
impl Encode for ObjectRef {
    fn encode(&self, w: &mut StreamWriter) {
        self.id.get().encode(w);
    }
}

/// Loaded without resolving: the referent may not be decoded yet.
impl Decode for ObjectRef {
    fn decode(r: &mut StreamReader<'_>) -> Result<Self, CodecError> {
        Ok(Self::new(ObjectId::decode(r)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::vec2::FixedVec2;
    use crate::stream::{decode_from_slice, encode_to_vec};
    use crate::world::object::{Unit, UnitKind};

    fn infantry() -> SimObject {
        SimObject::Unit(Unit::new(0, UnitKind::Infantry, FixedVec2::ZERO))
    }

    #[test]
    fn test_resolve_live_object() {
        let mut registry = ObjectRegistry::new();
        let id = registry.register(infantry()).unwrap();
        let r = ObjectRef::new(id);

        assert!(r.resolve(&registry).is_some());
        assert_eq!(r.id(), id);
    }

    #[test]
    fn test_self_heals_after_release() {
        let mut registry = ObjectRegistry::new();
        let id = registry.register(infantry()).unwrap();
        let a = ObjectRef::new(id);
        let b = a.clone();

        registry.release(id);

        assert!(a.resolve(&registry).is_none());
        assert!(a.is_none());
        // Idempotent.
        assert!(a.resolve(&registry).is_none());

        // A copy heals independently, on its own next access.
        assert_eq!(b.id(), id);
        assert!(b.resolve_mut(&mut registry).is_none());
        assert!(b.is_none());
    }

    #[test]
    fn test_released_id_not_reused() {
        let mut registry = ObjectRegistry::new();
        let id = registry.register(infantry()).unwrap();
        let r = ObjectRef::new(id);
        registry.release(id);

        let other = registry.register(infantry()).unwrap();
        assert_ne!(other, id);
        assert!(r.resolve(&registry).is_none());
    }

    #[test]
    fn test_none_short_circuits() {
        let registry = ObjectRegistry::new();
        assert!(ObjectRef::none().resolve(&registry).is_none());
    }

    #[test]
    #[should_panic(expected = "was not allocated by this registry")]
    fn test_foreign_reference_is_contract_violation() {
        let registry = ObjectRegistry::new();
        ObjectRef::new(ObjectId::from_raw(40)).resolve(&registry);
    }

    #[test]
    fn test_codec_keeps_raw_id() {
        let r = ObjectRef::new(ObjectId::from_raw(77));
        let bytes = encode_to_vec(&r);
        assert_eq!(bytes, 77u32.to_le_bytes());
        assert_eq!(decode_from_slice::<ObjectRef>(&bytes).unwrap().id(), ObjectId::from_raw(77));

        let none = encode_to_vec(&ObjectRef::none());
        assert!(decode_from_slice::<ObjectRef>(&none).unwrap().is_none());
    }
}

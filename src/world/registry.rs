//! Object Registry
//!
//! The registry is the only owner of simulation objects. Live objects are
//! kept in an ordered map keyed by id, next to a monotonic `next_id`
//! counter. Released ids simply leave the map; the counter never moves
//! back, so an id is never handed out twice and memory follows the number
//! of live objects rather than the number ever created.

use std::collections::BTreeMap;

use tracing::warn;

use super::id::{ObjectId, ID_LIMIT};
use super::object::SimObject;

/// Owner of every live simulation object.
#[derive(Clone, Debug)]
pub struct ObjectRegistry {
    objects: BTreeMap<ObjectId, SimObject>,
    next_id: ObjectId,
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self {
            objects: BTreeMap::new(),
            next_id: ObjectId::FIRST,
        }
    }
}

impl ObjectRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from decoded records.
    ///
    /// Every id in `objects` must be below `next_id`. Callers validate
    /// untrusted input first; see `world::save`.
    pub(crate) fn from_parts(next_id: ObjectId, objects: Vec<(ObjectId, SimObject)>) -> Self {
        Self {
            objects: objects.into_iter().collect(),
            next_id,
        }
    }

    /// Take ownership of `object` and return its new handle.
    ///
    /// Returns `None` once every id below [`ID_LIMIT`] has been used. The
    /// outcome only depends on the registry, so all peers refuse alike.
    pub fn register(&mut self, object: SimObject) -> Option<ObjectId> {
        let id = self.next_id;
        if id.raw() >= ID_LIMIT {
            warn!(next_id = id.raw(), "object id space exhausted");
            return None;
        }
        self.next_id = id.successor()?;
        self.objects.insert(id, object);
        Some(id)
    }

    /// The live object behind `id`.
    pub fn get(&self, id: ObjectId) -> Option<&SimObject> {
        self.objects.get(&id)
    }

    /// Mutable access to the live object behind `id`.
    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut SimObject> {
        self.objects.get_mut(&id)
    }

    /// Whether `id` names a live object.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Destroy the object behind `id` and return it.
    ///
    /// Releasing an unknown or already released id is a no-op.
    pub fn release(&mut self, id: ObjectId) -> Option<SimObject> {
        self.objects.remove(&id)
    }

    /// Id the next `register` call will return.
    pub fn next_id(&self) -> ObjectId {
        self.next_id
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether no object is alive.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Live objects in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, &SimObject)> {
        self.objects.iter().map(|(&id, object)| (id, object))
    }

    /// Snapshot of live ids, for loops that mutate the registry.
    pub fn ids(&self) -> Vec<ObjectId> {
        self.objects.keys().copied().collect()
    }
}

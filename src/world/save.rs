//! Save Files and Resync Payloads
//!
//! One encoding serves both: a late joiner receives exactly what a save file
//! would contain.
//!
//! ## Layout
//!
//! ```text
//! header        magic "RTSS", version u16
//! tick          u32
//! random state  37-byte block (flag, core words, pending word)
//! next id       u32
//! objects       count u32, then per object: id u32, tagged record
//! houses        count u32, then tagged house records
//! ```
//!
//! Loading is all-or-nothing: the decoder builds a fresh [`Simulation`] and
//! only hands it over once every section has been validated.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::core::rng::{DeterministicRng, RandomState};
use crate::stream::{
    CodecError, Decode, Encode, StreamReader, StreamWriter, FORMAT_VERSION, WORLD_MAGIC,
};

use super::house::HouseState;
use super::id::ObjectId;
use super::object::SimObject;
use super::registry::ObjectRegistry;
use super::sim::Simulation;

/// Smallest possible encoded object: id plus an empty record header.
const MIN_OBJECT_BYTES: usize = 4 + 2 + 4;

/// Smallest possible encoded house record.
const MIN_HOUSE_BYTES: usize = 2 + 4;

/// Why a save could not be written or read.
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    /// The file system failed.
    #[error("save file I/O failed: {0}")]
    Io(#[from] io::Error),

    /// The bytes are not a valid world encoding.
    #[error("cannot load: {0}")]
    Format(#[from] CodecError),
}

/// Encode the whole world.
pub fn encode_world(sim: &Simulation) -> Vec<u8> {
    let mut w = StreamWriter::with_capacity(64 + sim.registry.len() * 48);
    write_world(sim, &mut w);
    w.into_bytes()
}

/// Append the world encoding to `w`.
pub fn write_world(sim: &Simulation, w: &mut StreamWriter) {
    w.write_header(&WORLD_MAGIC, FORMAT_VERSION);
    w.write_u32(sim.tick);
    sim.rng.state().encode(w);
    sim.registry.next_id().encode(w);

    w.write_u32(sim.registry.len() as u32);
    for (id, object) in sim.registry.iter() {
        id.encode(w);
        object.encode(w);
    }

    w.write_u32(sim.houses.len() as u32);
    for house in &sim.houses {
        house.encode(w);
    }
}

/// Decode a world encoding that must span the whole buffer.
pub fn decode_world(bytes: &[u8]) -> Result<Simulation, CodecError> {
    let mut r = StreamReader::new(bytes);
    let sim = read_world(&mut r)?;
    r.finish("world")?;
    Ok(sim)
}

/// Read one world encoding from `r`.
pub fn read_world(r: &mut StreamReader<'_>) -> Result<Simulation, CodecError> {
    r.read_header(&WORLD_MAGIC, FORMAT_VERSION)?;
    let tick = r.read_u32()?;
    let rng = DeterministicRng::from_state(RandomState::decode(r)?);

    let next_id = ObjectId::decode(r)?;
    if next_id.is_none() {
        return Err(CodecError::invalid("world", format!("next object id {}", next_id.raw())));
    }

    let count = r.read_count(MIN_OBJECT_BYTES)?;
    let mut objects: Vec<(ObjectId, SimObject)> = Vec::with_capacity(count);
    for _ in 0..count {
        let id = ObjectId::decode(r)?;
        let object = SimObject::decode(r)?;
        check_object(id, &object, next_id, objects.last().map(|(prev, _)| *prev))?;
        objects.push((id, object));
    }

    let house_count = r.read_count(MIN_HOUSE_BYTES)?;
    if house_count > 256 {
        return Err(CodecError::invalid("world", format!("{} houses", house_count)));
    }
    let mut houses = Vec::with_capacity(house_count);
    for index in 0..house_count {
        let house = HouseState::decode(r)?;
        if house.index as usize != index {
            return Err(CodecError::invalid(
                "house",
                format!("index {} stored at position {}", house.index, index),
            ));
        }
        houses.push(house);
    }

    if let Some((id, object)) = objects.iter().find(|(_, o)| o.owner() as usize >= house_count) {
        return Err(CodecError::invalid(
            "object",
            format!("{} owned by missing house {}", id, object.owner()),
        ));
    }

    let registry = ObjectRegistry::from_parts(next_id, objects);
    Ok(Simulation::from_parts(tick, rng, registry, houses))
}

fn check_object(
    id: ObjectId,
    object: &SimObject,
    next_id: ObjectId,
    previous: Option<ObjectId>,
) -> Result<(), CodecError> {
    if id.is_none() || id >= next_id {
        return Err(CodecError::invalid("object", format!("id {} outside allocated range", id.raw())));
    }
    if previous.map_or(false, |prev| id <= prev) {
        return Err(CodecError::invalid("object", format!("id {} duplicated or out of order", id)));
    }
    if let Some(bad) = object.references().into_iter().find(|r| r.id() >= next_id) {
        return Err(CodecError::invalid(
            "object",
            format!("{} references unallocated id {}", id, bad.id().raw()),
        ));
    }
    Ok(())
}

/// Write a save file atomically (temp file, then rename).
pub fn save_to_file(sim: &Simulation, path: impl AsRef<Path>) -> Result<(), SaveError> {
    let path = path.as_ref();
    let tmp = temp_path(path);
    fs::write(&tmp, encode_world(sim))?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Read and decode a save file.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<Simulation, SaveError> {
    let bytes = fs::read(path)?;
    Ok(decode_world(&bytes)?)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

// =============================================================================
// TESTS
// =============================================================================

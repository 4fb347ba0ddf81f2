//! Per-player bookkeeping.

use serde::{Deserialize, Serialize};

use crate::stream::{CodecError, Decode, Encode, StreamReader, StreamWriter};

/// Record tag of a house.
pub const HOUSE_TAG: u16 = 16;

/// Credits every house starts with.
pub const STARTING_CREDITS: u32 = 1000;

/// Longest accepted house name, in bytes.
pub const MAX_NAME_BYTES: usize = 32;

/// State of one player's faction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HouseState {
    /// Player index; also the owner value on objects.
    pub index: u8,
    /// Display name.
    pub name: String,
    /// Spendable credits.
    pub credits: u32,
    /// Units finished by this house's factories.
    pub units_built: u32,
    /// Units destroyed.
    pub units_lost: u32,
    /// No units or structures left.
    pub defeated: bool,
}

impl HouseState {
    /// A fresh house with starting credits.
    pub fn new(index: u8, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            credits: STARTING_CREDITS,
            units_built: 0,
            units_lost: 0,
            defeated: false,
        }
    }

    /// Deduct `amount` if affordable.
    pub fn try_spend(&mut self, amount: u32) -> bool {
        match self.credits.checked_sub(amount) {
            Some(rest) => {
                self.credits = rest;
                true
            }
            None => false,
        }
    }
}

impl Encode for HouseState {
    fn encode(&self, w: &mut StreamWriter) {
        w.write_record(HOUSE_TAG, |w| {
            w.write_u8(self.index);
            w.write_str(&self.name);
            w.write_u32(self.credits);
            w.write_u32(self.units_built);
            w.write_u32(self.units_lost);
            w.write_bool(self.defeated);
        });
    }
}

impl Decode for HouseState {
    fn decode(r: &mut StreamReader<'_>) -> Result<Self, CodecError> {
        r.read_record(HOUSE_TAG, |r| {
            let index = r.read_u8()?;
            let name = r.read_str()?;
            if name.len() > MAX_NAME_BYTES {
                return Err(CodecError::invalid("house", "name too long"));
            }
            Ok(Self {
                index,
                name,
                credits: r.read_u32()?,
                units_built: r.read_u32()?,
                units_lost: r.read_u32()?,
                defeated: r.read_bool()?,
            })
        })
    }
}

//! Object handles.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::stream::{CodecError, Decode, Encode, StreamReader, StreamWriter};

/// Exclusive upper bound on allocated ids.
///
/// Once `next_id` reaches it the registry refuses new objects instead of
/// wrapping around to ids that may still be referenced.
pub const ID_LIMIT: u32 = u32::MAX;

/// Opaque handle to a simulation object.
///
/// Ids are allocated from 1 upwards and never reused. `0` is the
/// [`ObjectId::NONE`] sentinel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(u32);

impl ObjectId {
    /// "No object".
    pub const NONE: Self = Self(0);

    /// First id handed out by a fresh registry.
    pub const FIRST: Self = Self(1);

    /// Wrap a raw id, e.g. one read from a command payload.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw integer value.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether this is the NONE sentinel.
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Whether this names an object (live or not).
    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != 0
    }

    /// The id allocated after this one, or `None` on overflow.
    #[inline]
    pub(crate) fn successor(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "ObjectId(NONE)")
        } else {
            write!(f, "ObjectId({})", self.0)
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

impl Encode for ObjectId {
    fn encode(&self, w: &mut StreamWriter) {
        w.write_u32(self.0);
    }
}

impl Decode for ObjectId {
    fn decode(r: &mut StreamReader<'_>) -> Result<Self, CodecError> {
        Ok(Self(r.read_u32()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_sentinel() {
        assert!(ObjectId::NONE.is_none());
        assert_eq!(ObjectId::default(), ObjectId::NONE);
        assert_eq!(ObjectId::FIRST.successor(), Some(ObjectId::from_raw(2)));
        assert_eq!(ObjectId::from_raw(ID_LIMIT - 1).successor(), Some(ObjectId::from_raw(ID_LIMIT)));
        assert_eq!(ObjectId::from_raw(ID_LIMIT).successor(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(ObjectId::NONE.to_string(), "none");
        assert_eq!(ObjectId::from_raw(12).to_string(), "#12");
    }
}

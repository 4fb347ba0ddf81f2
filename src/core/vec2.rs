//! Fixed-Point 2D Vector
//!
//! Map positions and movement steps for simulation objects.

use std::fmt;
use serde::{Serialize, Deserialize};

use super::fixed::{
    Fixed, FIXED_SCALE,
    fixed_mul, fixed_div, fixed_sqrt, fixed_clamp, to_float,
    MAP_HALF_EXTENT,
};

/// 2D vector with fixed-point components.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FixedVec2 {
    /// X component (Q16.16 fixed-point)
    pub x: Fixed,
    /// Y component (Q16.16 fixed-point)
    pub y: Fixed,
}

impl FixedVec2 {
    /// Zero vector
    pub const ZERO: Self = Self { x: 0, y: 0 };

    /// Create a new vector from fixed-point components.
    #[inline]
    pub const fn new(x: Fixed, y: Fixed) -> Self {
        Self { x, y }
    }

    /// Create a vector from whole map cells.
    #[inline]
    pub const fn from_ints(x: i32, y: i32) -> Self {
        Self {
            x: x << FIXED_SCALE,
            y: y << FIXED_SCALE,
        }
    }

    /// Add another vector.
    #[inline]
    pub fn add(self, other: Self) -> Self {
        Self {
            x: self.x.wrapping_add(other.x),
            y: self.y.wrapping_add(other.y),
        }
    }

    /// Subtract another vector.
    #[inline]
    pub fn sub(self, other: Self) -> Self {
        Self {
            x: self.x.wrapping_sub(other.x),
            y: self.y.wrapping_sub(other.y),
        }
    }

    /// Scale by a fixed-point scalar.
    #[inline]
    pub fn scale(self, scalar: Fixed) -> Self {
        Self {
            x: fixed_mul(self.x, scalar),
            y: fixed_mul(self.y, scalar),
        }
    }

    /// Squared distance to another point.
    ///
    /// Computed in i64 so map-scale distances do not overflow.
    #[inline]
    pub fn distance_squared_wide(self, other: Self) -> i64 {
        let dx = self.x.wrapping_sub(other.x) as i64;
        let dy = self.y.wrapping_sub(other.y) as i64;
        (dx * dx + dy * dy) >> FIXED_SCALE
    }

    /// Whether `other` lies within `radius` of this point.
    #[inline]
    pub fn within(self, other: Self, radius: Fixed) -> bool {
        let r = radius as i64;
        self.distance_squared_wide(other) <= (r * r) >> FIXED_SCALE
    }

    /// Distance to another point.
    #[inline]
    pub fn distance(self, other: Self) -> Fixed {
        let sq = self.distance_squared_wide(other);
        fixed_sqrt(sq.min(i32::MAX as i64) as Fixed)
    }

    /// Move toward `target` by at most `step`, landing exactly on it when close.
    pub fn step_toward(self, target: Self, step: Fixed) -> Self {
        let dist = self.distance(target);
        if dist <= step || dist == 0 {
            return target;
        }
        let delta = target.sub(self);
        let ratio = fixed_div(step, dist);
        self.add(delta.scale(ratio))
    }

    /// Clamp to map bounds.
    #[inline]
    pub fn clamp_to_map(self) -> Self {
        Self {
            x: fixed_clamp(self.x, -MAP_HALF_EXTENT, MAP_HALF_EXTENT),
            y: fixed_clamp(self.y, -MAP_HALF_EXTENT, MAP_HALF_EXTENT),
        }
    }

    /// Check if position is within map bounds.
    #[inline]
    pub fn is_on_map(self) -> bool {
        self.x >= -MAP_HALF_EXTENT
            && self.x <= MAP_HALF_EXTENT
            && self.y >= -MAP_HALF_EXTENT
            && self.y <= MAP_HALF_EXTENT
    }

    /// Convert to floats for rendering collaborators.
    pub fn to_floats(self) -> (f32, f32) {
        (to_float(self.x), to_float(self.y))
    }
}

impl fmt::Debug for FixedVec2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (x, y) = self.to_floats();
        write!(f, "({:.3}, {:.3})", x, y)
    }
}

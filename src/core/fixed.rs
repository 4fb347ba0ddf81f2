//! Q16.16 Fixed-Point Arithmetic
//!
//! Every quantity that feeds the simulation (positions, speeds, ranges) is a
//! Q16.16 integer. Peers on different CPUs must agree bit-for-bit, so the
//! tick code never touches `f32`/`f64`.
//!
//! ```text
//! [S][IIIIIIIIIIIIIII][FFFFFFFFFFFFFFFF]
//!     15 bit integer    16 bit fraction
//! ```

/// Q16.16 fixed-point number stored as i32.
pub type Fixed = i32;

/// Number of fractional bits (16)
pub const FIXED_SCALE: i32 = 16;

/// 1.0 in fixed-point (65536)
pub const FIXED_ONE: Fixed = 1 << FIXED_SCALE;

/// 0.5 in fixed-point (32768)
pub const FIXED_HALF: Fixed = FIXED_ONE >> 1;

/// Half extent of the playable map: 64.0 cells in each direction.
pub const MAP_HALF_EXTENT: Fixed = 64 * FIXED_ONE;

/// Convert a compile-time float to fixed-point.
///
/// Only for constants and test fixtures, never inside a tick.
///
/// ```
/// use rts_lockstep::core::fixed::{to_fixed, FIXED_ONE};
/// const RANGE: i32 = to_fixed(2.5);
/// assert_eq!(RANGE, FIXED_ONE * 2 + FIXED_ONE / 2);
/// ```
#[inline]
pub const fn to_fixed(f: f64) -> Fixed {
    (f * (FIXED_ONE as f64)) as Fixed
}

/// Convert fixed-point to float for display.
#[inline]
pub fn to_float(f: Fixed) -> f32 {
    f as f32 / FIXED_ONE as f32
}

/// Build a fixed-point value from a whole number.
#[inline]
pub const fn from_int(i: i32) -> Fixed {
    i << FIXED_SCALE
}

/// Multiply two fixed-point numbers through an i64 intermediate.
#[inline]
pub fn fixed_mul(a: Fixed, b: Fixed) -> Fixed {
    let wide = (a as i64) * (b as i64);
    (wide >> FIXED_SCALE) as Fixed
}

/// Divide two fixed-point numbers. Division by zero yields 0.
#[inline]
pub fn fixed_div(a: Fixed, b: Fixed) -> Fixed {
    if b == 0 {
        return 0;
    }
    let wide = (a as i64) << FIXED_SCALE;
    (wide / b as i64) as Fixed
}

/// Square root by Newton-Raphson with a fixed iteration count.
///
/// Non-positive inputs return 0.
#[inline]
pub fn fixed_sqrt(x: Fixed) -> Fixed {
    if x <= 0 {
        return 0;
    }

    let mut guess = (x >> 1).max(1);
    for _ in 0..12 {
        let div = fixed_div(x, guess);
        guess = (guess.wrapping_add(div)) >> 1;
        if guess == 0 {
            guess = 1;
        }
    }

    guess
}

/// Clamp a fixed-point number to a range.
#[inline]
pub fn fixed_clamp(value: Fixed, min: Fixed, max: Fixed) -> Fixed {
    value.max(min).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_constants() {
        assert_eq!(FIXED_ONE, 65536);
        assert_eq!(FIXED_HALF, 32768);
        assert_eq!(from_int(64), MAP_HALF_EXTENT);
    }

    #[test]
    fn test_fixed_mul_div() {
        assert_eq!(fixed_mul(to_fixed(2.0), to_fixed(3.0)), to_fixed(6.0));
        assert_eq!(fixed_mul(to_fixed(-2.0), to_fixed(3.0)), to_fixed(-6.0));
        assert_eq!(fixed_div(to_fixed(6.0), to_fixed(2.0)), to_fixed(3.0));
        assert_eq!(fixed_div(FIXED_ONE, 0), 0);
    }

    #[test]
    fn test_fixed_sqrt() {
        let result = fixed_sqrt(to_fixed(16.0));
        assert!((result - to_fixed(4.0)).abs() < 64, "sqrt(16) should be ~4.0");
        assert_eq!(fixed_sqrt(0), 0);
        assert_eq!(fixed_sqrt(-FIXED_ONE), 0);
    }

    #[test]
    fn test_fixed_clamp() {
        assert_eq!(fixed_clamp(to_fixed(5.0), 0, FIXED_ONE), FIXED_ONE);
        assert_eq!(fixed_clamp(to_fixed(-5.0), 0, FIXED_ONE), 0);
    }
}

//! State Stream Codec
//!
//! A small binary format used for everything that must be byte-identical
//! between peers: save files, resync payloads and network frames.
//!
//! ## Format
//!
//! ```text
//! header   := magic[4] version:u16
//! integers := little-endian, fixed width
//! bool     := 0x00 | 0x01
//! text     := len:u32 utf8[len]
//! record   := tag:u16 len:u32 body[len]
//! ```
//!
//! Encoding is a pure function of the value, so hashing an encoding is a
//! valid way to compare state between processes. Decoding is a pure function
//! of the bytes and the schema: any inconsistency is a [`CodecError`], never
//! a partially built value.

pub mod error;
pub mod reader;
pub mod writer;

pub use error::CodecError;
pub use reader::StreamReader;
pub use writer::StreamWriter;

use crate::core::rng::{RandomState, STATE_BYTES};
use crate::core::vec2::FixedVec2;

/// Magic bytes of world-state encodings (save files, resync payloads).
pub const WORLD_MAGIC: [u8; 4] = *b"RTSS";

/// Magic bytes of network frames.
pub const NET_MAGIC: [u8; 4] = *b"RTSN";

/// Current format version. Bump on any layout change.
pub const FORMAT_VERSION: u16 = 1;

/// A value with a canonical encoding.
pub trait Encode {
    /// Append this value to `w`.
    fn encode(&self, w: &mut StreamWriter);
}

/// A value that can be rebuilt from its canonical encoding.
pub trait Decode: Sized {
    /// Read one value from `r`.
    fn decode(r: &mut StreamReader<'_>) -> Result<Self, CodecError>;
}

/// Encode a single value into a fresh buffer.
pub fn encode_to_vec<T: Encode + ?Sized>(value: &T) -> Vec<u8> {
    let mut w = StreamWriter::new();
    value.encode(&mut w);
    w.into_bytes()
}

/// Decode a single value that must span the whole buffer.
pub fn decode_from_slice<T: Decode>(bytes: &[u8]) -> Result<T, CodecError> {
    let mut r = StreamReader::new(bytes);
    let value = T::decode(&mut r)?;
    r.finish("value")?;
    Ok(value)
}

// =============================================================================
// PRIMITIVE IMPLS
// =============================================================================

macro_rules! impl_int_codec {
    ($($ty:ty => $write:ident, $read:ident;)*) => {
        $(
            impl Encode for $ty {
                fn encode(&self, w: &mut StreamWriter) {
                    w.$write(*self);
                }
            }

            impl Decode for $ty {
                fn decode(r: &mut StreamReader<'_>) -> Result<Self, CodecError> {
                    r.$read()
                }
            }
        )*
    };
}

impl_int_codec! {
    u8 => write_u8, read_u8;
    u16 => write_u16, read_u16;
    u32 => write_u32, read_u32;
    u64 => write_u64, read_u64;
    i32 => write_i32, read_i32;
    i64 => write_i64, read_i64;
    bool => write_bool, read_bool;
}

impl Encode for str {
    fn encode(&self, w: &mut StreamWriter) {
        w.write_str(self);
    }
}

impl Encode for String {
    fn encode(&self, w: &mut StreamWriter) {
        w.write_str(self);
    }
}

impl Decode for String {
    fn decode(r: &mut StreamReader<'_>) -> Result<Self, CodecError> {
        r.read_str()
    }
}

impl Encode for FixedVec2 {
    fn encode(&self, w: &mut StreamWriter) {
        w.write_vec2(*self);
    }
}

impl Decode for FixedVec2 {
    fn decode(r: &mut StreamReader<'_>) -> Result<Self, CodecError> {
        r.read_vec2()
    }
}

/// Random state is stored as its fixed-size block.
impl Encode for RandomState {
    fn encode(&self, w: &mut StreamWriter) {
        w.write_raw(&self.to_block());
    }
}

/// Decoding validates what `DeterministicRng::from_state_bytes` asserts, so
/// a corrupt block becomes a format error instead of a panic.
impl Decode for RandomState {
    fn decode(r: &mut StreamReader<'_>) -> Result<Self, CodecError> {
        let mut block = [0u8; STATE_BYTES];
        block.copy_from_slice(r.take(STATE_BYTES)?);
        let (flag, core, word) = RandomState::split_block(&block);

        let has_pending = match flag {
            0 => false,
            1 => true,
            other => return Err(CodecError::InvalidBool(other)),
        };
        if !has_pending && word != 0 {
            return Err(CodecError::invalid("random state", "pending word set without flag"));
        }

        let state = RandomState {
            core,
            pending: has_pending.then_some(word),
        };
        if !state.is_valid() {
            return Err(CodecError::invalid("random state", "core state is all zero"));
        }
        Ok(state)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rng::DeterministicRng;
    use proptest::prelude::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_primitives_little_endian() {
        let mut w = StreamWriter::new();
        w.write_u16(0x0102);
        w.write_u32(0x03040506);
        w.write_i32(-1);
        w.write_bool(true);
        assert_eq!(
            w.as_bytes(),
            &[0x02, 0x01, 0x06, 0x05, 0x04, 0x03, 0xff, 0xff, 0xff, 0xff, 0x01]
        );
    }

    #[test]
    fn test_header_checks() {
        let mut w = StreamWriter::new();
        w.write_header(&WORLD_MAGIC, FORMAT_VERSION);
        let bytes = w.into_bytes();

        assert!(StreamReader::new(&bytes).read_header(&WORLD_MAGIC, FORMAT_VERSION).is_ok());

        let err = StreamReader::new(&bytes).read_header(&NET_MAGIC, FORMAT_VERSION).unwrap_err();
        assert!(matches!(err, CodecError::BadMagic { .. }));

        let err = StreamReader::new(&bytes).read_header(&WORLD_MAGIC, FORMAT_VERSION + 1).unwrap_err();
        assert_eq!(
            err,
            CodecError::VersionMismatch {
                expected: FORMAT_VERSION + 1,
                found: FORMAT_VERSION
            }
        );
    }

    #[test]
    fn test_nested_records() {
        let mut w = StreamWriter::new();
        w.write_record(7, |w| {
            w.write_u32(42);
            w.write_record(8, |w| w.write_str("inner"));
        });
        let bytes = w.into_bytes();

        let mut r = StreamReader::new(&bytes);
        let (a, s) = r
            .read_record(7, |r| {
                let a = r.read_u32()?;
                let s = r.read_record(8, |r| r.read_str())?;
                Ok((a, s))
            })
            .unwrap();
        assert_eq!(a, 42);
        assert_eq!(s, "inner");
        assert!(r.is_empty());
    }

    #[test]
    fn test_record_tag_mismatch() {
        let mut w = StreamWriter::new();
        w.write_record(1, |w| w.write_u8(0));
        let bytes = w.into_bytes();

        let err = StreamReader::new(&bytes).read_record(2, |r| r.read_u8()).unwrap_err();
        assert_eq!(err, CodecError::UnexpectedTag { expected: 2, found: 1 });
    }

    #[test]
    fn test_record_body_must_be_consumed() {
        let mut w = StreamWriter::new();
        w.write_record(1, |w| {
            w.write_u8(1);
            w.write_u8(2);
        });
        let bytes = w.into_bytes();

        let err = StreamReader::new(&bytes).read_record(1, |r| r.read_u8()).unwrap_err();
        assert!(matches!(err, CodecError::TrailingBytes { count: 1, .. }));
    }

    #[test]
    fn test_record_cannot_read_past_body() {
        let mut w = StreamWriter::new();
        w.write_record(1, |w| w.write_u8(9));
        w.write_u32(0xdeadbeef);
        let bytes = w.into_bytes();

        let err = StreamReader::new(&bytes).read_record(1, |r| r.read_u32()).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut w = StreamWriter::new();
        w.write_u32(u32::MAX);
        w.write_raw(b"abc");
        let bytes = w.into_bytes();

        let err = StreamReader::new(&bytes).read_bytes().unwrap_err();
        assert!(matches!(err, CodecError::Truncated { needed, remaining: 3 } if needed == u32::MAX as usize));

        let err = StreamReader::new(&bytes).read_seq::<u64>().unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn test_invalid_bool_and_utf8() {
        assert_eq!(
            StreamReader::new(&[2]).read_bool().unwrap_err(),
            CodecError::InvalidBool(2)
        );

        let mut w = StreamWriter::new();
        w.write_bytes(&[0xff, 0xfe]);
        let bytes = w.into_bytes();
        assert_eq!(StreamReader::new(&bytes).read_str().unwrap_err(), CodecError::InvalidUtf8);
    }

    #[test]
    fn test_decode_from_slice_rejects_trailing() {
        let mut bytes = encode_to_vec(&7u32);
        assert_eq!(decode_from_slice::<u32>(&bytes).unwrap(), 7);

        bytes.push(0);
        assert!(matches!(
            decode_from_slice::<u32>(&bytes),
            Err(CodecError::TrailingBytes { count: 1, .. })
        ));
    }

    #[test]
    fn test_random_state_block() {
        let mut rng = DeterministicRng::new(99);
        rng.draw();
        let state = rng.state();

        let bytes = encode_to_vec(&state);
        assert_eq!(bytes.len(), STATE_BYTES);
        assert_eq!(decode_from_slice::<RandomState>(&bytes).unwrap(), state);
    }

    #[test]
    fn test_random_state_rejects_zero_core() {
        let zero = [0u8; STATE_BYTES];
        let err = decode_from_slice::<RandomState>(&zero).unwrap_err();
        assert!(matches!(err, CodecError::Invalid { context: "random state", .. }));

        let mut bad_flag = encode_to_vec(&DeterministicRng::new(1).state());
        bad_flag[0] = 5;
        assert_eq!(
            decode_from_slice::<RandomState>(&bad_flag).unwrap_err(),
            CodecError::InvalidBool(5)
        );
    }

    #[test]
    fn test_garbage_never_panics() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        for _ in 0..500 {
            let len = rng.gen_range(0..64);
            let bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();

            let mut r = StreamReader::new(&bytes);
            let _ = r.read_record(1, |r| {
                let _ = r.read_str()?;
                r.read_seq::<u32>()
            });
            let _ = decode_from_slice::<RandomState>(&bytes);
            let _ = decode_from_slice::<String>(&bytes);
        }
    }

    proptest! {
        #[test]
        fn prop_string_round_trip(s in ".*") {
            let bytes = encode_to_vec(&s);
            prop_assert_eq!(decode_from_slice::<String>(&bytes).unwrap(), s);
        }

        #[test]
        fn prop_mixed_record_round_trip(a in any::<u64>(), b in any::<i32>(), flag in any::<bool>(), items in prop::collection::vec(any::<u32>(), 0..16)) {
            let mut w = StreamWriter::new();
            w.write_record(3, |w| {
                w.write_u64(a);
                w.write_i32(b);
                w.write_bool(flag);
                w.write_seq(&items);
            });
            let bytes = w.into_bytes();

            let mut r = StreamReader::new(&bytes);
            let decoded = r.read_record(3, |r| {
                Ok((r.read_u64()?, r.read_i32()?, r.read_bool()?, r.read_seq::<u32>()?))
            }).unwrap();
            prop_assert_eq!(decoded, (a, b, flag, items));
        }

        #[test]
        fn prop_encoding_is_deterministic(x in any::<i32>(), y in any::<i32>()) {
            let v = FixedVec2::new(x, y);
            prop_assert_eq!(encode_to_vec(&v), encode_to_vec(&v));
            prop_assert_eq!(decode_from_slice::<FixedVec2>(&encode_to_vec(&v)).unwrap(), v);
        }
    }
}

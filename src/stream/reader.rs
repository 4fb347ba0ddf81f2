//! Decoder side of the state stream.

use crate::core::fixed::Fixed;
use crate::core::vec2::FixedVec2;

use super::error::CodecError;
use super::Decode;

/// Cursor over an encoded buffer.
///
/// Every length read from the buffer is checked against the bytes that are
/// actually left before anything is allocated, so a corrupt prefix can never
/// trigger a huge allocation.
#[derive(Debug, Clone)]
pub struct StreamReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> StreamReader<'a> {
    /// Start reading at the beginning of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current read offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Whether the whole buffer has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Fail with [`CodecError::TrailingBytes`] if anything is left.
    pub fn finish(&self, context: &'static str) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            count => Err(CodecError::TrailingBytes { context, count }),
        }
    }

    /// Consume exactly `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if n > self.remaining() {
            return Err(CodecError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read and check a format header.
    pub fn read_header(&mut self, magic: &[u8; 4], version: u16) -> Result<(), CodecError> {
        let found: [u8; 4] = self.take_array()?;
        if &found != magic {
            return Err(CodecError::BadMagic {
                expected: *magic,
                found,
            });
        }
        let found = self.read_u16()?;
        if found != version {
            return Err(CodecError::VersionMismatch {
                expected: version,
                found,
            });
        }
        Ok(())
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    /// Read a little-endian u16.
    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    /// Read a little-endian u32.
    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    /// Read a little-endian u64.
    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    /// Read a little-endian i32.
    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    /// Read a little-endian i64.
    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    /// Read a Q16.16 fixed-point number.
    pub fn read_fixed(&mut self) -> Result<Fixed, CodecError> {
        self.read_i32()
    }

    /// Read a fixed-point vector.
    pub fn read_vec2(&mut self) -> Result<FixedVec2, CodecError> {
        let x = self.read_fixed()?;
        let y = self.read_fixed()?;
        Ok(FixedVec2::new(x, y))
    }

    /// Read a strict 0/1 boolean.
    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidBool(other)),
        }
    }

    /// Read a length prefix and check it fits in the remaining buffer.
    fn read_len(&mut self) -> Result<usize, CodecError> {
        let len = self.read_u32()? as usize;
        if len > self.remaining() {
            return Err(CodecError::Truncated {
                needed: len,
                remaining: self.remaining(),
            });
        }
        Ok(len)
    }

    /// Read a length-prefixed byte string.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_len()?;
        Ok(self.take(len)?.to_vec())
    }

    /// Read length-prefixed UTF-8 text.
    pub fn read_str(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Read a sequence count.
    ///
    /// Each element takes at least `min_element_size` bytes, so a count that
    /// cannot possibly fit is rejected before the caller reserves space.
    pub fn read_count(&mut self, min_element_size: usize) -> Result<usize, CodecError> {
        let count = self.read_u32()? as usize;
        let needed = count.saturating_mul(min_element_size.max(1));
        if needed > self.remaining() {
            return Err(CodecError::Truncated {
                needed,
                remaining: self.remaining(),
            });
        }
        Ok(count)
    }

    /// Read a length-prefixed sequence of decodable values.
    pub fn read_seq<T: Decode>(&mut self) -> Result<Vec<T>, CodecError> {
        let count = self.read_count(1)?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::decode(self)?);
        }
        Ok(items)
    }

    /// Read an optional value written by [`StreamWriter::write_option`].
    ///
    /// [`StreamWriter::write_option`]: super::StreamWriter::write_option
    pub fn read_option<T: Decode>(&mut self) -> Result<Option<T>, CodecError> {
        if self.read_bool()? {
            Ok(Some(T::decode(self)?))
        } else {
            Ok(None)
        }
    }

    /// Read the header of a nested record without checking its tag.
    ///
    /// Returns the tag and a reader bounded to the record body.
    pub fn read_record_header(&mut self) -> Result<(u16, StreamReader<'a>), CodecError> {
        let tag = self.read_u16()?;
        let len = self.read_len()?;
        let body = self.take(len)?;
        Ok((tag, StreamReader::new(body)))
    }

    /// Read a nested record that must carry `expected_tag`.
    ///
    /// `body` sees only the record's own bytes and must consume all of them.
    pub fn read_record<T, F>(&mut self, expected_tag: u16, body: F) -> Result<T, CodecError>
    where
        F: FnOnce(&mut StreamReader<'a>) -> Result<T, CodecError>,
    {
        let (tag, mut inner) = self.read_record_header()?;
        if tag != expected_tag {
            return Err(CodecError::UnexpectedTag {
                expected: expected_tag,
                found: tag,
            });
        }
        let value = body(&mut inner)?;
        inner.finish("record body")?;
        Ok(value)
    }
}

//! Encoder side of the state stream.

use crate::core::fixed::Fixed;
use crate::core::vec2::FixedVec2;

use super::Encode;

/// Append-only byte sink for typed writes.
///
/// Writing cannot fail; all validation happens on the decode side.
/// Integers are little-endian, text and byte strings carry a `u32` length,
/// records carry a `u16` tag and a `u32` body length.
#[derive(Debug, Default, Clone)]
pub struct StreamWriter {
    buf: Vec<u8>,
}

impl StreamWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Create a writer with reserved capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Borrow the encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Finish and take the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Write a format header: 4 magic bytes and a version.
    pub fn write_header(&mut self, magic: &[u8; 4], version: u16) {
        self.buf.extend_from_slice(magic);
        self.write_u16(version);
    }

    /// Write raw bytes without a length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Write a single byte.
    #[inline]
    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Write a little-endian u16.
    #[inline]
    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Write a little-endian u32.
    #[inline]
    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Write a little-endian u64.
    #[inline]
    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Write a little-endian i32.
    #[inline]
    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Write a little-endian i64.
    #[inline]
    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Write a Q16.16 fixed-point number.
    #[inline]
    pub fn write_fixed(&mut self, v: Fixed) {
        self.write_i32(v);
    }

    /// Write a fixed-point vector.
    #[inline]
    pub fn write_vec2(&mut self, v: FixedVec2) {
        self.write_fixed(v.x);
        self.write_fixed(v.y);
    }

    /// Write a boolean as a strict 0/1 byte.
    #[inline]
    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    /// Write length-prefixed UTF-8 text.
    pub fn write_str(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
    }

    /// Write a length-prefixed byte string.
    pub fn write_bytes(&mut self, b: &[u8]) {
        self.write_u32(b.len() as u32);
        self.buf.extend_from_slice(b);
    }

    /// Write a length-prefixed sequence of encodable values.
    pub fn write_seq<T: Encode>(&mut self, items: &[T]) {
        self.write_u32(items.len() as u32);
        for item in items {
            item.encode(self);
        }
    }

    /// Write an optional value as a presence flag followed by the value.
    pub fn write_option<T: Encode>(&mut self, value: Option<&T>) {
        match value {
            Some(v) => {
                self.write_bool(true);
                v.encode(self);
            }
            None => self.write_bool(false),
        }
    }

    /// Write a nested record: tag, body length, then whatever `body` writes.
    ///
    /// The length is patched in after the body, so readers can bound and
    /// verify the record without knowing its schema.
    pub fn write_record<F>(&mut self, tag: u16, body: F)
    where
        F: FnOnce(&mut StreamWriter),
    {
        self.write_u16(tag);
        let len_at = self.buf.len();
        self.write_u32(0);
        let start = self.buf.len();
        body(self);
        let body_len = (self.buf.len() - start) as u32;
        self.buf[len_at..len_at + 4].copy_from_slice(&body_len.to_le_bytes());
    }
}

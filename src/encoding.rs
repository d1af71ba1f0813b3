// Copyright 2021 The Ostraka Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Deterministic tag-keyed binary encoding.
//!
//! Every hashed or signed record in the node is serialized to this form:
//! a flat sequence of fields, each introduced by a fixed one-byte integer
//! tag, with little-endian integers and `u32`-length-prefixed byte strings.
//! Field tags are stable across versions, so hashes and signatures computed
//! over the encoding are stable as well.
//!
//! Decoding is schema-driven: the reader expects the same tags in the same
//! order the writer produced them, which keeps the format canonical — for
//! any record `R`, `from_bytes(to_bytes(R)) == R` and re-encoding yields
//! byte-identical output.
//!
//! The JSON representation of the same records (via `serde`) exists only
//! for operator visibility and is never hashed.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// Errors produced while decoding the canonical form.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The input ended in the middle of a field.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// A field carried a different tag than the schema requires.
    #[error("unexpected field tag: expected {expected}, found {found}")]
    UnexpectedTag {
        /// Tag required by the record schema.
        expected: u8,
        /// Tag found in the input.
        found: u8,
    },

    /// A field value is structurally malformed.
    #[error("malformed field: {0}")]
    Malformed(String),

    /// Input contained bytes past the end of the record.
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),
}

/// Records with a canonical binary form.
///
/// All content hashes and sign-bytes in the node are computed over this
/// encoding.
pub trait Canonical: Sized {
    /// Serializes the record into its canonical byte form.
    fn to_bytes(&self) -> Vec<u8>;

    /// Restores the record from its canonical byte form.
    fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError>;
}

/// Writer for the canonical form.
#[derive(Debug, Default)]
pub struct TagWriter {
    buf: Vec<u8>,
}

impl TagWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    fn push_u32(&mut self, value: u32) {
        let mut bytes = [0; 4];
        LittleEndian::write_u32(&mut bytes, value);
        self.buf.extend_from_slice(&bytes);
    }

    /// Writes a tagged `u8` field.
    pub fn write_u8(&mut self, tag: u8, value: u8) {
        self.buf.push(tag);
        self.buf.push(value);
    }

    /// Writes a tagged `bool` field.
    pub fn write_bool(&mut self, tag: u8, value: bool) {
        self.write_u8(tag, value as u8);
    }

    /// Writes a tagged `u32` field.
    pub fn write_u32(&mut self, tag: u8, value: u32) {
        self.buf.push(tag);
        self.push_u32(value);
    }

    /// Writes a tagged `u64` field.
    pub fn write_u64(&mut self, tag: u8, value: u64) {
        self.buf.push(tag);
        let mut bytes = [0; 8];
        LittleEndian::write_u64(&mut bytes, value);
        self.buf.extend_from_slice(&bytes);
    }

    /// Writes a tagged `i64` field.
    pub fn write_i64(&mut self, tag: u8, value: i64) {
        self.buf.push(tag);
        let mut bytes = [0; 8];
        LittleEndian::write_i64(&mut bytes, value);
        self.buf.extend_from_slice(&bytes);
    }

    /// Writes a tagged fixed-width field without a length prefix. The width
    /// is part of the record schema (hashes, addresses, keys, signatures).
    pub fn write_fixed(&mut self, tag: u8, bytes: &[u8]) {
        self.buf.push(tag);
        self.buf.extend_from_slice(bytes);
    }

    /// Writes a tagged variable-length byte string.
    pub fn write_bytes(&mut self, tag: u8, bytes: &[u8]) {
        self.buf.push(tag);
        self.push_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    /// Writes a tagged UTF-8 string.
    pub fn write_str(&mut self, tag: u8, value: &str) {
        self.write_bytes(tag, value.as_bytes());
    }

    /// Writes the header of a tagged sequence; the caller then writes
    /// `count` untagged items.
    pub fn write_seq(&mut self, tag: u8, count: u32) {
        self.buf.push(tag);
        self.push_u32(count);
    }

    /// Writes an untagged length-prefixed nested record (a sequence item).
    pub fn write_nested(&mut self, bytes: &[u8]) {
        self.push_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    /// Consumes the writer and returns the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Schema-driven reader for the canonical form.
#[derive(Debug)]
pub struct TagReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> TagReader<'a> {
    /// Creates a reader over the given input.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() - self.pos < len {
            return Err(CodecError::UnexpectedEof);
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn expect_tag(&mut self, expected: u8) -> Result<(), CodecError> {
        let found = self.take(1)?[0];
        if found != expected {
            return Err(CodecError::UnexpectedTag { expected, found });
        }
        Ok(())
    }

    /// Reads a tagged `u8` field.
    pub fn read_u8(&mut self, tag: u8) -> Result<u8, CodecError> {
        self.expect_tag(tag)?;
        Ok(self.take(1)?[0])
    }

    /// Reads a tagged `bool` field.
    pub fn read_bool(&mut self, tag: u8) -> Result<bool, CodecError> {
        match self.read_u8(tag)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::Malformed(format!("bad bool value {}", other))),
        }
    }

    /// Reads a tagged `u32` field.
    pub fn read_u32(&mut self, tag: u8) -> Result<u32, CodecError> {
        self.expect_tag(tag)?;
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    /// Reads a tagged `u64` field.
    pub fn read_u64(&mut self, tag: u8) -> Result<u64, CodecError> {
        self.expect_tag(tag)?;
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    /// Reads a tagged `i64` field.
    pub fn read_i64(&mut self, tag: u8) -> Result<i64, CodecError> {
        self.expect_tag(tag)?;
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    /// Reads a tagged fixed-width field of the given schema width.
    pub fn read_fixed(&mut self, tag: u8, len: usize) -> Result<&'a [u8], CodecError> {
        self.expect_tag(tag)?;
        self.take(len)
    }

    /// Reads a tagged variable-length byte string.
    pub fn read_bytes(&mut self, tag: u8) -> Result<Vec<u8>, CodecError> {
        self.expect_tag(tag)?;
        let len = LittleEndian::read_u32(self.take(4)?) as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Reads a tagged UTF-8 string.
    pub fn read_str(&mut self, tag: u8) -> Result<String, CodecError> {
        let bytes = self.read_bytes(tag)?;
        String::from_utf8(bytes).map_err(|_| CodecError::Malformed("invalid utf-8".into()))
    }

    /// Reads the header of a tagged sequence and returns the item count.
    pub fn read_seq(&mut self, tag: u8) -> Result<u32, CodecError> {
        self.expect_tag(tag)?;
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    /// Reads an untagged length-prefixed nested record.
    pub fn read_nested(&mut self) -> Result<&'a [u8], CodecError> {
        let len = LittleEndian::read_u32(self.take(4)?) as usize;
        self.take(len)
    }

    /// Verifies the whole input has been consumed.
    pub fn finish(self) -> Result<(), CodecError> {
        let rest = self.buf.len() - self.pos;
        if rest != 0 {
            return Err(CodecError::TrailingBytes(rest));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn scalar_round_trip() {
        let mut writer = TagWriter::new();
        writer.write_u8(1, 0xAB);
        writer.write_u32(2, 123_456);
        writer.write_u64(3, u64::max_value());
        writer.write_i64(4, -42);
        writer.write_bool(5, true);
        writer.write_str(6, "memo");
        let bytes = writer.into_bytes();

        let mut reader = TagReader::new(&bytes);
        assert_eq!(reader.read_u8(1).unwrap(), 0xAB);
        assert_eq!(reader.read_u32(2).unwrap(), 123_456);
        assert_eq!(reader.read_u64(3).unwrap(), u64::max_value());
        assert_eq!(reader.read_i64(4).unwrap(), -42);
        assert!(reader.read_bool(5).unwrap());
        assert_eq!(reader.read_str(6).unwrap(), "memo");
        reader.finish().unwrap();
    }

    #[test]
    fn tag_mismatch_is_rejected() {
        let mut writer = TagWriter::new();
        writer.write_u32(7, 1);
        let bytes = writer.into_bytes();

        let mut reader = TagReader::new(&bytes);
        let err = reader.read_u32(8).unwrap_err();
        assert!(matches!(
            err,
            CodecError::UnexpectedTag {
                expected: 8,
                found: 7
            }
        ));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let mut writer = TagWriter::new();
        writer.write_bytes(1, &[1, 2, 3]);
        let mut bytes = writer.into_bytes();
        bytes.truncate(bytes.len() - 1);

        let mut reader = TagReader::new(&bytes);
        assert!(matches!(
            reader.read_bytes(1),
            Err(CodecError::UnexpectedEof)
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut writer = TagWriter::new();
        writer.write_u8(1, 1);
        let mut bytes = writer.into_bytes();
        bytes.push(0);

        let mut reader = TagReader::new(&bytes);
        reader.read_u8(1).unwrap();
        assert!(matches!(reader.finish(), Err(CodecError::TrailingBytes(1))));
    }
}

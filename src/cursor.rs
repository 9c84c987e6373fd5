// Byte cursor over a borrowed patch or ROM buffer.
//
// Every read is bounds-checked and fails with `TruncatedInput` instead of
// panicking, so malformed patches are rejected at the first short read.
// Writing goes straight into a `Vec<u8>` through byteorder's
// `WriteBytesExt`; the helpers at the bottom cover the fixed-width string
// fields several formats use.

use std::io::Write;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{PatchError, Result};

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Sequential reader with a movable offset and a stack of saved offsets.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    offset: usize,
    saved: Vec<usize>,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            saved: Vec::new(),
        }
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    #[inline]
    pub fn is_eof(&self) -> bool {
        self.offset >= self.data.len()
    }

    /// The whole underlying buffer.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Move to an absolute offset.  Seeking to `len()` is allowed.
    pub fn seek(&mut self, offset: usize) -> Result<()> {
        if offset > self.data.len() {
            return Err(PatchError::TruncatedInput {
                offset,
                needed: 0,
            });
        }
        self.offset = offset;
        Ok(())
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    /// Remember the current offset.
    pub fn push_offset(&mut self) {
        self.saved.push(self.offset);
    }

    /// Return to the most recently pushed offset.
    pub fn pop_offset(&mut self) {
        if let Some(offset) = self.saved.pop() {
            self.offset = offset;
        }
    }

    /// Borrow the next `n` bytes and advance past them.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or(PatchError::TruncatedInput {
                offset: self.offset,
                needed: n,
            })?;
        let out = &self.data[self.offset..end];
        self.offset = end;
        Ok(out)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        self.take(n).map(<[u8]>::to_vec)
    }

    /// Whether the unread bytes begin with `prefix`.
    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.data[self.offset..].starts_with(prefix)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn read_u16_be(&mut self) -> Result<u16> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    pub fn read_u24_be(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u24(self.take(3)?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_u32_be(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    /// Read a fixed-width text field, stopping at the first NUL.
    ///
    /// The cursor always advances by `width` bytes.
    pub fn read_fixed_string(&mut self, width: usize) -> Result<String> {
        let raw = self.take(width)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }
}

// ---------------------------------------------------------------------------
// Writer helpers
// ---------------------------------------------------------------------------

/// Write `text` into a field of exactly `width` bytes, zero padded or cut.
pub fn write_fixed_string<W: Write>(w: &mut W, text: &str, width: usize) -> std::io::Result<()> {
    let bytes = text.as_bytes();
    let n = bytes.len().min(width);
    w.write_all(&bytes[..n])?;
    w.write_all(&vec![0u8; width - n])
}

/// Read a byte of `data`, treating positions past the end as zero.
///
/// XOR-based formats define bytes beyond the end of a shorter source as 0.
#[inline]
pub fn byte_or_zero(data: &[u8], pos: usize) -> u8 {
    data.get(pos).copied().unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_mixed_endianness() {
        let data = [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE];
        let mut c = ByteCursor::new(&data);
        assert_eq!(c.read_u24_be().unwrap(), 0x123456);
        assert_eq!(c.read_u16_le().unwrap(), 0x9A78);
        assert_eq!(c.read_u16_be().unwrap(), 0xBCDE);
        assert!(c.is_eof());
    }

    #[test]
    fn short_read_is_truncated_input() {
        let data = [1, 2, 3];
        let mut c = ByteCursor::new(&data);
        c.skip(2).unwrap();
        match c.read_u16_le() {
            Err(PatchError::TruncatedInput { offset, needed }) => {
                assert_eq!(offset, 2);
                assert_eq!(needed, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        // A failed read leaves the offset untouched.
        assert_eq!(c.offset(), 2);
    }

    #[test]
    fn push_pop_restores_offset() {
        let data = [0u8; 16];
        let mut c = ByteCursor::new(&data);
        c.skip(4).unwrap();
        c.push_offset();
        c.skip(8).unwrap();
        c.pop_offset();
        assert_eq!(c.offset(), 4);
    }

    #[test]
    fn fixed_string_stops_at_nul_but_consumes_field() {
        let mut field = Vec::new();
        write_fixed_string(&mut field, "abc", 8).unwrap();
        field.push(0xFF);
        let mut c = ByteCursor::new(&field);
        assert_eq!(c.read_fixed_string(8).unwrap(), "abc");
        assert_eq!(c.read_u8().unwrap(), 0xFF);
    }

    #[test]
    fn fixed_string_is_cut_to_width() {
        let mut field = Vec::new();
        write_fixed_string(&mut field, "abcdef", 4).unwrap();
        assert_eq!(field, b"abcd");
    }
}

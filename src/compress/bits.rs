// Big-endian (most significant bit first) bit reader.

use super::bzip2::Bzip2Error;

#[derive(Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    buf: u64,
    count: u32,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            buf: 0,
            count: 0,
        }
    }

    #[inline]
    fn refill(&mut self) {
        while self.count <= 56 && self.pos < self.data.len() {
            self.buf = (self.buf << 8) | u64::from(self.data[self.pos]);
            self.pos += 1;
            self.count += 8;
        }
    }

    /// Read `n` bits (at most 32) as an unsigned integer.
    #[inline]
    pub fn read_bits(&mut self, n: u32) -> Result<u32, Bzip2Error> {
        debug_assert!(n <= 32);
        if n == 0 {
            return Ok(0);
        }
        if self.count < n {
            self.refill();
            if self.count < n {
                return Err(Bzip2Error::UnexpectedEof);
            }
        }
        self.count -= n;
        Ok(((self.buf >> self.count) & ((1u64 << n) - 1)) as u32)
    }

    #[inline]
    pub fn read_bit(&mut self) -> Result<bool, Bzip2Error> {
        Ok(self.read_bits(1)? == 1)
    }

    /// Drop bits up to the next byte boundary.
    pub fn align_to_byte(&mut self) {
        self.count -= self.count % 8;
    }

    /// Whole bytes not yet consumed.
    pub fn remaining_bytes(&self) -> usize {
        (self.data.len() - self.pos) + (self.count / 8) as usize
    }
}

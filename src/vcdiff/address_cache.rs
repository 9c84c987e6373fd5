// VCDIFF COPY address cache (RFC 3284, Section 5.3).
//
// Addresses live in one space: the source segment first, then the target
// window decoded so far ("here").  Modes:
//
//   0        SELF   address as-is
//   1        HERE   here - value
//   2..=5    NEAR   near[mode - 2] + value
//   6..=8    SAME   same[(mode - 6) * 256 + byte], one raw byte
//
// Both sides call `update` after every address, so the caches stay in lock
// step between encoder and decoder.

use super::varint;

pub const VCD_SELF: u8 = 0;
pub const VCD_HERE: u8 = 1;

const S_NEAR: usize = 4;
const S_SAME: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AddressCacheError {
    #[error("address section exhausted")]
    Underflow,
    #[error("address {addr:#x} is not below here ({here:#x})")]
    OutOfRange { addr: u64, here: u64 },
    #[error("unknown address mode {0}")]
    BadMode(u8),
}

/// An address as it will appear in the address section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodedAddr {
    Int(u64),
    Byte(u8),
}

impl EncodedAddr {
    pub fn write_to(self, out: &mut Vec<u8>) {
        match self {
            Self::Int(v) => varint::write(out, v),
            Self::Byte(b) => out.push(b),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AddressCache {
    near: [u64; S_NEAR],
    same: Vec<u64>,
    next_slot: usize,
}

impl Default for AddressCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressCache {
    pub fn new() -> Self {
        Self {
            near: [0; S_NEAR],
            same: vec![0; S_SAME * 256],
            next_slot: 0,
        }
    }

    /// Clear all slots; done at the start of every window.
    pub fn reset(&mut self) {
        self.near = [0; S_NEAR];
        self.same.fill(0);
        self.next_slot = 0;
    }

    pub fn update(&mut self, addr: u64) {
        self.near[self.next_slot] = addr;
        self.next_slot = (self.next_slot + 1) % S_NEAR;
        self.same[(addr % (S_SAME as u64 * 256)) as usize] = addr;
    }

    /// Pick the mode giving the shortest encoding of `addr` and update.
    pub fn encode(&mut self, addr: u64, here: u64) -> (u8, EncodedAddr) {
        let same_slot = (addr % (S_SAME as u64 * 256)) as usize;
        let chosen = if self.same[same_slot] == addr {
            (
                (2 + S_NEAR + same_slot / 256) as u8,
                EncodedAddr::Byte((same_slot % 256) as u8),
            )
        } else {
            let mut best = (VCD_SELF, addr);
            if here - addr < best.1 {
                best = (VCD_HERE, here - addr);
            }
            for (i, &near) in self.near.iter().enumerate() {
                if addr >= near && addr - near < best.1 {
                    best = (2 + i as u8, addr - near);
                }
            }
            (best.0, EncodedAddr::Int(best.1))
        };
        self.update(addr);
        chosen
    }

    /// Decode one address from the front of `section`.
    ///
    /// Returns the address and the number of bytes consumed.
    pub fn decode(
        &mut self,
        mode: u8,
        section: &[u8],
        here: u64,
    ) -> Result<(u64, usize), AddressCacheError> {
        let mode_idx = mode as usize;
        let (addr, used) = if mode_idx < 2 + S_NEAR {
            let (raw, used) = varint::read(section).map_err(|_| AddressCacheError::Underflow)?;
            let addr = match mode {
                VCD_SELF => Some(raw),
                VCD_HERE => here.checked_sub(raw),
                _ => self.near[mode_idx - 2].checked_add(raw),
            };
            let addr = addr.ok_or(AddressCacheError::OutOfRange { addr: raw, here })?;
            (addr, used)
        } else if mode_idx < 2 + S_NEAR + S_SAME {
            let byte = *section.first().ok_or(AddressCacheError::Underflow)?;
            let slot = (mode_idx - 2 - S_NEAR) * 256 + byte as usize;
            (self.same[slot], 1)
        } else {
            return Err(AddressCacheError::BadMode(mode));
        };

        if addr >= here {
            return Err(AddressCacheError::OutOfRange { addr, here });
        }
        self.update(addr);
        Ok((addr, used))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(addrs: &[(u64, u64)]) {
        let mut enc = AddressCache::new();
        let mut dec = AddressCache::new();
        for &(addr, here) in addrs {
            let (mode, encoded) = enc.encode(addr, here);
            let mut section = Vec::new();
            encoded.write_to(&mut section);
            let (got, used) = dec.decode(mode, &section, here).unwrap();
            assert_eq!(got, addr);
            assert_eq!(used, section.len());
        }
    }

    #[test]
    fn encoder_and_decoder_stay_in_step() {
        roundtrip(&[
            (0, 100),
            (1000, 5000),
            (1004, 5010),
            (1000, 6000),
            (4999, 5000),
            (77, 90_000),
            (77 + 768, 90_000),
        ]);
    }

    #[test]
    fn here_mode_for_recent_addresses() {
        let mut cache = AddressCache::new();
        let (mode, enc) = cache.encode(9_990, 10_000);
        assert_eq!(mode, VCD_HERE);
        assert_eq!(enc, EncodedAddr::Int(10));
    }

    #[test]
    fn same_mode_hits_exact_repeats() {
        let mut cache = AddressCache::new();
        cache.encode(123_456, 200_000);
        let (mode, enc) = cache.encode(123_456, 300_000);
        assert!(mode >= 6);
        assert!(matches!(enc, EncodedAddr::Byte(_)));
    }

    #[test]
    fn address_at_or_past_here_is_rejected() {
        let mut cache = AddressCache::new();
        assert_eq!(
            cache.decode(VCD_SELF, &[10], 10),
            Err(AddressCacheError::OutOfRange { addr: 10, here: 10 })
        );
        assert_eq!(cache.decode(VCD_SELF, &[], 10), Err(AddressCacheError::Underflow));
        assert_eq!(cache.decode(9, &[0], 10), Err(AddressCacheError::BadMode(9)));
    }
}

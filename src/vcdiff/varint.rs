// VCDIFF integers (RFC 3284, Section 2).
//
// Base-128 with the most significant group first; every byte except the
// last has bit 7 set.  Note this is the opposite byte order from the byuu
// VLV in `crate::vlv`, and carries no bias.

/// Longest encoding of a 64-bit value.
pub const MAX_LEN: usize = 10;

const OVERFLOW_MASK: u64 = 0xFE00_0000_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VarIntError {
    #[error("integer runs past the end of its section")]
    Underflow,
    #[error("integer does not fit in 64 bits")]
    Overflow,
}

/// Append `num` to `out`.
pub fn write(out: &mut Vec<u8>, num: u64) {
    let mut buf = [0u8; MAX_LEN];
    let mut i = MAX_LEN;
    let mut rest = num;
    loop {
        i -= 1;
        buf[i] = (rest as u8 & 0x7F) | 0x80;
        rest >>= 7;
        if rest == 0 {
            break;
        }
    }
    buf[MAX_LEN - 1] &= 0x7F;
    out.extend_from_slice(&buf[i..]);
}

/// Encoded size of `num` in bytes.
pub fn encoded_len(num: u64) -> usize {
    let bits = 64 - num.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

/// Decode from the front of `data`, returning the value and bytes consumed.
pub fn read(data: &[u8]) -> Result<(u64, usize), VarIntError> {
    let mut val: u64 = 0;
    for (i, &byte) in data.iter().enumerate() {
        if val & OVERFLOW_MASK != 0 {
            return Err(VarIntError::Overflow);
        }
        val = (val << 7) | u64::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            return Ok((val, i + 1));
        }
    }
    Err(VarIntError::Underflow)
}

/// Decode a value that must index memory.
pub fn read_usize(data: &[u8]) -> Result<(usize, usize), VarIntError> {
    let (val, len) = read(data)?;
    let val = usize::try_from(val).map_err(|_| VarIntError::Overflow)?;
    Ok((val, len))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(v: u64) -> Vec<u8> {
        let mut out = Vec::new();
        write(&mut out, v);
        out
    }

    #[test]
    fn rfc_example() {
        // The worked example from RFC 3284 Section 2.
        assert_eq!(enc(123_456_789), [0xBA, 0xEF, 0x9A, 0x15]);
    }

    #[test]
    fn small_values_are_single_bytes() {
        assert_eq!(enc(0), [0x00]);
        assert_eq!(enc(127), [0x7F]);
        assert_eq!(enc(128), [0x81, 0x00]);
    }

    #[test]
    fn lengths_agree_with_writer() {
        for v in [0, 1, 127, 128, 16383, 16384, u32::MAX as u64, u64::MAX] {
            assert_eq!(encoded_len(v), enc(v).len(), "value {v}");
            assert_eq!(read(&enc(v)).unwrap(), (v, enc(v).len()));
        }
    }

    #[test]
    fn unterminated_input_underflows() {
        assert_eq!(read(&[0x81, 0x80]), Err(VarIntError::Underflow));
        assert_eq!(read(&[]), Err(VarIntError::Underflow));
    }

    #[test]
    fn eleven_groups_overflow() {
        let data = [0xFFu8; 11];
        assert_eq!(read(&data), Err(VarIntError::Overflow));
    }
}

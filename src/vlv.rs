// Variable-length values used by the byuu-family formats and by RUP.
//
// BPS, UPS and APS share one scheme: seven data bits per byte, least
// significant group first, the high bit marks the *last* byte, and every
// continuation adds the running power of 128 so that each value has exactly
// one encoding.  RUP instead stores a byte count followed by that many
// little-endian bytes.  VCDIFF's big-endian varint lives in `vcdiff::varint`.

use crate::cursor::ByteCursor;
use crate::error::{PatchError, Result};

// ---------------------------------------------------------------------------
// byuu VLV (BPS / UPS)
// ---------------------------------------------------------------------------

/// Read a byuu-style VLV.
pub fn read_vlv(cursor: &mut ByteCursor<'_>) -> Result<u64> {
    let start = cursor.offset();
    let mut data: u64 = 0;
    let mut shift: u64 = 1;
    loop {
        let x = cursor.read_u8()?;
        data = u64::from(x & 0x7F)
            .checked_mul(shift)
            .and_then(|v| data.checked_add(v))
            .ok_or_else(|| overflow(start))?;
        if x & 0x80 != 0 {
            return Ok(data);
        }
        shift = shift.checked_mul(128).ok_or_else(|| overflow(start))?;
        data = data.checked_add(shift).ok_or_else(|| overflow(start))?;
    }
}

/// Read a VLV and narrow it to `usize`.
pub fn read_vlv_usize(cursor: &mut ByteCursor<'_>) -> Result<usize> {
    let start = cursor.offset();
    let value = read_vlv(cursor)?;
    usize::try_from(value).map_err(|_| overflow(start))
}

/// Append a byuu-style VLV to `out`.
pub fn write_vlv(out: &mut Vec<u8>, mut data: u64) {
    loop {
        let x = (data & 0x7F) as u8;
        data >>= 7;
        if data == 0 {
            out.push(0x80 | x);
            break;
        }
        out.push(x);
        data -= 1;
    }
}

/// Encode a signed displacement as `(|d| << 1) | sign`.
pub fn encode_signed(delta: i64) -> u64 {
    (delta.unsigned_abs() << 1) | u64::from(delta < 0)
}

/// Inverse of [`encode_signed`].
pub fn decode_signed(raw: u64) -> i64 {
    let magnitude = (raw >> 1) as i64;
    if raw & 1 != 0 { -magnitude } else { magnitude }
}

fn overflow(offset: usize) -> PatchError {
    PatchError::record(format!("variable-length value at {offset:#x} overflows"))
}

// ---------------------------------------------------------------------------
// RUP length-prefixed values
// ---------------------------------------------------------------------------

/// Read a RUP value: one count byte, then that many little-endian bytes.
pub fn read_rup_vlv(cursor: &mut ByteCursor<'_>) -> Result<u64> {
    let start = cursor.offset();
    let n = cursor.read_u8()? as usize;
    if n > 8 {
        return Err(overflow(start));
    }
    let bytes = cursor.take(n)?;
    Ok(bytes
        .iter()
        .enumerate()
        .fold(0u64, |acc, (i, &b)| acc | (u64::from(b) << (8 * i))))
}

pub fn write_rup_vlv(out: &mut Vec<u8>, mut data: u64) {
    let count_pos = out.len();
    out.push(0);
    let mut n = 0u8;
    while data != 0 {
        out.push((data & 0xFF) as u8);
        data >>= 8;
        n += 1;
    }
    out[count_pos] = n;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

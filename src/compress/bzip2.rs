// bzip2 stream decoder.
//
// Decodes one or more concatenated bzip2 streams:
//
//   stream  := "BZh" level(1..9) block* end-marker combined-crc pad
//   block   := 0x314159265359 crc rand orig_ptr symbol-map huffman-groups
//              selectors code-lengths mtf/rle2 symbols
//
// Per block the stages run in reverse of the encoder: Huffman decode with a
// table switch every 50 symbols, RUNA/RUNB run lengths, move-to-front,
// inverse Burrows-Wheeler through the counting-rank permutation, and finally
// the initial 4+count run-length expansion.  Block and stream CRCs are
// verified.

use super::bits::BitReader;

const BLOCK_MAGIC: u64 = 0x3141_5926_5359;
const END_MAGIC: u64 = 0x1772_4538_5090;

const MAX_GROUPS: usize = 6;
const MIN_GROUPS: usize = 2;
const GROUP_SIZE: usize = 50;
const MAX_CODE_LEN: usize = 20;
const RUNA: u16 = 0;
const RUNB: u16 = 1;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Bzip2Error {
    #[error("missing \"BZh\" stream signature")]
    BadSignature,
    #[error("invalid block size level {0:#04x}")]
    BadBlockSize(u8),
    #[error("unexpected end of compressed data")]
    UnexpectedEof,
    #[error("unknown block marker {0:#014x}")]
    BadBlockMagic(u64),
    #[error("randomised blocks are not supported")]
    Randomised,
    #[error("corrupt block: {0}")]
    Corrupt(&'static str),
    #[error("block CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    BlockCrc { expected: u32, actual: u32 },
    #[error("stream CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    StreamCrc { expected: u32, actual: u32 },
}

type Result<T> = std::result::Result<T, Bzip2Error>;

// ---------------------------------------------------------------------------
// CRC (MSB-first, polynomial 0x04C11DB7)
// ---------------------------------------------------------------------------

const CRC_TABLE: [u32; 256] = build_crc_table();

const fn build_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = (i as u32) << 24;
        let mut k = 0;
        while k < 8 {
            c = if c & 0x8000_0000 != 0 {
                (c << 1) ^ 0x04C1_1DB7
            } else {
                c << 1
            };
            k += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

fn block_crc(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &b in data {
        crc = (crc << 8) ^ CRC_TABLE[((crc >> 24) as u8 ^ b) as usize];
    }
    !crc
}

// ---------------------------------------------------------------------------
// Canonical Huffman table
// ---------------------------------------------------------------------------

/// Canonical code: `counts[len]` codes of each length, `symbols` sorted by
/// (length, symbol).  bzip2 assigns codes in exactly that order.
struct HuffmanTable {
    counts: [u16; MAX_CODE_LEN + 1],
    symbols: Vec<u16>,
}

impl HuffmanTable {
    fn new(lengths: &[u8]) -> Result<Self> {
        let mut counts = [0u16; MAX_CODE_LEN + 1];
        for &len in lengths {
            counts[len as usize] += 1;
        }

        // Reject over-subscribed length sets.
        let mut left: i32 = 1;
        for &count in &counts[1..] {
            left = (left << 1) - i32::from(count);
            if left < 0 {
                return Err(Bzip2Error::Corrupt("over-subscribed Huffman code"));
            }
        }

        let mut symbols = Vec::with_capacity(lengths.len());
        for len in 1..=MAX_CODE_LEN as u8 {
            for (sym, _) in lengths.iter().enumerate().filter(|&(_, &l)| l == len) {
                symbols.push(sym as u16);
            }
        }
        Ok(Self { counts, symbols })
    }

    fn decode(&self, bits: &mut BitReader<'_>) -> Result<u16> {
        let mut code: i32 = 0;
        let mut first: i32 = 0;
        let mut index: i32 = 0;
        for len in 1..=MAX_CODE_LEN {
            code |= i32::from(bits.read_bit()?);
            let count = i32::from(self.counts[len]);
            if code - first < count {
                return Ok(self.symbols[(index + code - first) as usize]);
            }
            index += count;
            first = (first + count) << 1;
            code <<= 1;
        }
        Err(Bzip2Error::Corrupt("invalid Huffman code"))
    }
}

// ---------------------------------------------------------------------------
// Stream decoding
// ---------------------------------------------------------------------------

/// Decompress every bzip2 stream in `data`, concatenating their output.
///
/// Decoding stops after the last complete stream; trailing bytes that do not
/// start another stream are ignored.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut bits = BitReader::new(data);
    let mut out = Vec::new();
    let mut streams = 0usize;

    loop {
        if streams > 0 && (bits.remaining_bytes() < 4 || !starts_stream(&bits)?) {
            break;
        }
        decode_stream(&mut bits, &mut out)?;
        streams += 1;
    }
    log::trace!("bzip2: {streams} stream(s), {} bytes", out.len());
    Ok(out)
}

/// Peek for a "BZh" signature at the current (byte aligned) position.
fn starts_stream(bits: &BitReader<'_>) -> Result<bool> {
    let mut probe = bits.clone();
    Ok(probe.read_bits(24)? == 0x42_5A68)
}

fn decode_stream(bits: &mut BitReader<'_>, out: &mut Vec<u8>) -> Result<()> {
    if bits.read_bits(24)? != 0x42_5A68 {
        return Err(Bzip2Error::BadSignature);
    }
    let level = bits.read_bits(8)? as u8;
    if !(b'1'..=b'9').contains(&level) {
        return Err(Bzip2Error::BadBlockSize(level));
    }
    let max_block = usize::from(level - b'0') * 100_000;

    let mut combined: u32 = 0;
    loop {
        let magic = (u64::from(bits.read_bits(24)?) << 24) | u64::from(bits.read_bits(24)?);
        match magic {
            BLOCK_MAGIC => {
                let expected = bits.read_bits(32)?;
                let start = out.len();
                decode_block(bits, max_block, out)?;
                let actual = block_crc(&out[start..]);
                if actual != expected {
                    return Err(Bzip2Error::BlockCrc { expected, actual });
                }
                combined = combined.rotate_left(1) ^ actual;
            }
            END_MAGIC => {
                let expected = bits.read_bits(32)?;
                if expected != combined {
                    return Err(Bzip2Error::StreamCrc {
                        expected,
                        actual: combined,
                    });
                }
                bits.align_to_byte();
                return Ok(());
            }
            other => return Err(Bzip2Error::BadBlockMagic(other)),
        }
    }
}

fn decode_block(bits: &mut BitReader<'_>, max_block: usize, out: &mut Vec<u8>) -> Result<()> {
    if bits.read_bit()? {
        return Err(Bzip2Error::Randomised);
    }
    let orig_ptr = bits.read_bits(24)? as usize;

    // Symbol map: 16 ranges of 16 byte values.
    let used_ranges = bits.read_bits(16)?;
    let mut seq_to_unseq: Vec<u8> = Vec::with_capacity(256);
    for i in 0..16u32 {
        if used_ranges & (0x8000 >> i) != 0 {
            let used = bits.read_bits(16)?;
            for j in 0..16u32 {
                if used & (0x8000 >> j) != 0 {
                    seq_to_unseq.push((i * 16 + j) as u8);
                }
            }
        }
    }
    if seq_to_unseq.is_empty() {
        return Err(Bzip2Error::Corrupt("no symbols in use"));
    }
    let alpha_size = seq_to_unseq.len() + 2;
    let eob = (alpha_size - 1) as u16;

    let n_groups = bits.read_bits(3)? as usize;
    if !(MIN_GROUPS..=MAX_GROUPS).contains(&n_groups) {
        return Err(Bzip2Error::Corrupt("bad Huffman group count"));
    }
    let n_selectors = bits.read_bits(15)? as usize;
    if n_selectors == 0 {
        return Err(Bzip2Error::Corrupt("no selectors"));
    }

    // Selectors are unary coded, then move-to-front coded.
    let mut group_order: Vec<u8> = (0..n_groups as u8).collect();
    let mut selectors = Vec::with_capacity(n_selectors);
    for _ in 0..n_selectors {
        let mut j = 0usize;
        while bits.read_bit()? {
            j += 1;
            if j >= n_groups {
                return Err(Bzip2Error::Corrupt("selector out of range"));
            }
        }
        let group = group_order.remove(j);
        group_order.insert(0, group);
        selectors.push(group);
    }

    // Delta-coded code lengths, one table per group.
    let mut tables = Vec::with_capacity(n_groups);
    let mut lengths = vec![0u8; alpha_size];
    for _ in 0..n_groups {
        let mut curr = bits.read_bits(5)? as i32;
        for len in lengths.iter_mut() {
            loop {
                if !(1..=MAX_CODE_LEN as i32).contains(&curr) {
                    return Err(Bzip2Error::Corrupt("code length out of range"));
                }
                if !bits.read_bit()? {
                    break;
                }
                if bits.read_bit()? {
                    curr -= 1;
                } else {
                    curr += 1;
                }
            }
            *len = curr as u8;
        }
        tables.push(HuffmanTable::new(&lengths)?);
    }

    // Huffman -> RUNA/RUNB -> move-to-front.
    let mut mtf: Vec<u8> = (0..=255u8).collect();
    let mut byte_counts = [0usize; 256];
    let mut tt: Vec<u32> = Vec::with_capacity(max_block);
    let mut selector_idx = 0usize;
    let mut group_left = 0usize;
    let mut table = &tables[0];
    let mut run: usize = 0;
    let mut run_weight: usize = 1;

    loop {
        if group_left == 0 {
            let group = *selectors
                .get(selector_idx)
                .ok_or(Bzip2Error::Corrupt("ran out of selectors"))?;
            table = &tables[group as usize];
            selector_idx += 1;
            group_left = GROUP_SIZE;
        }
        group_left -= 1;

        let sym = table.decode(bits)?;
        if sym == RUNA || sym == RUNB {
            run += run_weight << (sym as usize);
            run_weight <<= 1;
            if run > max_block {
                return Err(Bzip2Error::Corrupt("run exceeds block size"));
            }
            continue;
        }

        if run > 0 {
            if tt.len() + run > max_block {
                return Err(Bzip2Error::Corrupt("block exceeds declared size"));
            }
            let byte = seq_to_unseq[mtf[0] as usize];
            byte_counts[byte as usize] += run;
            tt.extend(std::iter::repeat_n(u32::from(byte), run));
            run = 0;
            run_weight = 1;
        }

        if sym == eob {
            break;
        }

        let pos = (sym - 1) as usize;
        if pos >= seq_to_unseq.len() {
            return Err(Bzip2Error::Corrupt("move-to-front index out of range"));
        }
        let idx = mtf.remove(pos);
        mtf.insert(0, idx);
        let byte = seq_to_unseq[idx as usize];
        if tt.len() >= max_block {
            return Err(Bzip2Error::Corrupt("block exceeds declared size"));
        }
        byte_counts[byte as usize] += 1;
        tt.push(u32::from(byte));
    }

    if orig_ptr >= tt.len() {
        return Err(Bzip2Error::Corrupt("origin pointer outside block"));
    }

    // Inverse BWT: link every position to its successor via cumulative
    // byte counts, storing the link in the upper 24 bits.
    let mut cumulative = [0usize; 256];
    let mut sum = 0usize;
    for (slot, &count) in cumulative.iter_mut().zip(byte_counts.iter()) {
        *slot = sum;
        sum += count;
    }
    for i in 0..tt.len() {
        let byte = (tt[i] & 0xFF) as usize;
        let dest = cumulative[byte];
        cumulative[byte] += 1;
        tt[dest] |= (i as u32) << 8;
    }

    // Walk the permutation and undo the initial run-length stage.
    let mut pos = (tt[orig_ptr] >> 8) as usize;
    let mut last: Option<u8> = None;
    let mut repeat = 0u8;
    for _ in 0..tt.len() {
        let entry = tt[pos];
        let byte = (entry & 0xFF) as u8;
        pos = (entry >> 8) as usize;

        if repeat == 4 {
            if let Some(prev) = last {
                out.extend(std::iter::repeat_n(prev, byte as usize));
            }
            repeat = 0;
            last = None;
            continue;
        }
        if last == Some(byte) {
            repeat += 1;
        } else {
            last = Some(byte);
            repeat = 1;
        }
        out.push(byte);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// `printf 'hello world\n' | bzip2 -9`
    const HELLO: &[u8] = &[
        0x42, 0x5a, 0x68, 0x39, 0x31, 0x41, 0x59, 0x26, 0x53, 0x59, 0x4e, 0xec, 0xe8, 0x36, 0x00,
        0x00, 0x02, 0x51, 0x80, 0x00, 0x10, 0x40, 0x00, 0x06, 0x44, 0x90, 0x80, 0x20, 0x00, 0x31,
        0x06, 0x4c, 0x41, 0x01, 0xa7, 0xa9, 0xa5, 0x80, 0xbb, 0x94, 0x31, 0xf8, 0xbb, 0x92, 0x29,
        0xc2, 0x84, 0x82, 0x77, 0x67, 0x41, 0xb0,
    ];

    /// An empty bzip2 stream: header, end marker, zero CRC.
    const EMPTY: &[u8] = &[
        0x42, 0x5a, 0x68, 0x39, 0x17, 0x72, 0x45, 0x38, 0x50, 0x90, 0x00, 0x00, 0x00, 0x00,
    ];

    #[test]
    fn crc_matches_bzip2_reference() {
        // Block CRC of "hello world\n" as stored in HELLO.
        assert_eq!(block_crc(b"hello world\n"), 0x4eec_e836);
    }

    #[test]
    fn decodes_known_stream() {
        assert_eq!(decompress(HELLO).unwrap(), b"hello world\n");
    }

    #[test]
    fn decodes_empty_stream() {
        assert_eq!(decompress(EMPTY).unwrap(), b"");
    }

    #[test]
    fn decodes_concatenated_streams() {
        let mut two = HELLO.to_vec();
        two.extend_from_slice(HELLO);
        assert_eq!(decompress(&two).unwrap(), b"hello world\nhello world\n");
    }

    #[test]
    fn rejects_bad_signature() {
        assert_eq!(decompress(b"BZx9"), Err(Bzip2Error::BadSignature));
        assert_eq!(decompress(b"BZh0"), Err(Bzip2Error::BadBlockSize(b'0')));
    }

    #[test]
    fn truncated_stream_fails() {
        assert_eq!(
            decompress(&HELLO[..HELLO.len() - 6]),
            Err(Bzip2Error::UnexpectedEof)
        );
    }

    #[test]
    fn flipped_payload_bit_is_detected() {
        let mut corrupt = HELLO.to_vec();
        corrupt[30] ^= 0x01;
        assert!(decompress(&corrupt).is_err());
    }

    #[test]
    fn over_subscribed_lengths_are_rejected() {
        assert!(HuffmanTable::new(&[1, 1, 1]).is_err());
        assert!(HuffmanTable::new(&[1, 2, 2]).is_ok());
    }
}

// UPS patches.
//
//   "UPS1"  VLV source size  VLV target size
//   record*  VLV skip  xor bytes  0x00
//   crc32(source)  crc32(target)  crc32(patch without these 4 bytes)
//
// `skip` is relative to a cursor that advances past every record's
// bytes and its terminator.  XOR bytes past the end of the source read
// the source as zero.

use byteorder::{LittleEndian, WriteBytesExt};

use super::{BuildOptions, PatchBuilder, PatchCodec, PatchInfo, image_len};
use crate::checksum::{crc32, to_hex};
use crate::cursor::{ByteCursor, byte_or_zero};
use crate::error::{ChecksumStage, PatchError, Result};
use crate::vlv::{read_vlv_usize, write_vlv};

const TRAILER: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsRecord {
    /// Bytes skipped since the end of the previous record.
    pub skip: usize,
    pub xor: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsPatch {
    pub source_size: usize,
    pub target_size: usize,
    pub records: Vec<UpsRecord>,
    pub source_crc: u32,
    pub target_crc: u32,
}

impl PatchCodec for UpsPatch {
    const MAGIC: &'static [u8] = b"UPS1";

    fn parse(data: &[u8]) -> Result<Self> {
        if !data.starts_with(Self::MAGIC) {
            return Err(PatchError::header("missing UPS magic"));
        }
        if data.len() < Self::MAGIC.len() + TRAILER {
            return Err(PatchError::TruncatedInput {
                offset: data.len(),
                needed: Self::MAGIC.len() + TRAILER - data.len(),
            });
        }

        let body_end = data.len() - TRAILER;
        let mut trailer = ByteCursor::new(&data[body_end..]);
        let source_crc = trailer.read_u32_le()?;
        let target_crc = trailer.read_u32_le()?;
        let patch_crc = trailer.read_u32_le()?;
        if crc32(&data[..data.len() - 4]) != patch_crc {
            return Err(PatchError::checksum(ChecksumStage::Patch));
        }

        let mut c = ByteCursor::new(&data[..body_end]);
        c.skip(Self::MAGIC.len())?;
        let source_size = read_vlv_usize(&mut c)?;
        let target_size = read_vlv_usize(&mut c)?;

        let mut records = Vec::new();
        while !c.is_eof() {
            let skip = read_vlv_usize(&mut c)?;
            let rest = &data[c.offset()..body_end];
            let len = rest.iter().position(|&b| b == 0).ok_or_else(|| {
                PatchError::record(format!("UPS record at {:#x} is unterminated", c.offset()))
            })?;
            let xor = c.read_bytes(len)?;
            c.skip(1)?;
            records.push(UpsRecord { skip, xor });
        }

        log::debug!(
            "ups: {} record(s), {source_size} -> {target_size} bytes",
            records.len()
        );
        Ok(Self {
            source_size,
            target_size,
            records,
            source_crc,
            target_crc,
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Self::MAGIC.to_vec();
        write_vlv(&mut out, self.source_size as u64);
        write_vlv(&mut out, self.target_size as u64);
        for record in &self.records {
            write_vlv(&mut out, record.skip as u64);
            out.extend_from_slice(&record.xor);
            out.push(0);
        }
        out.write_u32::<LittleEndian>(self.source_crc)?;
        out.write_u32::<LittleEndian>(self.target_crc)?;
        let crc = crc32(&out);
        out.write_u32::<LittleEndian>(crc)?;
        Ok(out)
    }

    fn apply(&self, source: &[u8], validate: bool) -> Result<Vec<u8>> {
        if validate && !self.validate_source(source) {
            return Err(PatchError::checksum(ChecksumStage::Source));
        }

        let mut source_size = self.source_size;
        let mut target_size = self.target_size;
        if !validate && source.len() > source_size {
            log::warn!(
                "ups: source is {} bytes, patch declares {source_size}; keeping the extra data",
                source.len()
            );
            source_size = source.len();
            target_size = target_size.max(source_size);
        }

        let mut out = vec![0u8; image_len(target_size as u64, "UPS target")?];
        let keep = source_size.min(source.len()).min(target_size);
        out[..keep].copy_from_slice(&source[..keep]);

        let mut pos = 0usize;
        for record in &self.records {
            pos = pos
                .checked_add(record.skip)
                .ok_or_else(|| PatchError::record("UPS skip overflows"))?;
            for &x in &record.xor {
                // Shrinking patches XOR away source bytes beyond the target.
                if pos < target_size {
                    out[pos] = byte_or_zero(source, pos) ^ x;
                }
                pos += 1;
            }
            pos += 1;
        }

        if validate && crc32(&out) != self.target_crc {
            return Err(PatchError::checksum(ChecksumStage::Target));
        }
        Ok(out)
    }

    fn validate_source(&self, source: &[u8]) -> bool {
        crc32(source) == self.source_crc
    }

    fn info(&self) -> PatchInfo {
        PatchInfo {
            source_size: Some(self.source_size as u64),
            target_size: Some(self.target_size as u64),
            source_checksum: Some(to_hex(&self.source_crc.to_be_bytes())),
            records: self.records.len(),
            details: Vec::new(),
        }
        .detail("target crc32", to_hex(&self.target_crc.to_be_bytes()))
    }
}

impl PatchBuilder for UpsPatch {
    fn build(original: &[u8], modified: &[u8], _options: &BuildOptions) -> Result<Self> {
        let mut records = Vec::new();
        let end = original.len().max(modified.len());
        // Position the next record's skip is measured from.
        let mut cursor = 0usize;
        let mut pos = 0usize;

        while pos < end {
            let a = byte_or_zero(original, pos);
            let b = byte_or_zero(modified, pos);
            if a == b {
                pos += 1;
                continue;
            }

            let start = pos;
            let mut xor = Vec::new();
            while pos < end {
                let a = byte_or_zero(original, pos);
                let b = byte_or_zero(modified, pos);
                if a == b {
                    break;
                }
                xor.push(a ^ b);
                pos += 1;
            }
            records.push(UpsRecord {
                skip: start - cursor,
                xor,
            });
            // The terminator covers one matching (or trailing) byte.
            pos += 1;
            cursor = pos;
        }

        Ok(Self {
            source_size: original.len(),
            target_size: modified.len(),
            records,
            source_crc: crc32(original),
            target_crc: crc32(modified),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn build(original: &[u8], modified: &[u8]) -> UpsPatch {
        UpsPatch::build(original, modified, &BuildOptions::default()).unwrap()
    }

    #[test]
    fn round_trip_same_size() {
        let original = b"The quick brown fox jumps over the lazy dog".to_vec();
        let mut modified = original.clone();
        modified[4] = b'Q';
        modified[40..43].copy_from_slice(b"cat");
        let patch = build(&original, &modified);
        assert_eq!(patch.records.len(), 2);
        let bytes = patch.serialize().unwrap();
        let parsed = UpsPatch::parse(&bytes).unwrap();
        assert_eq!(parsed, patch);
        assert_eq!(parsed.apply(&original, true).unwrap(), modified);
    }

    #[test]
    fn grows_and_shrinks() {
        let original = vec![1u8; 100];
        let mut longer = original.clone();
        longer.extend_from_slice(&[0, 0, 7, 7]);
        let patch = build(&original, &longer);
        assert_eq!(patch.apply(&original, true).unwrap(), longer);

        let shorter = original[..60].to_vec();
        let patch = build(&original, &shorter);
        assert_eq!(patch.apply(&original, true).unwrap(), shorter);
    }

    #[test]
    fn xor_records_are_reversible() {
        let a = b"abcdefgh".to_vec();
        let b = b"abXdeYYh".to_vec();
        let patch = build(&a, &b);
        // Same-size XOR patches undo themselves.
        assert_eq!(patch.apply(&b, false).unwrap(), a);
    }

    #[test]
    fn corrupted_patch_crc_is_rejected() {
        let patch = build(b"hello world", b"hello there");
        let mut bytes = patch.serialize().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(
            UpsPatch::parse(&bytes),
            Err(PatchError::ChecksumMismatch {
                stage: ChecksumStage::Patch
            })
        ));
    }

    #[test]
    fn wrong_source_fails_validation() {
        let patch = build(b"hello world", b"hello there");
        assert!(matches!(
            patch.apply(b"HELLO world", true),
            Err(PatchError::ChecksumMismatch {
                stage: ChecksumStage::Source
            })
        ));
    }

    #[test]
    fn oversized_source_is_kept_without_validation() {
        let patch = build(b"abcd", b"abXd");
        let out = patch.apply(b"abcdEXTRA", false).unwrap();
        assert_eq!(out, b"abXdEXTRA");
    }
}

// Paper Mario Star Rod mod patches.
//
//   "PMSR"  record count:u32 BE
//   record*  offset:u32 BE  length:u32 BE  data[length]
//
// Mods only target the 40 MiB Paper Mario (USA) image.

use byteorder::{BigEndian, WriteBytesExt};

use super::{PatchCodec, PatchInfo, ensure_len};
use crate::checksum::{crc32, to_hex};
use crate::cursor::ByteCursor;
use crate::error::{ChecksumStage, PatchError, Result};

pub const PAPER_MARIO_USA_SIZE: usize = 41_943_040;
pub const PAPER_MARIO_USA_CRC32: u32 = 0xA7F5_CD7E;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmsrRecord {
    pub offset: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PmsrPatch {
    pub records: Vec<PmsrRecord>,
}

impl PatchCodec for PmsrPatch {
    const MAGIC: &'static [u8] = b"PMSR";

    fn parse(data: &[u8]) -> Result<Self> {
        let mut c = ByteCursor::new(data);
        if !c.starts_with(Self::MAGIC) {
            return Err(PatchError::header("missing PMSR magic"));
        }
        c.skip(Self::MAGIC.len())?;
        let count = c.read_u32_be()?;

        // Each record needs at least 8 bytes, so a huge count fails on read
        // rather than on allocation.
        let mut records = Vec::with_capacity((count as usize).min(c.remaining() / 8));
        for _ in 0..count {
            let offset = c.read_u32_be()?;
            let len = c.read_u32_be()? as usize;
            records.push(PmsrRecord {
                offset,
                data: c.read_bytes(len)?,
            });
        }
        log::debug!("pmsr: {} record(s)", records.len());
        Ok(Self { records })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Self::MAGIC.to_vec();
        out.write_u32::<BigEndian>(self.records.len() as u32)?;
        for record in &self.records {
            let len = u32::try_from(record.data.len())
                .map_err(|_| PatchError::SizeLimitExceeded("PMSR record over 4 GiB".into()))?;
            out.write_u32::<BigEndian>(record.offset)?;
            out.write_u32::<BigEndian>(len)?;
            out.extend_from_slice(&record.data);
        }
        Ok(out)
    }

    fn apply(&self, source: &[u8], validate: bool) -> Result<Vec<u8>> {
        if validate && !self.validate_source(source) {
            return Err(PatchError::checksum(ChecksumStage::Source));
        }
        let mut out = source.to_vec();
        for record in &self.records {
            let start = record.offset as usize;
            let end = start + record.data.len();
            ensure_len(&mut out, end)?;
            out[start..end].copy_from_slice(&record.data);
        }
        Ok(out)
    }

    fn validate_source(&self, source: &[u8]) -> bool {
        source.len() == PAPER_MARIO_USA_SIZE && crc32(source) == PAPER_MARIO_USA_CRC32
    }

    fn info(&self) -> PatchInfo {
        PatchInfo {
            source_size: Some(PAPER_MARIO_USA_SIZE as u64),
            target_size: None,
            source_checksum: Some(to_hex(&PAPER_MARIO_USA_CRC32.to_be_bytes())),
            records: self.records.len(),
            details: Vec::new(),
        }
        .detail("game", "Paper Mario (USA)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PmsrPatch {
        PmsrPatch {
            records: vec![
                PmsrRecord {
                    offset: 2,
                    data: b"xy".to_vec(),
                },
                PmsrRecord {
                    offset: 10,
                    data: b"tail".to_vec(),
                },
            ],
        }
    }

    #[test]
    fn layout_is_big_endian() {
        let bytes = sample().serialize().unwrap();
        assert_eq!(&bytes[..8], b"PMSR\x00\x00\x00\x02");
        assert_eq!(&bytes[8..16], &[0, 0, 0, 2, 0, 0, 0, 2]);
        assert_eq!(PmsrPatch::parse(&bytes).unwrap(), sample());
    }

    #[test]
    fn grows_to_furthest_record() {
        let out = sample().apply(b"abcdefgh", false).unwrap();
        assert_eq!(out, b"abxyefgh\0\0tail");
    }

    #[test]
    fn only_paper_mario_validates() {
        assert!(matches!(
            sample().apply(b"abcdefgh", true),
            Err(PatchError::ChecksumMismatch {
                stage: ChecksumStage::Source
            })
        ));
    }

    #[test]
    fn truncated_record_is_reported() {
        let mut bytes = sample().serialize().unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            PmsrPatch::parse(&bytes),
            Err(PatchError::TruncatedInput { .. })
        ));
    }
}

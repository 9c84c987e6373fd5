// APS patches for Nintendo 64 images.
//
//   "APS10"  header type:u8  encoding:u8  description[50]
//   [header type 1: original format:u8  cart id[3]  crc[8]  pad[5]]
//   target size:u32 LE
//   record*  offset:u32 LE  len:u8  data[len]
//            offset:u32 LE  0x00  byte:u8  count:u8
//
// The N64 header copies the cartridge id (ROM 0x3C) and the header CRC
// (ROM 0x10) of the original so the source can be recognised later.

use byteorder::{LittleEndian, WriteBytesExt};

use super::{BuildOptions, PatchBuilder, PatchCodec, PatchInfo};
use crate::checksum::to_hex;
use crate::cursor::{ByteCursor, write_fixed_string};
use crate::error::{ChecksumStage, PatchError, Result};

const DESCRIPTION_LEN: usize = 50;
const CART_ID_OFFSET: usize = 0x3C;
const CRC_OFFSET: usize = 0x10;
const MAX_RECORD: usize = 0xFF;

/// Big-endian (.z64) N64 images start with these bytes.
pub const Z64_MAGIC: [u8; 4] = [0x80, 0x37, 0x12, 0x40];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct N64Header {
    /// 0 for byte-swapped (.v64), 1 for big-endian (.z64).
    pub original_format: u8,
    pub cart_id: [u8; 3],
    pub crc: [u8; 8],
}

impl N64Header {
    fn from_rom(rom: &[u8]) -> Option<Self> {
        let cart_id = rom.get(CART_ID_OFFSET..CART_ID_OFFSET + 3)?;
        let crc = rom.get(CRC_OFFSET..CRC_OFFSET + 8)?;
        Some(Self {
            original_format: 1,
            cart_id: cart_id.try_into().ok()?,
            crc: crc.try_into().ok()?,
        })
    }

    fn matches(&self, rom: &[u8]) -> bool {
        rom.get(CART_ID_OFFSET..CART_ID_OFFSET + 3) == Some(&self.cart_id[..])
            && rom.get(CRC_OFFSET..CRC_OFFSET + 8) == Some(&self.crc[..])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApsRecord {
    Simple { offset: u32, data: Vec<u8> },
    Rle { offset: u32, byte: u8, count: u8 },
}

impl ApsRecord {
    fn end(&self) -> usize {
        match self {
            Self::Simple { offset, data } => *offset as usize + data.len(),
            Self::Rle { offset, count, .. } => *offset as usize + *count as usize,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApsN64Patch {
    pub encoding: u8,
    pub description: String,
    pub header: Option<N64Header>,
    pub target_size: u32,
    pub records: Vec<ApsRecord>,
}

impl PatchCodec for ApsN64Patch {
    const MAGIC: &'static [u8] = b"APS10";

    fn parse(data: &[u8]) -> Result<Self> {
        let mut c = ByteCursor::new(data);
        if !c.starts_with(Self::MAGIC) {
            return Err(PatchError::header("missing APS10 magic"));
        }
        c.skip(Self::MAGIC.len())?;

        let header_type = c.read_u8()?;
        let encoding = c.read_u8()?;
        let description = c.read_fixed_string(DESCRIPTION_LEN)?;
        let header = match header_type {
            0 => None,
            1 => {
                let original_format = c.read_u8()?;
                let mut cart_id = [0u8; 3];
                cart_id.copy_from_slice(c.take(3)?);
                let mut crc = [0u8; 8];
                crc.copy_from_slice(c.take(8)?);
                c.skip(5)?;
                Some(N64Header {
                    original_format,
                    cart_id,
                    crc,
                })
            }
            other => {
                return Err(PatchError::header(format!("unknown APS header type {other}")));
            }
        };
        let target_size = c.read_u32_le()?;

        let mut records = Vec::new();
        while !c.is_eof() {
            let offset = c.read_u32_le()?;
            let len = c.read_u8()?;
            records.push(if len == 0 {
                ApsRecord::Rle {
                    offset,
                    byte: c.read_u8()?,
                    count: c.read_u8()?,
                }
            } else {
                ApsRecord::Simple {
                    offset,
                    data: c.read_bytes(len as usize)?,
                }
            });
        }

        log::debug!("aps-n64: {} record(s), target {target_size} bytes", records.len());
        Ok(Self {
            encoding,
            description,
            header,
            target_size,
            records,
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Self::MAGIC.to_vec();
        out.push(u8::from(self.header.is_some()));
        out.push(self.encoding);
        write_fixed_string(&mut out, &self.description, DESCRIPTION_LEN)?;
        if let Some(h) = &self.header {
            out.push(h.original_format);
            out.extend_from_slice(&h.cart_id);
            out.extend_from_slice(&h.crc);
            out.extend_from_slice(&[0u8; 5]);
        }
        out.write_u32::<LittleEndian>(self.target_size)?;

        for record in &self.records {
            match record {
                ApsRecord::Simple { offset, data } => {
                    if data.is_empty() || data.len() > MAX_RECORD {
                        return Err(PatchError::SizeLimitExceeded(format!(
                            "APS record of {} bytes at {offset:#x}",
                            data.len()
                        )));
                    }
                    out.write_u32::<LittleEndian>(*offset)?;
                    out.push(data.len() as u8);
                    out.extend_from_slice(data);
                }
                ApsRecord::Rle {
                    offset,
                    byte,
                    count,
                } => {
                    out.write_u32::<LittleEndian>(*offset)?;
                    out.push(0);
                    out.push(*byte);
                    out.push(*count);
                }
            }
        }
        Ok(out)
    }

    fn apply(&self, source: &[u8], validate: bool) -> Result<Vec<u8>> {
        if validate && !self.validate_source(source) {
            return Err(PatchError::checksum(ChecksumStage::Source));
        }

        let target_size = self.target_size as usize;
        let mut out = source.to_vec();
        out.resize(target_size, 0);

        for record in &self.records {
            if record.end() > target_size {
                return Err(PatchError::record(format!(
                    "APS record ends at {:#x}, past the {target_size}-byte target",
                    record.end()
                )));
            }
            match record {
                ApsRecord::Simple { offset, data } => {
                    let at = *offset as usize;
                    out[at..at + data.len()].copy_from_slice(data);
                }
                ApsRecord::Rle {
                    offset,
                    byte,
                    count,
                } => {
                    let at = *offset as usize;
                    out[at..at + *count as usize].fill(*byte);
                }
            }
        }
        Ok(out)
    }

    fn validate_source(&self, source: &[u8]) -> bool {
        self.header.as_ref().is_none_or(|h| h.matches(source))
    }

    fn info(&self) -> PatchInfo {
        let mut info = PatchInfo {
            target_size: Some(u64::from(self.target_size)),
            records: self.records.len(),
            ..Default::default()
        };
        if let Some(h) = &self.header {
            info.source_checksum = Some(to_hex(&h.crc));
            info = info.detail("cart id", String::from_utf8_lossy(&h.cart_id));
        }
        if !self.description.is_empty() {
            info = info.detail("description", &self.description);
        }
        info
    }
}

impl PatchBuilder for ApsN64Patch {
    fn build(original: &[u8], modified: &[u8], options: &BuildOptions) -> Result<Self> {
        if modified.len() > u32::MAX as usize {
            return Err(PatchError::SizeLimitExceeded(
                "APS target larger than 4 GiB".into(),
            ));
        }
        let header = if original.starts_with(&Z64_MAGIC) {
            N64Header::from_rom(original)
        } else {
            None
        };

        let mut records = Vec::new();
        let mut pos = 0usize;
        while pos < modified.len() {
            let b = modified[pos];
            if original.get(pos) == Some(&b) {
                pos += 1;
                continue;
            }

            let start = pos;
            let mut data = Vec::new();
            while pos < modified.len() && data.len() < MAX_RECORD {
                let b = modified[pos];
                if original.get(pos) == Some(&b) {
                    break;
                }
                data.push(b);
                pos += 1;
            }

            let offset = start as u32;
            if data.len() > 2 && data.iter().all(|&x| x == data[0]) {
                records.push(ApsRecord::Rle {
                    offset,
                    byte: data[0],
                    count: data.len() as u8,
                });
            } else {
                records.push(ApsRecord::Simple { offset, data });
            }
        }

        Ok(Self {
            encoding: 0,
            description: options.metadata.description.clone().unwrap_or_default(),
            header,
            target_size: modified.len() as u32,
            records,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn n64_rom() -> Vec<u8> {
        let mut rom: Vec<u8> = (0..0x2000u32).map(|i| (i % 251) as u8).collect();
        rom[..4].copy_from_slice(&Z64_MAGIC);
        rom[0x3C..0x3F].copy_from_slice(b"NSM");
        rom
    }

    #[test]
    fn builds_n64_header_from_z64_rom() {
        let original = n64_rom();
        let mut modified = original.clone();
        modified[0x100..0x110].fill(0xAA);
        modified[0x400] ^= 0xFF;

        let patch = ApsN64Patch::build(&original, &modified, &BuildOptions::default()).unwrap();
        let header = patch.header.as_ref().unwrap();
        assert_eq!(&header.cart_id, b"NSM");
        assert_eq!(header.crc, original[0x10..0x18]);
        assert!(matches!(patch.records[0], ApsRecord::Rle { count: 16, byte: 0xAA, .. }));

        let bytes = patch.serialize().unwrap();
        let parsed = ApsN64Patch::parse(&bytes).unwrap();
        assert_eq!(parsed, patch);
        assert_eq!(parsed.apply(&original, true).unwrap(), modified);
    }

    #[test]
    fn wrong_cartridge_is_rejected() {
        let original = n64_rom();
        let mut modified = original.clone();
        modified[0x500] = 1;
        let patch = ApsN64Patch::build(&original, &modified, &BuildOptions::default()).unwrap();

        let mut other = original.clone();
        other[0x3C] = b'X';
        assert!(!patch.validate_source(&other));
        assert!(matches!(
            patch.apply(&other, true),
            Err(PatchError::ChecksumMismatch {
                stage: ChecksumStage::Source
            })
        ));
    }

    #[test]
    fn long_runs_split_at_255_bytes() {
        let original = vec![0u8; 1000];
        let modified: Vec<u8> = (0..1000u32).map(|i| (i % 7 + 1) as u8).collect();
        let patch = ApsN64Patch::build(&original, &modified, &BuildOptions::default()).unwrap();
        assert!(patch.header.is_none());
        assert_eq!(patch.records.len(), 4);
        assert_eq!(patch.apply(&original, true).unwrap(), modified);
    }

    #[test]
    fn resizes_to_target() {
        let original = b"0123456789".to_vec();
        let grown = b"0123456789AB".to_vec();
        let patch = ApsN64Patch::build(&original, &grown, &BuildOptions::default()).unwrap();
        assert_eq!(patch.apply(&original, true).unwrap(), grown);

        let shrunk = b"01234".to_vec();
        let patch = ApsN64Patch::build(&original, &shrunk, &BuildOptions::default()).unwrap();
        assert!(patch.records.is_empty());
        assert_eq!(patch.apply(&original, true).unwrap(), shrunk);
    }
}

// APS patches for Game Boy Advance images.
//
//   "APS1"  source size:u32 LE  target size:u32 LE
//   block*  offset:u32 LE  source crc16:u16 LE  target crc16:u16 LE  xor[65536]
//
// Each block XORs a whole 64 KiB window of the image.  The CRC16s cover
// the window before and after patching, so a block can be checked as
// soon as it is written.

use byteorder::{LittleEndian, WriteBytesExt};

use super::{PatchCodec, PatchInfo};
use crate::checksum::crc16;
use crate::cursor::{ByteCursor, byte_or_zero};
use crate::error::{ChecksumStage, PatchError, Result};

pub const BLOCK_SIZE: usize = 0x10000;
const HEADER_LEN: usize = 12;
const RECORD_LEN: usize = 8 + BLOCK_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApsGbaBlock {
    pub offset: u32,
    pub source_crc16: u16,
    pub target_crc16: u16,
    pub xor: Vec<u8>,
}

impl ApsGbaBlock {
    /// The 64 KiB window of `image` this block covers, zero-extended.
    fn window(&self, image: &[u8]) -> Vec<u8> {
        let start = self.offset as usize;
        (start..start + BLOCK_SIZE).map(|p| byte_or_zero(image, p)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApsGbaPatch {
    pub source_size: u32,
    pub target_size: u32,
    pub blocks: Vec<ApsGbaBlock>,
}

impl PatchCodec for ApsGbaPatch {
    const MAGIC: &'static [u8] = b"APS1";

    /// "APS1" is also a prefix of "APS10", so the file size must be an
    /// exact number of blocks as well.
    fn detect(data: &[u8]) -> bool {
        data.starts_with(Self::MAGIC)
            && data.len() >= HEADER_LEN + RECORD_LEN
            && (data.len() - HEADER_LEN) % RECORD_LEN == 0
    }

    fn parse(data: &[u8]) -> Result<Self> {
        if !Self::detect(data) {
            return Err(PatchError::header("not an APS-GBA patch"));
        }
        let mut c = ByteCursor::new(data);
        c.skip(Self::MAGIC.len())?;
        let source_size = c.read_u32_le()?;
        let target_size = c.read_u32_le()?;

        let mut blocks = Vec::with_capacity((data.len() - HEADER_LEN) / RECORD_LEN);
        while !c.is_eof() {
            blocks.push(ApsGbaBlock {
                offset: c.read_u32_le()?,
                source_crc16: c.read_u16_le()?,
                target_crc16: c.read_u16_le()?,
                xor: c.read_bytes(BLOCK_SIZE)?,
            });
        }

        log::debug!(
            "aps-gba: {} block(s), {source_size} -> {target_size} bytes",
            blocks.len()
        );
        Ok(Self {
            source_size,
            target_size,
            blocks,
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.blocks.len() * RECORD_LEN);
        out.extend_from_slice(Self::MAGIC);
        out.write_u32::<LittleEndian>(self.source_size)?;
        out.write_u32::<LittleEndian>(self.target_size)?;
        for block in &self.blocks {
            if block.xor.len() != BLOCK_SIZE {
                return Err(PatchError::record(format!(
                    "APS-GBA block at {:#x} holds {} bytes",
                    block.offset,
                    block.xor.len()
                )));
            }
            out.write_u32::<LittleEndian>(block.offset)?;
            out.write_u16::<LittleEndian>(block.source_crc16)?;
            out.write_u16::<LittleEndian>(block.target_crc16)?;
            out.extend_from_slice(&block.xor);
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

        for block in &self.blocks {
            let start = block.offset as usize;
            let patched: Vec<u8> = block
                .window(source)
                .iter()
                .zip(&block.xor)
                .map(|(a, x)| a ^ x)
                .collect();
            if validate && crc16(&patched) != block.target_crc16 {
                return Err(PatchError::checksum(ChecksumStage::Target));
            }
            if start < target_size {
                let end = (start + BLOCK_SIZE).min(target_size);
                out[start..end].copy_from_slice(&patched[..end - start]);
            }
        }
        Ok(out)
    }

    fn validate_source(&self, source: &[u8]) -> bool {
        source.len() == self.source_size as usize
            && self
                .blocks
                .iter()
                .all(|b| crc16(&b.window(source)) == b.source_crc16)
    }

    fn info(&self) -> PatchInfo {
        PatchInfo {
            source_size: Some(u64::from(self.source_size)),
            target_size: Some(u64::from(self.target_size)),
            source_checksum: None,
            records: self.blocks.len(),
            details: Vec::new(),
        }
        .detail("block size", BLOCK_SIZE)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

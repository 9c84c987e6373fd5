// PlayStation Patch Format, versions 1 to 3.
//
//   "PPF" "10"|"20"|"30"  version-1:u8  description[50]
//   v2: input size:u32 LE  block check[1024]
//   v3: image type:u8  block check flag:u8  undo flag:u8  dummy:u8  [block check[1024]]
//   record*  offset (u32 LE, u64 LE in v3)  len:u8  data[len]  [undo[len]]
//   ["@BEGIN_FILE_ID.DIZ" text "@END_FILE_ID.DIZ" (v2/v3: text length:u32 LE)]
//
// The block check is a 1024-byte excerpt of the disc image the patch was
// made for, taken at 0x9320 (0x80A0 for v3 GI images).

use byteorder::{LittleEndian, WriteBytesExt};

use super::{BuildOptions, PatchBuilder, PatchCodec, PatchInfo, ensure_len};
use crate::cursor::ByteCursor;
use crate::error::{ChecksumStage, PatchError, Result};

const DESCRIPTION_LEN: usize = 50;
const BLOCK_CHECK_LEN: usize = 1024;
const BLOCK_CHECK_BIN: usize = 0x9320;
const BLOCK_CHECK_GI: usize = 0x80A0;
const MAX_RECORD: usize = 0xFF;

const DIZ_BEGIN: &[u8] = b"@BEGIN_FILE_ID.DIZ";
const DIZ_END: &[u8] = b"@END_FILE_ID.DIZ";

const DEFAULT_DESCRIPTION: &str = "Patch description";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PpfRecord {
    pub offset: u64,
    pub data: Vec<u8>,
    /// Bytes the record overwrites, when the patch carries undo data.
    pub undo: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PpfPatch {
    /// 1, 2 or 3.
    pub version: u8,
    pub description: String,
    /// v3 only: 0 for BIN images, 1 for GI images.
    pub image_type: u8,
    /// v2 only: size of the image the patch was made for.
    pub input_size: Option<u32>,
    pub block_check: Option<Vec<u8>>,
    pub undo: bool,
    pub records: Vec<PpfRecord>,
    pub file_id_diz: Option<String>,
}

impl PpfPatch {
    fn block_check_offset(&self) -> usize {
        if self.version == 3 && self.image_type == 1 {
            BLOCK_CHECK_GI
        } else {
            BLOCK_CHECK_BIN
        }
    }

    /// Whether `image` already holds the first record's data, meaning the
    /// patch was applied before and should be reverted.
    fn is_applied_to(&self, image: &[u8]) -> bool {
        let Some(first) = self.records.first() else {
            return false;
        };
        if first.undo.is_none() {
            return false;
        }
        usize::try_from(first.offset)
            .ok()
            .and_then(|start| image.get(start..start.checked_add(first.data.len())?))
            .is_some_and(|live| live == &first.data[..])
    }
}

fn read_description(c: &mut ByteCursor<'_>) -> Result<String> {
    let text = c.read_fixed_string(DESCRIPTION_LEN)?;
    Ok(text.trim_end_matches(' ').to_string())
}

fn write_description(out: &mut Vec<u8>, text: &str) {
    let bytes = text.as_bytes();
    let n = bytes.len().min(DESCRIPTION_LEN);
    out.extend_from_slice(&bytes[..n]);
    out.resize(out.len() + DESCRIPTION_LEN - n, b' ');
}

impl PatchCodec for PpfPatch {
    const MAGIC: &'static [u8] = b"PPF";

    fn parse(data: &[u8]) -> Result<Self> {
        let mut c = ByteCursor::new(data);
        if !c.starts_with(Self::MAGIC) {
            return Err(PatchError::header("missing PPF magic"));
        }
        c.skip(Self::MAGIC.len())?;
        let version = match c.take(2)? {
            b"10" => 1,
            b"20" => 2,
            b"30" => 3,
            other => {
                return Err(PatchError::header(format!(
                    "unknown PPF version {:?}",
                    String::from_utf8_lossy(other)
                )));
            }
        };
        let encoded = c.read_u8()?;
        if encoded != version - 1 {
            return Err(PatchError::header(format!(
                "PPF{version}0 declares encoding byte {encoded}"
            )));
        }
        let description = read_description(&mut c)?;

        let mut image_type = 0;
        let mut input_size = None;
        let mut block_check = None;
        let mut undo = false;
        match version {
            2 => {
                input_size = Some(c.read_u32_le()?);
                block_check = Some(c.read_bytes(BLOCK_CHECK_LEN)?);
            }
            3 => {
                image_type = c.read_u8()?;
                let has_block_check = c.read_u8()? != 0;
                undo = c.read_u8()? != 0;
                c.skip(1)?;
                if has_block_check {
                    block_check = Some(c.read_bytes(BLOCK_CHECK_LEN)?);
                }
            }
            _ => {}
        }

        let mut records = Vec::new();
        let mut file_id_diz = None;
        while !c.is_eof() {
            if version > 1 && c.starts_with(b"@BEG") {
                let rest = &data[c.offset()..];
                let body = rest.strip_prefix(DIZ_BEGIN).unwrap_or(&rest[4..]);
                let end = body
                    .windows(DIZ_END.len())
                    .position(|w| w == DIZ_END)
                    .unwrap_or(body.len());
                file_id_diz = Some(String::from_utf8_lossy(&body[..end]).into_owned());
                break;
            }

            let offset = if version == 3 {
                c.read_u64_le()?
            } else {
                u64::from(c.read_u32_le()?)
            };
            let len = c.read_u8()? as usize;
            let data = c.read_bytes(len)?;
            let undo_bytes = if undo { Some(c.read_bytes(len)?) } else { None };
            records.push(PpfRecord {
                offset,
                data,
                undo: undo_bytes,
            });
        }

        log::debug!("ppf: version {version}, {} record(s)", records.len());
        Ok(Self {
            version,
            description,
            image_type,
            input_size,
            block_check,
            undo,
            records,
            file_id_diz,
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        if !(1..=3).contains(&self.version) {
            return Err(PatchError::header(format!("PPF version {}", self.version)));
        }
        let mut out = Self::MAGIC.to_vec();
        out.extend_from_slice(format!("{}0", self.version).as_bytes());
        out.push(self.version - 1);
        write_description(&mut out, &self.description);

        let block = |out: &mut Vec<u8>, check: Option<&Vec<u8>>| {
            let mut bytes = check.cloned().unwrap_or_default();
            bytes.resize(BLOCK_CHECK_LEN, 0);
            out.extend_from_slice(&bytes);
        };
        match self.version {
            2 => {
                out.write_u32::<LittleEndian>(self.input_size.unwrap_or(0))?;
                block(&mut out, self.block_check.as_ref());
            }
            3 => {
                out.push(self.image_type);
                out.push(u8::from(self.block_check.is_some()));
                out.push(u8::from(self.undo));
                out.push(0);
                if self.block_check.is_some() {
                    block(&mut out, self.block_check.as_ref());
                }
            }
            _ => {}
        }

        for record in &self.records {
            let len = record.data.len();
            if len == 0 || len > MAX_RECORD {
                return Err(PatchError::SizeLimitExceeded(format!(
                    "PPF record of {len} bytes at {:#x}",
                    record.offset
                )));
            }
            if self.version == 3 {
                out.write_u64::<LittleEndian>(record.offset)?;
            } else {
                let offset = u32::try_from(record.offset).map_err(|_| {
                    PatchError::SizeLimitExceeded(format!(
                        "PPF{}0 offset {:#x} needs 64 bits",
                        self.version, record.offset
                    ))
                })?;
                out.write_u32::<LittleEndian>(offset)?;
            }
            out.push(len as u8);
            out.extend_from_slice(&record.data);
            if self.undo {
                let undo = record.undo.as_deref().ok_or_else(|| {
                    PatchError::record(format!("PPF record at {:#x} lacks undo data", record.offset))
                })?;
                if undo.len() != len {
                    return Err(PatchError::record("PPF undo data length differs from record"));
                }
                out.extend_from_slice(undo);
            }
        }

        if let Some(diz) = &self.file_id_diz
            && self.version > 1
        {
            out.extend_from_slice(DIZ_BEGIN);
            out.extend_from_slice(diz.as_bytes());
            out.extend_from_slice(DIZ_END);
            out.write_u32::<LittleEndian>(diz.len() as u32)?;
        }
        Ok(out)
    }

    fn apply(&self, source: &[u8], validate: bool) -> Result<Vec<u8>> {
        if validate && !self.validate_source(source) {
            return Err(PatchError::checksum(ChecksumStage::Source));
        }

        let undoing = self.undo && self.is_applied_to(source);
        if undoing {
            log::warn!("ppf: image already carries this patch, reverting it");
        }

        let mut out = source.to_vec();
        for record in &self.records {
            let bytes = match (&record.undo, undoing) {
                (Some(undo), true) => undo,
                _ => &record.data,
            };
            let start = usize::try_from(record.offset)
                .map_err(|_| PatchError::record("PPF offset does not fit in memory"))?;
            let end = start
                .checked_add(bytes.len())
                .ok_or_else(|| PatchError::record("PPF record overflows"))?;
            ensure_len(&mut out, end)?;
            out[start..end].copy_from_slice(bytes);
        }
        Ok(out)
    }

    fn validate_source(&self, source: &[u8]) -> bool {
        if let Some(size) = self.input_size
            && source.len() != size as usize
        {
            return false;
        }
        match &self.block_check {
            Some(check) => {
                let at = self.block_check_offset();
                source.get(at..at + BLOCK_CHECK_LEN) == Some(&check[..])
            }
            None => true,
        }
    }

    fn info(&self) -> PatchInfo {
        let mut info = PatchInfo {
            source_size: self.input_size.map(u64::from),
            records: self.records.len(),
            ..Default::default()
        }
        .detail("version", self.version)
        .detail("undo data", self.undo)
        .detail("block check", self.block_check.is_some());
        if !self.description.is_empty() {
            info = info.detail("description", &self.description);
        }
        if let Some(diz) = &self.file_id_diz {
            info = info.detail("FILE_ID.DIZ", diz);
        }
        info
    }
}

impl PatchBuilder for PpfPatch {
    /// Version 3 with undo data.  A shorter modified image is zero padded:
    /// PPF can only grow an image.
    fn build(original: &[u8], modified: &[u8], options: &BuildOptions) -> Result<Self> {
        let end = modified.len().max(original.len());
        let target = |pos: usize| modified.get(pos).copied().unwrap_or(0);
        let before = |pos: usize| original.get(pos).copied().unwrap_or(0);

        let mut records = Vec::new();
        let mut pos = 0usize;
        while pos < end {
            if before(pos) == target(pos) {
                pos += 1;
                continue;
            }
            let start = pos;
            let mut data = Vec::new();
            let mut undo = Vec::new();
            while pos < end && before(pos) != target(pos) && data.len() < MAX_RECORD {
                data.push(target(pos));
                undo.push(before(pos));
                pos += 1;
            }
            records.push(PpfRecord {
                offset: start as u64,
                data,
                undo: Some(undo),
            });
        }

        // Apply only grows the image up to the furthest record, so a tail
        // of zeros needs its last byte written explicitly.
        let reached = records.last().map_or(0, |r| r.offset as usize + r.data.len());
        if modified.len() > original.len() && reached < modified.len() {
            let last = modified.len() - 1;
            records.push(PpfRecord {
                offset: last as u64,
                data: vec![modified[last]],
                undo: Some(vec![before(last)]),
            });
        }

        Ok(Self {
            version: 3,
            description: options
                .metadata
                .description
                .clone()
                .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
            image_type: 0,
            input_size: None,
            block_check: None,
            undo: true,
            records,
            file_id_diz: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

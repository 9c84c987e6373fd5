// IPS patches, and the EBP (EarthBound Patcher) variant.
//
//   "PATCH"
//   record*   offset:u24 BE  size:u16 BE  data[size]
//             offset:u24 BE  0x0000  run:u16 BE  byte
//   "EOF"
//   [truncate:u24 BE]            plain IPS only
//   [JSON metadata object]       EBP only
//
// The bytes "EOF" are also a valid record offset (0x454F46); they only end
// the record stream when nothing, exactly a truncate value, or a JSON
// object follows.

use byteorder::{BigEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};

use super::{BuildOptions, PatchBuilder, PatchCodec, PatchInfo, PatchMetadata, ensure_len};
use crate::cursor::{ByteCursor, byte_or_zero};
use crate::error::{PatchError, Result};

const EOF_MARKER: &[u8] = b"EOF";
const EOF_OFFSET: usize = 0x454F46;

/// Offsets are 24-bit.
pub const MAX_OFFSET: usize = 0x100_0000;
/// Largest payload of one record.
pub const MAX_RECORD: usize = 0xFFFF;
/// Differences closer than this to the previous record are folded into it.
const MERGE_GAP: usize = 6;
/// RLE runs longer than this always get a record of their own.
const RLE_SPLIT: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpsRecord {
    Simple { offset: u32, data: Vec<u8> },
    Rle { offset: u32, len: u16, byte: u8 },
}

impl IpsRecord {
    pub fn offset(&self) -> usize {
        match self {
            Self::Simple { offset, .. } | Self::Rle { offset, .. } => *offset as usize,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Simple { data, .. } => data.len(),
            Self::Rle { len, .. } => *len as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn end(&self) -> usize {
        self.offset() + self.len()
    }
}

/// The JSON object EBP files carry after "EOF".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct EbpJson {
    #[serde(rename = "Author", alias = "author", default)]
    author: String,
    #[serde(rename = "Title", alias = "title", default)]
    title: String,
    #[serde(rename = "Description", alias = "description", default)]
    description: String,
    #[serde(default)]
    patcher: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpsPatch {
    pub records: Vec<IpsRecord>,
    /// Exact output length, when the patch shrinks (or pads) the image.
    pub truncate: Option<u32>,
    /// Present for EBP patches.
    pub metadata: Option<PatchMetadata>,
}

impl IpsPatch {
    pub fn is_ebp(&self) -> bool {
        self.metadata.is_some()
    }

    fn parse_metadata(json: &[u8]) -> Result<PatchMetadata> {
        let raw: EbpJson = serde_json::from_slice(json)
            .map_err(|e| PatchError::header(format!("EBP metadata is not valid JSON: {e}")))?;
        let field = |s: String| if s.is_empty() { None } else { Some(s) };
        Ok(PatchMetadata {
            title: field(raw.title),
            author: field(raw.author),
            description: field(raw.description),
        })
    }
}

impl PatchCodec for IpsPatch {
    const MAGIC: &'static [u8] = b"PATCH";

    fn parse(data: &[u8]) -> Result<Self> {
        let mut c = ByteCursor::new(data);
        if c.take(Self::MAGIC.len())? != Self::MAGIC {
            return Err(PatchError::header("missing IPS magic"));
        }

        let mut patch = IpsPatch::default();
        loop {
            if c.starts_with(EOF_MARKER) {
                let after = c.remaining() - EOF_MARKER.len();
                let json_follows = c.data().get(c.offset() + EOF_MARKER.len()) == Some(&b'{');
                if after == 0 || after == 3 || json_follows {
                    c.skip(EOF_MARKER.len())?;
                    if after == 3 && !json_follows {
                        patch.truncate = Some(c.read_u24_be()?);
                    } else if json_follows {
                        patch.metadata = Some(Self::parse_metadata(&data[c.offset()..])?);
                    }
                    break;
                }
            }

            let offset = c.read_u24_be()?;
            let size = c.read_u16_be()?;
            let record = if size == 0 {
                let len = c.read_u16_be()?;
                let byte = c.read_u8()?;
                IpsRecord::Rle { offset, len, byte }
            } else {
                IpsRecord::Simple {
                    offset,
                    data: c.read_bytes(size as usize)?,
                }
            };
            patch.records.push(record);
        }

        log::debug!(
            "ips: {} record(s), truncate {:?}, ebp {}",
            patch.records.len(),
            patch.truncate,
            patch.is_ebp()
        );
        Ok(patch)
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Self::MAGIC.to_vec();
        for record in &self.records {
            match record {
                IpsRecord::Simple { offset, data } => {
                    let len = u16::try_from(data.len()).map_err(|_| {
                        PatchError::SizeLimitExceeded(format!(
                            "IPS record at {offset:#x} holds {} bytes",
                            data.len()
                        ))
                    })?;
                    out.write_u24::<BigEndian>(*offset)?;
                    out.write_u16::<BigEndian>(len)?;
                    out.extend_from_slice(data);
                }
                IpsRecord::Rle { offset, len, byte } => {
                    out.write_u24::<BigEndian>(*offset)?;
                    out.write_u16::<BigEndian>(0)?;
                    out.write_u16::<BigEndian>(*len)?;
                    out.push(*byte);
                }
            }
        }
        out.extend_from_slice(EOF_MARKER);

        if let Some(meta) = &self.metadata {
            let json = EbpJson {
                author: meta.author.clone().unwrap_or_default(),
                title: meta.title.clone().unwrap_or_default(),
                description: meta.description.clone().unwrap_or_default(),
                patcher: "EBPatcher".into(),
            };
            serde_json::to_writer(&mut out, &json)
                .map_err(|e| PatchError::header(format!("cannot encode EBP metadata: {e}")))?;
        } else if let Some(len) = self.truncate {
            out.write_u24::<BigEndian>(len)?;
        }
        Ok(out)
    }

    fn apply(&self, source: &[u8], _validate: bool) -> Result<Vec<u8>> {
        let mut out = source.to_vec();
        let furthest = self.records.iter().map(IpsRecord::end).max().unwrap_or(0);
        ensure_len(&mut out, furthest)?;

        for record in &self.records {
            match record {
                IpsRecord::Simple { offset, data } => {
                    let start = *offset as usize;
                    out[start..start + data.len()].copy_from_slice(data);
                }
                IpsRecord::Rle { offset, len, byte } => {
                    let start = *offset as usize;
                    out[start..start + *len as usize].fill(*byte);
                }
            }
        }

        if let Some(len) = self.truncate {
            out.resize(len as usize, 0);
        }
        Ok(out)
    }

    fn info(&self) -> PatchInfo {
        let mut info = PatchInfo {
            target_size: self.truncate.map(u64::from),
            records: self.records.len(),
            ..PatchInfo::default()
        };
        let rle = self
            .records
            .iter()
            .filter(|r| matches!(r, IpsRecord::Rle { .. }))
            .count();
        info = info.detail("rle records", rle);
        if let Some(meta) = &self.metadata {
            for (key, value) in [
                ("title", &meta.title),
                ("author", &meta.author),
                ("description", &meta.description),
            ] {
                if let Some(v) = value {
                    info = info.detail(key, v);
                }
            }
        }
        info
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

impl PatchBuilder for IpsPatch {
    fn build(original: &[u8], modified: &[u8], options: &BuildOptions) -> Result<Self> {
        let mut records: Vec<IpsRecord> = Vec::new();
        // Index of the last record, when it is a simple record that may
        // still absorb a nearby difference.
        let mut mergeable: Option<usize> = None;
        let mut seek = 0usize;

        while seek < modified.len() {
            if byte_or_zero(original, seek) == modified[seek] {
                seek += 1;
                continue;
            }

            let start = seek;
            let first = modified[start];
            let limit = if start == EOF_OFFSET {
                MAX_RECORD - 1
            } else {
                MAX_RECORD
            };
            let mut rle = true;
            while seek < modified.len()
                && seek - start < limit
                && byte_or_zero(original, seek) != modified[seek]
            {
                rle &= modified[seek] == first;
                seek += 1;
            }
            let len = seek - start;

            if let Some(idx) = mergeable
                && let IpsRecord::Simple { offset, data } = &mut records[idx]
            {
                let prev_end = *offset as usize + data.len();
                let gap = start - prev_end;
                if gap < MERGE_GAP && data.len() + gap + len < MAX_RECORD {
                    if rle && len > RLE_SPLIT {
                        // Rescan this run without the merge candidate so it
                        // becomes an RLE record.
                        mergeable = None;
                        seek = start;
                        continue;
                    }
                    data.extend_from_slice(&modified[prev_end..seek]);
                    continue;
                }
            }

            if start >= MAX_OFFSET {
                return Err(PatchError::SizeLimitExceeded(format!(
                    "IPS cannot address offset {start:#x} (limit {MAX_OFFSET:#x})"
                )));
            }

            let record = if rle && len > 2 {
                mergeable = None;
                IpsRecord::Rle {
                    offset: start as u32,
                    len: len as u16,
                    byte: first,
                }
            } else {
                mergeable = Some(records.len());
                IpsRecord::Simple {
                    offset: start as u32,
                    data: modified[start..seek].to_vec(),
                }
            };
            records.push(avoid_eof_offset(record, modified));
        }

        if modified.len() > original.len() {
            let last_end = records.last().map(IpsRecord::end).unwrap_or(0);
            if last_end < modified.len() {
                let offset = modified.len() - 1;
                if offset >= MAX_OFFSET {
                    return Err(PatchError::SizeLimitExceeded(format!(
                        "IPS cannot grow an image to {} bytes",
                        modified.len()
                    )));
                }
                records.push(IpsRecord::Simple {
                    offset: offset as u32,
                    data: vec![0x00],
                });
            }
        }

        let metadata = (!options.metadata.is_empty()).then(|| options.metadata.clone());
        if metadata.is_some() && modified.len() < original.len() {
            return Err(PatchError::UnsupportedFeature(
                "EBP patches cannot shrink an image".into(),
            ));
        }
        let truncate = if modified.len() < original.len() && metadata.is_none() {
            Some(u32::try_from(modified.len()).map_err(|_| {
                PatchError::SizeLimitExceeded("IPS truncation beyond 24 bits".into())
            })?)
        } else {
            None
        };
        if truncate.is_some_and(|t| t as usize >= MAX_OFFSET) {
            return Err(PatchError::SizeLimitExceeded(
                "IPS truncation beyond 24 bits".into(),
            ));
        }

        log::debug!(
            "ips: built {} record(s) ({} -> {} bytes)",
            records.len(),
            original.len(),
            modified.len()
        );
        Ok(IpsPatch {
            records,
            truncate,
            metadata,
        })
    }
}

/// A record at offset 0x454F46 would serialize as "EOF"; start it one
/// byte earlier instead.
fn avoid_eof_offset(record: IpsRecord, modified: &[u8]) -> IpsRecord {
    if record.offset() != EOF_OFFSET {
        return record;
    }
    let start = EOF_OFFSET - 1;
    IpsRecord::Simple {
        offset: start as u32,
        data: modified[start..record.end()].to_vec(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

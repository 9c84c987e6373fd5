// BPS patches.
//
//   "BPS1"  VLV source size  VLV target size  VLV metadata size  metadata
//   action*  VLV ((length - 1) << 2 | kind)  [payload]
//   crc32(source)  crc32(target)  crc32(patch without these 4 bytes)
//
// Kinds: 0 SourceRead (source bytes at the output position), 1 TargetRead
// (literal bytes), 2 SourceCopy and 3 TargetCopy.  Copies carry a signed
// VLV displacement applied to their own running cursor, one for the
// source and one for the target; each cursor then advances by the
// copy length.

use byteorder::{LittleEndian, WriteBytesExt};

use super::{BpsMode, BuildOptions, PatchBuilder, PatchCodec, PatchInfo, output_capacity};
use crate::checksum::{crc32, to_hex};
use crate::cursor::ByteCursor;
use crate::error::{ChecksumStage, PatchError, Result};
use crate::hash::matching::{DEFAULT_MAX_CHAIN, MIN_MATCH, MatchFinder, common_prefix};
use crate::vlv::{decode_signed, encode_signed, read_vlv, read_vlv_usize, write_vlv};

const TRAILER: usize = 12;

/// `BpsMode::Auto` uses the delta builder up to this original size.
pub const DELTA_AUTO_LIMIT: usize = 4 * 1024 * 1024;

/// Minimum repeat or source run the linear builder turns into a copy.
const LINEAR_MIN_RUN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BpsAction {
    SourceRead { len: usize },
    TargetRead { data: Vec<u8> },
    SourceCopy { len: usize, rel: i64 },
    TargetCopy { len: usize, rel: i64 },
}

impl BpsAction {
    fn len(&self) -> usize {
        match self {
            Self::SourceRead { len } | Self::SourceCopy { len, .. } | Self::TargetCopy { len, .. } => {
                *len
            }
            Self::TargetRead { data } => data.len(),
        }
    }

    fn kind(&self) -> u64 {
        match self {
            Self::SourceRead { .. } => 0,
            Self::TargetRead { .. } => 1,
            Self::SourceCopy { .. } => 2,
            Self::TargetCopy { .. } => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BpsPatch {
    pub source_size: usize,
    pub target_size: usize,
    /// Free-form metadata, conventionally XML.
    pub metadata: Vec<u8>,
    pub actions: Vec<BpsAction>,
    pub source_crc: u32,
    pub target_crc: u32,
}

fn signed_rel(cursor: &mut ByteCursor<'_>) -> Result<i64> {
    let raw = read_vlv(cursor)?;
    if raw >> 63 != 0 {
        return Err(PatchError::record("BPS displacement overflows"));
    }
    Ok(decode_signed(raw))
}

/// Move a copy cursor by `rel`, refusing to leave `0..=limit`.
fn displace(cursor: usize, rel: i64, limit: usize, what: &str) -> Result<usize> {
    let moved = (cursor as i64)
        .checked_add(rel)
        .filter(|&p| p >= 0 && p as usize <= limit)
        .ok_or_else(|| PatchError::record(format!("BPS {what} displacement leaves the image")))?;
    Ok(moved as usize)
}

impl PatchCodec for BpsPatch {
    const MAGIC: &'static [u8] = b"BPS1";

    fn parse(data: &[u8]) -> Result<Self> {
        if !data.starts_with(Self::MAGIC) {
            return Err(PatchError::header("missing BPS magic"));
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
        let metadata_len = read_vlv_usize(&mut c)?;
        let metadata = c.read_bytes(metadata_len)?;

        let mut actions = Vec::new();
        while !c.is_eof() {
            let word = read_vlv(&mut c)?;
            let len = usize::try_from((word >> 2) + 1)
                .map_err(|_| PatchError::record("BPS action length overflows"))?;
            let action = match word & 3 {
                0 => BpsAction::SourceRead { len },
                1 => BpsAction::TargetRead {
                    data: c.read_bytes(len)?,
                },
                2 => BpsAction::SourceCopy {
                    len,
                    rel: signed_rel(&mut c)?,
                },
                _ => BpsAction::TargetCopy {
                    len,
                    rel: signed_rel(&mut c)?,
                },
            };
            actions.push(action);
        }

        log::debug!(
            "bps: {} action(s), {source_size} -> {target_size} bytes, {} byte(s) of metadata",
            actions.len(),
            metadata.len()
        );
        Ok(Self {
            source_size,
            target_size,
            metadata,
            actions,
            source_crc,
            target_crc,
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Self::MAGIC.to_vec();
        write_vlv(&mut out, self.source_size as u64);
        write_vlv(&mut out, self.target_size as u64);
        write_vlv(&mut out, self.metadata.len() as u64);
        out.extend_from_slice(&self.metadata);

        for action in &self.actions {
            let len = action.len();
            if len == 0 {
                return Err(PatchError::record("BPS actions cannot be empty"));
            }
            write_vlv(&mut out, ((len as u64 - 1) << 2) | action.kind());
            match action {
                BpsAction::SourceRead { .. } => {}
                BpsAction::TargetRead { data } => out.extend_from_slice(data),
                BpsAction::SourceCopy { rel, .. } | BpsAction::TargetCopy { rel, .. } => {
                    write_vlv(&mut out, encode_signed(*rel));
                }
            }
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

        let capacity = output_capacity(self.target_size as u64, source.len(), "BPS target")?;
        let mut out: Vec<u8> = Vec::with_capacity(capacity);
        let mut source_rel = 0usize;
        let mut target_rel = 0usize;

        for action in &self.actions {
            if out.len() + action.len() > self.target_size {
                return Err(PatchError::record("BPS action writes past the target size"));
            }
            match action {
                BpsAction::SourceRead { len } => {
                    let start = out.len();
                    let bytes = source.get(start..start + len).ok_or_else(|| {
                        PatchError::record(format!("BPS SourceRead at {start:#x} runs past the source"))
                    })?;
                    out.extend_from_slice(bytes);
                }
                BpsAction::TargetRead { data } => out.extend_from_slice(data),
                BpsAction::SourceCopy { len, rel } => {
                    source_rel = displace(source_rel, *rel, source.len(), "source")?;
                    let bytes = source.get(source_rel..source_rel + len).ok_or_else(|| {
                        PatchError::record(format!(
                            "BPS SourceCopy at {source_rel:#x} runs past the source"
                        ))
                    })?;
                    out.extend_from_slice(bytes);
                    source_rel += len;
                }
                BpsAction::TargetCopy { len, rel } => {
                    target_rel = displace(target_rel, *rel, out.len(), "target")?;
                    if target_rel >= out.len() {
                        return Err(PatchError::record("BPS TargetCopy reads unwritten output"));
                    }
                    // Byte at a time: the copy may overlap what it writes.
                    for _ in 0..*len {
                        let byte = out[target_rel];
                        out.push(byte);
                        target_rel += 1;
                    }
                }
            }
        }

        if out.len() != self.target_size {
            return Err(PatchError::record(format!(
                "BPS actions produce {} bytes, header declares {}",
                out.len(),
                self.target_size
            )));
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
        let mut info = PatchInfo {
            source_size: Some(self.source_size as u64),
            target_size: Some(self.target_size as u64),
            source_checksum: Some(to_hex(&self.source_crc.to_be_bytes())),
            records: self.actions.len(),
            details: Vec::new(),
        }
        .detail("target crc32", to_hex(&self.target_crc.to_be_bytes()));
        if !self.metadata.is_empty() {
            info = info.detail("metadata", String::from_utf8_lossy(&self.metadata));
        }
        info
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Collects actions, coalescing single-byte literals into TargetRead runs.
struct ActionWriter<'a> {
    target: &'a [u8],
    actions: Vec<BpsAction>,
    pending: usize,
}

impl<'a> ActionWriter<'a> {
    fn new(target: &'a [u8]) -> Self {
        Self {
            target,
            actions: Vec::new(),
            pending: 0,
        }
    }

    /// Flush the literal run ending just before `output`.
    fn flush(&mut self, output: usize) {
        if self.pending > 0 {
            let start = output - self.pending;
            self.actions.push(BpsAction::TargetRead {
                data: self.target[start..output].to_vec(),
            });
            self.pending = 0;
        }
    }

    fn push(&mut self, output: usize, action: BpsAction) {
        self.flush(output);
        self.actions.push(action);
    }
}

/// Single pass: positional source runs, repeats via TargetCopy, literals.
fn build_linear(source: &[u8], target: &[u8]) -> Vec<BpsAction> {
    let mut w = ActionWriter::new(target);
    let mut output = 0usize;
    let mut target_rel = 0usize;
    let shared = source.len().min(target.len());

    while output < target.len() {
        let source_len = if output < shared {
            common_prefix(&source[output..shared], &target[output..shared])
        } else {
            0
        };
        let rle_len = target[output + 1..]
            .iter()
            .take_while(|&&b| b == target[output])
            .count();

        if rle_len >= LINEAR_MIN_RUN {
            // Emit the repeated byte, then copy it forward.
            w.pending += 1;
            output += 1;
            let rel = (output - 1) as i64 - target_rel as i64;
            w.push(output, BpsAction::TargetCopy { len: rle_len, rel });
            output += rle_len;
            target_rel = output - 1;
        } else if source_len >= LINEAR_MIN_RUN {
            w.push(output, BpsAction::SourceRead { len: source_len });
            output += source_len;
        } else {
            w.pending += 1;
            output += 1;
        }
    }
    w.flush(output);
    w.actions
}

/// Longest match among positional source reads, source copies and target
/// copies, found through hash chains.
fn build_delta(source: &[u8], target: &[u8]) -> Vec<BpsAction> {
    let mut finder = MatchFinder::new(source, target.len(), DEFAULT_MAX_CHAIN);
    let mut w = ActionWriter::new(target);
    let mut output = 0usize;
    let mut source_rel = 0usize;
    let mut target_rel = 0usize;

    while output < target.len() {
        let mut best_len = 0usize;
        let mut best: Option<BpsAction> = None;
        let mut best_addr = 0usize;

        if output < source.len() {
            let len = common_prefix(&source[output..], &target[output..]);
            if len > best_len {
                best_len = len;
                best = Some(BpsAction::SourceRead { len });
            }
        }
        if let Some(m) = finder.source_match(target, output)
            && m.length > best_len
        {
            best_len = m.length;
            best_addr = m.addr;
            best = Some(BpsAction::SourceCopy {
                len: m.length,
                rel: 0,
            });
        }
        if let Some(m) = finder.target_match(target, output)
            && m.length > best_len
        {
            best_len = m.length;
            best_addr = m.addr;
            best = Some(BpsAction::TargetCopy {
                len: m.length,
                rel: 0,
            });
        }
        finder.insert_target(target, output);

        let action = match best {
            Some(action) if best_len >= MIN_MATCH => action,
            _ => {
                w.pending += 1;
                output += 1;
                continue;
            }
        };

        let action = match action {
            BpsAction::SourceCopy { len, .. } => {
                let rel = best_addr as i64 - source_rel as i64;
                source_rel = best_addr + len;
                BpsAction::SourceCopy { len, rel }
            }
            BpsAction::TargetCopy { len, .. } => {
                let rel = best_addr as i64 - target_rel as i64;
                target_rel = best_addr + len;
                BpsAction::TargetCopy { len, rel }
            }
            other => other,
        };
        w.push(output, action);
        output += best_len;
    }
    w.flush(output);
    w.actions
}

impl PatchBuilder for BpsPatch {
    fn build(original: &[u8], modified: &[u8], options: &BuildOptions) -> Result<Self> {
        let delta = match options.bps_mode {
            BpsMode::Linear => false,
            BpsMode::Delta => true,
            BpsMode::Auto => original.len() <= DELTA_AUTO_LIMIT,
        };
        log::debug!(
            "bps: building with the {} builder",
            if delta { "delta" } else { "linear" }
        );
        let actions = if delta {
            build_delta(original, modified)
        } else {
            build_linear(original, modified)
        };

        let metadata = options
            .metadata
            .description
            .as_deref()
            .map(|d| d.as_bytes().to_vec())
            .unwrap_or_default();

        Ok(Self {
            source_size: original.len(),
            target_size: modified.len(),
            metadata,
            actions,
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

    fn sample() -> (Vec<u8>, Vec<u8>) {
        let original: Vec<u8> = (0..6000u32).map(|i| (i * 31 % 253) as u8).collect();
        let mut modified = original.clone();
        modified[100..140].fill(0xEE);
        modified.splice(2000..2000, b"inserted text".iter().copied());
        modified.extend_from_slice(&original[10..500]);
        modified.truncate(5800);
        (original, modified)
    }

    fn build(mode: BpsMode, original: &[u8], modified: &[u8]) -> BpsPatch {
        let options = BuildOptions {
            bps_mode: mode,
            ..Default::default()
        };
        BpsPatch::build(original, modified, &options).unwrap()
    }

    #[test]
    fn linear_round_trip() {
        let (original, modified) = sample();
        let patch = build(BpsMode::Linear, &original, &modified);
        let bytes = patch.serialize().unwrap();
        let parsed = BpsPatch::parse(&bytes).unwrap();
        assert_eq!(parsed, patch);
        assert_eq!(parsed.apply(&original, true).unwrap(), modified);
    }

    #[test]
    fn delta_round_trip_is_smaller_than_linear() {
        let (original, modified) = sample();
        let delta = build(BpsMode::Delta, &original, &modified);
        let linear = build(BpsMode::Linear, &original, &modified);
        assert_eq!(delta.apply(&original, true).unwrap(), modified);
        assert!(delta.serialize().unwrap().len() < linear.serialize().unwrap().len());
    }

    #[test]
    fn linear_encodes_repeats_as_target_copy() {
        let original = vec![0u8; 4];
        let modified = vec![9u8; 32];
        let patch = build(BpsMode::Linear, &original, &modified);
        assert_eq!(
            patch.actions,
            vec![
                BpsAction::TargetRead { data: vec![9] },
                BpsAction::TargetCopy { len: 31, rel: 0 },
            ]
        );
        assert_eq!(patch.apply(&original, true).unwrap(), modified);
    }

    #[test]
    fn empty_images() {
        for mode in [BpsMode::Linear, BpsMode::Delta] {
            let patch = build(mode, b"", b"");
            assert!(patch.actions.is_empty());
            assert_eq!(patch.apply(b"", true).unwrap(), b"");
            let patch = build(mode, b"abc", b"");
            assert_eq!(patch.apply(b"abc", true).unwrap(), b"");
            let patch = build(mode, b"", b"x");
            assert_eq!(patch.apply(b"", true).unwrap(), b"x");
        }
    }

    #[test]
    fn metadata_is_preserved() {
        let options = BuildOptions {
            metadata: crate::formats::PatchMetadata {
                description: Some("<patch/>".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let patch = BpsPatch::build(b"abcd", b"abcx", &options).unwrap();
        let parsed = BpsPatch::parse(&patch.serialize().unwrap()).unwrap();
        assert_eq!(parsed.metadata, b"<patch/>");
    }

    #[test]
    fn corrupted_patch_crc_is_rejected() {
        let (original, modified) = sample();
        let mut bytes = build(BpsMode::Linear, &original, &modified)
            .serialize()
            .unwrap();
        bytes[6] ^= 0x40;
        assert!(matches!(
            BpsPatch::parse(&bytes),
            Err(PatchError::ChecksumMismatch {
                stage: ChecksumStage::Patch
            })
        ));
    }

    #[test]
    fn target_checksum_is_checked() {
        let mut patch = build(BpsMode::Linear, b"abcdefgh", b"abcdXfgh");
        patch.target_crc ^= 1;
        assert!(matches!(
            patch.apply(b"abcdefgh", true),
            Err(PatchError::ChecksumMismatch {
                stage: ChecksumStage::Target
            })
        ));
        assert!(patch.apply(b"abcdefgh", false).is_ok());
    }

    #[test]
    fn displacement_before_start_is_rejected() {
        let patch = BpsPatch {
            source_size: 4,
            target_size: 4,
            metadata: Vec::new(),
            actions: vec![BpsAction::SourceCopy { len: 4, rel: -1 }],
            source_crc: crc32(b"abcd"),
            target_crc: 0,
        };
        assert!(matches!(
            patch.apply(b"abcd", false),
            Err(PatchError::InvalidRecord(_))
        ));
    }

    #[test]
    fn oversized_declared_target_fails_on_short_output() {
        let patch = BpsPatch {
            source_size: 4,
            target_size: u32::MAX as usize,
            metadata: Vec::new(),
            actions: vec![BpsAction::TargetRead {
                data: b"tiny".to_vec(),
            }],
            source_crc: crc32(b"abcd"),
            target_crc: 0,
        };
        assert!(matches!(
            patch.apply(b"abcd", false),
            Err(PatchError::InvalidRecord(_))
        ));
    }
}

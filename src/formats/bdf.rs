// bsdiff 4 patches (BDF).
//
//   "BSDIFF40"  ctrl len:i64  diff len:i64  new size:i64
//   bzip2(ctrl)  bzip2(diff)  bzip2(extra)
//
// Integers are sign-magnitude little-endian (sign in bit 63).  The control
// stream is a sequence of (add, copy, seek) triples: add `add` diff bytes
// to the old image, append `copy` extra bytes, then move the old cursor
// by `seek`.

use byteorder::{LittleEndian, WriteBytesExt};

use super::{PatchCodec, PatchInfo, image_len};
use crate::compress::decompress;
use crate::cursor::ByteCursor;
use crate::error::{PatchError, Result};

const HEADER_LEN: usize = 32;
const SIGN_BIT: u64 = 1 << 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BdfControl {
    pub add: u64,
    pub copy: u64,
    pub seek: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BdfPatch {
    pub new_size: u64,
    pub controls: Vec<BdfControl>,
    pub diff: Vec<u8>,
    pub extra: Vec<u8>,
    /// The three bzip2 streams as stored, reused by `serialize`.
    streams: [Vec<u8>; 3],
}

fn read_offt(c: &mut ByteCursor<'_>) -> Result<i64> {
    let raw = c.read_u64_le()?;
    let magnitude = (raw & !SIGN_BIT) as i64;
    Ok(if raw & SIGN_BIT != 0 { -magnitude } else { magnitude })
}

fn write_offt(out: &mut Vec<u8>, value: i64) -> std::io::Result<()> {
    let raw = value.unsigned_abs() | if value < 0 { SIGN_BIT } else { 0 };
    out.write_u64::<LittleEndian>(raw)
}

/// End of a `len`-byte block starting at `pos`, if it stays within `limit`.
fn block_end(pos: usize, len: u64, limit: usize) -> Option<usize> {
    let len = usize::try_from(len).ok()?;
    pos.checked_add(len).filter(|&end| end <= limit)
}

fn non_negative(value: i64, what: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| PatchError::record(format!("negative BDF {what}: {value}")))
}

impl PatchCodec for BdfPatch {
    const MAGIC: &'static [u8] = b"BSDIFF40";

    fn parse(data: &[u8]) -> Result<Self> {
        let mut c = ByteCursor::new(data);
        if !c.starts_with(Self::MAGIC) {
            return Err(PatchError::header("missing BSDIFF40 magic"));
        }
        c.skip(Self::MAGIC.len())?;
        let ctrl_len = non_negative(read_offt(&mut c)?, "control length")?;
        let diff_len = non_negative(read_offt(&mut c)?, "diff length")?;
        let new_size = non_negative(read_offt(&mut c)?, "target size")?;

        let too_long = || PatchError::header("BDF stream lengths exceed the patch");
        let ctrl_len = usize::try_from(ctrl_len).map_err(|_| too_long())?;
        let diff_len = usize::try_from(diff_len).map_err(|_| too_long())?;
        let ctrl_stream = c.take(ctrl_len)?;
        let diff_stream = c.take(diff_len)?;
        let extra_stream = c.take(c.remaining())?;

        let ctrl = decompress(ctrl_stream)?;
        let diff = decompress(diff_stream)?;
        let extra = decompress(extra_stream)?;

        if ctrl.len() % 24 != 0 {
            return Err(PatchError::record(format!(
                "BDF control stream of {} bytes is not whole triples",
                ctrl.len()
            )));
        }
        let mut cc = ByteCursor::new(&ctrl);
        let mut controls = Vec::with_capacity(ctrl.len() / 24);
        while !cc.is_eof() {
            controls.push(BdfControl {
                add: non_negative(read_offt(&mut cc)?, "add length")?,
                copy: non_negative(read_offt(&mut cc)?, "copy length")?,
                seek: read_offt(&mut cc)?,
            });
        }

        log::debug!(
            "bdf: {} control(s), {} diff and {} extra byte(s), target {new_size} bytes",
            controls.len(),
            diff.len(),
            extra.len()
        );
        Ok(Self {
            new_size,
            controls,
            diff,
            extra,
            streams: [ctrl_stream.to_vec(), diff_stream.to_vec(), extra_stream.to_vec()],
        })
    }

    /// Re-emits the stored streams; BDF patches are never built here.
    fn serialize(&self) -> Result<Vec<u8>> {
        let [ctrl, diff, extra] = &self.streams;
        let mut out = Vec::with_capacity(HEADER_LEN + ctrl.len() + diff.len() + extra.len());
        out.extend_from_slice(Self::MAGIC);
        write_offt(&mut out, ctrl.len() as i64)?;
        write_offt(&mut out, diff.len() as i64)?;
        write_offt(&mut out, self.new_size as i64)?;
        out.extend_from_slice(ctrl);
        out.extend_from_slice(diff);
        out.extend_from_slice(extra);
        Ok(out)
    }

    fn apply(&self, source: &[u8], _validate: bool) -> Result<Vec<u8>> {
        let new_size = image_len(self.new_size, "BDF target")?;
        // Every target byte comes from exactly one diff or extra byte.
        if new_size > self.diff.len().saturating_add(self.extra.len()) {
            return Err(PatchError::record(
                "BDF target is larger than its diff and extra data",
            ));
        }
        let mut out = vec![0u8; new_size];
        let mut new_pos = 0usize;
        let mut old_pos = 0i64;
        let mut diff = self.diff.iter();
        let mut extra = self.extra.iter();
        let past_target =
            |what: &str| PatchError::record(format!("BDF {what} block runs past the target"));
        let old_cursor = || PatchError::record("BDF old-image cursor overflows");

        for ctrl in &self.controls {
            let add_end =
                block_end(new_pos, ctrl.add, new_size).ok_or_else(|| past_target("diff"))?;
            for (i, slot) in out[new_pos..add_end].iter_mut().enumerate() {
                let d = *diff
                    .next()
                    .ok_or_else(|| PatchError::record("BDF diff stream exhausted"))?;
                let base = i64::try_from(i)
                    .ok()
                    .and_then(|i| old_pos.checked_add(i))
                    .and_then(|old| usize::try_from(old).ok())
                    .and_then(|old| source.get(old).copied())
                    .unwrap_or(0);
                *slot = d.wrapping_add(base);
            }
            let added = i64::try_from(add_end - new_pos).map_err(|_| old_cursor())?;
            old_pos = old_pos.checked_add(added).ok_or_else(old_cursor)?;
            new_pos = add_end;

            let copy_end =
                block_end(new_pos, ctrl.copy, new_size).ok_or_else(|| past_target("extra"))?;
            for slot in &mut out[new_pos..copy_end] {
                *slot = *extra
                    .next()
                    .ok_or_else(|| PatchError::record("BDF extra stream exhausted"))?;
            }
            new_pos = copy_end;
            old_pos = old_pos.checked_add(ctrl.seek).ok_or_else(old_cursor)?;
        }
        Ok(out)
    }

    fn info(&self) -> PatchInfo {
        PatchInfo {
            target_size: Some(self.new_size),
            records: self.controls.len(),
            ..Default::default()
        }
        .detail("diff bytes", self.diff.len())
        .detail("extra bytes", self.extra.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

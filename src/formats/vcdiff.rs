// VCDIFF (RFC 3284) patches as written by xdelta3.
//
// A file header followed by windows until the end of the file.  Parsing
// keeps each window's raw sections; decoding happens in `apply`, window by
// window, against the source image and the output produced so far.

use super::{BuildOptions, PatchBuilder, PatchCodec, PatchInfo, output_capacity};
use crate::cursor::ByteCursor;
use crate::error::Result;
use crate::hash::matching::{DEFAULT_MAX_CHAIN, MatchFinder, MatchKind, Op, greedy_ops};
use crate::vcdiff::{FileHeader, VCDIFF_MAGIC, Window, WindowEncoder};

/// Target bytes per window produced by the builder.
pub const BUILD_WINDOW: usize = 8 << 20;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VcdiffPatch {
    pub header: FileHeader,
    pub windows: Vec<Window>,
}

impl VcdiffPatch {
    pub fn target_size(&self) -> u64 {
        self.windows
            .iter()
            .fold(0u64, |sum, w| sum.saturating_add(w.header.target_len))
    }
}

impl PatchCodec for VcdiffPatch {
    /// The version byte is checked by the parser so an unknown version is
    /// reported instead of falling through to "unrecognized".
    const MAGIC: &'static [u8] = &[VCDIFF_MAGIC[0], VCDIFF_MAGIC[1], VCDIFF_MAGIC[2]];

    fn parse(data: &[u8]) -> Result<Self> {
        let mut c = ByteCursor::new(data);
        let header = FileHeader::read(&mut c)?;
        let mut windows = Vec::new();
        while !c.is_eof() {
            windows.push(Window::read(&mut c)?);
        }
        log::debug!("vcdiff: {} window(s)", windows.len());
        Ok(Self { header, windows })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.header.write(&mut out);
        for window in &self.windows {
            window.write(&mut out);
        }
        Ok(out)
    }

    fn apply(&self, source: &[u8], validate: bool) -> Result<Vec<u8>> {
        let capacity = output_capacity(self.target_size(), source.len(), "VCDIFF target")?;
        let mut out = Vec::with_capacity(capacity);
        for window in &self.windows {
            window.decode_into(source, &mut out, validate)?;
        }
        Ok(out)
    }

    /// Every source segment must lie inside `source`.
    fn validate_source(&self, source: &[u8]) -> bool {
        self.windows
            .iter()
            .filter(|w| !w.header.copies_from_target() && w.header.copy_len > 0)
            .all(|w| {
                w.header
                    .copy_pos
                    .checked_add(w.header.copy_len)
                    .is_some_and(|end| end <= source.len() as u64)
            })
    }

    fn info(&self) -> PatchInfo {
        let mut info = PatchInfo {
            target_size: Some(self.target_size()),
            records: self.windows.len(),
            ..Default::default()
        }
        .detail(
            "checksummed windows",
            self.windows.iter().filter(|w| w.header.adler32.is_some()).count(),
        );
        if let Some(app) = &self.header.app_data {
            info = info.detail("application data", String::from_utf8_lossy(app));
        }
        info
    }
}

impl PatchBuilder for VcdiffPatch {
    /// Windows of up to [`BUILD_WINDOW`] target bytes, each copying from
    /// the whole original.
    fn build(original: &[u8], modified: &[u8], _options: &BuildOptions) -> Result<Self> {
        let window_len = BUILD_WINDOW.min(modified.len());
        let mut finder = MatchFinder::new(original, window_len, DEFAULT_MAX_CHAIN);
        let segment_len = original.len() as u64;

        let mut windows = Vec::new();
        for target in modified.chunks(BUILD_WINDOW) {
            finder.reset_target();
            let ops = greedy_ops(&mut finder, target);

            let mut enc = WindowEncoder::new(segment_len);
            for op in ops {
                match op {
                    Op::Add { start, len } => enc.add(&target[start..start + len]),
                    Op::Run { byte, len } => enc.run(byte, len),
                    Op::Copy(m) => {
                        let addr = match m.kind {
                            MatchKind::Source => m.addr as u64,
                            MatchKind::Target => segment_len + m.addr as u64,
                        };
                        enc.copy(addr, m.length);
                    }
                }
            }
            windows.push(enc.finish(0, target));
        }

        log::debug!(
            "vcdiff: built {} window(s) against a {}-byte source",
            windows.len(),
            original.len()
        );
        Ok(Self {
            header: FileHeader::default(),
            windows,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ChecksumStage, PatchError};

    fn build(original: &[u8], modified: &[u8]) -> VcdiffPatch {
        VcdiffPatch::build(original, modified, &BuildOptions::default()).unwrap()
    }

    #[test]
    fn round_trip() {
        let original: Vec<u8> = (0..20_000u32).map(|i| (i * 13 % 241) as u8).collect();
        let mut modified = original[5000..15000].to_vec();
        modified.extend_from_slice(&[0u8; 300]);
        modified.extend_from_slice(b"fresh literal bytes");
        modified.extend_from_slice(&original[..4000]);

        let patch = build(&original, &modified);
        let bytes = patch.serialize().unwrap();
        assert!(bytes.starts_with(&VCDIFF_MAGIC));
        let parsed = VcdiffPatch::parse(&bytes).unwrap();
        assert_eq!(parsed, patch);
        assert_eq!(parsed.apply(&original, true).unwrap(), modified);
        assert!(bytes.len() < 200);
    }

    #[test]
    fn empty_target_has_no_windows() {
        let patch = build(b"anything", b"");
        assert!(patch.windows.is_empty());
        let parsed = VcdiffPatch::parse(&patch.serialize().unwrap()).unwrap();
        assert_eq!(parsed.apply(b"anything", true).unwrap(), b"");
    }

    #[test]
    fn no_source() {
        let modified = b"abcabcabcabcabcabc-xyz".to_vec();
        let patch = build(b"", &modified);
        assert_eq!(patch.apply(b"", true).unwrap(), modified);
    }

    #[test]
    fn adler_mismatch_is_a_target_error() {
        let mut patch = build(b"0123456789", b"0123456789!");
        patch.windows[0].header.adler32 = Some(1);
        assert!(matches!(
            patch.apply(b"0123456789", true),
            Err(PatchError::ChecksumMismatch {
                stage: ChecksumStage::Target
            })
        ));
        assert!(patch.apply(b"0123456789", false).is_ok());
    }

    #[test]
    fn short_source_fails_validation() {
        let patch = build(b"0123456789", b"0123456789!");
        assert!(patch.validate_source(b"0123456789"));
        assert!(!patch.validate_source(b"01234"));
    }

    #[test]
    fn secondary_compression_is_unsupported() {
        let bytes = [0xD6, 0xC3, 0xC4, 0x00, 0x01, 0x02];
        assert!(matches!(
            VcdiffPatch::parse(&bytes),
            Err(PatchError::UnsupportedFeature(_))
        ));
    }
}

// Patch dispatcher: ties the format codecs to header handling.
//
// Provides the high-level APIs that orchestrate:
//   - Format detection by magic, in a fixed priority order
//   - Applying a parsed patch with optional header strip/inject and
//     console checksum fixup
//   - Building a patch in a chosen format and verifying it by re-applying

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::checksum::crc32;
use crate::error::{PatchError, Result};
use crate::formats::aps_gba::ApsGbaPatch;
use crate::formats::aps_n64::ApsN64Patch;
use crate::formats::bdf::BdfPatch;
use crate::formats::bps::BpsPatch;
use crate::formats::ips::IpsPatch;
use crate::formats::pmsr::PmsrPatch;
use crate::formats::ppf::PpfPatch;
use crate::formats::rup::RupPatch;
use crate::formats::ups::UpsPatch;
use crate::formats::vcdiff::VcdiffPatch;
use crate::formats::{BuildOptions, PatchBuilder, PatchCodec, PatchInfo, PatchMetadata};
use crate::header::{self, HeaderKind, RomSystem};

/// Images above this size are flagged as too big for most patchers.
pub const ROM_SIZE_LIMIT: usize = 0x3FF_FFFF;

// ---------------------------------------------------------------------------
// Formats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatchFormat {
    Ips,
    /// IPS with a JSON metadata trailer.
    Ebp,
    Ups,
    Bps,
    ApsN64,
    ApsGba,
    Ppf,
    Rup,
    Bdf,
    Pmsr,
    Vcdiff,
}

impl PatchFormat {
    pub const ALL: [PatchFormat; 11] = [
        Self::Ips,
        Self::Ebp,
        Self::Ups,
        Self::Bps,
        Self::ApsN64,
        Self::ApsGba,
        Self::Ppf,
        Self::Rup,
        Self::Bdf,
        Self::Pmsr,
        Self::Vcdiff,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Ips => "IPS",
            Self::Ebp => "EBP",
            Self::Ups => "UPS",
            Self::Bps => "BPS",
            Self::ApsN64 => "APS (N64)",
            Self::ApsGba => "APS (GBA)",
            Self::Ppf => "PPF",
            Self::Rup => "RUP",
            Self::Bdf => "BDF",
            Self::Pmsr => "PMSR",
            Self::Vcdiff => "VCDIFF",
        }
    }

    /// Conventional file extension, without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Ips => "ips",
            Self::Ebp => "ebp",
            Self::Ups => "ups",
            Self::Bps => "bps",
            Self::ApsN64 | Self::ApsGba => "aps",
            Self::Ppf => "ppf",
            Self::Rup => "rup",
            Self::Bdf => "bdf",
            Self::Pmsr => "pmsr",
            Self::Vcdiff => "xdelta",
        }
    }

    /// Whether `build` supports this format.
    pub fn can_build(self) -> bool {
        !matches!(self, Self::ApsGba | Self::Bdf | Self::Pmsr)
    }
}

impl fmt::Display for PatchFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PatchFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "ips" => Self::Ips,
            "ebp" => Self::Ebp,
            "ups" => Self::Ups,
            "bps" => Self::Bps,
            "aps" | "aps-n64" | "apsn64" => Self::ApsN64,
            "aps-gba" | "apsgba" => Self::ApsGba,
            "ppf" => Self::Ppf,
            "rup" => Self::Rup,
            "bdf" | "bsdiff" => Self::Bdf,
            "pmsr" => Self::Pmsr,
            "vcdiff" | "xdelta" | "xdelta3" => Self::Vcdiff,
            other => return Err(format!("unknown patch format '{other}'")),
        })
    }
}

// ---------------------------------------------------------------------------
// Patch
// ---------------------------------------------------------------------------

/// A parsed or built patch of any supported format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch {
    Ips(IpsPatch),
    Ups(UpsPatch),
    Bps(BpsPatch),
    ApsN64(ApsN64Patch),
    ApsGba(ApsGbaPatch),
    Ppf(PpfPatch),
    Rup(RupPatch),
    Bdf(BdfPatch),
    Pmsr(PmsrPatch),
    Vcdiff(VcdiffPatch),
}

/// Run `$body` with `$p` bound to the concrete patch.
macro_rules! with_codec {
    ($patch:expr, $p:ident => $body:expr) => {
        match $patch {
            Patch::Ips($p) => $body,
            Patch::Ups($p) => $body,
            Patch::Bps($p) => $body,
            Patch::ApsN64($p) => $body,
            Patch::ApsGba($p) => $body,
            Patch::Ppf($p) => $body,
            Patch::Rup($p) => $body,
            Patch::Bdf($p) => $body,
            Patch::Pmsr($p) => $body,
            Patch::Vcdiff($p) => $body,
        }
    };
}

impl Patch {
    pub fn format(&self) -> PatchFormat {
        match self {
            Self::Ips(p) if p.is_ebp() => PatchFormat::Ebp,
            Self::Ips(_) => PatchFormat::Ips,
            Self::Ups(_) => PatchFormat::Ups,
            Self::Bps(_) => PatchFormat::Bps,
            Self::ApsN64(_) => PatchFormat::ApsN64,
            Self::ApsGba(_) => PatchFormat::ApsGba,
            Self::Ppf(_) => PatchFormat::Ppf,
            Self::Rup(_) => PatchFormat::Rup,
            Self::Bdf(_) => PatchFormat::Bdf,
            Self::Pmsr(_) => PatchFormat::Pmsr,
            Self::Vcdiff(_) => PatchFormat::Vcdiff,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        with_codec!(self, p => p.serialize())
    }

    /// Apply without any header handling.
    pub fn apply_to(&self, source: &[u8], validate: bool) -> Result<Vec<u8>> {
        with_codec!(self, p => p.apply(source, validate))
    }

    pub fn validate_source(&self, source: &[u8]) -> bool {
        with_codec!(self, p => p.validate_source(source))
    }

    pub fn info(&self) -> PatchInfo {
        with_codec!(self, p => p.info())
    }

    pub fn source_size(&self) -> Option<u64> {
        self.info().source_size
    }

    pub fn target_size(&self) -> Option<u64> {
        self.info().target_size
    }

    /// Declared source checksum as lowercase hex (CRC32, MD5 or header CRC).
    pub fn source_checksum(&self) -> Option<String> {
        self.info().source_checksum
    }

    /// Human-readable key/value summary.
    pub fn describe(&self) -> Vec<(String, String)> {
        let info = self.info();
        let mut rows = vec![("format".to_string(), self.format().to_string())];
        if let Some(size) = info.source_size {
            rows.push(("source size".into(), size.to_string()));
        }
        if let Some(size) = info.target_size {
            rows.push(("target size".into(), size.to_string()));
        }
        if let Some(sum) = info.source_checksum {
            rows.push(("source checksum".into(), sum));
        }
        rows.push(("records".into(), info.records.to_string()));
        rows.extend(info.details);
        rows
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Identify and parse a patch file.
///
/// Formats are tried in a fixed order; the first whose signature matches
/// is committed to, and its parse errors are returned as-is.
pub fn detect_and_parse(data: &[u8]) -> Result<Patch> {
    macro_rules! try_format {
        ($ty:ty, $variant:ident) => {
            if <$ty>::detect(data) {
                log::debug!("detected {} patch", stringify!($variant));
                return <$ty>::parse(data).map(Patch::$variant);
            }
        };
    }

    try_format!(IpsPatch, Ips);
    try_format!(UpsPatch, Ups);
    if ApsN64Patch::detect(data) && !ApsGbaPatch::detect(data) {
        log::debug!("detected ApsN64 patch");
        return ApsN64Patch::parse(data).map(Patch::ApsN64);
    }
    try_format!(ApsGbaPatch, ApsGba);
    try_format!(BpsPatch, Bps);
    try_format!(RupPatch, Rup);
    try_format!(PpfPatch, Ppf);
    try_format!(BdfPatch, Bdf);
    try_format!(PmsrPatch, Pmsr);
    try_format!(VcdiffPatch, Vcdiff);
    Err(PatchError::UnrecognizedFormat)
}

/// Whether `image` is larger than most patch formats and tools allow.
pub fn rom_too_big(image: &[u8]) -> bool {
    image.len() > ROM_SIZE_LIMIT
}

/// Check `image` against what `patch` declares, without applying it.
pub fn validate_source(patch: &Patch, image: &[u8]) -> bool {
    patch.validate_source(image)
}

/// `name` with " (patched)" before its extension when `suffix` is set.
pub fn patched_file_name(name: &str, suffix: bool) -> String {
    if !suffix {
        return name.to_string();
    }
    let base_start = name.rfind(['/', '\\']).map_or(0, |i| i + 1);
    match name.rfind('.') {
        Some(dot) if dot > base_start => format!("{} (patched){}", &name[..dot], &name[dot..]),
        _ => format!("{name} (patched)"),
    }
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Check the source (and where declared, the result) checksums.
    pub require_source_validation: bool,
    /// Patch the body of a headered image and re-attach the header.
    pub strip_header: bool,
    /// Patch a headerless image as if it carried a header.
    pub inject_fake_header: bool,
    /// Rewrite Game Boy / Mega Drive internal checksums afterwards.
    pub fix_checksum: bool,
    /// Add " (patched)" to the output name.
    pub name_suffix: bool,
    /// Name of the source image; its extension drives header detection.
    pub file_name: Option<String>,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            require_source_validation: true,
            strip_header: false,
            inject_fake_header: false,
            fix_checksum: false,
            name_suffix: true,
            file_name: None,
        }
    }
}

/// What happened to a header while applying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderAction {
    Stripped(&'static HeaderKind),
    Injected(&'static HeaderKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patched {
    pub data: Vec<u8>,
    /// Suggested output name, when a source name was given.
    pub file_name: Option<String>,
    pub header: Option<HeaderAction>,
    pub checksum_fixed: Option<RomSystem>,
}

/// Apply `patch` to `source` with header handling and checksum fixup.
pub fn apply(source: &[u8], patch: &Patch, options: &ApplyOptions) -> Result<Patched> {
    let name = options.file_name.as_deref().unwrap_or("");

    let mut action = None;
    let mut kept_header: &[u8] = &[];
    let working: Cow<'_, [u8]> = if options.strip_header
        && let Some(kind) = header::detect_header(source, name)
    {
        log::info!("stripping {}-byte {} header", kind.size, kind.name);
        let (head, body) = header::split_header(source, kind);
        kept_header = head;
        action = Some(HeaderAction::Stripped(kind));
        Cow::Borrowed(body)
    } else if options.inject_fake_header
        && let Some(kind) = header::fake_header_kind(source, name)
    {
        log::info!("adding a temporary {} header", kind.name);
        action = Some(HeaderAction::Injected(kind));
        Cow::Owned(header::add_fake_header(source, kind))
    } else {
        Cow::Borrowed(source)
    };

    let mut data = patch.apply_to(&working, options.require_source_validation)?;

    let mut checksum_fixed = None;
    match action {
        Some(HeaderAction::Stripped(_)) => {
            if options.fix_checksum {
                checksum_fixed = header::fix_checksum(&mut data);
            }
            let mut whole = Vec::with_capacity(kept_header.len() + data.len());
            whole.extend_from_slice(kept_header);
            whole.extend_from_slice(&data);
            data = whole;
        }
        Some(HeaderAction::Injected(kind)) => {
            data = header::remove_header(&data, kind);
            if options.fix_checksum {
                checksum_fixed = header::fix_checksum(&mut data);
            }
        }
        None => {
            if options.fix_checksum {
                checksum_fixed = header::fix_checksum(&mut data);
            }
        }
    }

    Ok(Patched {
        data,
        file_name: options
            .file_name
            .as_deref()
            .map(|n| patched_file_name(n, options.name_suffix)),
        header: action,
        checksum_fixed,
    })
}

// ---------------------------------------------------------------------------
// Build
// ---------------------------------------------------------------------------

/// Build a `format` patch turning `original` into `modified`.
///
/// With `options.verify` the serialized patch is parsed back and applied to
/// `original`; a result that differs from `modified` is an error.  PPF
/// cannot shrink an image, so a PPF built from a larger original is not
/// verified.  EBP has no truncation trailer and refuses to shrink.
pub fn build(
    original: &[u8],
    modified: &[u8],
    format: PatchFormat,
    options: &BuildOptions,
) -> Result<Patch> {
    let patch = match format {
        PatchFormat::Ips => {
            let plain = BuildOptions {
                metadata: PatchMetadata::default(),
                ..options.clone()
            };
            Patch::Ips(IpsPatch::build(original, modified, &plain)?)
        }
        PatchFormat::Ebp => {
            if modified.len() < original.len() {
                return Err(PatchError::UnsupportedFeature(
                    "EBP patches cannot shrink an image".into(),
                ));
            }
            let mut patch = IpsPatch::build(original, modified, options)?;
            if patch.metadata.is_none() {
                patch.metadata = Some(PatchMetadata::default());
                patch.truncate = None;
            }
            Patch::Ips(patch)
        }
        PatchFormat::Ups => Patch::Ups(UpsPatch::build(original, modified, options)?),
        PatchFormat::Bps => Patch::Bps(BpsPatch::build(original, modified, options)?),
        PatchFormat::ApsN64 => Patch::ApsN64(ApsN64Patch::build(original, modified, options)?),
        PatchFormat::Ppf => Patch::Ppf(PpfPatch::build(original, modified, options)?),
        PatchFormat::Rup => Patch::Rup(RupPatch::build(original, modified, options)?),
        PatchFormat::Vcdiff => Patch::Vcdiff(VcdiffPatch::build(original, modified, options)?),
        PatchFormat::ApsGba | PatchFormat::Bdf | PatchFormat::Pmsr => {
            return Err(PatchError::UnsupportedFormat(format));
        }
    };

    if !options.verify {
        return Ok(patch);
    }
    if format == PatchFormat::Ppf && original.len() > modified.len() {
        log::warn!("ppf: original is larger than modified; skipping verification");
        return Ok(patch);
    }
    verify(&patch, original, modified)?;
    Ok(patch)
}

fn verify(patch: &Patch, original: &[u8], modified: &[u8]) -> Result<()> {
    let bytes = patch.serialize()?;
    let outcome = detect_and_parse(&bytes).and_then(|p| p.apply_to(original, true));
    match outcome {
        Ok(out) if out.len() == modified.len() && crc32(&out) == crc32(modified) => {
            log::debug!("{} patch verified ({} bytes)", patch.format(), bytes.len());
            Ok(())
        }
        Ok(out) => {
            log::debug!(
                "{} patch produced {} bytes, expected {}",
                patch.format(),
                out.len(),
                modified.len()
            );
            Err(PatchError::PatchVerificationFailed)
        }
        Err(e) => {
            log::debug!("{} patch failed to re-apply: {e}", patch.format());
            Err(PatchError::PatchVerificationFailed)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn images() -> (Vec<u8>, Vec<u8>) {
        let original: Vec<u8> = (0..4096u32).map(|i| (i * 17 % 256) as u8).collect();
        let mut modified = original.clone();
        modified[100..110].fill(0x42);
        modified[3000] ^= 0x80;
        (original, modified)
    }

    #[test]
    fn every_buildable_format_round_trips_through_detection() {
        let (original, modified) = images();
        for format in PatchFormat::ALL.into_iter().filter(|f| f.can_build()) {
            let patch = build(&original, &modified, format, &BuildOptions::default())
                .unwrap_or_else(|e| panic!("{format}: {e}"));
            assert_eq!(patch.format(), format);
            let parsed = detect_and_parse(&patch.serialize().unwrap()).unwrap();
            assert_eq!(parsed.format(), format);
            let out = apply(&original, &parsed, &ApplyOptions::default()).unwrap();
            assert_eq!(out.data, modified, "{format}");
        }
    }

    #[test]
    fn unbuildable_formats_are_reported() {
        for format in [PatchFormat::ApsGba, PatchFormat::Bdf, PatchFormat::Pmsr] {
            assert!(matches!(
                build(b"a", b"b", format, &BuildOptions::default()),
                Err(PatchError::UnsupportedFormat(f)) if f == format
            ));
        }
    }

    #[test]
    fn unknown_bytes_are_unrecognized() {
        assert!(matches!(
            detect_and_parse(b"definitely not a patch"),
            Err(PatchError::UnrecognizedFormat)
        ));
        assert!(matches!(detect_and_parse(b""), Err(PatchError::UnrecognizedFormat)));
    }

    #[test]
    fn committed_format_reports_corruption() {
        assert!(matches!(
            detect_and_parse(b"PATCH\x00\x00"),
            Err(PatchError::TruncatedInput { .. })
        ));
    }

    #[test]
    fn format_names_parse() {
        for format in PatchFormat::ALL {
            let parsed: PatchFormat = format.extension().parse().unwrap();
            if format != PatchFormat::ApsGba {
                assert_eq!(parsed, format);
            }
        }
        assert!("zip".parse::<PatchFormat>().is_err());
    }

    #[test]
    fn output_names() {
        assert_eq!(patched_file_name("Game.sfc", true), "Game (patched).sfc");
        assert_eq!(patched_file_name("dir.x/Game", true), "dir.x/Game (patched)");
        assert_eq!(patched_file_name("Game.sfc", false), "Game.sfc");
    }

    #[test]
    fn size_ceiling() {
        assert!(!rom_too_big(&[0u8; 16]));
        assert!(!rom_too_big(&vec![0u8; ROM_SIZE_LIMIT]));
        assert!(rom_too_big(&vec![0u8; ROM_SIZE_LIMIT + 1]));
    }

    #[test]
    fn strip_header_patches_the_body() {
        let body: Vec<u8> = (0..0x4000u32).map(|i| (i % 97) as u8).collect();
        let mut modified_body = body.clone();
        modified_body[0x10] = 0xEE;
        let patch = build(&body, &modified_body, PatchFormat::Bps, &BuildOptions::default())
            .unwrap();

        let headered = header::add_fake_header(&body, &header::HEADERS[0]);
        let options = ApplyOptions {
            strip_header: true,
            file_name: Some("game.nes".into()),
            ..Default::default()
        };
        let out = apply(&headered, &patch, &options).unwrap();
        assert_eq!(&out.data[..16], &headered[..16]);
        assert_eq!(&out.data[16..], &modified_body[..]);
        assert_eq!(out.file_name.as_deref(), Some("game (patched).nes"));
        assert!(matches!(out.header, Some(HeaderAction::Stripped(_))));
    }

    #[test]
    fn injected_header_is_removed_again() {
        let body = vec![0u8; 1024];
        let headered = header::add_fake_header(&body, &header::HEADERS[0]);
        let mut modified = headered.clone();
        modified[20] = 1;
        let patch = build(&headered, &modified, PatchFormat::Ips, &BuildOptions::default())
            .unwrap();

        let options = ApplyOptions {
            inject_fake_header: true,
            file_name: Some("game.nes".into()),
            ..Default::default()
        };
        let out = apply(&body, &patch, &options).unwrap();
        assert_eq!(out.data, &modified[16..]);
    }

    #[test]
    fn describe_starts_with_format() {
        let (original, modified) = images();
        let patch = build(&original, &modified, PatchFormat::Ups, &BuildOptions::default())
            .unwrap();
        let rows = patch.describe();
        assert_eq!(rows[0], ("format".to_string(), "UPS".to_string()));
        assert_eq!(patch.source_size(), Some(4096));
        assert_eq!(patch.source_checksum(), Some(format!("{:08x}", crc32(&original))));
    }
}

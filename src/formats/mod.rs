// Patch format codecs.
//
// Every format implements `PatchCodec` (detect, parse, serialize, apply);
// formats with authoring support also implement `PatchBuilder`.  The
// dispatcher in `crate::engine` wraps the concrete types in `Patch`.
//
// - `ips`: IPS and the EBP metadata variant
// - `ups`: UPS (XOR records, CRC32 trailer)
// - `bps`: BPS (source/target copies, linear and delta builders)
// - `aps_n64`: APS for Nintendo 64 images
// - `aps_gba`: APS for Game Boy Advance images (64 KiB XOR blocks)
// - `ppf`: PlayStation Patch Format v1-v3
// - `rup`: NINJA 2 multi-file patches
// - `bdf`: bsdiff 4 with bzip2 streams
// - `pmsr`: Paper Mario Star Rod mods
// - `vcdiff`: RFC 3284 / xdelta3 patches

pub mod aps_gba;
pub mod aps_n64;
pub mod bdf;
pub mod bps;
pub mod ips;
pub mod pmsr;
pub mod ppf;
pub mod rup;
pub mod ups;
pub mod vcdiff;

use serde::Serialize;

use crate::error::{PatchError, Result};

/// Parse/serialize/apply contract shared by all formats.
pub trait PatchCodec: Sized {
    /// Leading bytes identifying the format.
    const MAGIC: &'static [u8];

    /// Whether `data` looks like this format.  A positive answer commits
    /// the dispatcher; later failures are reported as errors.
    fn detect(data: &[u8]) -> bool {
        data.starts_with(Self::MAGIC)
    }

    fn parse(data: &[u8]) -> Result<Self>;

    fn serialize(&self) -> Result<Vec<u8>>;

    /// Reconstruct the target from `source`.  With `validate` set, the
    /// source (and where declared, the result) is checked against the
    /// checksums the patch carries.
    fn apply(&self, source: &[u8], validate: bool) -> Result<Vec<u8>>;

    /// Check `source` against what the patch declares without applying.
    /// Formats that declare nothing accept any source.
    fn validate_source(&self, _source: &[u8]) -> bool {
        true
    }

    fn info(&self) -> PatchInfo {
        PatchInfo::default()
    }
}

/// Authoring support.
pub trait PatchBuilder: PatchCodec {
    fn build(original: &[u8], modified: &[u8], options: &BuildOptions) -> Result<Self>;
}

// ---------------------------------------------------------------------------
// Build options
// ---------------------------------------------------------------------------

/// Which BPS builder to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BpsMode {
    /// Delta for originals up to [`bps::DELTA_AUTO_LIMIT`], linear above.
    #[default]
    Auto,
    Linear,
    Delta,
}

/// Free-text metadata some formats can carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PatchMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub description: Option<String>,
}

impl PatchMetadata {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.author.is_none() && self.description.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    /// Re-apply the built patch and compare against the modified image.
    pub verify: bool,
    pub bps_mode: BpsMode,
    pub metadata: PatchMetadata,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            verify: true,
            bps_mode: BpsMode::Auto,
            metadata: PatchMetadata::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Patch summary
// ---------------------------------------------------------------------------

/// What a patch declares about itself, for reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PatchInfo {
    pub source_size: Option<u64>,
    pub target_size: Option<u64>,
    /// Declared source checksum rendered as lowercase hex.
    pub source_checksum: Option<String>,
    pub records: usize,
    /// Format-specific key/value pairs.
    pub details: Vec<(String, String)>,
}

impl PatchInfo {
    pub(crate) fn detail(mut self, key: &str, value: impl ToString) -> Self {
        self.details.push((key.to_string(), value.to_string()));
        self
    }
}

/// Largest image any codec will allocate, declared or addressed.
pub const MAX_IMAGE_SIZE: u64 = u32::MAX as u64;

/// `size` as a buffer length, refusing anything above [`MAX_IMAGE_SIZE`].
pub(crate) fn image_len(size: u64, what: &str) -> Result<usize> {
    if size > MAX_IMAGE_SIZE {
        return Err(PatchError::SizeLimitExceeded(format!(
            "{what} of {size} bytes is over the {MAX_IMAGE_SIZE}-byte limit"
        )));
    }
    usize::try_from(size)
        .map_err(|_| PatchError::SizeLimitExceeded(format!("{what} does not fit in memory")))
}

/// Most of a declared size reserved up front beyond the source length.
const RESERVE_SLACK: usize = 16 << 20;

/// Initial capacity for an output that grows while a patch is applied.
///
/// The declared size is checked against [`MAX_IMAGE_SIZE`] but only
/// reserved up to the source length plus a fixed slack; past that the
/// buffer grows as bytes are actually produced.
pub(crate) fn output_capacity(declared: u64, source_len: usize, what: &str) -> Result<usize> {
    let len = image_len(declared, what)?;
    Ok(len.min(source_len.saturating_add(RESERVE_SLACK)))
}

/// Grow `buf` with zeros so that it is at least `len` bytes long.
pub(crate) fn ensure_len(buf: &mut Vec<u8>, len: usize) -> Result<()> {
    if buf.len() < len {
        buf.resize(image_len(len as u64, "output")?, 0);
    }
    Ok(())
}

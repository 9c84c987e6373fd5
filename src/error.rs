// Crate-wide error taxonomy.
//
// Every codec reports failures through `PatchError`.  Low-level helpers keep
// their own small error enums (varints, the VCDIFF address cache, the bzip2
// decoder) and convert into this one at the codec boundary.

use std::fmt;

use crate::compress::bzip2::Bzip2Error;
use crate::engine::PatchFormat;
use crate::vcdiff::address_cache::AddressCacheError;
use crate::vcdiff::varint::VarIntError;

/// Which checksum failed to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumStage {
    /// The checksum the patch declares over its own bytes.
    Patch,
    /// The checksum of the image the patch is applied to.
    Source,
    /// The checksum of the reconstructed image.
    Target,
}

impl fmt::Display for ChecksumStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Patch => f.write_str("patch"),
            Self::Source => f.write_str("source"),
            Self::Target => f.write_str("target"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    /// Bad magic, unknown version or an inconsistent fixed header.
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// A read ran past the end of the buffer.
    #[error("truncated input: needed {needed} byte(s) at offset {offset:#x}")]
    TruncatedInput { offset: usize, needed: usize },

    #[error("{stage} checksum mismatch")]
    ChecksumMismatch { stage: ChecksumStage },

    /// The patch uses an optional feature this engine does not implement,
    /// or a build needs one its format lacks.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// A hard format limit (IPS offset ceiling, record lengths) was exceeded.
    #[error("size limit exceeded: {0}")]
    SizeLimitExceeded(String),

    #[error("unrecognized patch format")]
    UnrecognizedFormat,

    /// `build` was asked for a format that has no authoring support.
    #[error("{0} patches cannot be created")]
    UnsupportedFormat(PatchFormat),

    /// A freshly built patch did not reproduce the modified image.
    #[error("patch verification failed: patched output differs from the modified file")]
    PatchVerificationFailed,

    /// A record addresses bytes outside the stream it refers to.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("bzip2: {0}")]
    Decompress(Bzip2Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PatchError>;

impl PatchError {
    pub(crate) fn checksum(stage: ChecksumStage) -> Self {
        Self::ChecksumMismatch { stage }
    }

    pub(crate) fn header(msg: impl Into<String>) -> Self {
        Self::MalformedHeader(msg.into())
    }

    pub(crate) fn record(msg: impl Into<String>) -> Self {
        Self::InvalidRecord(msg.into())
    }
}

impl From<Bzip2Error> for PatchError {
    fn from(e: Bzip2Error) -> Self {
        match e {
            Bzip2Error::Randomised => Self::UnsupportedFeature("randomised bzip2 block".into()),
            other => Self::Decompress(other),
        }
    }
}

impl From<VarIntError> for PatchError {
    fn from(e: VarIntError) -> Self {
        match e {
            VarIntError::Underflow => Self::record("VCDIFF varint runs past its section"),
            VarIntError::Overflow => Self::record("VCDIFF varint overflows 64 bits"),
        }
    }
}

impl From<AddressCacheError> for PatchError {
    fn from(e: AddressCacheError) -> Self {
        Self::InvalidRecord(format!("VCDIFF COPY address: {e}"))
    }
}

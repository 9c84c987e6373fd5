//! Oxipatch: ROM patch parsing, applying and authoring in Rust.
//!
//! The crate provides:
//! - Codecs for IPS/EBP, UPS, BPS, APS (N64 and GBA), PPF, RUP, BDF, PMSR
//!   and VCDIFF patches (`formats`)
//! - A dispatcher that detects formats, applies patches with header
//!   handling, and builds verified patches (`engine`)
//! - Console header heuristics and checksum fixups (`header`)
//! - File-oriented helpers and ROM reports (`io`)
//! - An optional CLI (`cli` feature)
//!
//! # Quick Start
//!
//! ```no_run
//! use oxipatch::{ApplyOptions, BuildOptions, PatchFormat};
//!
//! let original = vec![0u8; 1024];
//! let mut modified = original.clone();
//! modified[100] = 0xFF;
//!
//! let patch = oxipatch::build(&original, &modified, PatchFormat::Bps, &BuildOptions::default()).unwrap();
//! let bytes = patch.serialize().unwrap();
//!
//! let parsed = oxipatch::detect_and_parse(&bytes).unwrap();
//! let patched = oxipatch::apply(&original, &parsed, &ApplyOptions::default()).unwrap();
//! assert_eq!(patched.data, modified);
//! ```

pub mod checksum;
pub mod compress;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod formats;
pub mod hash;
pub mod header;
pub mod io;
pub mod vcdiff;
pub mod vlv;

#[cfg(feature = "cli")]
pub mod cli;

pub use engine::{
    ApplyOptions, Patch, PatchFormat, Patched, apply, build, detect_and_parse, patched_file_name,
    rom_too_big, validate_source,
};
pub use error::{ChecksumStage, PatchError, Result};
pub use formats::{BpsMode, BuildOptions, PatchInfo, PatchMetadata};

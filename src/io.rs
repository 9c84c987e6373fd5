// File-level I/O helpers for applying and creating patches.
//
// Provides `apply_file()` and `create_file()` convenience functions that
// load the images fully into memory, run the engine and write the result
// with buffered I/O.  `rom_info()` reports the digests patch sites list
// for a ROM; the SHA-256 digest is feature-gated behind `file-io`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::checksum::{crc32, md5, sha1, to_hex};
use crate::engine::{self, ApplyOptions, HeaderAction, Patch, PatchFormat};
use crate::error::Result;
use crate::formats::BuildOptions;
use crate::formats::aps_n64::Z64_MAGIC;
use crate::header::{self, RomSystem};

const BUF_SIZE: usize = 64 * 1024; // 64 KiB

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Statistics returned by `apply_file()`.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyStats {
    pub format: PatchFormat,
    pub source_size: u64,
    pub patch_size: u64,
    pub output_size: u64,
    pub output_path: PathBuf,
    /// Name of the header that was stripped or injected, if any.
    pub header: Option<String>,
    pub checksum_fixed: Option<RomSystem>,
    pub output_crc32: String,
}

/// Statistics returned by `create_file()`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateStats {
    pub format: PatchFormat,
    pub original_size: u64,
    pub modified_size: u64,
    pub patch_size: u64,
    pub verified: bool,
}

// ---------------------------------------------------------------------------
// Reading and writing
// ---------------------------------------------------------------------------

/// Read and parse a patch file of any supported format.
pub fn read_patch(path: &Path) -> Result<Patch> {
    let data = std::fs::read(path)?;
    engine::detect_and_parse(&data)
}

/// Write `data` to `path` through a buffered writer.
pub fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    let mut writer = BufWriter::with_capacity(BUF_SIZE, File::create(path)?);
    writer.write_all(data)?;
    writer.flush()?;
    Ok(())
}

/// Where `apply_file` writes when no output path is given: next to the
/// ROM, with " (patched)" inserted before the extension.
pub fn default_output_path(rom_path: &Path) -> PathBuf {
    let name = rom_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".into());
    rom_path.with_file_name(engine::patched_file_name(&name, true))
}

// ---------------------------------------------------------------------------
// apply_file / create_file
// ---------------------------------------------------------------------------

/// Apply the patch at `patch_path` to the ROM at `rom_path`.
///
/// The ROM's file name is passed to the engine for header detection.
/// Without `output_path` the result is written next to the ROM.
pub fn apply_file(
    rom_path: &Path,
    patch_path: &Path,
    output_path: Option<&Path>,
    options: &ApplyOptions,
) -> Result<ApplyStats> {
    let rom = std::fs::read(rom_path)?;
    let patch_data = std::fs::read(patch_path)?;
    let patch = engine::detect_and_parse(&patch_data)?;

    if engine::rom_too_big(&rom) {
        log::warn!(
            "{} is {} bytes, larger than most patchers accept",
            rom_path.display(),
            rom.len()
        );
    }

    let mut options = options.clone();
    if options.file_name.is_none() {
        options.file_name = rom_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
    }
    let patched = engine::apply(&rom, &patch, &options)?;

    let output_path = match output_path {
        Some(p) => p.to_path_buf(),
        None => match &patched.file_name {
            Some(name) if rom_path.file_name().is_none_or(|n| n.to_string_lossy() != *name) => {
                rom_path.with_file_name(name)
            }
            _ => default_output_path(rom_path),
        },
    };
    write_file(&output_path, &patched.data)?;

    Ok(ApplyStats {
        format: patch.format(),
        source_size: rom.len() as u64,
        patch_size: patch_data.len() as u64,
        output_size: patched.data.len() as u64,
        output_path,
        header: patched.header.map(|h| match h {
            HeaderAction::Stripped(kind) | HeaderAction::Injected(kind) => kind.name.to_string(),
        }),
        checksum_fixed: patched.checksum_fixed,
        output_crc32: to_hex(&crc32(&patched.data).to_be_bytes()),
    })
}

/// Build a `format` patch from two files and write it to `patch_path`.
pub fn create_file(
    original_path: &Path,
    modified_path: &Path,
    patch_path: &Path,
    format: PatchFormat,
    options: &BuildOptions,
) -> Result<CreateStats> {
    let original = std::fs::read(original_path)?;
    let modified = std::fs::read(modified_path)?;
    let patch = engine::build(&original, &modified, format, options)?;
    let bytes = patch.serialize()?;
    write_file(patch_path, &bytes)?;

    Ok(CreateStats {
        format: patch.format(),
        original_size: original.len() as u64,
        modified_size: modified.len() as u64,
        patch_size: bytes.len() as u64,
        verified: options.verify,
    })
}

// ---------------------------------------------------------------------------
// ROM report
// ---------------------------------------------------------------------------

/// Identifiers stored in the header of a big-endian N64 image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct N64Ids {
    pub cart_id: String,
    pub header_crc: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RomInfo {
    pub size: u64,
    pub crc32: String,
    pub md5: String,
    pub sha1: String,
    /// Only with the `file-io` feature.
    pub sha256: Option<String>,
    pub system: Option<RomSystem>,
    /// Header recognised from the file name and size.
    pub header: Option<&'static str>,
    pub n64: Option<N64Ids>,
    pub too_big: bool,
}

/// Digests and console details for `image`, named `file_name`.
pub fn rom_info(image: &[u8], file_name: &str) -> RomInfo {
    #[cfg(feature = "file-io")]
    let sha256 = Some(to_hex(&crate::checksum::sha256(image)));
    #[cfg(not(feature = "file-io"))]
    let sha256: Option<String> = None;

    let n64 = (image.len() >= 0x40 && image.starts_with(&Z64_MAGIC)).then(|| N64Ids {
        cart_id: String::from_utf8_lossy(&image[0x3C..0x3F]).into_owned(),
        header_crc: to_hex(&image[0x10..0x18]),
    });

    RomInfo {
        size: image.len() as u64,
        crc32: to_hex(&crc32(image).to_be_bytes()),
        md5: to_hex(&md5(image)),
        sha1: to_hex(&sha1(image)),
        sha256,
        system: header::detect_system(image),
        header: header::detect_header(image, file_name).map(|k| k.name),
        n64,
        too_big: engine::rom_too_big(image),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_apply_files() {
        let dir = tempfile::tempdir().unwrap();
        let original_path = dir.path().join("game.bin");
        let modified_path = dir.path().join("hack.bin");
        let patch_path = dir.path().join("hack.bps");

        let original: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();
        let mut modified = original.clone();
        modified[5000..5010].copy_from_slice(b"0123456789");
        std::fs::write(&original_path, &original).unwrap();
        std::fs::write(&modified_path, &modified).unwrap();

        let created = create_file(
            &original_path,
            &modified_path,
            &patch_path,
            PatchFormat::Bps,
            &BuildOptions::default(),
        )
        .unwrap();
        assert_eq!(created.format, PatchFormat::Bps);
        assert!(created.patch_size > 0);

        let stats = apply_file(&original_path, &patch_path, None, &ApplyOptions::default()).unwrap();
        assert_eq!(stats.output_path, dir.path().join("game (patched).bin"));
        assert_eq!(std::fs::read(&stats.output_path).unwrap(), modified);
        assert_eq!(stats.output_crc32, format!("{:08x}", crc32(&modified)));
    }

    #[test]
    fn missing_rom_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = apply_file(
            &dir.path().join("nope.sfc"),
            &dir.path().join("nope.ips"),
            None,
            &ApplyOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, crate::error::PatchError::Io(_)));
    }

    #[test]
    fn rom_report() {
        let mut rom = vec![0u8; 0x1000];
        rom[..4].copy_from_slice(&Z64_MAGIC);
        rom[0x3C..0x3F].copy_from_slice(b"NZL");
        let info = rom_info(&rom, "zelda.z64");
        assert_eq!(info.size, 0x1000);
        assert_eq!(info.crc32.len(), 8);
        assert_eq!(info.md5.len(), 32);
        assert_eq!(info.sha1.len(), 40);
        assert_eq!(info.n64.unwrap().cart_id, "NZL");
        assert!(!info.too_big);
        #[cfg(feature = "file-io")]
        assert_eq!(info.sha256.unwrap().len(), 64);
    }

    #[test]
    fn output_path_suffix() {
        assert_eq!(
            default_output_path(Path::new("/roms/Game.sfc")),
            PathBuf::from("/roms/Game (patched).sfc")
        );
    }
}

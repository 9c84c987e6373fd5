// Console header heuristics and checksum fixups.
//
// Some dumps carry a copier or emulator header in front of the ROM body
// while patches are usually made against the bare body (or the other way
// around).  Headers are recognised from the file extension and from the
// body size being a multiple of the console's unit.  After patching, Game
// Boy and Mega Drive images can have their internal checksums rewritten.

use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;

// ---------------------------------------------------------------------------
// Header table
// ---------------------------------------------------------------------------

/// A fixed-size header some dumps of a console carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeaderKind {
    pub name: &'static str,
    pub extensions: &'static [&'static str],
    /// Header length in bytes.
    pub size: usize,
    /// The unheadered body is a multiple of this.
    pub modulus: usize,
}

pub const HEADERS: &[HeaderKind] = &[
    HeaderKind {
        name: "iNES",
        extensions: &["nes"],
        size: 16,
        modulus: 1024,
    },
    HeaderKind {
        name: "fwNES",
        extensions: &["fds"],
        size: 16,
        modulus: 65500,
    },
    HeaderKind {
        name: "LNX",
        extensions: &["lnx"],
        size: 64,
        modulus: 1024,
    },
    HeaderKind {
        name: "SNES copier",
        extensions: &["sfc", "smc", "swc", "fig"],
        size: 512,
        modulus: 262_144,
    },
];

/// Images above this size are never offered a fake header.
const MAX_FAKE_HEADER_INPUT: usize = 0x60_0200;

const FDS_DISK_SIZE: usize = 65500;

/// Lowercased extension of `file_name`, without the dot.
pub fn extension(file_name: &str) -> Option<String> {
    let name = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn header_for_extension(ext: &str) -> Option<&'static HeaderKind> {
    HEADERS
        .iter()
        .find(|h| h.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
}

/// The header `image` carries, judging by its name and size.
pub fn detect_header(image: &[u8], file_name: &str) -> Option<&'static HeaderKind> {
    let kind = header_for_extension(&extension(file_name)?)?;
    (image.len() > kind.size && (image.len() - kind.size) % kind.modulus == 0).then_some(kind)
}

/// The header `image` could be given, if it has none yet.
pub fn fake_header_kind(image: &[u8], file_name: &str) -> Option<&'static HeaderKind> {
    let kind = header_for_extension(&extension(file_name)?)?;
    (!image.is_empty() && image.len() <= MAX_FAKE_HEADER_INPUT && image.len() % kind.modulus == 0)
        .then_some(kind)
}

/// Split `image` into its header and body.
pub fn split_header<'a>(image: &'a [u8], kind: &HeaderKind) -> (&'a [u8], &'a [u8]) {
    image.split_at(kind.size.min(image.len()))
}

/// `image` without its first `kind.size` bytes.
pub fn remove_header(image: &[u8], kind: &HeaderKind) -> Vec<u8> {
    split_header(image, kind).1.to_vec()
}

/// A plausible header for `body`.
pub fn fake_header(body: &[u8], kind: &HeaderKind) -> Vec<u8> {
    let mut header = vec![0u8; kind.size];
    match kind.name {
        "iNES" => {
            header[..4].copy_from_slice(b"NES\x1a");
            header[4] = (body.len() / 0x4000).min(0xFF) as u8;
        }
        "fwNES" => {
            header[..4].copy_from_slice(b"FDS\x1a");
            header[4] = (body.len() / FDS_DISK_SIZE).min(0xFF) as u8;
        }
        "LNX" => {
            header[..4].copy_from_slice(b"LYNX");
        }
        _ => {
            // Copier headers open with the body size in 8 KiB units.
            let units = (body.len() / 0x2000).min(0xFFFF) as u16;
            header[..2].copy_from_slice(&units.to_le_bytes());
        }
    }
    header
}

/// `image` with a fake header in front.
pub fn add_fake_header(image: &[u8], kind: &HeaderKind) -> Vec<u8> {
    let mut out = fake_header(image, kind);
    out.extend_from_slice(image);
    out
}

// ---------------------------------------------------------------------------
// System detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RomSystem {
    GameBoy,
    MegaDrive,
    Nintendo64,
    FamicomDisk,
}

const GB_LOGO_OFFSET: usize = 0x104;
const GB_LOGO: [u8; 48] = [
    0xCE, 0xED, 0x66, 0x66, 0xCC, 0x0D, 0x00, 0x0B, 0x03, 0x73, 0x00, 0x83, 0x00, 0x0C, 0x00, 0x0D,
    0x00, 0x08, 0x11, 0x1F, 0x88, 0x89, 0x00, 0x0E, 0xDC, 0xCC, 0x6E, 0xE6, 0xDD, 0xDD, 0xD9, 0x99,
    0xBB, 0xBB, 0x67, 0x63, 0x6E, 0x0E, 0xEC, 0xCC, 0xDD, 0xDC, 0x99, 0x9F, 0xBB, 0xB9, 0x33, 0x3E,
];
const GB_CHECKSUM_RANGE: std::ops::RangeInclusive<usize> = 0x134..=0x14C;
const GB_CHECKSUM_OFFSET: usize = 0x14D;

const MD_SIGNATURE_OFFSET: usize = 0x100;
const MD_CHECKSUM_OFFSET: usize = 0x18E;
const MD_SUM_START: usize = 0x200;

/// Guess the console from the image contents.
pub fn detect_system(image: &[u8]) -> Option<RomSystem> {
    let len = image.len();
    if len <= 0x200 || len % 4 != 0 {
        return None;
    }
    if len % 0x4000 == 0 && image[GB_LOGO_OFFSET..].starts_with(&GB_LOGO) {
        return Some(RomSystem::GameBoy);
    }
    let signature = &image[MD_SIGNATURE_OFFSET..MD_SIGNATURE_OFFSET + 12];
    if signature == b"SEGA GENESIS" || signature == b"SEGA MEGA DR" {
        return Some(RomSystem::MegaDrive);
    }
    if len >= 0x40_0000 && image.starts_with(&crate::formats::aps_n64::Z64_MAGIC) {
        return Some(RomSystem::Nintendo64);
    }
    if len % FDS_DISK_SIZE == 0 {
        return Some(RomSystem::FamicomDisk);
    }
    None
}

/// Game Boy header checksum over 0x134..=0x14C.
pub fn game_boy_checksum(image: &[u8]) -> u8 {
    image[GB_CHECKSUM_RANGE]
        .iter()
        .fold(0u8, |c, &b| c.wrapping_sub(b).wrapping_sub(1))
}

/// Mega Drive checksum: big-endian word sum from 0x200 to the end.
pub fn mega_drive_checksum(image: &[u8]) -> u16 {
    image[MD_SUM_START..]
        .chunks_exact(2)
        .fold(0u16, |sum, w| sum.wrapping_add(BigEndian::read_u16(w)))
}

/// Rewrite the internal checksum of Game Boy and Mega Drive images.
///
/// Returns the system whose checksum was changed, if any.
pub fn fix_checksum(image: &mut [u8]) -> Option<RomSystem> {
    match detect_system(image)? {
        RomSystem::GameBoy => {
            let fixed = game_boy_checksum(image);
            let old = image[GB_CHECKSUM_OFFSET];
            if old == fixed {
                return None;
            }
            image[GB_CHECKSUM_OFFSET] = fixed;
            log::info!("fixed Game Boy header checksum: {old:#04x} -> {fixed:#04x}");
            Some(RomSystem::GameBoy)
        }
        RomSystem::MegaDrive => {
            let fixed = mega_drive_checksum(image);
            let slot = &mut image[MD_CHECKSUM_OFFSET..MD_CHECKSUM_OFFSET + 2];
            let old = BigEndian::read_u16(slot);
            if old == fixed {
                return None;
            }
            BigEndian::write_u16(slot, fixed);
            log::info!("fixed Mega Drive checksum: {old:#06x} -> {fixed:#06x}");
            Some(RomSystem::MegaDrive)
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

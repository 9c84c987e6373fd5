// NINJA 2 (RUP) patches.
//
// A 0x800-byte text header (magic "NINJA2", encoding byte, then fixed
// zero-padded fields) is followed by a command stream:
//
//   0x01  open file: name, rom type, source/target sizes and MD5s, and
//         when the sizes differ an 'A'ppend or 'M'inify overflow blob
//   0x02  XOR record: offset, length, bytes
//   0x00  end
//
// Sizes, offsets and lengths use the RUP count-prefixed integer.  A file
// is picked by matching the image's MD5 against either its source MD5
// (apply) or its target MD5 (undo).

use chrono::Utc;

use super::{BuildOptions, PatchBuilder, PatchCodec, PatchInfo, image_len};
use crate::checksum::{md5, to_hex};
use crate::cursor::{ByteCursor, byte_or_zero, write_fixed_string};
use crate::error::{ChecksumStage, PatchError, Result};
use crate::vlv::{read_rup_vlv, write_rup_vlv};

const COMMANDS_OFFSET: usize = 0x800;

const AUTHOR_LEN: usize = 84;
const VERSION_LEN: usize = 11;
const TITLE_LEN: usize = 256;
const GENRE_LEN: usize = 48;
const LANGUAGE_LEN: usize = 48;
const DATE_LEN: usize = 8;
const WEB_LEN: usize = 512;
const DESCRIPTION_LEN: usize = 1074;

const CMD_END: u8 = 0x00;
const CMD_OPEN_FILE: u8 = 0x01;
const CMD_XOR_RECORD: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowMode {
    /// The target is longer; the blob is the target's tail.
    Append,
    /// The target is shorter; the blob is the source's tail.
    Minify,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RupOverflow {
    pub mode: OverflowMode,
    /// Plain bytes; stored XOR 0xFF on disk.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RupRecord {
    pub offset: u64,
    pub xor: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RupFile {
    pub name: String,
    pub rom_type: u8,
    pub source_size: u64,
    pub target_size: u64,
    pub source_md5: [u8; 16],
    pub target_md5: [u8; 16],
    pub overflow: Option<RupOverflow>,
    pub records: Vec<RupRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RupPatch {
    pub text_encoding: u8,
    pub author: String,
    pub version: String,
    pub title: String,
    pub genre: String,
    pub language: String,
    /// YYYYMMDD.
    pub date: String,
    pub web: String,
    pub description: String,
    pub files: Vec<RupFile>,
}

/// Which file entry applies to an image, and in which direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Selection {
    index: usize,
    undo: bool,
}

impl RupPatch {
    fn select(&self, image: &[u8]) -> Option<Selection> {
        let digest = md5(image);
        self.files.iter().enumerate().find_map(|(index, f)| {
            if f.source_md5 == digest {
                Some(Selection { index, undo: false })
            } else if f.target_md5 == digest {
                Some(Selection { index, undo: true })
            } else {
                None
            }
        })
    }
}

fn read_size(c: &mut ByteCursor<'_>) -> Result<usize> {
    usize::try_from(read_rup_vlv(c)?).map_err(|_| PatchError::record("RUP length overflows"))
}

fn read_md5(c: &mut ByteCursor<'_>) -> Result<[u8; 16]> {
    let mut digest = [0u8; 16];
    digest.copy_from_slice(c.take(16)?);
    Ok(digest)
}

fn flip(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(|b| b ^ 0xFF).collect()
}

impl PatchCodec for RupPatch {
    const MAGIC: &'static [u8] = b"NINJA2";

    fn parse(data: &[u8]) -> Result<Self> {
        let mut c = ByteCursor::new(data);
        if !c.starts_with(Self::MAGIC) {
            return Err(PatchError::header("missing NINJA2 magic"));
        }
        c.skip(Self::MAGIC.len())?;

        let mut patch = Self {
            text_encoding: c.read_u8()?,
            author: c.read_fixed_string(AUTHOR_LEN)?,
            version: c.read_fixed_string(VERSION_LEN)?,
            title: c.read_fixed_string(TITLE_LEN)?,
            genre: c.read_fixed_string(GENRE_LEN)?,
            language: c.read_fixed_string(LANGUAGE_LEN)?,
            date: c.read_fixed_string(DATE_LEN)?,
            web: c.read_fixed_string(WEB_LEN)?,
            description: c.read_fixed_string(DESCRIPTION_LEN)?.replace("\\n", "\n"),
            files: Vec::new(),
        };
        c.seek(COMMANDS_OFFSET)?;

        loop {
            match c.read_u8()? {
                CMD_END => break,
                CMD_OPEN_FILE => {
                    let name_len = read_size(&mut c)?;
                    let name = String::from_utf8_lossy(c.take(name_len)?).into_owned();
                    let rom_type = c.read_u8()?;
                    let source_size = read_rup_vlv(&mut c)?;
                    let target_size = read_rup_vlv(&mut c)?;
                    let source_md5 = read_md5(&mut c)?;
                    let target_md5 = read_md5(&mut c)?;
                    let overflow = if source_size != target_size {
                        let mode = match c.read_u8()? {
                            b'A' => OverflowMode::Append,
                            b'M' => OverflowMode::Minify,
                            other => {
                                return Err(PatchError::record(format!(
                                    "unknown RUP overflow mode {other:#04x}"
                                )));
                            }
                        };
                        let len = read_size(&mut c)?;
                        Some(RupOverflow {
                            mode,
                            data: flip(c.take(len)?),
                        })
                    } else {
                        None
                    };
                    patch.files.push(RupFile {
                        name,
                        rom_type,
                        source_size,
                        target_size,
                        source_md5,
                        target_md5,
                        overflow,
                        records: Vec::new(),
                    });
                }
                CMD_XOR_RECORD => {
                    let offset = read_rup_vlv(&mut c)?;
                    let len = read_size(&mut c)?;
                    let xor = c.read_bytes(len)?;
                    let file = patch
                        .files
                        .last_mut()
                        .ok_or_else(|| PatchError::record("RUP XOR record before any file"))?;
                    file.records.push(RupRecord { offset, xor });
                }
                other => {
                    return Err(PatchError::record(format!(
                        "unknown RUP command {other:#04x} at {:#x}",
                        c.offset() - 1
                    )));
                }
            }
        }

        log::debug!("rup: {} file(s)", patch.files.len());
        Ok(patch)
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(COMMANDS_OFFSET + 64);
        out.extend_from_slice(Self::MAGIC);
        out.push(self.text_encoding);
        write_fixed_string(&mut out, &self.author, AUTHOR_LEN)?;
        write_fixed_string(&mut out, &self.version, VERSION_LEN)?;
        write_fixed_string(&mut out, &self.title, TITLE_LEN)?;
        write_fixed_string(&mut out, &self.genre, GENRE_LEN)?;
        write_fixed_string(&mut out, &self.language, LANGUAGE_LEN)?;
        write_fixed_string(&mut out, &self.date, DATE_LEN)?;
        write_fixed_string(&mut out, &self.web, WEB_LEN)?;
        write_fixed_string(&mut out, &self.description.replace('\n', "\\n"), DESCRIPTION_LEN)?;

        for file in &self.files {
            out.push(CMD_OPEN_FILE);
            write_rup_vlv(&mut out, file.name.len() as u64);
            out.extend_from_slice(file.name.as_bytes());
            out.push(file.rom_type);
            write_rup_vlv(&mut out, file.source_size);
            write_rup_vlv(&mut out, file.target_size);
            out.extend_from_slice(&file.source_md5);
            out.extend_from_slice(&file.target_md5);
            if file.source_size != file.target_size {
                let overflow = file.overflow.as_ref().ok_or_else(|| {
                    PatchError::record(format!("RUP file {:?} changes size without overflow data", file.name))
                })?;
                out.push(match overflow.mode {
                    OverflowMode::Append => b'A',
                    OverflowMode::Minify => b'M',
                });
                write_rup_vlv(&mut out, overflow.data.len() as u64);
                out.extend_from_slice(&flip(&overflow.data));
            }
            for record in &file.records {
                out.push(CMD_XOR_RECORD);
                write_rup_vlv(&mut out, record.offset);
                write_rup_vlv(&mut out, record.xor.len() as u64);
                out.extend_from_slice(&record.xor);
            }
        }
        out.push(CMD_END);
        Ok(out)
    }

    fn apply(&self, source: &[u8], validate: bool) -> Result<Vec<u8>> {
        let selection = match self.select(source) {
            Some(s) => s,
            None if validate => return Err(PatchError::checksum(ChecksumStage::Source)),
            None if self.files.is_empty() => {
                return Err(PatchError::record("RUP patch holds no files"));
            }
            None => Selection {
                index: 0,
                undo: false,
            },
        };
        let file = &self.files[selection.index];
        if selection.undo {
            log::warn!("rup: image matches the target of {:?}, undoing the patch", file.name);
        }

        let (size, expected) = if selection.undo {
            (file.source_size, file.source_md5)
        } else {
            (file.target_size, file.target_md5)
        };
        let size = image_len(size, "RUP target")?;

        // Bytes past the source can only come from the overflow blob.
        let overflow = match &file.overflow {
            Some(overflow) => match (overflow.mode, selection.undo) {
                (OverflowMode::Append, false) => Some((file.source_size, &overflow.data)),
                (OverflowMode::Minify, true) => Some((file.target_size, &overflow.data)),
                _ => None,
            },
            None => None,
        };
        let overflow = overflow
            .map(|(at, data)| {
                let at = usize::try_from(at)
                    .map_err(|_| PatchError::record("RUP overflow offset overflows"))?;
                let end = at
                    .checked_add(data.len())
                    .ok_or_else(|| PatchError::record("RUP overflow offset overflows"))?;
                Ok::<_, PatchError>((at, end, data))
            })
            .transpose()?;
        let reach = overflow.map_or(0, |(_, end, _)| end).max(source.len());
        if size > reach {
            return Err(PatchError::record(format!(
                "RUP target of {size} bytes is not covered by the image and overflow data"
            )));
        }

        let mut out = vec![0u8; size];
        let keep = size.min(source.len());
        out[..keep].copy_from_slice(&source[..keep]);

        if let Some((at, end, data)) = overflow {
            if end > out.len() {
                return Err(PatchError::record("RUP overflow data runs past the output"));
            }
            out[at..end].copy_from_slice(data);
        }

        for record in &file.records {
            let start = usize::try_from(record.offset)
                .map_err(|_| PatchError::record("RUP offset overflows"))?;
            let end = start
                .checked_add(record.xor.len())
                .ok_or_else(|| PatchError::record("RUP record overflows"))?;
            for (pos, &x) in (start..end).zip(&record.xor) {
                if pos < out.len() {
                    out[pos] = byte_or_zero(source, pos) ^ x;
                }
            }
        }

        if validate && md5(&out) != expected {
            return Err(PatchError::checksum(ChecksumStage::Target));
        }
        Ok(out)
    }

    fn validate_source(&self, source: &[u8]) -> bool {
        self.select(source).is_some()
    }

    fn info(&self) -> PatchInfo {
        let mut info = PatchInfo {
            records: self.files.iter().map(|f| f.records.len()).sum(),
            ..Default::default()
        };
        if let Some(first) = self.files.first() {
            info.source_size = Some(first.source_size);
            info.target_size = Some(first.target_size);
            info.source_checksum = Some(to_hex(&first.source_md5));
        }
        for (key, value) in [
            ("title", &self.title),
            ("author", &self.author),
            ("version", &self.version),
            ("date", &self.date),
            ("web", &self.web),
            ("description", &self.description),
        ] {
            if !value.is_empty() {
                info = info.detail(key, value);
            }
        }
        info.detail("files", self.files.len())
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Today's date as YYYYMMDD (UTC).
fn today() -> String {
    Utc::now().format("%Y%m%d").to_string()
}

impl PatchBuilder for RupPatch {
    fn build(original: &[u8], modified: &[u8], options: &BuildOptions) -> Result<Self> {
        let shared = original.len().min(modified.len());
        let mut records = Vec::new();
        let mut pos = 0usize;
        while pos < shared {
            if original[pos] == modified[pos] {
                pos += 1;
                continue;
            }
            let start = pos;
            while pos < shared && original[pos] != modified[pos] {
                pos += 1;
            }
            records.push(RupRecord {
                offset: start as u64,
                xor: (start..pos).map(|i| original[i] ^ modified[i]).collect(),
            });
        }

        let overflow = match original.len().cmp(&modified.len()) {
            std::cmp::Ordering::Less => Some(RupOverflow {
                mode: OverflowMode::Append,
                data: modified[shared..].to_vec(),
            }),
            std::cmp::Ordering::Greater => Some(RupOverflow {
                mode: OverflowMode::Minify,
                data: original[shared..].to_vec(),
            }),
            std::cmp::Ordering::Equal => None,
        };

        let meta = &options.metadata;
        Ok(Self {
            text_encoding: 0,
            author: meta.author.clone().unwrap_or_default(),
            version: String::new(),
            title: meta.title.clone().unwrap_or_default(),
            genre: String::new(),
            language: String::new(),
            date: today(),
            web: String::new(),
            description: meta.description.clone().unwrap_or_default(),
            files: vec![RupFile {
                name: String::new(),
                rom_type: 0,
                source_size: original.len() as u64,
                target_size: modified.len() as u64,
                source_md5: md5(original),
                target_md5: md5(modified),
                overflow,
                records,
            }],
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

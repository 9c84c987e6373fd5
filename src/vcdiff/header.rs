// VCDIFF file and window headers (RFC 3284, Sections 4.1 and 4.2).
//
//   file    := D6 C3 C4 00  hdr_ind  [secondary id]  [code table]  [app data]
//   window  := win_ind  [copy len, copy pos]  enc_len  target_len  del_ind
//              data_len  inst_len  addr_len  [adler32 BE]
//
// `VCD_ADLER32` is the xdelta3 window extension; it is accepted on decode
// and always written on encode.

use bitflags::bitflags;

use super::varint;
use crate::cursor::ByteCursor;
use crate::error::{PatchError, Result};

pub const VCDIFF_MAGIC: [u8; 4] = [0xD6, 0xC3, 0xC4, 0x00];

/// Largest target window accepted on decode.
pub const MAX_WINDOW: u64 = 1 << 24;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HeaderFlags: u8 {
        const SECONDARY = 1 << 0;
        const CODETABLE = 1 << 1;
        const APPHEADER = 1 << 2;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WindowFlags: u8 {
        const SOURCE  = 1 << 0;
        const TARGET  = 1 << 1;
        const ADLER32 = 1 << 2;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeltaFlags: u8 {
        const DATACOMP = 1 << 0;
        const INSTCOMP = 1 << 1;
        const ADDRCOMP = 1 << 2;
    }
}

fn read_int(cursor: &mut ByteCursor<'_>) -> Result<u64> {
    let start = cursor.offset();
    let (value, used) = varint::read(&cursor.data()[start..])?;
    cursor.skip(used)?;
    Ok(value)
}

fn read_len(cursor: &mut ByteCursor<'_>) -> Result<usize> {
    usize::try_from(read_int(cursor)?).map_err(|_| PatchError::record("VCDIFF length overflows"))
}

// ---------------------------------------------------------------------------
// File header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileHeader {
    pub flags: HeaderFlags,
    pub app_data: Option<Vec<u8>>,
}

impl FileHeader {
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&VCDIFF_MAGIC);
        let mut flags = self.flags - HeaderFlags::SECONDARY - HeaderFlags::CODETABLE;
        flags.set(HeaderFlags::APPHEADER, self.app_data.is_some());
        out.push(flags.bits());
        if let Some(data) = &self.app_data {
            varint::write(out, data.len() as u64);
            out.extend_from_slice(data);
        }
    }

    /// Parse the file header.  Secondary compressors and custom code
    /// tables are rejected; application data is kept but never interpreted.
    pub fn read(cursor: &mut ByteCursor<'_>) -> Result<Self> {
        let magic = cursor.take(4)?;
        if magic[..3] != VCDIFF_MAGIC[..3] {
            return Err(PatchError::header("missing VCDIFF magic"));
        }
        if magic[3] != 0 {
            return Err(PatchError::header(format!(
                "unsupported VCDIFF version {:#04x}",
                magic[3]
            )));
        }

        let raw = cursor.read_u8()?;
        let flags = HeaderFlags::from_bits(raw)
            .ok_or_else(|| PatchError::header(format!("invalid header indicator {raw:#04x}")))?;

        if flags.contains(HeaderFlags::SECONDARY) {
            let id = cursor.read_u8()?;
            return Err(PatchError::UnsupportedFeature(format!(
                "VCDIFF secondary compressor (id {id})"
            )));
        }
        if flags.contains(HeaderFlags::CODETABLE) {
            return Err(PatchError::UnsupportedFeature(
                "VCDIFF custom code table".into(),
            ));
        }

        let app_data = if flags.contains(HeaderFlags::APPHEADER) {
            let len = read_len(cursor)?;
            Some(cursor.read_bytes(len)?)
        } else {
            None
        };

        Ok(Self { flags, app_data })
    }
}

// ---------------------------------------------------------------------------
// Window header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowHeader {
    pub flags: WindowFlags,
    /// Length and position of the copy segment (source or earlier target).
    pub copy_len: u64,
    pub copy_pos: u64,
    pub target_len: u64,
    pub data_len: u64,
    pub inst_len: u64,
    pub addr_len: u64,
    pub adler32: Option<u32>,
}

impl WindowHeader {
    /// Size of the delta encoding that `enc_len` must declare.
    fn delta_len(&self) -> u64 {
        varint::encoded_len(self.target_len) as u64
            + 1
            + varint::encoded_len(self.data_len) as u64
            + varint::encoded_len(self.inst_len) as u64
            + varint::encoded_len(self.addr_len) as u64
            + self.data_len
            + self.inst_len
            + self.addr_len
            + if self.adler32.is_some() { 4 } else { 0 }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        let mut flags = self.flags;
        flags.set(WindowFlags::ADLER32, self.adler32.is_some());
        out.push(flags.bits());
        if flags.intersects(WindowFlags::SOURCE | WindowFlags::TARGET) {
            varint::write(out, self.copy_len);
            varint::write(out, self.copy_pos);
        }
        varint::write(out, self.delta_len());
        varint::write(out, self.target_len);
        out.push(DeltaFlags::empty().bits());
        varint::write(out, self.data_len);
        varint::write(out, self.inst_len);
        varint::write(out, self.addr_len);
        if let Some(sum) = self.adler32 {
            out.extend_from_slice(&sum.to_be_bytes());
        }
    }

    pub fn read(cursor: &mut ByteCursor<'_>) -> Result<Self> {
        let raw = cursor.read_u8()?;
        let flags = WindowFlags::from_bits(raw)
            .ok_or_else(|| PatchError::header(format!("invalid window indicator {raw:#04x}")))?;
        if flags.contains(WindowFlags::SOURCE | WindowFlags::TARGET) {
            return Err(PatchError::header(
                "window declares both a source and a target segment",
            ));
        }

        let (copy_len, copy_pos) = if flags.intersects(WindowFlags::SOURCE | WindowFlags::TARGET) {
            (read_int(cursor)?, read_int(cursor)?)
        } else {
            (0, 0)
        };

        let enc_len = read_int(cursor)?;
        let target_len = read_int(cursor)?;
        if target_len > MAX_WINDOW {
            return Err(PatchError::SizeLimitExceeded(format!(
                "VCDIFF window of {target_len} bytes"
            )));
        }

        let del_raw = cursor.read_u8()?;
        let delta = DeltaFlags::from_bits(del_raw)
            .ok_or_else(|| PatchError::header(format!("invalid delta indicator {del_raw:#04x}")))?;
        if !delta.is_empty() {
            return Err(PatchError::UnsupportedFeature(
                "VCDIFF secondary-compressed sections".into(),
            ));
        }

        let data_len = read_int(cursor)?;
        let inst_len = read_int(cursor)?;
        let addr_len = read_int(cursor)?;
        let adler32 = if flags.contains(WindowFlags::ADLER32) {
            Some(cursor.read_u32_be()?)
        } else {
            None
        };

        let header = Self {
            flags,
            copy_len,
            copy_pos,
            target_len,
            data_len,
            inst_len,
            addr_len,
            adler32,
        };
        if header.delta_len() != enc_len {
            return Err(PatchError::header(format!(
                "window delta length {enc_len} disagrees with its sections"
            )));
        }
        Ok(header)
    }

    pub fn copies_from_target(&self) -> bool {
        self.flags.contains(WindowFlags::TARGET)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

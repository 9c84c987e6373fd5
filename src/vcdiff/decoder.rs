// VCDIFF window parsing and reconstruction.
//
// A window is held as its header plus the three raw sections.  Decoding
// walks the instruction section through the default code table; every
// COPY address is resolved through a fresh address cache and read from
// the combined space: copy segment first, then the target window as it
// is being produced.  The copy segment comes from the source image
// (VCD_SOURCE) or from output of earlier windows (VCD_TARGET).

use super::address_cache::AddressCache;
use super::code_table::{InstKind, default_code_table};
use super::header::WindowHeader;
use super::varint;
use crate::checksum;
use crate::cursor::ByteCursor;
use crate::formats::image_len;
use crate::error::{ChecksumStage, PatchError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Window {
    pub header: WindowHeader,
    pub data: Vec<u8>,
    pub inst: Vec<u8>,
    pub addr: Vec<u8>,
}

fn section_len(len: u64) -> Result<usize> {
    usize::try_from(len).map_err(|_| PatchError::record("VCDIFF section length overflows"))
}

impl Window {
    pub fn read(cursor: &mut ByteCursor<'_>) -> Result<Self> {
        let header = WindowHeader::read(cursor)?;
        let data = cursor.read_bytes(section_len(header.data_len)?)?;
        let inst = cursor.read_bytes(section_len(header.inst_len)?)?;
        let addr = cursor.read_bytes(section_len(header.addr_len)?)?;
        Ok(Self {
            header,
            data,
            inst,
            addr,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        self.header.write(out);
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.inst);
        out.extend_from_slice(&self.addr);
    }

    /// Append this window's target bytes to `output`.
    ///
    /// `output` holds everything produced by earlier windows; VCD_TARGET
    /// segments are read from it.
    pub fn decode_into(&self, source: &[u8], output: &mut Vec<u8>, verify: bool) -> Result<()> {
        let h = &self.header;
        let copy_len = section_len(h.copy_len)?;
        let copy_pos = section_len(h.copy_pos)?;
        let target_len = image_len(h.target_len, "VCDIFF window")?;

        let segment_base = output.len();
        let earlier_output: Vec<u8>;
        let segment: &[u8] = if h.copies_from_target() {
            let end = copy_pos
                .checked_add(copy_len)
                .filter(|&end| end <= segment_base)
                .ok_or_else(|| PatchError::record("VCDIFF target segment outside produced output"))?;
            earlier_output = output[copy_pos..end].to_vec();
            &earlier_output
        } else if copy_len > 0 {
            let end = copy_pos
                .checked_add(copy_len)
                .filter(|&end| end <= source.len())
                .ok_or_else(|| PatchError::record("VCDIFF source segment outside the source"))?;
            &source[copy_pos..end]
        } else {
            &[]
        };

        output.reserve(target_len.min(segment.len().saturating_add(self.data.len())));
        let mut state = DecodeState {
            data: &self.data,
            inst: &self.inst,
            addr: &self.addr,
            data_pos: 0,
            inst_pos: 0,
            addr_pos: 0,
            cache: AddressCache::new(),
            segment,
            window_start: segment_base,
            target_len,
        };

        let table = default_code_table();
        while state.inst_pos < state.inst.len() {
            let entry = table[state.inst[state.inst_pos] as usize];
            state.inst_pos += 1;
            for half in [entry.first, entry.second] {
                if half.kind != InstKind::Noop {
                    state.execute(half.kind, half.size, output)?;
                }
            }
        }

        let produced = output.len() - segment_base;
        if produced != target_len {
            return Err(PatchError::record(format!(
                "VCDIFF window produced {produced} bytes, header declares {target_len}"
            )));
        }
        if verify
            && let Some(expected) = h.adler32
            && checksum::adler32(&output[segment_base..]) != expected
        {
            return Err(PatchError::checksum(ChecksumStage::Target));
        }
        Ok(())
    }
}

struct DecodeState<'a> {
    data: &'a [u8],
    inst: &'a [u8],
    addr: &'a [u8],
    data_pos: usize,
    inst_pos: usize,
    addr_pos: usize,
    cache: AddressCache,
    segment: &'a [u8],
    window_start: usize,
    target_len: usize,
}

impl DecodeState<'_> {
    fn execute(&mut self, kind: InstKind, table_size: u8, output: &mut Vec<u8>) -> Result<()> {
        let size = if table_size == 0 {
            let (size, used) = varint::read_usize(&self.inst[self.inst_pos..])?;
            self.inst_pos += used;
            size
        } else {
            usize::from(table_size)
        };

        let here = output.len() - self.window_start;
        if here.checked_add(size).is_none_or(|end| end > self.target_len) {
            return Err(PatchError::record("VCDIFF instruction overruns its window"));
        }

        match kind {
            InstKind::Noop => {}
            InstKind::Add => {
                let end = self.data_pos + size;
                let bytes = self
                    .data
                    .get(self.data_pos..end)
                    .ok_or_else(|| PatchError::record("VCDIFF ADD overruns the data section"))?;
                output.extend_from_slice(bytes);
                self.data_pos = end;
            }
            InstKind::Run => {
                let byte = *self
                    .data
                    .get(self.data_pos)
                    .ok_or_else(|| PatchError::record("VCDIFF RUN overruns the data section"))?;
                self.data_pos += 1;
                output.resize(output.len() + size, byte);
            }
            InstKind::Copy(mode) => {
                let seg_len = self.segment.len();
                let (addr, used) = self.cache.decode(
                    mode,
                    &self.addr[self.addr_pos..],
                    (seg_len + here) as u64,
                )?;
                self.addr_pos += used;
                let addr = addr as usize;

                if addr + size <= seg_len {
                    output.extend_from_slice(&self.segment[addr..addr + size]);
                } else {
                    // Runs into (or starts in) the target window; may overlap
                    // the bytes being written.
                    for i in 0..size {
                        let p = addr + i;
                        let byte = if p < seg_len {
                            self.segment[p]
                        } else {
                            output[self.window_start + p - seg_len]
                        };
                        output.push(byte);
                    }
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcdiff::header::WindowFlags;

    fn window(
        flags: WindowFlags,
        copy: (u64, u64),
        target_len: u64,
        data: &[u8],
        inst: &[u8],
        addr: &[u8],
    ) -> Window {
        Window {
            header: WindowHeader {
                flags,
                copy_len: copy.0,
                copy_pos: copy.1,
                target_len,
                data_len: data.len() as u64,
                inst_len: inst.len() as u64,
                addr_len: addr.len() as u64,
                adler32: None,
            },
            data: data.to_vec(),
            inst: inst.to_vec(),
            addr: addr.to_vec(),
        }
    }

    #[test]
    fn add_run_and_source_copy() {
        // ADD 3 "abc", RUN 4 'z', COPY(size 0 -> 5, mode SELF) from source 2.
        let w = window(
            WindowFlags::SOURCE,
            (8, 0),
            12,
            b"abcz",
            &[4, 0, 4, 19, 5],
            &[2],
        );
        let mut out = Vec::new();
        w.decode_into(b"0123456789", &mut out, true).unwrap();
        assert_eq!(out, b"abczzzz23456");
    }

    #[test]
    fn overlapping_target_copy_repeats_pattern() {
        // ADD 2 "xy", then COPY 6 from HERE - 2 (the bytes just written).
        let w = window(WindowFlags::empty(), (0, 0), 8, b"xy", &[3, 19 + 16 + 3], &[2]);
        let mut out = Vec::new();
        w.decode_into(&[], &mut out, false).unwrap();
        assert_eq!(out, b"xyxyxyxy");
    }

    #[test]
    fn target_segment_reads_earlier_windows() {
        let mut out = b"HELLO".to_vec();
        // COPY 4 bytes, SELF address 1, from a target segment [0, 5).
        let w = window(WindowFlags::TARGET, (5, 0), 4, b"", &[20], &[1]);
        w.decode_into(&[], &mut out, false).unwrap();
        assert_eq!(out, b"HELLOELLO");
    }

    #[test]
    fn declared_length_must_match() {
        let w = window(WindowFlags::empty(), (0, 0), 5, b"ab", &[3], &[]);
        let mut out = Vec::new();
        assert!(matches!(
            w.decode_into(&[], &mut out, false),
            Err(PatchError::InvalidRecord(_))
        ));
    }

    #[test]
    fn adler_mismatch_is_a_target_checksum_error() {
        let mut w = window(WindowFlags::empty(), (0, 0), 2, b"ab", &[3], &[]);
        w.header.adler32 = Some(0);
        let mut out = Vec::new();
        assert!(matches!(
            w.decode_into(&[], &mut out, true),
            Err(PatchError::ChecksumMismatch {
                stage: ChecksumStage::Target
            })
        ));
    }

    #[test]
    fn window_bytes_round_trip() {
        let w = window(WindowFlags::SOURCE, (8, 0), 12, b"abcz", &[4, 0, 4, 19, 5], &[2]);
        let mut bytes = Vec::new();
        w.write(&mut bytes);
        let mut c = ByteCursor::new(&bytes);
        assert_eq!(Window::read(&mut c).unwrap(), w);
    }
}

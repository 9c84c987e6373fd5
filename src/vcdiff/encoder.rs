// VCDIFF window encoding.
//
// `WindowEncoder` collects ADD/RUN/COPY instructions for one target window
// and lays out the data, instruction and address sections.  Each
// instruction gets its own opcode; sizes the default table cannot express
// inline follow the opcode in the instruction section.

use super::address_cache::AddressCache;
use super::code_table::{InstKind, single_opcode};
use super::decoder::Window;
use super::header::{WindowFlags, WindowHeader};
use super::varint;
use crate::checksum;

pub struct WindowEncoder {
    data: Vec<u8>,
    inst: Vec<u8>,
    addr: Vec<u8>,
    cache: AddressCache,
    /// Length of the copy segment, the base of target addresses.
    segment_len: u64,
    target_len: u64,
}

impl WindowEncoder {
    pub fn new(segment_len: u64) -> Self {
        Self {
            data: Vec::new(),
            inst: Vec::new(),
            addr: Vec::new(),
            cache: AddressCache::new(),
            segment_len,
            target_len: 0,
        }
    }

    #[inline]
    fn here(&self) -> u64 {
        self.segment_len + self.target_len
    }

    fn opcode(&mut self, kind: InstKind, size: usize) {
        let (code, explicit) = single_opcode(kind, size);
        self.inst.push(code);
        if explicit {
            varint::write(&mut self.inst, size as u64);
        }
    }

    pub fn add(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.opcode(InstKind::Add, bytes.len());
        self.data.extend_from_slice(bytes);
        self.target_len += bytes.len() as u64;
    }

    pub fn run(&mut self, byte: u8, len: usize) {
        if len == 0 {
            return;
        }
        self.opcode(InstKind::Run, len);
        self.data.push(byte);
        self.target_len += len as u64;
    }

    /// COPY `len` bytes from `addr` in the combined segment + target space.
    pub fn copy(&mut self, addr: u64, len: usize) {
        if len == 0 {
            return;
        }
        let (mode, encoded) = self.cache.encode(addr, self.here());
        self.opcode(InstKind::Copy(mode), len);
        encoded.write_to(&mut self.addr);
        self.target_len += len as u64;
    }

    /// Close the window.  `copy_pos` locates the segment in the source and
    /// `target` is the window's expected output, used for the Adler-32.
    pub fn finish(self, copy_pos: u64, target: &[u8]) -> Window {
        let flags = if self.segment_len > 0 {
            WindowFlags::SOURCE
        } else {
            WindowFlags::empty()
        };
        Window {
            header: WindowHeader {
                flags,
                copy_len: self.segment_len,
                copy_pos: if self.segment_len > 0 { copy_pos } else { 0 },
                target_len: self.target_len,
                data_len: self.data.len() as u64,
                inst_len: self.inst.len() as u64,
                addr_len: self.addr.len() as u64,
                adler32: Some(checksum::adler32(target)),
            },
            data: self.data,
            inst: self.inst,
            addr: self.addr,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

// VCDIFF default instruction code table (RFC 3284, Section 5.6).
//
// Each of the 256 opcodes names one or two instructions, each with a kind
// and a size (0 meaning "size follows in the instruction section").  The
// table is generated once from the RFC's descriptor and shared.

use std::sync::LazyLock;

/// Shortest COPY the default table gives an implicit size to.
pub const MIN_MATCH: u8 = 4;

const ADD_SIZES: u8 = 17;
const COPY_SIZES: u8 = 15;
const NEAR_MODES: u8 = 4;
const SAME_MODES: u8 = 3;
pub const COPY_MODES: u8 = 2 + NEAR_MODES + SAME_MODES;

/// Instruction kind in a code table slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InstKind {
    #[default]
    Noop,
    Add,
    Run,
    /// COPY with an address mode in `0..COPY_MODES`.
    Copy(u8),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Half {
    pub kind: InstKind,
    pub size: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeTableEntry {
    pub first: Half,
    pub second: Half,
}

pub type CodeTable = [CodeTableEntry; 256];

static DEFAULT: LazyLock<CodeTable> = LazyLock::new(build_default);

pub fn default_code_table() -> &'static CodeTable {
    &DEFAULT
}

fn single(kind: InstKind, size: u8) -> CodeTableEntry {
    CodeTableEntry {
        first: Half { kind, size },
        second: Half::default(),
    }
}

fn pair(k1: InstKind, s1: u8, k2: InstKind, s2: u8) -> CodeTableEntry {
    CodeTableEntry {
        first: Half { kind: k1, size: s1 },
        second: Half { kind: k2, size: s2 },
    }
}

fn build_default() -> CodeTable {
    let mut entries = Vec::with_capacity(256);

    entries.push(single(InstKind::Run, 0));
    entries.push(single(InstKind::Add, 0));
    entries.extend((1..=ADD_SIZES).map(|s| single(InstKind::Add, s)));

    for mode in 0..COPY_MODES {
        entries.push(single(InstKind::Copy(mode), 0));
        entries.extend((MIN_MATCH..MIN_MATCH + COPY_SIZES).map(|s| single(InstKind::Copy(mode), s)));
    }

    // ADD(1..4) + COPY: near modes pair with copies of 4..6, same modes with 4.
    for mode in 0..COPY_MODES {
        let copy_max = if mode < 2 + NEAR_MODES { 6 } else { 4 };
        for add in 1..=4 {
            for copy in MIN_MATCH..=copy_max {
                entries.push(pair(InstKind::Add, add, InstKind::Copy(mode), copy));
            }
        }
    }

    // COPY(4) + ADD(1) for every mode.
    for mode in 0..COPY_MODES {
        entries.push(pair(InstKind::Copy(mode), MIN_MATCH, InstKind::Add, 1));
    }

    let mut table = [CodeTableEntry::default(); 256];
    table.copy_from_slice(&entries);
    table
}

// ---------------------------------------------------------------------------
// Encoder side: single-instruction opcodes
// ---------------------------------------------------------------------------

/// Opcode for a lone instruction, and whether its size must be written
/// to the instruction section.
pub fn single_opcode(kind: InstKind, size: usize) -> (u8, bool) {
    match kind {
        InstKind::Noop | InstKind::Run => (0, true),
        InstKind::Add => {
            if (1..=ADD_SIZES as usize).contains(&size) {
                (1 + size as u8, false)
            } else {
                (1, true)
            }
        }
        InstKind::Copy(mode) => {
            let base = 19 + 16 * mode;
            let min = MIN_MATCH as usize;
            if (min..min + COPY_SIZES as usize).contains(&size) {
                (base + (size - min) as u8 + 1, false)
            } else {
                (base, true)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

// Hash chains keyed by 16-bit symbols.
//
// A symbol is the byte at a position plus (when present) the next byte
// shifted up by eight.  `heads[symbol]` holds the most recently inserted
// position and `next[pos]` links each position to the one inserted before
// it, so walking a chain visits positions newest first.
//
// Positions are stored with HASH_CKOFFSET added so that 0 means "empty".
// Both arrays are allocated once up front; nothing is allocated per node.

pub const HASH_CKOFFSET: u32 = 1;
const SYMBOLS: usize = 1 << 16;

/// The 16-bit symbol starting at `pos`.
#[inline(always)]
pub fn symbol(data: &[u8], pos: usize) -> u16 {
    let lo = u16::from(data[pos]);
    match data.get(pos + 1) {
        Some(&hi) => lo | (u16::from(hi) << 8),
        None => lo,
    }
}

pub struct HashChains {
    heads: Vec<u32>,
    next: Vec<u32>,
}

impl HashChains {
    /// Chains able to hold positions `0..positions`.
    pub fn new(positions: usize) -> Self {
        Self {
            heads: vec![0; SYMBOLS],
            next: vec![0; positions],
        }
    }

    /// Chains holding every position of `data`, inserted in ascending order.
    pub fn index(data: &[u8]) -> Self {
        let mut chains = Self::new(data.len());
        for pos in 0..data.len() {
            chains.insert(symbol(data, pos), pos);
        }
        chains
    }

    /// Make `pos` the head of the chain for `sym`.
    ///
    /// Positions that do not fit the arena are ignored.
    #[inline]
    pub fn insert(&mut self, sym: u16, pos: usize) {
        let Some(stored) = u32::try_from(pos)
            .ok()
            .and_then(|p| p.checked_add(HASH_CKOFFSET))
        else {
            return;
        };
        let Some(link) = self.next.get_mut(pos) else {
            return;
        };
        *link = self.heads[sym as usize];
        self.heads[sym as usize] = stored;
    }

    /// Positions inserted under `sym`, newest first.
    pub fn candidates(&self, sym: u16) -> Chain<'_> {
        Chain {
            next: &self.next,
            cursor: self.heads[sym as usize],
        }
    }

    /// Forget every position while keeping the allocation.
    pub fn reset(&mut self) {
        self.heads.fill(0);
        self.next.fill(0);
    }
}

pub struct Chain<'a> {
    next: &'a [u32],
    cursor: u32,
}

impl Iterator for Chain<'_> {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        if self.cursor == 0 {
            return None;
        }
        let pos = (self.cursor - HASH_CKOFFSET) as usize;
        self.cursor = self.next[pos];
        Some(pos)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

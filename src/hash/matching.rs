// Longest-match search over hash chains.
//
// `MatchFinder` indexes a source image once and keeps a second set of
// chains for the target, filled in as the caller advances.  Each lookup
// walks a chain newest first and keeps the first candidate that is
// strictly longer than the best so far, so results depend only on the
// insertion order.
//
// The greedy scan at the bottom turns a target window into ADD/RUN/COPY
// operations for the VCDIFF builder.  BPS drives the finder itself because
// it also needs positional source reads.

use super::table::{HashChains, symbol};

/// Shortest copy worth emitting.
pub const MIN_MATCH: usize = 4;

/// Shortest run turned into a RUN instead of literals.
pub const MIN_RUN: usize = 8;

/// Default bound on the candidates visited per lookup.
pub const DEFAULT_MAX_CHAIN: usize = 1 << 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Source,
    Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub kind: MatchKind,
    /// Offset of the match in the source, or in the target.
    pub addr: usize,
    pub length: usize,
}

/// Length of the common prefix of `a` and `b`.
#[inline]
pub fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Number of bytes from `pos` equal to `data[pos]`.
#[inline]
pub fn run_length(data: &[u8], pos: usize) -> usize {
    match data.get(pos) {
        Some(&b) => data[pos..].iter().take_while(|&&x| x == b).count(),
        None => 0,
    }
}

// ---------------------------------------------------------------------------
// Match finder
// ---------------------------------------------------------------------------

pub struct MatchFinder<'a> {
    source: &'a [u8],
    source_chains: HashChains,
    target_chains: HashChains,
    max_chain: usize,
}

impl<'a> MatchFinder<'a> {
    /// Index `source`; the target chains can hold `target_capacity` positions.
    pub fn new(source: &'a [u8], target_capacity: usize, max_chain: usize) -> Self {
        Self {
            source,
            source_chains: HashChains::index(source),
            target_chains: HashChains::new(target_capacity),
            max_chain: max_chain.max(1),
        }
    }

    /// Start over with an empty target, keeping the source index.
    pub fn reset_target(&mut self) {
        self.target_chains.reset();
    }

    /// Longest source match for `target[pos..]`.
    pub fn source_match(&self, target: &[u8], pos: usize) -> Option<Match> {
        let sym = symbol(target, pos);
        let mut best: Option<Match> = None;
        for addr in self.source_chains.candidates(sym).take(self.max_chain) {
            let length = common_prefix(&self.source[addr..], &target[pos..]);
            if best.is_none_or(|b| length > b.length) {
                best = Some(Match {
                    kind: MatchKind::Source,
                    addr,
                    length,
                });
                if pos + length == target.len() {
                    break;
                }
            }
        }
        best
    }

    /// Longest match for `target[pos..]` starting earlier in the target.
    ///
    /// Only positions previously passed to `insert_target` are candidates.
    /// Matches may overlap `pos`.
    pub fn target_match(&self, target: &[u8], pos: usize) -> Option<Match> {
        let sym = symbol(target, pos);
        let mut best: Option<Match> = None;
        for addr in self.target_chains.candidates(sym).take(self.max_chain) {
            let length = common_prefix(&target[addr..], &target[pos..]);
            if best.is_none_or(|b| length > b.length) {
                best = Some(Match {
                    kind: MatchKind::Target,
                    addr,
                    length,
                });
                if pos + length == target.len() {
                    break;
                }
            }
        }
        best
    }

    #[inline]
    pub fn insert_target(&mut self, target: &[u8], pos: usize) {
        self.target_chains.insert(symbol(target, pos), pos);
    }
}

// ---------------------------------------------------------------------------
// Greedy operation stream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Literal bytes `target[start..start + len]`.
    Add { start: usize, len: usize },
    Run { byte: u8, len: usize },
    Copy(Match),
}

/// Cover `target` with operations, preferring runs, then the longer of
/// the source and target matches, then literals.
pub fn greedy_ops(finder: &mut MatchFinder<'_>, target: &[u8]) -> Vec<Op> {
    let mut ops = Vec::new();
    let mut pending = 0usize;
    let mut pos = 0usize;

    let flush = |ops: &mut Vec<Op>, pending: &mut usize, pos: usize| {
        if *pending > 0 {
            ops.push(Op::Add {
                start: pos - *pending,
                len: *pending,
            });
            *pending = 0;
        }
    };

    while pos < target.len() {
        let run = run_length(target, pos);
        if run >= MIN_RUN {
            flush(&mut ops, &mut pending, pos);
            ops.push(Op::Run {
                byte: target[pos],
                len: run,
            });
            for p in pos..pos + run {
                finder.insert_target(target, p);
            }
            pos += run;
            continue;
        }

        let from_source = finder.source_match(target, pos);
        let from_target = finder.target_match(target, pos);
        let best = match (from_source, from_target) {
            (Some(s), Some(t)) => Some(if t.length > s.length { t } else { s }),
            (s, t) => s.or(t),
        };

        match best {
            Some(m) if m.length >= MIN_MATCH => {
                flush(&mut ops, &mut pending, pos);
                ops.push(Op::Copy(m));
                for p in pos..pos + m.length {
                    finder.insert_target(target, p);
                }
                pos += m.length;
            }
            _ => {
                finder.insert_target(target, pos);
                pending += 1;
                pos += 1;
            }
        }
    }
    flush(&mut ops, &mut pending, pos);
    ops
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn replay(source: &[u8], target: &[u8], ops: &[Op]) -> Vec<u8> {
        let mut out: Vec<u8> = Vec::new();
        for op in ops {
            match *op {
                Op::Add { start, len } => out.extend_from_slice(&target[start..start + len]),
                Op::Run { byte, len } => out.extend(std::iter::repeat_n(byte, len)),
                Op::Copy(m) => {
                    for i in 0..m.length {
                        let b = match m.kind {
                            MatchKind::Source => source[m.addr + i],
                            MatchKind::Target => out[m.addr + i],
                        };
                        out.push(b);
                    }
                }
            }
        }
        out
    }

    #[test]
    fn prefix_and_run_helpers() {
        assert_eq!(common_prefix(b"abcdef", b"abcxyz"), 3);
        assert_eq!(common_prefix(b"", b"abc"), 0);
        assert_eq!(run_length(b"aaab", 0), 3);
        assert_eq!(run_length(b"aaab", 4), 0);
    }

    #[test]
    fn finds_longest_source_match() {
        let source = b"the quick brown fox, the quick red fox";
        let finder = MatchFinder::new(source, 64, DEFAULT_MAX_CHAIN);
        let m = finder.source_match(b"the quick red", 0).unwrap();
        assert_eq!(m.kind, MatchKind::Source);
        assert_eq!(m.addr, 21);
        assert_eq!(m.length, 13);
    }

    #[test]
    fn target_matches_only_see_inserted_positions() {
        let target = b"abcdabcd";
        let mut finder = MatchFinder::new(b"", target.len(), DEFAULT_MAX_CHAIN);
        assert!(finder.target_match(target, 4).is_none());
        for p in 0..4 {
            finder.insert_target(target, p);
        }
        let m = finder.target_match(target, 4).unwrap();
        assert_eq!((m.addr, m.length), (0, 4));
    }

    #[test]
    fn greedy_ops_reproduce_target() {
        let source: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 251) as u8).collect();
        let mut target = source[100..1200].to_vec();
        target.extend_from_slice(&[0x55; 40]);
        target.extend_from_slice(b"fresh literal bytes");
        target.extend_from_slice(&source[2000..2600]);
        let head = target[..300].to_vec();
        target.extend_from_slice(&head);

        let mut finder = MatchFinder::new(&source, target.len(), DEFAULT_MAX_CHAIN);
        let ops = greedy_ops(&mut finder, &target);
        assert_eq!(replay(&source, &target, &ops), target);
        assert!(ops.iter().any(|op| matches!(op, Op::Run { byte: 0x55, .. })));
        assert!(ops.len() < 20, "expected a compact op stream, got {}", ops.len());
    }
}

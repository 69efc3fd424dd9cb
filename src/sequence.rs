//! Canonical round pattern and round-size sequence.
//!
//! Every message on the wire is the pattern `0, 1, ..., n - 1` encoded as
//! `u32` words. Neither side sends a length: both derive `n` for the k-th
//! transfer from the same deterministic sequence, so the functions here must
//! stay pure.

use std::fmt;

/// Default largest round, in words.
pub const DEFAULT_MAX_ROUND: usize = 1024;

/// Upper bound accepted for a configured `max_round`.
pub const MAX_ROUND_LIMIT: usize = 1 << 24;

/// Size of the first round on a fresh connection.
pub const FIRST_ROUND: usize = 1;

/// A word that does not match the canonical pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    /// Position in the round.
    pub index: usize,
    /// Value the pattern requires at `index`.
    pub expected: u32,
    /// Value actually received.
    pub actual: u32,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf[{}] == {} != {}", self.index, self.actual, self.expected)
    }
}

/// Fill `buf[..n]` with the canonical pattern.
///
/// # Panics
/// Panics if `buf` is shorter than `n`.
pub fn generate(n: usize, buf: &mut [u32]) {
    for (i, word) in buf[..n].iter_mut().enumerate() {
        *word = i as u32;
    }
}

/// Check `buf[..n]` against the canonical pattern.
///
/// Returns the first mismatching word on failure.
///
/// # Panics
/// Panics if `buf` is shorter than `n`.
pub fn validate(n: usize, buf: &[u32]) -> Result<(), Mismatch> {
    match mismatches(n, buf).next() {
        Some(mismatch) => Err(mismatch),
        None => Ok(()),
    }
}

/// Every word in `buf[..n]` that breaks the pattern, in index order.
pub fn mismatches(n: usize, buf: &[u32]) -> impl Iterator<Item = Mismatch> + '_ {
    buf[..n]
        .iter()
        .enumerate()
        .filter(|&(i, &word)| word != i as u32)
        .map(|(index, &actual)| Mismatch {
            index,
            expected: index as u32,
            actual,
        })
}

/// Round size that follows `n`.
///
/// Cycles `1, 2, ..., max_round, 1, ...` and never yields 0. Input outside
/// `1..=max_round` is folded back into range.
pub fn next_round(n: usize, max_round: usize) -> usize {
    debug_assert!(max_round > 0, "max_round must be positive");
    n % max_round.max(1) + 1
}

/// Round-size state for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundSequence {
    current: usize,
    max_round: usize,
}

impl RoundSequence {
    /// Start a sequence at the first round.
    pub fn new(max_round: usize) -> Self {
        Self {
            current: FIRST_ROUND,
            max_round,
        }
    }

    /// Size of the round in progress, in words.
    pub fn current(&self) -> usize {
        self.current
    }

    /// Size of the round in progress, in bytes.
    pub fn current_bytes(&self) -> usize {
        self.current * std::mem::size_of::<u32>()
    }

    /// Move to the next round and return its size.
    pub fn advance(&mut self) -> usize {
        self.current = next_round(self.current, self.max_round);
        self.current
    }
}

//! Per-connection round buffer.
//!
//! Holds up to `max_round` `u32` words. The sequence code works on words
//! while the socket code works on bytes, so the buffer hands out both views
//! of the same storage. Bytes are in host order, which is the wire order.

use std::collections::TryReserveError;

/// Fixed-capacity word buffer owned by one Connection Context.
#[derive(Debug)]
pub struct RoundBuffer {
    words: Vec<u32>,
}

impl RoundBuffer {
    /// Allocate a zeroed buffer for rounds of up to `max_round` words.
    ///
    /// Allocation failure is reported instead of aborting, so the acceptor
    /// can drop a single connection and carry on.
    pub fn try_new(max_round: usize) -> Result<Self, TryReserveError> {
        let mut words = Vec::new();
        words.try_reserve_exact(max_round)?;
        words.resize(max_round, 0);
        Ok(Self { words })
    }

    /// The first `n` words.
    ///
    /// # Panics
    /// Panics if `n` exceeds the capacity.
    pub fn words(&self, n: usize) -> &[u32] {
        &self.words[..n]
    }

    /// The first `n` words, mutably.
    pub fn words_mut(&mut self, n: usize) -> &mut [u32] {
        &mut self.words[..n]
    }

    /// Byte view of the first `n` words.
    pub fn bytes(&self, n: usize) -> &[u8] {
        bytemuck::cast_slice(self.words(n))
    }

    /// Mutable byte view of the first `n` words.
    pub fn bytes_mut(&mut self, n: usize) -> &mut [u8] {
        bytemuck::cast_slice_mut(self.words_mut(n))
    }

    /// Zero the first `n` words so stale data from an earlier round can
    /// never pass validation.
    pub fn clear(&mut self, n: usize) {
        self.words_mut(n).fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_is_zeroed() {
        let buf = RoundBuffer::try_new(8).unwrap();
        assert_eq!(buf.words(8).len(), 8);
        assert!(buf.words(8).iter().all(|&w| w == 0));
    }

    #[test]
    fn test_byte_view_is_host_order() {
        let mut buf = RoundBuffer::try_new(4).unwrap();
        buf.words_mut(2).copy_from_slice(&[1, 0x0102_0304]);

        let mut expected = Vec::new();
        expected.extend_from_slice(&1u32.to_ne_bytes());
        expected.extend_from_slice(&0x0102_0304u32.to_ne_bytes());
        assert_eq!(buf.bytes(2), &expected[..]);
        assert_eq!(buf.bytes(4).len(), 16);
    }

    #[test]
    fn test_bytes_mut_writes_through() {
        let mut buf = RoundBuffer::try_new(2).unwrap();
        buf.bytes_mut(2)[4..8].copy_from_slice(&7u32.to_ne_bytes());
        assert_eq!(buf.words(2), &[0, 7]);

        buf.clear(2);
        assert_eq!(buf.words(2), &[0, 0]);
    }

    #[test]
    fn test_absurd_capacity_fails_cleanly() {
        assert!(RoundBuffer::try_new(usize::MAX).is_err());
    }
}

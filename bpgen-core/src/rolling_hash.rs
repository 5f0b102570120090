//! Cyclic polynomial rolling hash over a fixed-size byte window.
//!
//! Each byte contributes a 64-bit table value rotated left by its distance
//! from the newest byte in the window. Sliding the window one byte is then a
//! rotate, one XOR to remove the evicted byte's (fully rotated) contribution
//! and one XOR to admit the new byte, independent of the window size.

/// ECMA-182 polynomial, as used by CRC-64.
const HASH_POLY64: u64 = 0xC96C_5795_D787_0F42;

const fn build_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut idx = 0;
    while idx < 256 {
        let mut val = idx as u64;
        let mut shift = 0;
        while shift < 8 {
            if val & 1 == 1 {
                val = (val >> 1) ^ HASH_POLY64;
            } else {
                val >>= 1;
            }
            shift += 1;
        }
        table[idx] = val;
        idx += 1;
    }
    table
}

/// Per-byte table, evaluated at compile time.
pub static HASH_TABLE: [u64; 256] = build_table();

/// Rolling hash state plus the ring of bytes currently inside the window.
pub struct RollingHash {
    window_size: usize,
    evict_rot: u32,
    ring: Vec<u8>,
    start: usize,
    len: usize,
    hash: u64,
}

impl RollingHash {
    /// # Panics
    ///
    /// Panics if `window_size` is zero.
    pub fn new(window_size: usize) -> Self {
        assert!(window_size > 0, "rolling hash window must not be empty");
        Self {
            window_size,
            evict_rot: (window_size % 64) as u32,
            ring: vec![0u8; window_size],
            start: 0,
            len: 0,
            hash: 0,
        }
    }

    /// Hash of a complete data set, equal to the window hash after
    /// consuming `data` byte by byte.
    pub fn hash_of(data: &[u8]) -> u64 {
        data.iter()
            .fold(0u64, |h, &b| h.rotate_left(1) ^ HASH_TABLE[b as usize])
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.window_size
    }

    /// Bytes still needed before the window is primed.
    pub fn needed(&self) -> usize {
        self.window_size - self.len
    }

    /// Admit a byte while priming. Nothing is evicted.
    pub fn consume(&mut self, byte: u8) {
        debug_assert!(!self.is_full(), "consume on a full window");
        let at = (self.start + self.len) % self.window_size;
        self.ring[at] = byte;
        self.len += 1;
        self.hash = self.hash.rotate_left(1) ^ HASH_TABLE[byte as usize];
    }

    /// Evict the oldest byte and admit `byte`. The window must be full.
    pub fn roll_forward(&mut self, byte: u8) {
        debug_assert!(self.is_full(), "roll_forward before the window is primed");
        let old = self.ring[self.start];
        self.ring[self.start] = byte;
        self.start = (self.start + 1) % self.window_size;
        self.hash = self.hash.rotate_left(1)
            ^ HASH_TABLE[old as usize].rotate_left(self.evict_rot)
            ^ HASH_TABLE[byte as usize];
    }

    /// Oldest byte in the window, the next one to be evicted.
    pub fn oldest(&self) -> u8 {
        self.ring[self.start]
    }

    pub fn window_hash(&self) -> u64 {
        self.hash
    }

    /// The window contents in stream order, as two slices of the ring.
    pub fn window_bytes(&self) -> (&[u8], &[u8]) {
        let end = self.start + self.len;
        if end <= self.window_size {
            (&self.ring[self.start..end], &[])
        } else {
            (&self.ring[self.start..], &self.ring[..end - self.window_size])
        }
    }

    /// Replace `out` with a contiguous copy of the window.
    pub fn copy_window_into(&self, out: &mut Vec<u8>) {
        let (a, b) = self.window_bytes();
        out.clear();
        out.extend_from_slice(a);
        out.extend_from_slice(b);
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.len = 0;
        self.hash = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priming_matches_full_hash() {
        let data: Vec<u8> = (0..100u32).map(|i| (i * 7 + 3) as u8).collect();
        let mut rh = RollingHash::new(100);
        for &b in &data {
            rh.consume(b);
        }
        assert!(rh.is_full());
        assert_eq!(rh.window_hash(), RollingHash::hash_of(&data));
    }

    #[test]
    fn window_bytes_follow_stream_order_across_wrap() {
        let mut rh = RollingHash::new(4);
        for b in [1u8, 2, 3, 4] {
            rh.consume(b);
        }
        rh.roll_forward(5);
        rh.roll_forward(6);
        let mut out = Vec::new();
        rh.copy_window_into(&mut out);
        assert_eq!(out, vec![3, 4, 5, 6]);
        assert_eq!(rh.oldest(), 3);
        assert_eq!(rh.window_hash(), RollingHash::hash_of(&out));
    }

    #[test]
    fn clear_resets_to_priming() {
        let mut rh = RollingHash::new(3);
        for b in [9u8, 8, 7] {
            rh.consume(b);
        }
        rh.clear();
        assert!(rh.is_empty());
        assert_eq!(rh.needed(), 3);
        assert_eq!(rh.window_hash(), 0);
    }
}

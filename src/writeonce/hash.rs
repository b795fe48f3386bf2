//! Key hashing and slot probing for the trailing hash index.
//!
//! Version differences are concentrated here: major version 2 introduced the
//! 64-bit mixing hash, and major version 3 replaced Fibonacci double-stepping
//! with linear probing and fixed the slot width at eight bytes.

use xxhash_rust::xxh3::xxh3_64;

const LEGACY_SEED: u64 = 0x2257d6803a6f1b2;

/// The polynomial hash used by files older than major version 2.
pub fn legacy_hash(key: &[u8]) -> u64 {
    key.iter()
        .fold(LEGACY_SEED, |h, &b| h.wrapping_mul(31).wrapping_add(u64::from(b)))
}

/// Hashes a key according to the file's major version.
pub fn key_hash(major_version: u8, key: &[u8]) -> u64 {
    if major_version < 2 {
        legacy_hash(key)
    } else {
        xxh3_64(key)
    }
}

/// Storage width of one hash slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotWidth {
    U16,
    U32,
    U64,
}

impl SlotWidth {
    /// The slot width of a file: fixed at eight bytes from major version 3,
    /// otherwise the narrowest width that can represent `index_offset`.
    pub fn for_file(major_version: u8, index_offset: u64) -> Self {
        if major_version >= 3 {
            SlotWidth::U64
        } else if index_offset <= 0xffff {
            SlotWidth::U16
        } else if index_offset <= 0xffff_ffff {
            SlotWidth::U32
        } else {
            SlotWidth::U64
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            SlotWidth::U16 => 2,
            SlotWidth::U32 => 4,
            SlotWidth::U64 => 8,
        }
    }
}

/// Walks the probe sequence for one lookup.
pub struct Probe {
    slot: u64,
    index_size: u64,
    linear: bool,
    fib: [u64; 2],
    collisions: u64,
}

impl Probe {
    pub fn new(major_version: u8, hash: u64, index_size: u64) -> Self {
        Self {
            slot: hash % index_size,
            index_size,
            linear: major_version >= 3,
            fib: [2, 1],
            collisions: 0,
        }
    }

    pub fn slot(&self) -> u64 {
        self.slot
    }

    pub fn advance(&mut self) {
        if self.linear {
            self.slot += 1;
            if self.slot == self.index_size {
                self.slot = 0;
            }
        } else {
            self.collisions += 1;
            let i = (self.collisions & 1) as usize;
            self.slot = self.slot.wrapping_add(self.fib[i]) % self.index_size;
            self.fib[i] = self.fib[i].wrapping_add(self.fib[1 - i]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_hash() {
        assert_eq!(legacy_hash(b""), LEGACY_SEED);
        assert_eq!(
            legacy_hash(b"a"),
            LEGACY_SEED.wrapping_mul(31).wrapping_add(b'a' as u64)
        );
        // Byte-wise: casing matters.
        assert_ne!(legacy_hash(b"key"), legacy_hash(b"KEY"));
    }

    #[test]
    fn test_hash_dispatch() {
        assert_eq!(key_hash(1, b"k"), legacy_hash(b"k"));
        assert_eq!(key_hash(2, b"k"), xxh3_64(b"k"));
        assert_eq!(key_hash(4, b"k"), xxh3_64(b"k"));
    }

    #[test]
    fn test_slot_width() {
        assert_eq!(SlotWidth::for_file(2, 0xffff), SlotWidth::U16);
        assert_eq!(SlotWidth::for_file(2, 0x10000), SlotWidth::U32);
        assert_eq!(SlotWidth::for_file(2, 0x1_0000_0000), SlotWidth::U64);
        // From major 3 the width no longer depends on the offset.
        assert_eq!(SlotWidth::for_file(3, 100), SlotWidth::U64);
        assert_eq!(SlotWidth::for_file(4, 100), SlotWidth::U64);
    }

    #[test]
    fn test_linear_probe_wraps() {
        let mut probe = Probe::new(4, 8, 10);
        assert_eq!(probe.slot(), 8);
        probe.advance();
        assert_eq!(probe.slot(), 9);
        probe.advance();
        assert_eq!(probe.slot(), 0);
    }

    #[test]
    fn test_fibonacci_probe_steps() {
        // Successive steps advance by the Fibonacci sequence 1, 2, 3, 5, 8.
        let size = 1 << 20;
        let mut probe = Probe::new(2, 0, size);
        let mut prev = probe.slot();
        let mut deltas = Vec::new();
        for _ in 0..5 {
            probe.advance();
            deltas.push((probe.slot() + size - prev) % size);
            prev = probe.slot();
        }
        assert_eq!(deltas, vec![1, 2, 3, 5, 8]);
    }
}

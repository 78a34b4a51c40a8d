//! In-process bloom filter guarding the cache's negative lookup path.
//!
//! A `contains` miss proves the number was never written, so the cache can
//! answer not-found without a store round trip. No false negatives; the
//! false-positive rate is tuned by sizing (defaults target ~1% at ~100K
//! entries).

use std::hash::{Hash, Hasher};
use std::sync::RwLock;

/// Default bit-array size: 1,000,000 bits.
pub const DEFAULT_SIZE_BITS: usize = 1_000_000;

/// Default number of hash functions.
pub const DEFAULT_HASHES: u32 = 7;

struct BloomState {
    bits: Vec<u64>,
    set_bits: usize,
}

/// Fixed-size bloom filter, thread-safe via one RW lock.
pub struct BloomFilter {
    state: RwLock<BloomState>,
    size: usize,
    hashes: u32,
}

impl BloomFilter {
    pub fn new(size_bits: usize, hashes: u32) -> Self {
        assert!(size_bits > 0 && hashes > 0);
        let words = size_bits.div_ceil(64);
        Self {
            state: RwLock::new(BloomState {
                bits: vec![0u64; words],
                set_bits: 0,
            }),
            size: size_bits,
            hashes,
        }
    }

    /// Derive the k probe positions by double hashing.
    fn positions(&self, item: &str) -> Vec<usize> {
        let mut h1 = std::collections::hash_map::DefaultHasher::new();
        item.hash(&mut h1);
        let h1 = h1.finish();

        let mut h2 = std::collections::hash_map::DefaultHasher::new();
        // Seed the second hash differently so h2 is independent of h1.
        0x9e3779b97f4a7c15u64.hash(&mut h2);
        item.hash(&mut h2);
        let h2 = h2.finish() | 1;

        (0..self.hashes as u64)
            .map(|i| (h1.wrapping_add(i.wrapping_mul(h2)) % self.size as u64) as usize)
            .collect()
    }

    pub fn add(&self, item: &str) {
        let positions = self.positions(item);
        let mut state = self.state.write().unwrap();
        for pos in positions {
            let word = pos / 64;
            let mask = 1u64 << (pos % 64);
            if state.bits[word] & mask == 0 {
                state.bits[word] |= mask;
                state.set_bits += 1;
            }
        }
    }

    /// False iff any probe bit is clear — guaranteed no false negatives.
    pub fn contains(&self, item: &str) -> bool {
        let positions = self.positions(item);
        let state = self.state.read().unwrap();
        positions.iter().all(|&pos| {
            let word = pos / 64;
            let mask = 1u64 << (pos % 64);
            state.bits[word] & mask != 0
        })
    }

    /// Clear every bit. Subsequent writes rebuild the filter lazily.
    pub fn reset(&self) {
        let mut state = self.state.write().unwrap();
        state.bits.iter_mut().for_each(|w| *w = 0);
        state.set_bits = 0;
    }

    /// Estimate the number of distinct items added:
    /// `-m/k · ln(1 - set_bits/m)`, saturating to `size` as the array fills.
    pub fn estimated_item_count(&self) -> usize {
        let set_bits = self.state.read().unwrap().set_bits;
        let m = self.size as f64;
        let k = self.hashes as f64;
        let ratio = set_bits as f64 / m;
        if ratio >= 1.0 {
            return self.size;
        }
        (-(m / k) * (1.0 - ratio).ln()).round() as usize
    }

    pub fn size_bits(&self) -> usize {
        self.size
    }
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new(DEFAULT_SIZE_BITS, DEFAULT_HASHES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let bloom = BloomFilter::new(10_000, 7);
        let numbers: Vec<String> = (0..500).map(|i| format!("+1415555{i:04}")).collect();
        for n in &numbers {
            bloom.add(n);
        }
        for n in &numbers {
            assert!(bloom.contains(n), "false negative for {n}");
        }
    }

    #[test]
    fn test_unknown_items_mostly_rejected() {
        let bloom = BloomFilter::default();
        for i in 0..1000 {
            bloom.add(&format!("+1415555{i:04}"));
        }
        let false_positives = (0..1000)
            .filter(|i| bloom.contains(&format!("+1206555{i:04}")))
            .count();
        // At this load the filter is nearly empty; anything over a handful
        // of false positives indicates broken hashing.
        assert!(false_positives < 20, "{false_positives} false positives");
    }

    #[test]
    fn test_reset_clears_membership() {
        let bloom = BloomFilter::new(10_000, 7);
        bloom.add("+14155551234");
        assert!(bloom.contains("+14155551234"));
        bloom.reset();
        assert!(!bloom.contains("+14155551234"));
        assert_eq!(bloom.estimated_item_count(), 0);
    }

    #[test]
    fn test_estimated_count_tracks_inserts() {
        let bloom = BloomFilter::new(100_000, 7);
        for i in 0..1000 {
            bloom.add(&format!("+1415555{i:04}"));
        }
        let estimate = bloom.estimated_item_count();
        assert!((800..1200).contains(&estimate), "estimate {estimate}");
    }
}

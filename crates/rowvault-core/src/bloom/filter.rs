//! # Bloom Filter
//!
//! Fixed-size bit array addressed by `k` derived hash positions.
//!
//! Positions come from one BLAKE3 digest per token, split into two 64-bit
//! halves and combined as `h1 + i * h2` (Kirsch-Mitzenmacher), so inserting
//! or probing a token costs a single hash.
//!
//! Sizing for `n` expected items at false-positive rate `p`:
//! - bits `m = ceil(-n ln p / (ln 2)^2)`
//! - hashes `k = round(m / n * ln 2)`, clamped to `[1, MAX_HASHES]`

use crate::VaultError;
use serde::{Deserialize, Serialize};

/// Upper bound on hash functions per filter.
const MAX_HASHES: u32 = 16;

/// Smallest bit array allocated, one word.
const MIN_BITS: u64 = 64;

/// A standard (non-counting) bloom filter over string tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    words: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    item_count: u64,
}

impl BloomFilter {
    /// Create an empty filter sized for `expected_items` at `false_positive_rate`.
    ///
    /// A zero item estimate is treated as one so the filter is never empty.
    pub fn with_rate(expected_items: usize, false_positive_rate: f64) -> Result<Self, VaultError> {
        if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
            return Err(VaultError::InvalidArgument(format!(
                "false positive rate must be in (0, 1), got {}",
                false_positive_rate
            )));
        }

        let n = expected_items.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let bits = (-n * false_positive_rate.ln() / (ln2 * ln2)).ceil() as u64;
        let num_bits = bits.max(MIN_BITS).next_multiple_of(64);
        let num_hashes = ((num_bits as f64 / n) * ln2).round() as u32;

        Ok(Self {
            words: vec![0; (num_bits / 64) as usize],
            num_bits,
            num_hashes: num_hashes.clamp(1, MAX_HASHES),
            item_count: 0,
        })
    }

    /// Insert a token.
    pub fn insert(&mut self, token: &str) {
        let (h1, h2) = hash_pair(token);
        for i in 0..u64::from(self.num_hashes) {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.words[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
        self.item_count += 1;
    }

    /// Test a token. `false` is definitive, `true` may be a false positive.
    #[must_use]
    pub fn contains(&self, token: &str) -> bool {
        let (h1, h2) = hash_pair(token);
        (0..u64::from(self.num_hashes)).all(|i| {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.words[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0
        })
    }

    /// True if every token tests positive (AND semantics).
    #[must_use]
    pub fn contains_all<'a>(&self, tokens: impl IntoIterator<Item = &'a str>) -> bool {
        tokens.into_iter().all(|t| self.contains(t))
    }

    /// Number of insert calls (duplicates included).
    #[must_use]
    pub fn item_count(&self) -> u64 {
        self.item_count
    }

    #[must_use]
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    #[must_use]
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Bytes held by the bit array.
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.words.len() * std::mem::size_of::<u64>()
    }

    /// Expected false-positive rate at the current fill: `(1 - e^(-kn/m))^k`.
    #[must_use]
    pub fn estimated_false_positive_rate(&self) -> f64 {
        let k = f64::from(self.num_hashes);
        let exponent = -k * self.item_count as f64 / self.num_bits as f64;
        (1.0 - exponent.exp()).powf(k)
    }

    /// Reject filters whose shape would make probing index out of bounds.
    pub(crate) fn validate(&self) -> Result<(), VaultError> {
        if self.num_bits == 0
            || self.num_hashes == 0
            || self.words.len() as u64 * 64 != self.num_bits
        {
            return Err(VaultError::SerializationError(format!(
                "malformed bloom filter: {} bits, {} words, {} hashes",
                self.num_bits,
                self.words.len(),
                self.num_hashes
            )));
        }
        Ok(())
    }
}

fn hash_pair(token: &str) -> (u64, u64) {
    let digest = blake3::hash(token.as_bytes());
    let bytes = digest.as_bytes();
    let mut lo = [0u8; 8];
    let mut hi = [0u8; 8];
    lo.copy_from_slice(&bytes[0..8]);
    hi.copy_from_slice(&bytes[8..16]);
    // Odd step so successive positions never collapse onto one.
    (u64::from_le_bytes(lo), u64::from_le_bytes(hi) | 1)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_rates() {
        assert!(BloomFilter::with_rate(10, 0.0).is_err());
        assert!(BloomFilter::with_rate(10, 1.0).is_err());
        assert!(BloomFilter::with_rate(10, f64::NAN).is_err());
    }

    #[test]
    fn sizing_follows_formula() {
        let filter = BloomFilter::with_rate(1000, 0.01).expect("filter");
        // -1000 * ln(0.01) / ln(2)^2 ~= 9586 bits, rounded up to a word
        assert_eq!(filter.num_bits(), 9600);
        assert_eq!(filter.num_hashes(), 7);
        assert_eq!(filter.memory_bytes(), 1200);
    }

    #[test]
    fn zero_items_still_usable() {
        let mut filter = BloomFilter::with_rate(0, 0.01).expect("filter");
        assert_eq!(filter.num_bits(), MIN_BITS);
        filter.insert("x");
        assert!(filter.contains("x"));
    }

    #[test]
    fn no_false_negatives() {
        let mut filter = BloomFilter::with_rate(500, 0.01).expect("filter");
        let tokens: Vec<String> = (0..500).map(|i| format!("device-{i}")).collect();
        for t in &tokens {
            filter.insert(t);
        }
        assert!(tokens.iter().all(|t| filter.contains(t)));
        assert!(filter.contains_all(tokens.iter().take(3).map(String::as_str)));
        assert_eq!(filter.item_count(), 500);
    }

    #[test]
    fn false_positive_rate_near_target() {
        let mut filter = BloomFilter::with_rate(2000, 0.01).expect("filter");
        for i in 0..2000 {
            filter.insert(&format!("in-{i}"));
        }
        let hits = (0..20_000)
            .filter(|i| filter.contains(&format!("out-{i}")))
            .count();
        // 1% target; allow generous slack for a single sample
        assert!(hits < 600, "false positives: {hits}");
        assert!(filter.estimated_false_positive_rate() < 0.02);
    }

    #[test]
    fn validate_catches_truncated_words() {
        let mut filter = BloomFilter::with_rate(100, 0.01).expect("filter");
        assert!(filter.validate().is_ok());
        filter.words.pop();
        assert!(filter.validate().is_err());
    }
}

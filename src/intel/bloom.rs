//! Bloom filter pre-check for known-bad values
//!
//! Sized from the expected element count and target false-positive rate.
//! Both probe hashes come from one SHA-256 digest; probe i lands at
//! `h1 + i * h2`. A negative answer is authoritative, a positive one only
//! means "do the full lookup".

use sha2::{Digest, Sha256};

pub struct BloomFilter {
    bits: Vec<u64>,
    bit_count: usize,
    hash_count: u32,
}

impl BloomFilter {
    /// Create a filter sized for `expected_elements` at `fp_rate`
    pub fn new(expected_elements: usize, fp_rate: f64) -> Self {
        let n = expected_elements.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;

        let bit_count = (-(n * fp_rate.ln()) / (ln2 * ln2)).ceil() as usize;
        let bit_count = bit_count.max(64);
        let hash_count = ((bit_count as f64 / n) * ln2).ceil().max(1.0) as u32;

        Self {
            bits: vec![0u64; (bit_count + 63) / 64],
            bit_count,
            hash_count,
        }
    }

    pub fn add(&mut self, element: &str) {
        let (h1, h2) = Self::hash_pair(element);
        for i in 0..self.hash_count as u64 {
            let index = (h1.wrapping_add(i.wrapping_mul(h2)) % self.bit_count as u64) as usize;
            self.bits[index / 64] |= 1 << (index % 64);
        }
    }

    pub fn add_all<'a, I: IntoIterator<Item = &'a str>>(&mut self, elements: I) {
        for e in elements {
            self.add(e);
        }
    }

    /// May return false positives, never false negatives
    pub fn might_contain(&self, element: &str) -> bool {
        let (h1, h2) = Self::hash_pair(element);
        (0..self.hash_count as u64).all(|i| {
            let index = (h1.wrapping_add(i.wrapping_mul(h2)) % self.bit_count as u64) as usize;
            self.bits[index / 64] & (1 << (index % 64)) != 0
        })
    }

    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    pub fn bit_count(&self) -> usize {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    /// Estimate how many distinct elements have been added, from the fill ratio
    pub fn estimated_element_count(&self) -> usize {
        let set = self
            .bits
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum::<usize>();
        if set == 0 {
            return 0;
        }
        let ratio = set as f64 / self.bit_count as f64;
        (-(self.bit_count as f64) / self.hash_count as f64 * (1.0 - ratio).ln()) as usize
    }

    fn hash_pair(element: &str) -> (u64, u64) {
        let digest = Sha256::digest(element.as_bytes());
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(&digest[0..8]);
        b.copy_from_slice(&digest[8..16]);
        (u64::from_be_bytes(a), u64::from_be_bytes(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{distributions::Alphanumeric, Rng, SeedableRng};

    #[test]
    fn test_no_false_negatives() {
        let mut filter = BloomFilter::new(1000, 0.01);
        let elements: Vec<String> = (0..1000).map(|i| format!("host-{}.example.com", i)).collect();

        for e in &elements {
            filter.add(e);
        }
        for e in &elements {
            assert!(filter.might_contain(e), "false negative for {}", e);
        }
    }

    #[test]
    fn test_false_positive_rate_near_target() {
        let mut filter = BloomFilter::new(10_000, 0.01);
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);

        for i in 0..10_000 {
            filter.add(&format!("inserted-{}", i));
        }

        let trials = 10_000;
        let mut false_positives = 0;
        for _ in 0..trials {
            let probe: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(24)
                .map(char::from)
                .collect();
            if filter.might_contain(&probe) {
                false_positives += 1;
            }
        }

        let rate = false_positives as f64 / trials as f64;
        assert!(rate < 0.03, "false positive rate too high: {}", rate);
    }

    #[test]
    fn test_clear() {
        let mut filter = BloomFilter::new(100, 0.01);
        filter.add("203.0.113.9");
        assert!(filter.might_contain("203.0.113.9"));
        filter.clear();
        assert!(!filter.might_contain("203.0.113.9"));
        assert_eq!(filter.estimated_element_count(), 0);
    }

    #[test]
    fn test_estimated_count_roughly_tracks() {
        let mut filter = BloomFilter::new(10_000, 0.01);
        for i in 0..500 {
            filter.add(&format!("e{}", i));
        }
        let estimate = filter.estimated_element_count();
        assert!((400..=600).contains(&estimate), "estimate {}", estimate);
    }

    #[test]
    fn test_sizing_formulas() {
        let filter = BloomFilter::new(10_000, 0.01);
        // m = ceil(-n ln p / (ln 2)^2) is about 95851 for n=10000, p=0.01
        assert!((95_000..=97_000).contains(&filter.bit_count()));
        assert_eq!(filter.hash_count(), 7);
    }
}

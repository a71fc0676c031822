use std::fmt::{self, Display, Formatter};

use md5::{Digest, Md5};

use crate::firestore::value::BytesValue;

/// Reasons a bloom filter payload from the backend is unusable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BloomFilterError {
    InvalidPadding(i32),
    InvalidHashCount(i32),
    NonZeroPaddingWithEmptyBitmap(i32),
}

impl Display for BloomFilterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BloomFilterError::InvalidPadding(padding) => write!(f, "Invalid padding: {padding}"),
            BloomFilterError::InvalidHashCount(count) => write!(f, "Invalid hash count: {count}"),
            BloomFilterError::NonZeroPaddingWithEmptyBitmap(padding) => {
                write!(f, "Invalid padding when bitmap length is 0: {padding}")
            }
        }
    }
}

impl std::error::Error for BloomFilterError {}

/// Probabilistic set of document names sent with existence filters.
///
/// Bit `i` lives in byte `i / 8` at position `i % 8`. The `k` probe indexes of
/// a value are `(h1 + k * h2) mod bit_count`, where `h1`/`h2` are the
/// little-endian halves of the value's MD5 digest.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: BytesValue, padding: i32, hash_count: i32) -> Result<Self, BloomFilterError> {
        if !(0..8).contains(&padding) {
            return Err(BloomFilterError::InvalidPadding(padding));
        }
        if hash_count < 0 {
            return Err(BloomFilterError::InvalidHashCount(hash_count));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(BloomFilterError::InvalidHashCount(hash_count));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(BloomFilterError::NonZeroPaddingWithEmptyBitmap(padding));
        }

        let bit_count = bitmap.len() as u64 * 8 - padding as u64;
        Ok(Self {
            bitmap: bitmap.as_slice().to_vec(),
            hash_count: hash_count as u32,
            bit_count,
        })
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (h1, h2) = hash_halves(value);
        (0..self.hash_count).all(|round| self.is_bit_set(self.bit_index(h1, h2, round)))
    }

    fn bit_index(&self, h1: u64, h2: u64, round: u32) -> u64 {
        h1.wrapping_add(h2.wrapping_mul(round as u64)) % self.bit_count
    }

    fn is_bit_set(&self, index: u64) -> bool {
        let byte = self.bitmap[(index / 8) as usize];
        byte & (1 << (index % 8)) != 0
    }

    #[cfg(test)]
    pub(crate) fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    #[cfg(test)]
    pub(crate) fn from_values<'a>(
        values: impl IntoIterator<Item = &'a str>,
        bit_count: u64,
        hash_count: u32,
    ) -> Self {
        let byte_len = bit_count.div_ceil(8) as usize;
        let padding = (byte_len as u64 * 8 - bit_count) as i32;
        let mut filter = Self::new(BytesValue::from(vec![0u8; byte_len]), padding, hash_count as i32)
            .expect("valid bloom filter parameters");
        for value in values {
            let (h1, h2) = hash_halves(value);
            for round in 0..hash_count {
                let index = filter.bit_index(h1, h2, round);
                filter.bitmap[(index / 8) as usize] |= 1 << (index % 8);
            }
        }
        filter
    }
}

fn hash_halves(value: &str) -> (u64, u64) {
    let digest = Md5::digest(value.as_bytes());
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    second.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(first), u64::from_le_bytes(second))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(range: std::ops::Range<u32>) -> Vec<String> {
        range
            .map(|i| format!("projects/p/databases/d/documents/coll/doc{i}"))
            .collect()
    }

    #[test]
    fn rejects_malformed_parameters() {
        assert_eq!(
            BloomFilter::new(BytesValue::from(vec![1u8]), 8, 1).unwrap_err(),
            BloomFilterError::InvalidPadding(8)
        );
        assert_eq!(
            BloomFilter::new(BytesValue::from(vec![1u8]), 0, -1).unwrap_err(),
            BloomFilterError::InvalidHashCount(-1)
        );
        assert_eq!(
            BloomFilter::new(BytesValue::from(vec![1u8]), 0, 0).unwrap_err(),
            BloomFilterError::InvalidHashCount(0)
        );
        assert_eq!(
            BloomFilter::new(BytesValue::from(Vec::new()), 1, 0).unwrap_err(),
            BloomFilterError::NonZeroPaddingWithEmptyBitmap(1)
        );
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(BytesValue::from(Vec::new()), 0, 0).unwrap();
        assert_eq!(filter.bit_count(), 0);
        assert!(!filter.might_contain("anything"));
    }

    #[test]
    fn members_always_test_positive() {
        let members = names(0..200);
        let filter = BloomFilter::from_values(members.iter().map(String::as_str), 2_000, 7);
        assert!(members.iter().all(|name| filter.might_contain(name)));
    }

    #[test]
    fn false_positive_rate_is_bounded() {
        let members = names(0..100);
        let filter = BloomFilter::from_values(members.iter().map(String::as_str), 1_000, 7);
        let false_positives = names(1_000..3_000)
            .iter()
            .filter(|name| filter.might_contain(name))
            .count();
        // ~0.8% expected at this size; allow generous slack.
        assert!(false_positives < 100, "{false_positives} false positives");
    }

    #[test]
    fn padding_shrinks_bit_count() {
        let filter = BloomFilter::new(BytesValue::from(vec![0xffu8, 0x0f]), 4, 1).unwrap();
        assert_eq!(filter.bit_count(), 12);
        assert!(filter.might_contain("every bit is set"));
    }
}

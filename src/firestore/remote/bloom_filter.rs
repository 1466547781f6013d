use std::fmt::{Display, Formatter};

use md5::{Digest, Md5};

/// Why a bloom filter sent along with an existence filter was unusable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BloomFilterError {
    InvalidPadding(u8),
    NegativeHashCount(i32),
    /// A non-empty bitmap needs at least one hash function.
    ZeroHashCount,
    /// Empty bitmaps must not declare padding.
    PaddingOnEmptyBitmap(u8),
}

impl Display for BloomFilterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BloomFilterError::InvalidPadding(padding) => {
                write!(f, "invalid padding: {padding}")
            }
            BloomFilterError::NegativeHashCount(count) => {
                write!(f, "invalid hash count: {count}")
            }
            BloomFilterError::ZeroHashCount => f.write_str("invalid hash count: 0"),
            BloomFilterError::PaddingOnEmptyBitmap(padding) => {
                write!(f, "invalid padding when bitmap length is 0: {padding}")
            }
        }
    }
}

impl std::error::Error for BloomFilterError {}

/// Probabilistic set of the document names the backend still has for a
/// target. A miss is definite, a hit may be a false positive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: u8, hash_count: i32) -> Result<Self, BloomFilterError> {
        if padding >= 8 {
            return Err(BloomFilterError::InvalidPadding(padding));
        }
        if hash_count < 0 {
            return Err(BloomFilterError::NegativeHashCount(hash_count));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(BloomFilterError::ZeroHashCount);
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(BloomFilterError::PaddingOnEmptyBitmap(padding));
        }
        let bit_count = bitmap.len() as u64 * 8 - u64::from(padding);
        Ok(Self {
            bitmap,
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

    /// Whether `value` (a fully qualified document name) may be in the set.
    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (hash1, hash2) = md5_halves(value);
        (0..self.hash_count).all(|i| {
            let index = self.bit_index(hash1, hash2, u64::from(i));
            self.is_bit_set(index)
        })
    }

    /// Double hashing: the `i`th probe is `h1 + i * h2` modulo the bit count.
    fn bit_index(&self, hash1: u64, hash2: u64, i: u64) -> u64 {
        hash1.wrapping_add(hash2.wrapping_mul(i)) % self.bit_count
    }

    fn is_bit_set(&self, index: u64) -> bool {
        let byte = self.bitmap[(index / 8) as usize];
        byte & (1 << (index % 8)) != 0
    }

    #[cfg(test)]
    fn insert(&mut self, value: &str) {
        let (hash1, hash2) = md5_halves(value);
        for i in 0..self.hash_count {
            let index = self.bit_index(hash1, hash2, u64::from(i));
            self.bitmap[(index / 8) as usize] |= 1 << (index % 8);
        }
    }
}

/// Splits the MD5 digest into two little-endian 64-bit words.
fn md5_halves(value: &str) -> (u64, u64) {
    let digest = Md5::digest(value.as_bytes());
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    second.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(first), u64::from_le_bytes(second))
}

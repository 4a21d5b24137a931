//! Packed Bitvector - the sole data carrier of the consensus kernel
//!
//! A `PackedBitVec` is a bit-indexed boolean vector stored in 64-bit words.
//!
//! # Representation
//!
//! ```text
//! PackedBitVec { len = 70 }:
//!   words: [b₀b₁b₂...b₆₃ | b₆₄...b₆₉ 0 0 ... 0]
//!           word 0          word 1 (tail zeroed)
//!
//! bit i lives in words[i / 64] at bit position (i % 64), little-endian
//! ```
//!
//! Every bit at a position `>= len` is zero. That is the tail invariant. A
//! vector may carry more words than `len` needs; the extra words are all tail.
//! Every constructor and mutator here maintains it, and the kernels check it
//! on their outputs.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ConsensusError, Result};

/// Bits per storage word.
pub const WORD_BITS: usize = 64;

/// Fixed-width packed boolean vector.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawBitVec", into = "RawBitVec")]
pub struct PackedBitVec {
    /// Number of logical bits
    len: usize,
    /// Storage, little-endian within each word
    words: Vec<u64>,
}

/// Serialized mirror of [`PackedBitVec`]; validated on the way in.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct RawBitVec {
    bit_len: usize,
    words: Vec<u64>,
}

impl TryFrom<RawBitVec> for PackedBitVec {
    type Error = ConsensusError;

    fn try_from(raw: RawBitVec) -> Result<Self> {
        PackedBitVec::from_words(raw.words, raw.bit_len)
    }
}

impl From<PackedBitVec> for RawBitVec {
    fn from(v: PackedBitVec) -> Self {
        RawBitVec {
            bit_len: v.len,
            words: v.words,
        }
    }
}

impl PackedBitVec {
    // ========================================================================
    // CONSTRUCTION
    // ========================================================================

    /// All-zero vector of `len` bits using the minimal word count.
    #[inline]
    pub fn new_zero(len: usize) -> Self {
        Self {
            len,
            words: vec![0u64; Self::word_count_for(len)],
        }
    }

    /// All-zero vector with an explicit word count.
    ///
    /// Fails when `len` does not fit in `word_count` words.
    pub fn with_word_count(word_count: usize, len: usize) -> Result<Self> {
        if len > word_count.saturating_mul(WORD_BITS) {
            return Err(ConsensusError::invalid(format!(
                "bit length {len} does not fit in {word_count} words"
            )));
        }
        Ok(Self {
            len,
            words: vec![0u64; word_count],
        })
    }

    /// All-one vector of `len` bits.
    pub fn ones(len: usize) -> Self {
        let mut out = Self {
            len,
            words: vec![!0u64; Self::word_count_for(len)],
        };
        out.clear_tail();
        out
    }

    /// Pack a boolean sequence: bit i of word ⌊i/64⌋ is set iff `bits[i]`.
    pub fn from_bools(bits: &[bool]) -> Self {
        let mut out = Self::new_zero(bits.len());
        for (i, &b) in bits.iter().enumerate() {
            if b {
                out.words[i / WORD_BITS] |= 1u64 << (i % WORD_BITS);
            }
        }
        out
    }

    /// Adopt an existing word buffer.
    ///
    /// Rejects buffers that are too short for `len` or that carry set bits in
    /// the tail.
    pub fn from_words(words: Vec<u64>, len: usize) -> Result<Self> {
        if len > words.len().saturating_mul(WORD_BITS) {
            return Err(ConsensusError::invalid(format!(
                "bit length {len} does not fit in {} words",
                words.len()
            )));
        }
        let out = Self { len, words };
        if let Some(idx) = out.first_dirty_word() {
            return Err(ConsensusError::invalid(format!(
                "word {idx} has bits set past bit length {len}"
            )));
        }
        Ok(out)
    }

    /// Adopt a word buffer the caller has already validated (advanced use).
    ///
    /// Kernels use this for outputs they build word by word; the tail is
    /// checked afterwards by the caller.
    #[inline]
    pub(crate) fn from_raw(words: Vec<u64>, len: usize) -> Self {
        debug_assert!(len <= words.len() * WORD_BITS);
        Self { len, words }
    }

    /// Uniformly random vector, tail cleared.
    pub fn random<R: Rng + ?Sized>(len: usize, rng: &mut R) -> Self {
        let mut out = Self {
            len,
            words: (0..Self::word_count_for(len)).map(|_| rng.gen()).collect(),
        };
        out.clear_tail();
        out
    }

    /// Number of u64 words needed for `len` bits.
    #[inline(always)]
    pub const fn word_count_for(len: usize) -> usize {
        (len + WORD_BITS - 1) / WORD_BITS
    }

    /// Mask of the valid bits of word `idx` in a vector of `len` bits.
    #[inline(always)]
    pub const fn word_mask(len: usize, idx: usize) -> u64 {
        let start = idx * WORD_BITS;
        if start >= len {
            0
        } else if len - start >= WORD_BITS {
            !0u64
        } else {
            (1u64 << (len - start)) - 1
        }
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    /// Number of logical bits.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of storage words (may exceed `word_count_for(len)`).
    #[inline]
    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    /// Read-only access to the storage words, in order.
    #[inline]
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Word `idx`, or zero past the end of storage.
    #[inline]
    pub fn word(&self, idx: usize) -> u64 {
        self.words.get(idx).copied().unwrap_or(0)
    }

    /// Read bit `i`.
    #[inline]
    pub fn get(&self, i: usize) -> Result<bool> {
        if i >= self.len {
            return Err(ConsensusError::OutOfRange {
                index: i,
                len: self.len,
            });
        }
        Ok((self.words[i / WORD_BITS] >> (i % WORD_BITS)) & 1 == 1)
    }

    /// Write bit `i`.
    #[inline]
    pub fn set(&mut self, i: usize, value: bool) -> Result<()> {
        if i >= self.len {
            return Err(ConsensusError::OutOfRange {
                index: i,
                len: self.len,
            });
        }
        let mask = 1u64 << (i % WORD_BITS);
        if value {
            self.words[i / WORD_BITS] |= mask;
        } else {
            self.words[i / WORD_BITS] &= !mask;
        }
        Ok(())
    }

    /// Unpack into one boolean per bit.
    pub fn to_bools(&self) -> Vec<bool> {
        (0..self.len)
            .map(|i| (self.words[i / WORD_BITS] >> (i % WORD_BITS)) & 1 == 1)
            .collect()
    }

    /// Indices of set bits, ascending.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        let len = self.len;
        self.words.iter().enumerate().flat_map(move |(w, &word)| {
            let mut bits = word & Self::word_mask(len, w);
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let tz = bits.trailing_zeros() as usize;
                bits &= bits - 1; // Clear lowest set bit
                Some(w * WORD_BITS + tz)
            })
        })
    }

    // ========================================================================
    // TAIL INVARIANT
    // ========================================================================

    /// Whether every bit past `len` is zero.
    pub fn is_tail_clean(&self) -> bool {
        self.first_dirty_word().is_none()
    }

    fn first_dirty_word(&self) -> Option<usize> {
        let first_tail = self.len / WORD_BITS;
        (first_tail..self.words.len()).find(|&w| self.words[w] & !Self::word_mask(self.len, w) != 0)
    }

    /// Zero every bit past `len`.
    pub(crate) fn clear_tail(&mut self) {
        let first_tail = self.len / WORD_BITS;
        for w in first_tail..self.words.len() {
            self.words[w] &= Self::word_mask(self.len, w);
        }
    }

    /// Shape check for binary kernels: same bit length and word count.
    pub(crate) fn ensure_same_shape(&self, other: &Self) -> Result<()> {
        if self.len != other.len {
            return Err(ConsensusError::invalid(format!(
                "bit length mismatch: {} vs {}",
                self.len, other.len
            )));
        }
        if self.words.len() != other.words.len() {
            return Err(ConsensusError::invalid(format!(
                "word count mismatch: {} vs {}",
                self.words.len(),
                other.words.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_get_set() {
        let mut v = PackedBitVec::new_zero(100);

        v.set(0, true).unwrap();
        v.set(63, true).unwrap();
        v.set(64, true).unwrap();
        v.set(99, true).unwrap();

        assert!(v.get(0).unwrap());
        assert!(!v.get(1).unwrap());
        assert!(v.get(63).unwrap());
        assert!(v.get(64).unwrap());
        assert!(v.get(99).unwrap());
        assert_eq!(v.words(), &[(1u64 << 63) | 1, 1 | (1u64 << 35)]);

        v.set(63, false).unwrap();
        assert!(!v.get(63).unwrap());
    }

    #[test]
    fn test_out_of_range() {
        let mut v = PackedBitVec::new_zero(10);
        assert!(matches!(
            v.get(10),
            Err(ConsensusError::OutOfRange { index: 10, len: 10 })
        ));
        assert!(v.set(64, true).is_err());
    }

    #[test]
    fn test_from_bools_little_endian() {
        let v = PackedBitVec::from_bools(&[true, false, true, true]);
        assert_eq!(v.len(), 4);
        assert_eq!(v.words(), &[0b1101]);
        assert_eq!(v.to_bools(), vec![true, false, true, true]);
    }

    #[test]
    fn test_from_words_rejects_dirty_tail() {
        assert!(PackedBitVec::from_words(vec![0b1000], 3).is_err());
        assert!(PackedBitVec::from_words(vec![0b0111], 3).is_ok());
        // Extra words are tail too
        assert!(PackedBitVec::from_words(vec![1, 1], 64).is_err());
        assert!(PackedBitVec::from_words(vec![1, 0], 64).is_ok());
        // Too short
        assert!(PackedBitVec::from_words(vec![0], 65).is_err());
    }

    #[test]
    fn test_word_mask() {
        assert_eq!(PackedBitVec::word_mask(64, 0), !0u64);
        assert_eq!(PackedBitVec::word_mask(70, 1), 0b11_1111);
        assert_eq!(PackedBitVec::word_mask(70, 2), 0);
        assert_eq!(PackedBitVec::word_mask(0, 0), 0);
    }

    #[test]
    fn test_ones_and_random_keep_tail_clean() {
        let ones = PackedBitVec::ones(70);
        assert!(ones.is_tail_clean());
        assert_eq!(ones.iter_ones().count(), 70);

        let mut rng = StdRng::seed_from_u64(7);
        for len in [1usize, 63, 64, 65, 200] {
            assert!(PackedBitVec::random(len, &mut rng).is_tail_clean());
        }
    }

    #[test]
    fn test_iter_ones() {
        let v = PackedBitVec::from_bools(&[false, true, false, true]);
        assert_eq!(v.iter_ones().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_with_word_count() {
        let v = PackedBitVec::with_word_count(4, 128).unwrap();
        assert_eq!(v.word_count(), 4);
        assert_eq!(v.len(), 128);
        assert!(PackedBitVec::with_word_count(1, 65).is_err());
    }

    #[test]
    fn test_serde_validates() {
        let v = PackedBitVec::from_bools(&[true, true, false]);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"{"bit_len":3,"words":[3]}"#);
        let back: PackedBitVec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);

        let bad = serde_json::from_str::<PackedBitVec>(r#"{"bit_len":3,"words":[255]}"#);
        assert!(bad.is_err());
    }
}

//! Reduction kernel: data-parallel primitives over packed bitvectors.
//!
//! Every entry point has two forms. `popcount(x)` runs on the process-wide
//! backend from [`backend::selected`]; `popcount_with(&backend, x)` runs on
//! an explicit one. Both validate shapes before touching data and check the
//! tail invariant on every vector they produce.
//!
//! # Operations
//!
//! | Operation | Result | Requires |
//! |-----------|--------|----------|
//! | `popcount` | set bits in `[0, len]` | - |
//! | `and` / `or` / `xor` | new vector | equal shapes, `len > 0` |
//! | `carry_propagate` | new vector | `len > 0` |
//! | `equal` | bool | equal shapes |
//! | `hamming_distance` | `popcount(xor)` | equal shapes |
//! | `reduce` | fold of M vectors | M ≥ 1, equal shapes, `len > 0` |

use serde::{Deserialize, Serialize};

use crate::backend::{self, Backend};
use crate::bitvec::{PackedBitVec, WORD_BITS};
use crate::error::{self, ConsensusError, Result};

pub mod scalar;

#[cfg(target_arch = "x86_64")]
pub(crate) mod avx2;

#[cfg(all(target_arch = "x86_64", feature = "avx512"))]
pub(crate) mod avx512;

pub(crate) type PopcountFn = fn(&[u64]) -> Result<u64>;
pub(crate) type BinaryFn = fn(&[u64], &[u64], &mut [u64]) -> Result<()>;
pub(crate) type CarryFn = fn(&[u64], u64, &mut [u64]) -> Result<u64>;

/// Word-slice kernels for one backend. Accelerated entries may refuse an
/// input with `BackendUnavailable`; the scalar table never fails.
#[derive(Clone, Copy)]
pub(crate) struct KernelTable {
    pub popcount: PopcountFn,
    pub and: BinaryFn,
    pub or: BinaryFn,
    pub xor: BinaryFn,
    pub carry: CarryFn,
}

/// Bitwise operator for two-input kernels and multi-input folds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReduceOp {
    And,
    Or,
    Xor,
}

// ============================================================================
// POPCOUNT
// ============================================================================

/// Number of set bits, on the selected backend.
pub fn popcount(x: &PackedBitVec) -> usize {
    popcount_with(backend::selected(), x)
}

/// Number of set bits.
///
/// Whole words go through the backend; the final partial word is masked to
/// `len` before counting, and words past it are ignored.
pub fn popcount_with(backend: &Backend, x: &PackedBitVec) -> usize {
    let words = x.words();
    let full = (x.len() / WORD_BITS).min(words.len());

    let mut count = backend.popcount_words(&words[..full]);
    if full < words.len() {
        count += (words[full] & PackedBitVec::word_mask(x.len(), full)).count_ones() as u64;
    }
    count as usize
}

// ============================================================================
// BITWISE
// ============================================================================

pub fn and(x: &PackedBitVec, y: &PackedBitVec) -> Result<PackedBitVec> {
    bitwise_with(backend::selected(), ReduceOp::And, x, y)
}

pub fn or(x: &PackedBitVec, y: &PackedBitVec) -> Result<PackedBitVec> {
    bitwise_with(backend::selected(), ReduceOp::Or, x, y)
}

pub fn xor(x: &PackedBitVec, y: &PackedBitVec) -> Result<PackedBitVec> {
    bitwise_with(backend::selected(), ReduceOp::Xor, x, y)
}

/// Elementwise `op` over two vectors of identical shape.
pub fn bitwise_with(
    backend: &Backend,
    op: ReduceOp,
    x: &PackedBitVec,
    y: &PackedBitVec,
) -> Result<PackedBitVec> {
    x.ensure_same_shape(y)?;
    ensure_non_empty(x)?;

    let mut out = vec![0u64; x.word_count()];
    backend.binary_words(op, x.words(), y.words(), &mut out);
    finish(out, x.len(), op_name(op))
}

// ============================================================================
// CARRY PROPAGATION
// ============================================================================

/// Rolling transform on the selected backend.
pub fn carry_propagate(x: &PackedBitVec, initial_carry: bool) -> Result<PackedBitVec> {
    carry_propagate_with(backend::selected(), x, initial_carry)
}

/// Word-serial rolling transform `c_i = (c_{i-1} ^ x_i) & x_i`.
///
/// `initial_carry` is a single bit broadcast to all 64 positions of
/// `c_{-1}`. Words are processed strictly left to right. Each output word is
/// a subset of its input word, so the tail stays clean.
pub fn carry_propagate_with(
    backend: &Backend,
    x: &PackedBitVec,
    initial_carry: bool,
) -> Result<PackedBitVec> {
    ensure_non_empty(x)?;

    let carry_in = if initial_carry { !0u64 } else { 0 };
    let mut out = vec![0u64; x.word_count()];
    backend.carry_words(x.words(), carry_in, &mut out);
    finish(out, x.len(), "carry_propagate")
}

// ============================================================================
// COMPARISON
// ============================================================================

pub fn equal(x: &PackedBitVec, y: &PackedBitVec) -> Result<bool> {
    x.ensure_same_shape(y)?;
    Ok(x.words() == y.words())
}

pub fn hamming_distance(x: &PackedBitVec, y: &PackedBitVec) -> Result<usize> {
    hamming_distance_with(backend::selected(), x, y)
}

/// `popcount(xor(x, y))`.
pub fn hamming_distance_with(
    backend: &Backend,
    x: &PackedBitVec,
    y: &PackedBitVec,
) -> Result<usize> {
    x.ensure_same_shape(y)?;
    if x.is_empty() {
        return Ok(0);
    }
    let diff = bitwise_with(backend, ReduceOp::Xor, x, y)?;
    Ok(popcount_with(backend, &diff))
}

// ============================================================================
// MULTI-INPUT FOLD
// ============================================================================

pub fn reduce(op: ReduceOp, inputs: &[PackedBitVec]) -> Result<PackedBitVec> {
    reduce_with(backend::selected(), op, inputs)
}

/// Fold `inputs` left to right with `op`. All three operators are
/// commutative and associative, so the order does not affect the result.
pub fn reduce_with(backend: &Backend, op: ReduceOp, inputs: &[PackedBitVec]) -> Result<PackedBitVec> {
    let (first, rest) = inputs
        .split_first()
        .ok_or_else(|| ConsensusError::invalid("reduction over an empty input set"))?;
    ensure_non_empty(first)?;
    for v in rest {
        first.ensure_same_shape(v)?;
    }

    let mut acc = first.words().to_vec();
    let mut next = vec![0u64; acc.len()];
    for v in rest {
        backend.binary_words(op, &acc, v.words(), &mut next);
        std::mem::swap(&mut acc, &mut next);
    }
    finish(acc, first.len(), op_name(op))
}

// ============================================================================
// HELPERS
// ============================================================================

pub(crate) fn ensure_non_empty(x: &PackedBitVec) -> Result<()> {
    if x.is_empty() {
        return Err(ConsensusError::invalid("operation requires a non-empty bitvector"));
    }
    Ok(())
}

/// Wrap kernel output and check the tail invariant.
pub(crate) fn finish(words: Vec<u64>, len: usize, op: &str) -> Result<PackedBitVec> {
    let out = PackedBitVec::from_raw(words, len);
    if !out.is_tail_clean() {
        return Err(error::internal(format!(
            "{op} produced set bits past bit length {len}"
        )));
    }
    Ok(out)
}

fn op_name(op: ReduceOp) -> &'static str {
    match op {
        ReduceOp::And => "and",
        ReduceOp::Or => "or",
        ReduceOp::Xor => "xor",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar() -> Backend {
        Backend::scalar()
    }

    #[test]
    fn test_popcount_masks_partial_word() {
        // Tail bits can only appear through from_raw; popcount must ignore them.
        let dirty = PackedBitVec::from_raw(vec![!0u64, !0u64], 70);
        assert_eq!(popcount_with(&scalar(), &dirty), 70);
    }

    #[test]
    fn test_popcount_ignores_extra_words() {
        let v = PackedBitVec::from_words(vec![0b111, 0, 0, 0, 0], 3).unwrap();
        assert_eq!(popcount_with(&scalar(), &v), 3);
    }

    #[test]
    fn test_bitwise_shape_mismatch() {
        let a = PackedBitVec::new_zero(64);
        let b = PackedBitVec::new_zero(65);
        assert!(matches!(
            bitwise_with(&scalar(), ReduceOp::And, &a, &b),
            Err(ConsensusError::InvalidInput { .. })
        ));

        let c = PackedBitVec::with_word_count(2, 64).unwrap();
        assert!(bitwise_with(&scalar(), ReduceOp::Or, &a, &c).is_err());
    }

    #[test]
    fn test_empty_inputs_rejected() {
        let e = PackedBitVec::new_zero(0);
        assert!(bitwise_with(&scalar(), ReduceOp::Xor, &e, &e).is_err());
        assert!(carry_propagate_with(&scalar(), &e, false).is_err());
        assert!(reduce_with(&scalar(), ReduceOp::And, &[]).is_err());
        assert_eq!(popcount_with(&scalar(), &e), 0);
    }

    #[test]
    fn test_carry_broadcasts_initial_bit() {
        let x = PackedBitVec::from_words(vec![0b0110], 4).unwrap();
        let zero = carry_propagate_with(&scalar(), &x, false).unwrap();
        assert_eq!(zero.words(), &[0b0110]);
        let one = carry_propagate_with(&scalar(), &x, true).unwrap();
        assert_eq!(one.words(), &[0]);
    }

    #[test]
    fn test_reduce() {
        let a = PackedBitVec::from_words(vec![0b1100], 4).unwrap();
        let b = PackedBitVec::from_words(vec![0b1010], 4).unwrap();
        let c = PackedBitVec::from_words(vec![0b1001], 4).unwrap();
        let inputs = [a.clone(), b, c];

        assert_eq!(reduce_with(&scalar(), ReduceOp::And, &inputs).unwrap().words(), &[0b1000]);
        assert_eq!(reduce_with(&scalar(), ReduceOp::Or, &inputs).unwrap().words(), &[0b1111]);
        assert_eq!(reduce_with(&scalar(), ReduceOp::Xor, &inputs).unwrap().words(), &[0b1111]);
        assert_eq!(reduce_with(&scalar(), ReduceOp::Or, &[a.clone()]).unwrap(), a);
    }

    #[test]
    fn test_hamming_and_equal() {
        let a = PackedBitVec::from_bools(&[true, false, true, true]);
        let b = PackedBitVec::from_bools(&[false, false, true, false]);
        assert_eq!(hamming_distance_with(&scalar(), &a, &b).unwrap(), 2);
        assert!(!equal(&a, &b).unwrap());
        assert!(equal(&a, &a.clone()).unwrap());
        assert!(equal(&a, &PackedBitVec::new_zero(5)).is_err());
    }

    #[test]
    fn test_finish_accepts_clean_output() {
        let out = finish(vec![0b101, 0], 3, "xor").unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out.words(), &[0b101, 0]);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "contract violated")]
    fn test_dirty_output_panics_in_debug_builds() {
        let _ = finish(vec![!0u64], 3, "xor");
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn test_dirty_output_is_internal_error_in_release_builds() {
        let err = finish(vec![!0u64], 3, "xor").unwrap_err();
        assert!(matches!(err, ConsensusError::Internal { .. }));
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("xor produced set bits past bit length 3"));
    }
}

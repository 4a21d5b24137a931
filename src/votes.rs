//! Vote packing and majority queries.
//!
//! Majority is strict: `popcount > ⌊n/2⌋`, so ties resolve to `false`.
//! Weighted votes compare `Σ w_j · bit_j ≥ threshold`, so a sum exactly on the
//! threshold counts as agreement.

use crate::backend::{self, Backend};
use crate::bitvec::{PackedBitVec, WORD_BITS};
use crate::config::DEFAULT_SMALL_VOTE_THRESHOLD;
use crate::consensus::VoteCounter;
use crate::error::{ConsensusError, Result};
use crate::kernel;

/// Pack booleans into a bitvector of the same length.
pub fn pack(votes: &[bool]) -> PackedBitVec {
    PackedBitVec::from_bools(votes)
}

/// One boolean per bit.
pub fn unpack(pbv: &PackedBitVec) -> Vec<bool> {
    pbv.to_bools()
}

/// Strict majority of a vote sequence, on the selected backend.
pub fn majority(votes: &[bool]) -> Result<bool> {
    majority_with(backend::selected(), votes, DEFAULT_SMALL_VOTE_THRESHOLD)
}

/// Strict majority of a vote sequence.
///
/// Sequences shorter than `small_vote_threshold` are counted directly;
/// longer ones are packed and counted with the backend popcount.
pub fn majority_with(backend: &Backend, votes: &[bool], small_vote_threshold: usize) -> Result<bool> {
    if votes.is_empty() {
        return Err(ConsensusError::invalid("majority over an empty vote sequence"));
    }
    let ones = if votes.len() < small_vote_threshold {
        votes.iter().filter(|&&v| v).count()
    } else {
        kernel::popcount_with(backend, &pack(votes))
    };
    Ok(ones > votes.len() / 2)
}

/// Strict majority of the bits of a packed vector, on the selected backend.
pub fn majority_of(pbv: &PackedBitVec) -> Result<bool> {
    majority_of_with(backend::selected(), pbv)
}

pub fn majority_of_with(backend: &Backend, pbv: &PackedBitVec) -> Result<bool> {
    kernel::ensure_non_empty(pbv)?;
    Ok(kernel::popcount_with(backend, pbv) > pbv.len() / 2)
}

/// Per-position weighted vote, on the selected backend.
pub fn weighted_vote(inputs: &[PackedBitVec], weights: &[f64], threshold: f64) -> Result<PackedBitVec> {
    weighted_vote_with(backend::selected(), inputs, weights, threshold)
}

/// Per-position weighted vote.
///
/// Output bit i is set iff `Σ_j weights[j] · inputs[j][i] ≥ threshold`.
/// Weights must be finite and non-negative; the threshold must lie in
/// `[0, Σ weights]`. All validation happens before any counting.
///
/// Unit weights take the bit-sliced counting path; arbitrary weights sum per
/// bit position in input order.
pub fn weighted_vote_with(
    backend: &Backend,
    inputs: &[PackedBitVec],
    weights: &[f64],
    threshold: f64,
) -> Result<PackedBitVec> {
    let shape = validate_inputs(inputs)?;
    validate_weights(weights, inputs.len(), threshold)?;

    if weights.iter().all(|&w| w == 1.0) {
        // Integer counts: count ≥ t ⇔ count ≥ ⌈t⌉, and ⌈t⌉ ≤ M.
        let mut counter = VoteCounter::new(*backend, shape.len, shape.word_count);
        for v in inputs {
            counter.accumulate(v)?;
        }
        return counter.at_least(threshold.ceil() as u64);
    }

    let mut out = vec![0u64; shape.word_count];
    let mut sums = [0f64; WORD_BITS];

    for (w, out_word) in out.iter_mut().enumerate() {
        let mask = PackedBitVec::word_mask(shape.len, w);
        if mask == 0 {
            continue;
        }

        sums.fill(0.0);
        for (v, &weight) in inputs.iter().zip(weights) {
            if weight == 0.0 {
                continue;
            }
            let mut bits = v.word(w) & mask;
            while bits != 0 {
                sums[bits.trailing_zeros() as usize] += weight;
                bits &= bits - 1;
            }
        }

        let mut word = 0u64;
        for (bit, sum) in sums.iter().enumerate() {
            if *sum >= threshold {
                word |= 1u64 << bit;
            }
        }
        *out_word = word & mask;
    }

    kernel::finish(out, shape.len, "weighted_vote")
}

/// Common shape of a validated input set.
#[derive(Clone, Copy, Debug)]
pub(crate) struct InputShape {
    pub len: usize,
    pub word_count: usize,
}

/// Non-empty set of non-empty vectors, all the same shape.
pub(crate) fn validate_inputs(inputs: &[PackedBitVec]) -> Result<InputShape> {
    let (first, rest) = inputs
        .split_first()
        .ok_or_else(|| ConsensusError::invalid("consensus over an empty input set"))?;
    kernel::ensure_non_empty(first)?;
    for v in rest {
        first.ensure_same_shape(v)?;
    }
    Ok(InputShape {
        len: first.len(),
        word_count: first.word_count(),
    })
}

/// One finite, non-negative weight per input and a threshold in `[0, Σw]`.
pub(crate) fn validate_weights(weights: &[f64], inputs: usize, threshold: f64) -> Result<()> {
    if weights.len() != inputs {
        return Err(ConsensusError::invalid(format!(
            "expected {inputs} weights, got {}",
            weights.len()
        )));
    }
    if let Some((i, w)) = weights
        .iter()
        .enumerate()
        .find(|(_, w)| !w.is_finite() || **w < 0.0)
    {
        return Err(ConsensusError::invalid(format!(
            "weight {i} is {w}; weights must be finite and non-negative"
        )));
    }
    let total: f64 = weights.iter().sum();
    if !threshold.is_finite() || threshold < 0.0 || threshold > total {
        return Err(ConsensusError::invalid(format!(
            "threshold {threshold} outside [0, {total}]"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bits(v: &[u8]) -> PackedBitVec {
        PackedBitVec::from_bools(&v.iter().map(|&b| b == 1).collect::<Vec<_>>())
    }

    #[test]
    fn test_pack_unpack() {
        let votes = vec![true, false, false, true, true];
        let packed = pack(&votes);
        assert_eq!(packed.len(), 5);
        assert_eq!(packed.words(), &[0b11001]);
        assert_eq!(unpack(&packed), votes);
    }

    #[test]
    fn test_majority_strict() {
        let b = Backend::scalar();
        assert!(majority_with(&b, &[true, true, false, true, false], 1000).unwrap());
        assert!(!majority_with(&b, &[true, true, false, false], 1000).unwrap());
        assert!(majority_with(&b, &[true], 1000).unwrap());
        assert!(majority_with(&b, &[], 1000).is_err());
    }

    #[test]
    fn test_majority_paths_agree() {
        let b = Backend::best_available();
        for n in [999usize, 1000, 1001, 4096] {
            // Exactly half true for even n
            let votes: Vec<bool> = (0..n).map(|i| i % 2 == 0).collect();
            let direct = majority_with(&b, &votes, usize::MAX).unwrap();
            let packed = majority_with(&b, &votes, 0).unwrap();
            assert_eq!(direct, packed, "n = {n}");
            assert_eq!(direct, n % 2 == 1);
        }
    }

    #[test]
    fn test_majority_of_pbv() {
        let b = Backend::scalar();
        assert!(majority_of_with(&b, &bits(&[1, 1, 0])).unwrap());
        assert!(!majority_of_with(&b, &bits(&[1, 0])).unwrap());
        assert!(majority_of_with(&b, &PackedBitVec::new_zero(0)).is_err());
    }

    #[test]
    fn test_weighted_vote() {
        let b = Backend::scalar();
        let inputs = [bits(&[1, 0, 1, 0]), bits(&[0, 0, 1, 1])];
        let out = weighted_vote_with(&b, &inputs, &[1.0, 2.0], 1.5).unwrap();
        assert_eq!(out.to_bools(), vec![false, false, true, true]);
    }

    #[test]
    fn test_weighted_vote_tie_counts() {
        let b = Backend::scalar();
        let inputs = [bits(&[1, 0]), bits(&[0, 1])];
        // Sum exactly equals the threshold at both positions
        let out = weighted_vote_with(&b, &inputs, &[0.5, 0.5], 0.5).unwrap();
        assert_eq!(out.to_bools(), vec![true, true]);
    }

    #[test]
    fn test_unit_weights_use_ceiling() {
        let b = Backend::scalar();
        let inputs = [bits(&[1, 1, 0]), bits(&[1, 0, 0]), bits(&[1, 1, 1])];
        let out = weighted_vote_with(&b, &inputs, &[1.0; 3], 1.5).unwrap();
        assert_eq!(out.to_bools(), vec![true, true, false]);
    }

    #[test]
    fn test_zero_threshold_sets_every_bit() {
        let b = Backend::scalar();
        let inputs = [PackedBitVec::new_zero(70)];
        let out = weighted_vote_with(&b, &inputs, &[2.0], 0.0).unwrap();
        assert_eq!(out, PackedBitVec::ones(70));
    }

    #[test]
    fn test_weighted_vote_validation() {
        let b = Backend::scalar();
        let inputs = [bits(&[1, 0]), bits(&[0, 1])];
        assert!(weighted_vote_with(&b, &inputs, &[1.0], 0.5).is_err());
        assert!(weighted_vote_with(&b, &inputs, &[1.0, -1.0], 0.0).is_err());
        assert!(weighted_vote_with(&b, &inputs, &[1.0, f64::NAN], 0.5).is_err());
        assert!(weighted_vote_with(&b, &inputs, &[1.0, 1.0], 2.5).is_err());
        assert!(weighted_vote_with(&b, &inputs, &[1.0, 1.0], -0.1).is_err());
        assert!(weighted_vote_with(&b, &[], &[], 0.0).is_err());
        assert!(weighted_vote_with(&b, &[bits(&[1]), bits(&[1, 0])], &[1.0, 1.0], 1.0).is_err());
    }
}

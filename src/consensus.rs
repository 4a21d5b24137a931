//! Hierarchical consensus over many packed bitvectors.
//!
//! Per-position counts are kept bit-sliced: plane `k` holds bit `k` of every
//! position's vote count, 64 positions per word. Adding an input is a
//! ripple-carry add across planes (`sum = plane ^ carry`, `carry = plane &
//! carry`) that stops as soon as the carry is all zero. Thresholding is a
//! bit-sliced comparison against the constant, MSB first.
//!
//! ```text
//! plane 2: 0 0 1 0 ...
//! plane 1: 1 0 0 1 ...     count at position 0 = 0b010 = 2
//! plane 0: 0 1 1 1 ...     count at position 2 = 0b101 = 5
//! ```
//!
//! The matrix view runs the same counter once per grid row, over that row's
//! words only, one independent task per row.

use serde::ser::{Serialize, Serializer};

use crate::backend::{self, Backend};
use crate::bitvec::{PackedBitVec, WORD_BITS};
use crate::config;
use crate::error::{ConsensusError, Result};
use crate::kernel::{self, ReduceOp};
use crate::votes::{self, validate_inputs};

// ============================================================================
// BIT-SLICED VOTE COUNTER
// ============================================================================

/// Per-position vote counter over equal-shape bitvectors.
///
/// # Example
///
/// ```rust
/// use bitconsensus::{Backend, PackedBitVec, VoteCounter};
///
/// let a = PackedBitVec::from_bools(&[true, true, false]);
/// let b = PackedBitVec::from_bools(&[true, false, false]);
/// let mut counter = VoteCounter::new(Backend::scalar(), 3, 1);
/// counter.accumulate(&a).unwrap();
/// counter.accumulate(&b).unwrap();
/// assert_eq!(counter.counts(), vec![2, 1, 0]);
/// ```
#[derive(Clone, Debug)]
pub struct VoteCounter {
    backend: Backend,
    len: usize,
    word_count: usize,
    /// Bit k of every count, least significant plane first
    planes: Vec<Vec<u64>>,
    carry: Vec<u64>,
    next_carry: Vec<u64>,
    sum: Vec<u64>,
    /// Number of vectors accumulated
    inputs: usize,
}

impl VoteCounter {
    /// Counter for vectors of `len` bits stored in `word_count` words.
    pub fn new(backend: Backend, len: usize, word_count: usize) -> Self {
        Self {
            backend,
            len,
            word_count,
            planes: Vec::new(),
            carry: vec![0u64; word_count],
            next_carry: vec![0u64; word_count],
            sum: vec![0u64; word_count],
            inputs: 0,
        }
    }

    /// Add one vote vector.
    pub fn accumulate(&mut self, v: &PackedBitVec) -> Result<()> {
        if v.len() != self.len || v.word_count() != self.word_count {
            return Err(ConsensusError::invalid(format!(
                "counter expects {} bits in {} words, got {} bits in {} words",
                self.len,
                self.word_count,
                v.len(),
                v.word_count()
            )));
        }

        self.add_words(v.words());
        self.inputs += 1;
        Ok(())
    }

    /// Ripple one vector's words into the planes; `words` has `word_count` words.
    fn add_words(&mut self, words: &[u64]) {
        self.carry.copy_from_slice(words);
        for plane in self.planes.iter_mut() {
            if self.backend.popcount_words(&self.carry) == 0 {
                break;
            }
            self.backend
                .binary_words(ReduceOp::And, plane, &self.carry, &mut self.next_carry);
            self.backend
                .binary_words(ReduceOp::Xor, plane, &self.carry, &mut self.sum);
            std::mem::swap(plane, &mut self.sum);
            std::mem::swap(&mut self.carry, &mut self.next_carry);
        }
        if self.carry.iter().any(|&w| w != 0) {
            self.planes.push(self.carry.clone());
        }
    }

    /// Number of vectors accumulated so far.
    pub fn inputs(&self) -> usize {
        self.inputs
    }

    /// Number of count planes currently in use.
    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    /// Positions whose count is at least `threshold`.
    pub fn at_least(&self, threshold: u64) -> Result<PackedBitVec> {
        let words = (0..self.word_count)
            .map(|w| {
                let plane = |k: usize| self.planes.get(k).map_or(0, |p| p[w]);
                at_least_word(plane, threshold) & PackedBitVec::word_mask(self.len, w)
            })
            .collect();
        kernel::finish(words, self.len, "consensus")
    }

    /// Per-position counts.
    pub fn counts(&self) -> Vec<u64> {
        (0..self.len)
            .map(|i| {
                let (w, bit) = (i / WORD_BITS, i % WORD_BITS);
                self.planes
                    .iter()
                    .enumerate()
                    .map(|(k, plane)| ((plane[w] >> bit) & 1) << k)
                    .sum()
            })
            .collect()
    }

    pub fn reset(&mut self) {
        self.planes.clear();
        self.inputs = 0;
    }
}

/// Bit-sliced `count ≥ threshold` for one word of positions.
///
/// `plane(k)` returns bit `k` of the counts; planes past the last one are
/// zero. Walks from the most significant bit of either side tracking
/// "greater so far" and "equal so far".
pub(crate) fn at_least_word(plane: impl Fn(usize) -> u64, threshold: u64) -> u64 {
    if threshold == 0 {
        return !0u64;
    }
    let top = (u64::BITS - threshold.leading_zeros()) as usize;

    // Any set plane at or above `top` already exceeds the threshold.
    let mut gt = (top..u64::BITS as usize).fold(0u64, |acc, k| acc | plane(k));

    let mut eq = !gt;
    for k in (0..top).rev() {
        let c = plane(k);
        let t = if (threshold >> k) & 1 == 1 { !0u64 } else { 0 };
        gt |= eq & c & !t;
        eq &= !(c ^ t);
    }
    gt | eq
}

// ============================================================================
// BIT CONSENSUS
// ============================================================================

/// Threshold for a strict majority of `inputs` unweighted voters.
pub fn strict_majority(inputs: usize) -> u64 {
    (inputs / 2 + 1) as u64
}

/// Per-position vote counts across `inputs`.
pub fn vote_counts(inputs: &[PackedBitVec]) -> Result<Vec<u64>> {
    let shape = validate_inputs(inputs)?;
    let mut counter = VoteCounter::new(*backend::selected(), shape.len, shape.word_count);
    for v in inputs {
        counter.accumulate(v)?;
    }
    Ok(counter.counts())
}

/// Per-position consensus on the selected backend.
pub fn bit_consensus(
    inputs: &[PackedBitVec],
    weights: Option<&[f64]>,
    threshold: Option<f64>,
) -> Result<PackedBitVec> {
    bit_consensus_with(backend::selected(), inputs, weights, threshold)
}

/// Per-position consensus.
///
/// - no weights, no threshold: strict majority, `count ≥ ⌊M/2⌋ + 1`
/// - no weights, threshold `t`: unit weights, `count ≥ t`
/// - weights `w`, threshold `t`: [`weighted_vote`](crate::votes::weighted_vote)
/// - weights `w`, no threshold: `Σ w_j · bit_j ≥ Σw / 2`
///
/// Every input and weight is validated before any counting starts.
pub fn bit_consensus_with(
    backend: &Backend,
    inputs: &[PackedBitVec],
    weights: Option<&[f64]>,
    threshold: Option<f64>,
) -> Result<PackedBitVec> {
    let shape = validate_inputs(inputs)?;

    match (weights, threshold) {
        (None, None) => {
            let mut counter = VoteCounter::new(*backend, shape.len, shape.word_count);
            for v in inputs {
                counter.accumulate(v)?;
            }
            counter.at_least(strict_majority(inputs.len()))
        }
        (None, Some(t)) => {
            let ones = vec![1.0; inputs.len()];
            votes::weighted_vote_with(backend, inputs, &ones, t)
        }
        (Some(w), t) => {
            votes::validate_weights(w, inputs.len(), t.unwrap_or(0.0))?;
            let t = t.unwrap_or_else(|| w.iter().sum::<f64>() / 2.0);
            votes::weighted_vote_with(backend, inputs, w, t)
        }
    }
}

// ============================================================================
// MATRIX CONSENSUS
// ============================================================================

/// R×C grid of consensus words; cell `(r, c)` covers word `r·C + c`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConsensusMatrix<const R: usize, const C: usize> {
    cells: [[u64; C]; R],
}

impl<const R: usize, const C: usize> ConsensusMatrix<R, C> {
    pub const ROWS: usize = R;
    pub const COLS: usize = C;

    pub fn zero() -> Self {
        Self { cells: [[0u64; C]; R] }
    }

    /// Word at `(row, col)`, or `None` outside the grid.
    pub fn get(&self, row: usize, col: usize) -> Option<u64> {
        self.cells.get(row).and_then(|r| r.get(col)).copied()
    }

    pub fn rows(&self) -> &[[u64; C]; R] {
        &self.cells
    }

    /// Cells in row-major order, i.e. by word index.
    pub fn iter_words(&self) -> impl Iterator<Item = u64> + '_ {
        self.cells.iter().flat_map(|row| row.iter().copied())
    }
}

impl<const R: usize, const C: usize> Default for ConsensusMatrix<R, C> {
    fn default() -> Self {
        Self::zero()
    }
}

// Nested JSON arrays; serde has no blanket impl for arbitrary const-size arrays.
impl<const R: usize, const C: usize> Serialize for ConsensusMatrix<R, C> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(self.cells.iter().map(|row| row.as_slice()))
    }
}

/// Matrix consensus on the selected backend.
///
/// Workers are capped by `BITCONSENSUS_WORKERS` when it is set, and use the
/// global rayon pool otherwise.
pub fn matrix_consensus<const R: usize, const C: usize>(
    inputs: &[PackedBitVec],
) -> Result<ConsensusMatrix<R, C>> {
    matrix_consensus_with(backend::selected(), inputs, config::env_max_workers())
}

/// Strict-majority consensus for each of the first `R·C` words.
///
/// Each grid row is one task: a [`VoteCounter`] on `backend` over the words
/// that row covers. Cells whose word index is at or past the input word
/// count stay zero.
///
/// `workers` caps the parallelism. `None` uses the global rayon pool and
/// `Some(1)` runs on the calling thread. `Some(n)` runs on `n` scoped
/// threads that have all exited by the time this returns.
pub fn matrix_consensus_with<const R: usize, const C: usize>(
    backend: &Backend,
    inputs: &[PackedBitVec],
    workers: Option<usize>,
) -> Result<ConsensusMatrix<R, C>> {
    let plan = RowPlan::new(backend, inputs, R * C, C)?;
    assemble(run_rows(plan.rows(), workers, |row| plan.count_row(row)))
}

/// Matrix consensus with every row task run on `pool`.
///
/// The pool outlives the call, so repeated calls reuse its threads.
#[cfg(feature = "parallel")]
pub fn matrix_consensus_in<const R: usize, const C: usize>(
    pool: &rayon::ThreadPool,
    backend: &Backend,
    inputs: &[PackedBitVec],
) -> Result<ConsensusMatrix<R, C>> {
    use rayon::prelude::*;

    let plan = RowPlan::new(backend, inputs, R * C, C)?;
    let rows: Vec<Result<Vec<u64>>> = pool.install(|| {
        (0..plan.rows())
            .into_par_iter()
            .map(|row| plan.count_row(row))
            .collect()
    });
    assemble(rows)
}

/// Validated inputs split into grid rows of `cols` words.
struct RowPlan<'a> {
    backend: Backend,
    inputs: &'a [PackedBitVec],
    len: usize,
    /// Words covered by the grid, at most the input word count
    cells: usize,
    cols: usize,
    threshold: u64,
}

impl<'a> RowPlan<'a> {
    fn new(backend: &Backend, inputs: &'a [PackedBitVec], grid: usize, cols: usize) -> Result<Self> {
        let shape = validate_inputs(inputs)?;
        Ok(Self {
            backend: *backend,
            inputs,
            len: shape.len,
            cells: grid.min(shape.word_count),
            cols,
            threshold: strict_majority(inputs.len()),
        })
    }

    fn rows(&self) -> usize {
        if self.cols == 0 {
            0
        } else {
            self.cells.div_ceil(self.cols)
        }
    }

    /// Consensus words `row·cols ..` up to the end of the grid.
    fn count_row(&self, row: usize) -> Result<Vec<u64>> {
        let start = row * self.cols;
        let end = (start + self.cols).min(self.cells);
        let row_len = self
            .len
            .saturating_sub(start * WORD_BITS)
            .min((end - start) * WORD_BITS);

        let mut counter = VoteCounter::new(self.backend, row_len, end - start);
        for v in self.inputs {
            counter.add_words(&v.words()[start..end]);
        }
        Ok(counter.at_least(self.threshold)?.words().to_vec())
    }
}

fn assemble<const R: usize, const C: usize>(
    rows: Vec<Result<Vec<u64>>>,
) -> Result<ConsensusMatrix<R, C>> {
    let mut matrix = ConsensusMatrix::zero();
    for (cells, words) in matrix.cells.iter_mut().zip(rows) {
        for (cell, word) in cells.iter_mut().zip(words?) {
            *cell = word;
        }
    }
    Ok(matrix)
}

#[cfg(feature = "parallel")]
fn run_rows<T, F>(rows: usize, workers: Option<usize>, row: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    use rayon::prelude::*;

    let par = || (0..rows).into_par_iter().map(&row).collect::<Vec<T>>();
    match workers {
        None => par(),
        Some(n) if n <= 1 || rows <= 1 => (0..rows).map(&row).collect(),
        Some(n) => {
            // The scope joins every worker before build_scoped returns.
            let scoped = rayon::ThreadPoolBuilder::new()
                .num_threads(n.min(rows))
                .build_scoped(|thread| thread.run(), |pool| pool.install(par));
            match scoped {
                Ok(out) => out,
                Err(e) => {
                    tracing::debug!(error = %e, workers = n, "worker pool unavailable, running inline");
                    (0..rows).map(&row).collect()
                }
            }
        }
    }
}

#[cfg(not(feature = "parallel"))]
fn run_rows<T, F>(rows: usize, _workers: Option<usize>, row: F) -> Vec<T>
where
    F: Fn(usize) -> T,
{
    (0..rows).map(row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn words(w: Vec<u64>) -> PackedBitVec {
        let len = w.len() * WORD_BITS;
        PackedBitVec::from_words(w, len).unwrap()
    }

    fn naive_counts(inputs: &[PackedBitVec]) -> Vec<u64> {
        (0..inputs[0].len())
            .map(|i| inputs.iter().filter(|v| v.get(i).unwrap()).count() as u64)
            .collect()
    }

    #[test]
    fn test_counter_matches_naive() {
        let mut rng = StdRng::seed_from_u64(7);
        let inputs: Vec<_> = (0..37).map(|_| PackedBitVec::random(300, &mut rng)).collect();

        let mut counter = VoteCounter::new(Backend::best_available(), 300, 5);
        for v in &inputs {
            counter.accumulate(v).unwrap();
        }
        assert_eq!(counter.inputs(), 37);
        assert!(counter.plane_count() <= 6);
        assert_eq!(counter.counts(), naive_counts(&inputs));
    }

    #[test]
    fn test_counts_past_u32_planes() {
        // 2^33 + 2^31 + 1 votes at position 0, 2^40 at position 65.
        let mut counter = VoteCounter::new(Backend::scalar(), 70, 2);
        counter.planes = vec![vec![0u64; 2]; 41];
        for k in [0, 31, 33] {
            counter.planes[k][0] = 1;
        }
        counter.planes[40][1] = 1 << 1;

        let counts = counter.counts();
        assert_eq!(counts[0], (1u64 << 33) + (1 << 31) + 1);
        assert_eq!(counts[65], 1u64 << 40);
        assert_eq!(counts[1], 0);
        assert_eq!(counter.at_least(1 << 33).unwrap().iter_ones().collect::<Vec<_>>(), vec![0, 65]);
    }

    #[test]
    fn test_at_least_word_exhaustive() {
        // One position per count value 0..=63 in a single word.
        let mut planes = [0u64; 6];
        for count in 0..64u64 {
            for (k, plane) in planes.iter_mut().enumerate() {
                if (count >> k) & 1 == 1 {
                    *plane |= 1 << count;
                }
            }
        }
        for t in 0..70u64 {
            let got = at_least_word(|k| planes.get(k).copied().unwrap_or(0), t);
            let want = (0..64u64)
                .filter(|&c| c >= t)
                .fold(0u64, |acc, c| acc | (1 << c));
            assert_eq!(got, want, "threshold {t}");
        }
    }

    #[test]
    fn test_at_least_large_threshold() {
        assert_eq!(at_least_word(|k| if k == 0 { !0 } else { 0 }, u64::MAX), 0);
        assert_eq!(at_least_word(|_| 0, 1 << 40), 0);
    }

    #[test]
    fn test_counter_rejects_shape_mismatch() {
        let mut counter = VoteCounter::new(Backend::scalar(), 10, 1);
        let err = counter.accumulate(&PackedBitVec::new_zero(11)).unwrap_err();
        assert!(matches!(err, ConsensusError::InvalidInput { .. }));
        assert_eq!(counter.inputs(), 0);
    }

    #[test]
    fn test_bit_consensus_strict_majority() {
        let b = Backend::scalar();
        let inputs = [
            PackedBitVec::from_bools(&[true, true, false, false]),
            PackedBitVec::from_bools(&[true, false, true, false]),
            PackedBitVec::from_bools(&[false, false, true, true]),
            PackedBitVec::from_bools(&[true, true, true, false]),
        ];
        // Counts [3, 2, 3, 1]; strict majority of four needs 3.
        let out = bit_consensus_with(&b, &inputs, None, None).unwrap();
        assert_eq!(out.to_bools(), vec![true, false, true, false]);

        let half = bit_consensus_with(&b, &inputs, None, Some(2.0)).unwrap();
        assert_eq!(half.to_bools(), vec![true, true, true, false]);
    }

    #[test]
    fn test_bit_consensus_weighted_default_threshold() {
        let b = Backend::scalar();
        let inputs = [
            PackedBitVec::from_bools(&[true, false, true]),
            PackedBitVec::from_bools(&[false, true, true]),
        ];
        // Σw = 4, default threshold 2; sums [1, 3, 4]
        let out = bit_consensus_with(&b, &inputs, Some(&[1.0, 3.0]), None).unwrap();
        assert_eq!(out.to_bools(), vec![false, true, true]);
    }

    #[test]
    fn test_bit_consensus_validation() {
        let b = Backend::scalar();
        let a = PackedBitVec::new_zero(8);
        assert!(bit_consensus_with(&b, &[], None, None).is_err());
        assert!(bit_consensus_with(&b, &[PackedBitVec::new_zero(0)], None, None).is_err());
        assert!(bit_consensus_with(&b, &[a.clone(), PackedBitVec::new_zero(9)], None, None).is_err());
        assert!(bit_consensus_with(&b, &[a.clone()], Some(&[-1.0]), None).is_err());
        assert!(bit_consensus_with(&b, &[a.clone()], None, Some(2.0)).is_err());
        assert!(bit_consensus_with(&b, &[a], Some(&[1.0, 1.0]), None).is_err());
    }

    #[test]
    fn test_matrix_strict_majority_of_four_is_zero() {
        let inputs = [
            words(vec![1, 0, 0, 0]),
            words(vec![1, 1, 0, 0]),
            words(vec![0, 1, 1, 0]),
            words(vec![0, 0, 1, 1]),
        ];
        let m = matrix_consensus::<2, 2>(&inputs).unwrap();
        assert_eq!(m, ConsensusMatrix::zero());
    }

    #[test]
    fn test_matrix_cells_past_input_are_zero() {
        let inputs = [words(vec![!0, 5]), words(vec![!0, 5]), words(vec![0, 4])];
        let m = matrix_consensus_with::<2, 2>(&Backend::scalar(), &inputs, Some(1)).unwrap();
        assert_eq!(m.rows(), &[[!0, 5], [0, 0]]);
        assert_eq!(m.get(0, 1), Some(5));
        assert_eq!(m.get(2, 0), None);
    }

    #[test]
    fn test_matrix_matches_bit_consensus() {
        let mut rng = StdRng::seed_from_u64(11);
        let inputs: Vec<_> = (0..9).map(|_| PackedBitVec::random(64 * 12 - 5, &mut rng)).collect();
        let flat = bit_consensus_with(&Backend::scalar(), &inputs, None, None).unwrap();

        for workers in [None, Some(1), Some(3)] {
            let m = matrix_consensus_with::<4, 4>(&Backend::scalar(), &inputs, workers).unwrap();
            for (idx, word) in m.iter_words().enumerate() {
                assert_eq!(word, flat.word(idx), "cell {idx}, workers {workers:?}");
            }
        }
    }

    #[test]
    fn test_matrix_rows_run_on_each_backend() {
        let mut rng = StdRng::seed_from_u64(23);
        // 3 full rows of 8 words plus a partial row ending in a tail word.
        let inputs: Vec<_> = (0..11).map(|_| PackedBitVec::random(64 * 27 - 9, &mut rng)).collect();
        let flat = bit_consensus_with(&Backend::scalar(), &inputs, None, None).unwrap();

        for d in backend::available_backends() {
            let b = Backend::for_kind(d.kind).unwrap();
            let m = matrix_consensus_with::<4, 8>(&b, &inputs, Some(2)).unwrap();
            for (idx, word) in m.iter_words().enumerate() {
                let want = if idx < flat.word_count() { flat.word(idx) } else { 0 };
                assert_eq!(word, want, "cell {idx} on {}", d.kind);
            }
        }
    }

    #[test]
    fn test_matrix_with_zero_columns_is_empty() {
        let inputs = [words(vec![1])];
        let m = matrix_consensus_with::<3, 0>(&Backend::scalar(), &inputs, None).unwrap();
        assert_eq!(m.iter_words().count(), 0);
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn test_matrix_in_dedicated_pool() {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let inputs = [words(vec![7, 1, 0]), words(vec![3, 1, 2]), words(vec![6, 0, 2])];
        let m = matrix_consensus_in::<2, 2>(&pool, &Backend::scalar(), &inputs).unwrap();
        assert_eq!(m.rows(), &[[7, 1], [2, 0]]);
    }

    #[test]
    fn test_matrix_serializes_as_nested_arrays() {
        let inputs = [words(vec![3, 1])];
        let m = matrix_consensus_with::<1, 2>(&Backend::scalar(), &inputs, Some(1)).unwrap();
        assert_eq!(serde_json::to_string(&m).unwrap(), "[[3,1]]");
    }

    #[test]
    fn test_vote_counts() {
        let inputs = [
            PackedBitVec::from_bools(&[true, false, true]),
            PackedBitVec::from_bools(&[true, true, false]),
        ];
        assert_eq!(vote_counts(&inputs).unwrap(), vec![2, 1, 1]);
    }
}

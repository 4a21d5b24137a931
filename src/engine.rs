//! Configured entry point bundling a resolved backend with engine settings.

#[cfg(feature = "parallel")]
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::backend::{Backend, BackendDescriptor, BackendKind};
use crate::bitvec::PackedBitVec;
use crate::config::EngineConfig;
use crate::consensus::{self, ConsensusMatrix};
use crate::error::Result;
use crate::kernel::{self, ReduceOp};
use crate::votes;

/// Result of a timed engine call.
#[derive(Clone, Debug, Serialize)]
pub struct ConsensusReport<T> {
    pub value: T,
    #[serde(serialize_with = "serialize_micros", rename = "elapsed_us")]
    pub elapsed: Duration,
    /// Input bits examined
    pub bits_processed: u64,
    pub backend: BackendKind,
}

fn serialize_micros<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_micros().min(u64::MAX as u128) as u64)
}

/// Consensus engine.
///
/// Unlike the free functions, which share the process-wide backend, each
/// engine holds its own backend and worker limits. With `max_workers` above
/// one the engine owns a rayon pool of that size, built once and shared by
/// clones, so matrix calls do not spawn threads.
///
/// ```rust
/// use bitconsensus::{ConsensusEngine, EngineConfig, PackedBitVec};
///
/// let engine = ConsensusEngine::new(EngineConfig::scalar_only());
/// let votes = [
///     PackedBitVec::from_bools(&[true, false, true]),
///     PackedBitVec::from_bools(&[true, true, false]),
///     PackedBitVec::from_bools(&[false, false, true]),
/// ];
/// let out = engine.bit_consensus(&votes, None, None).unwrap();
/// assert_eq!(out.to_bools(), vec![true, false, true]);
/// ```
#[derive(Clone, Debug)]
pub struct ConsensusEngine {
    config: EngineConfig,
    backend: Backend,
    #[cfg(feature = "parallel")]
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl Default for ConsensusEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl ConsensusEngine {
    pub fn new(config: EngineConfig) -> Self {
        let backend = Backend::resolve(config.backend);
        tracing::debug!(backend = %backend.kind(), ?config, "consensus engine ready");
        Self {
            #[cfg(feature = "parallel")]
            pool: worker_pool(config.max_workers),
            config,
            backend,
        }
    }

    /// Defaults overridden by `BITCONSENSUS_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(EngineConfig::from_env()?))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn describe_backend(&self) -> BackendDescriptor {
        self.backend.descriptor()
    }

    // ========================================================================
    // KERNEL
    // ========================================================================

    pub fn popcount(&self, x: &PackedBitVec) -> usize {
        kernel::popcount_with(&self.backend, x)
    }

    pub fn and(&self, x: &PackedBitVec, y: &PackedBitVec) -> Result<PackedBitVec> {
        kernel::bitwise_with(&self.backend, ReduceOp::And, x, y)
    }

    pub fn or(&self, x: &PackedBitVec, y: &PackedBitVec) -> Result<PackedBitVec> {
        kernel::bitwise_with(&self.backend, ReduceOp::Or, x, y)
    }

    pub fn xor(&self, x: &PackedBitVec, y: &PackedBitVec) -> Result<PackedBitVec> {
        kernel::bitwise_with(&self.backend, ReduceOp::Xor, x, y)
    }

    pub fn carry_propagate(&self, x: &PackedBitVec, initial_carry: bool) -> Result<PackedBitVec> {
        kernel::carry_propagate_with(&self.backend, x, initial_carry)
    }

    pub fn hamming_distance(&self, x: &PackedBitVec, y: &PackedBitVec) -> Result<usize> {
        kernel::hamming_distance_with(&self.backend, x, y)
    }

    pub fn reduce(&self, op: ReduceOp, inputs: &[PackedBitVec]) -> Result<PackedBitVec> {
        kernel::reduce_with(&self.backend, op, inputs)
    }

    // ========================================================================
    // VOTES
    // ========================================================================

    pub fn majority(&self, votes: &[bool]) -> Result<bool> {
        votes::majority_with(&self.backend, votes, self.config.small_vote_threshold)
    }

    pub fn majority_of(&self, pbv: &PackedBitVec) -> Result<bool> {
        votes::majority_of_with(&self.backend, pbv)
    }

    pub fn weighted_vote(
        &self,
        inputs: &[PackedBitVec],
        weights: &[f64],
        threshold: f64,
    ) -> Result<PackedBitVec> {
        votes::weighted_vote_with(&self.backend, inputs, weights, threshold)
    }

    // ========================================================================
    // CONSENSUS
    // ========================================================================

    pub fn bit_consensus(
        &self,
        inputs: &[PackedBitVec],
        weights: Option<&[f64]>,
        threshold: Option<f64>,
    ) -> Result<PackedBitVec> {
        consensus::bit_consensus_with(&self.backend, inputs, weights, threshold)
    }

    pub fn matrix_consensus<const R: usize, const C: usize>(
        &self,
        inputs: &[PackedBitVec],
    ) -> Result<ConsensusMatrix<R, C>> {
        #[cfg(feature = "parallel")]
        if let Some(pool) = &self.pool {
            return consensus::matrix_consensus_in(pool, &self.backend, inputs);
        }
        consensus::matrix_consensus_with(&self.backend, inputs, self.config.max_workers)
    }

    // ========================================================================
    // TIMED VARIANTS
    // ========================================================================

    pub fn majority_report(&self, votes: &[bool]) -> Result<ConsensusReport<bool>> {
        self.timed("majority", votes.len() as u64, || self.majority(votes))
    }

    pub fn bit_consensus_report(
        &self,
        inputs: &[PackedBitVec],
        weights: Option<&[f64]>,
        threshold: Option<f64>,
    ) -> Result<ConsensusReport<PackedBitVec>> {
        self.timed("bit_consensus", total_bits(inputs), || {
            self.bit_consensus(inputs, weights, threshold)
        })
    }

    pub fn matrix_consensus_report<const R: usize, const C: usize>(
        &self,
        inputs: &[PackedBitVec],
    ) -> Result<ConsensusReport<ConsensusMatrix<R, C>>> {
        self.timed("matrix_consensus", total_bits(inputs), || {
            self.matrix_consensus::<R, C>(inputs)
        })
    }

    fn timed<T>(
        &self,
        op: &'static str,
        bits_processed: u64,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<ConsensusReport<T>> {
        let start = Instant::now();
        let value = f()?;
        let elapsed = start.elapsed();
        tracing::trace!(op, bits_processed, elapsed_us = elapsed.as_micros() as u64, "consensus call");
        Ok(ConsensusReport {
            value,
            elapsed,
            bits_processed,
            backend: self.backend.kind(),
        })
    }
}

#[cfg(feature = "parallel")]
fn worker_pool(max_workers: Option<usize>) -> Option<Arc<rayon::ThreadPool>> {
    let n = max_workers.filter(|&n| n > 1)?;
    match rayon::ThreadPoolBuilder::new()
        .num_threads(n)
        .thread_name(|i| format!("bitconsensus-{i}"))
        .build()
    {
        Ok(pool) => Some(Arc::new(pool)),
        Err(e) => {
            tracing::warn!(error = %e, workers = n, "cannot build worker pool, matrix rows run inline");
            None
        }
    }
}

fn total_bits(inputs: &[PackedBitVec]) -> u64 {
    inputs.iter().map(|v| v.len() as u64).sum()
}

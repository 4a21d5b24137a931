//! bitconsensus - Packed Bitvector Consensus Kernel
//!
//! Copyright (c) 2025 Bitconsensus Contributors
//! Licensed under MIT License
//!
//! Data-parallel reductions over packed bitvectors (popcount, AND/OR/XOR,
//! word-serial carry propagation) and the majority-voting layer built on top
//! of them, with SIMD backends chosen once per process.
//!
//! # Quick Start
//!
//! ```
//! use bitconsensus::{bit_consensus, majority, popcount, PackedBitVec};
//!
//! let v = PackedBitVec::from_words(vec![0xAAAA_AAAA_AAAA_AAAA, 1], 128)?;
//! assert_eq!(popcount(&v), 33);
//!
//! assert!(majority(&[true, true, false, true, false])?);
//! assert!(!majority(&[true, true, false, false])?);
//!
//! let inputs = [
//!     PackedBitVec::from_bools(&[true, false, true]),
//!     PackedBitVec::from_bools(&[true, true, false]),
//!     PackedBitVec::from_bools(&[false, false, true]),
//! ];
//! let out = bit_consensus(&inputs, None, None)?;
//! assert_eq!(out.to_bools(), vec![true, false, true]);
//! # Ok::<(), bitconsensus::ConsensusError>(())
//! ```
//!
//! # Core Concepts
//!
//! ## Packed bitvectors
//!
//! Bit `i` lives in word `i / 64` at position `i % 64`. Every bit at or past
//! the bit length is zero (the tail invariant); constructors reject vectors
//! that break it and every kernel output is checked against it.
//!
//! ## Backends
//!
//! - **scalar**: reference kernels, always available
//! - **avx2**: 4 × u64 lanes
//! - **wide**: 8 × u64 lanes, AVX-512 (`avx512` feature)
//!
//! `BITCONSENSUS_BACKEND=scalar` forces the reference path.
//!
//! # Modules
//!
//! - [`bitvec`]: the packed bitvector type
//! - [`kernel`]: popcount, bitwise ops, carry propagation, folds
//! - [`votes`]: packing, strict majority, weighted vote
//! - [`consensus`]: bit-sliced per-position and matrix consensus
//! - [`backend`]: capability detection and dispatch
//! - [`engine`]: configured facade with timed reports
//! - [`config`], [`error`], [`cli`]

pub mod backend;
pub mod bitvec;
pub mod cli;
pub mod config;
pub mod consensus;
pub mod engine;
pub mod error;
pub mod kernel;
pub mod votes;

// Re-export main types for convenience
pub use backend::{available_backends, describe_backend, Backend, BackendDescriptor, BackendKind};
pub use bitvec::{PackedBitVec, WORD_BITS};
pub use config::{BackendPreference, EngineConfig};
pub use consensus::{
    bit_consensus, matrix_consensus, vote_counts, ConsensusMatrix, VoteCounter,
};
pub use engine::{ConsensusEngine, ConsensusReport};
pub use error::{ConsensusError, Result};
pub use kernel::{
    and, carry_propagate, equal, hamming_distance, or, popcount, reduce, xor, ReduceOp,
};
pub use votes::{majority, majority_of, pack, unpack, weighted_vote};

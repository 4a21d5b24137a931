//! Backend selection for the reduction kernel.
//!
//! The CPU is probed once; the chosen backend is a `Copy` record of function
//! pointers, so hot loops call through the table and never re-check
//! capability.
//!
//! ```text
//! kernel / votes / consensus
//!   │
//!   └── Backend (fn-pointer table, resolved once)
//!         ├── Wide    8×u64  AVX-512F + VPOPCNTDQ   (feature = "avx512")
//!         ├── Avx2    4×u64  AVX2
//!         └── Scalar  1×u64  reference, always available
//! ```
//!
//! Accelerated entries refuse inputs shorter than one lane group. The
//! selector catches that refusal, logs it at debug level and reruns the call
//! on the scalar kernels, so callers never observe `BackendUnavailable`.

use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::config::{BackendPreference, EngineConfig};
use crate::error::{ConsensusError, Result};
use crate::kernel::{scalar, KernelTable, ReduceOp};

/// Concrete kernel implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Scalar,
    Avx2,
    Wide,
}

impl BackendKind {
    /// Every kind, widest first.
    pub const ALL: [BackendKind; 3] = [BackendKind::Wide, BackendKind::Avx2, BackendKind::Scalar];

    /// u64 words processed per instruction.
    pub const fn lane_width(self) -> usize {
        match self {
            BackendKind::Scalar => 1,
            BackendKind::Avx2 => 4,
            BackendKind::Wide => 8,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            BackendKind::Scalar => "scalar",
            BackendKind::Avx2 => "avx2",
            BackendKind::Wide => "wide",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of a backend's capabilities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub kind: BackendKind,
    pub lane_width: usize,
    pub alignment_required: bool,
    pub has_hardware_popcount: bool,
    pub fallback_available: bool,
}

/// A resolved kernel backend.
#[derive(Clone, Copy)]
pub struct Backend {
    descriptor: BackendDescriptor,
    table: KernelTable,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl Backend {
    /// The scalar reference backend.
    pub fn scalar() -> Self {
        Self::from_table(BackendKind::Scalar, scalar::TABLE)
    }

    /// Build a specific backend, failing if this CPU or build cannot run it.
    pub fn for_kind(kind: BackendKind) -> Result<Self> {
        match kind {
            BackendKind::Scalar => Ok(Self::scalar()),
            BackendKind::Avx2 => avx2_table()
                .map(|t| Self::from_table(kind, t))
                .ok_or(ConsensusError::BackendUnavailable {
                    backend: kind,
                    reason: "cpu lacks avx2",
                }),
            BackendKind::Wide => wide_table().map(|t| Self::from_table(kind, t)),
        }
    }

    /// Widest backend this CPU supports.
    pub fn best_available() -> Self {
        BackendKind::ALL
            .iter()
            .find_map(|&kind| Self::for_kind(kind).ok())
            .unwrap_or_else(Self::scalar)
    }

    /// Honour a preference, degrading to the best available backend when the
    /// requested one cannot run here.
    pub fn resolve(preference: BackendPreference) -> Self {
        let Some(kind) = preference.kind() else {
            return Self::best_available();
        };
        match Self::for_kind(kind) {
            Ok(backend) => backend,
            Err(e) => {
                let fallback = Self::best_available();
                tracing::info!(
                    requested = %kind,
                    using = %fallback.kind(),
                    error = %e,
                    "requested backend unavailable"
                );
                fallback
            }
        }
    }

    fn from_table(kind: BackendKind, table: KernelTable) -> Self {
        Self {
            descriptor: BackendDescriptor {
                kind,
                lane_width: kind.lane_width(),
                alignment_required: false,
                has_hardware_popcount: has_hardware_popcount(),
                fallback_available: true,
            },
            table,
        }
    }

    #[inline]
    pub fn kind(&self) -> BackendKind {
        self.descriptor.kind
    }

    #[inline]
    pub fn descriptor(&self) -> BackendDescriptor {
        self.descriptor
    }

    // ========================================================================
    // DISPATCH WITH SCALAR RETRY
    // ========================================================================

    #[inline]
    pub(crate) fn popcount_words(&self, words: &[u64]) -> u64 {
        match (self.table.popcount)(words) {
            Ok(n) => n,
            Err(e) => {
                self.log_fallback("popcount", &e);
                scalar::popcount(words)
            }
        }
    }

    #[inline]
    pub(crate) fn binary_words(&self, op: ReduceOp, a: &[u64], b: &[u64], out: &mut [u64]) {
        let kernel = match op {
            ReduceOp::And => self.table.and,
            ReduceOp::Or => self.table.or,
            ReduceOp::Xor => self.table.xor,
        };
        if let Err(e) = kernel(a, b, out) {
            self.log_fallback("bitwise", &e);
            match op {
                ReduceOp::And => scalar::and(a, b, out),
                ReduceOp::Or => scalar::or(a, b, out),
                ReduceOp::Xor => scalar::xor(a, b, out),
            }
        }
    }

    #[inline]
    pub(crate) fn carry_words(&self, src: &[u64], carry_in: u64, out: &mut [u64]) -> u64 {
        match (self.table.carry)(src, carry_in, out) {
            Ok(c) => c,
            Err(e) => {
                self.log_fallback("carry_propagate", &e);
                scalar::carry_propagate(src, carry_in, out)
            }
        }
    }

    fn log_fallback(&self, op: &'static str, e: &ConsensusError) {
        debug_assert!(e.is_recoverable(), "kernel returned a non-recoverable error: {e}");
        tracing::debug!(backend = %self.kind(), op, error = %e, "falling back to scalar kernel");
    }
}

// ============================================================================
// DETECTION
// ============================================================================

#[cfg(target_arch = "x86_64")]
fn avx2_table() -> Option<KernelTable> {
    crate::kernel::avx2::table()
}

#[cfg(not(target_arch = "x86_64"))]
fn avx2_table() -> Option<KernelTable> {
    None
}

#[cfg(all(target_arch = "x86_64", feature = "avx512"))]
fn wide_table() -> Result<KernelTable> {
    crate::kernel::avx512::table().ok_or(ConsensusError::BackendUnavailable {
        backend: BackendKind::Wide,
        reason: "cpu lacks avx512f/avx512vpopcntdq",
    })
}

#[cfg(not(all(target_arch = "x86_64", feature = "avx512")))]
fn wide_table() -> Result<KernelTable> {
    Err(ConsensusError::BackendUnavailable {
        backend: BackendKind::Wide,
        reason: "built without the avx512 feature",
    })
}

#[cfg(target_arch = "x86_64")]
fn has_hardware_popcount() -> bool {
    is_x86_feature_detected!("popcnt")
}

// CNT is part of the base aarch64 SIMD set.
#[cfg(target_arch = "aarch64")]
fn has_hardware_popcount() -> bool {
    true
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn has_hardware_popcount() -> bool {
    false
}

/// Descriptors of every backend this process can run, widest first.
pub fn available_backends() -> Vec<BackendDescriptor> {
    BackendKind::ALL
        .iter()
        .filter_map(|&kind| Backend::for_kind(kind).ok())
        .map(|b| b.descriptor())
        .collect()
}

static SELECTED: OnceLock<Backend> = OnceLock::new();

/// Process-wide backend, resolved on first use from `BITCONSENSUS_BACKEND`
/// (default: widest available).
pub fn selected() -> &'static Backend {
    SELECTED.get_or_init(|| {
        let preference = match EngineConfig::default().with_env() {
            Ok(config) => config.backend,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed backend environment");
                BackendPreference::Auto
            }
        };
        let backend = Backend::resolve(preference);
        tracing::info!(backend = %backend.kind(), ?preference, "consensus backend selected");
        backend
    })
}

/// Descriptor of the process-wide backend.
pub fn describe_backend() -> BackendDescriptor {
    selected().descriptor()
}

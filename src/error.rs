//! Error kinds for the consensus kernel.
//!
//! `InvalidInput` and `OutOfRange` surface to the caller unchanged.
//! `BackendUnavailable` is produced by accelerated kernels and by explicit
//! backend construction; the backend selector recovers from it locally, so the
//! reduction entry points never return it. `Internal` flags a broken contract
//! (for example a dirty tail on an output vector) and is a bug.

use std::fmt;
use std::io;

use crate::backend::BackendKind;

/// Errors from the consensus kernel and its surrounding configuration layer.
#[derive(Debug)]
pub enum ConsensusError {
    /// Empty input, length mismatch, weight or threshold out of domain.
    InvalidInput { reason: String },
    /// Bit index outside `[0, len)`.
    OutOfRange { index: usize, len: usize },
    /// An accelerated path cannot run this call (capability absent or input
    /// shorter than one lane group).
    BackendUnavailable {
        backend: BackendKind,
        reason: &'static str,
    },
    /// Contract violation detected after the fact.
    Internal { reason: String },
    /// Malformed configuration value.
    Config { reason: String },
    /// I/O failure while loading configuration or CLI input.
    Io(io::Error),
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

impl ConsensusError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        ConsensusError::InvalidInput {
            reason: reason.into(),
        }
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        ConsensusError::Config {
            reason: reason.into(),
        }
    }

    /// Whether the selector can recover from this error by running the
    /// scalar path instead.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ConsensusError::BackendUnavailable { .. })
    }
}

impl fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusError::InvalidInput { reason } => write!(f, "invalid input: {reason}"),
            ConsensusError::OutOfRange { index, len } => {
                write!(f, "bit index {index} out of range for length {len}")
            }
            ConsensusError::BackendUnavailable { backend, reason } => {
                write!(f, "{backend} backend unavailable: {reason}")
            }
            ConsensusError::Internal { reason } => write!(f, "internal error: {reason}"),
            ConsensusError::Config { reason } => write!(f, "configuration error: {reason}"),
            ConsensusError::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for ConsensusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConsensusError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConsensusError {
    fn from(e: io::Error) -> Self {
        ConsensusError::Io(e)
    }
}

/// Report a broken output contract.
///
/// Debug builds abort after logging; release builds hand back an opaque
/// `Internal` error so the caller never sees a partial result.
pub(crate) fn internal(reason: String) -> ConsensusError {
    tracing::error!(%reason, "consensus kernel contract violated");
    if cfg!(debug_assertions) {
        panic!("consensus kernel contract violated: {reason}");
    }
    ConsensusError::Internal { reason }
}

//! Engine configuration.
//!
//! Defaults need no setup. Two environment variables override them:
//!
//! - `BITCONSENSUS_BACKEND` = `auto` | `scalar` | `avx2` | `wide`
//!   (`scalar` forces the reference kernels, e.g. for testing)
//! - `BITCONSENSUS_WORKERS` = positive integer, caps matrix-consensus workers
//!   for engines built from the environment and for the free
//!   [`matrix_consensus`](crate::consensus::matrix_consensus)
//!
//! The same struct loads from JSON for the CLI.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::error::{ConsensusError, Result};

pub const ENV_BACKEND: &str = "BITCONSENSUS_BACKEND";
pub const ENV_WORKERS: &str = "BITCONSENSUS_WORKERS";

/// Below this many votes, majority counts booleans directly instead of
/// packing them.
pub const DEFAULT_SMALL_VOTE_THRESHOLD: usize = 1000;

/// Which backend the engine should use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Widest backend the CPU supports.
    #[default]
    Auto,
    Scalar,
    Avx2,
    Wide,
}

impl BackendPreference {
    /// Concrete kind, or `None` for `Auto`.
    pub fn kind(self) -> Option<BackendKind> {
        match self {
            BackendPreference::Auto => None,
            BackendPreference::Scalar => Some(BackendKind::Scalar),
            BackendPreference::Avx2 => Some(BackendKind::Avx2),
            BackendPreference::Wide => Some(BackendKind::Wide),
        }
    }
}

impl From<BackendKind> for BackendPreference {
    fn from(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Scalar => BackendPreference::Scalar,
            BackendKind::Avx2 => BackendPreference::Avx2,
            BackendKind::Wide => BackendPreference::Wide,
        }
    }
}

impl FromStr for BackendPreference {
    type Err = ConsensusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(BackendPreference::Auto),
            "scalar" => Ok(BackendPreference::Scalar),
            "avx2" => Ok(BackendPreference::Avx2),
            "wide" | "avx512" => Ok(BackendPreference::Wide),
            other => Err(ConsensusError::config(format!(
                "unknown backend '{other}' (expected auto, scalar, avx2 or wide)"
            ))),
        }
    }
}

impl fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(kind) => fmt::Display::fmt(&kind, f),
            None => f.write_str("auto"),
        }
    }
}

/// Runtime knobs for [`ConsensusEngine`](crate::engine::ConsensusEngine).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Kernel backend preference
    pub backend: BackendPreference,
    /// Vote sequences shorter than this are counted without packing
    pub small_vote_threshold: usize,
    /// Upper bound on matrix-consensus workers; `None` uses every core,
    /// `Some(1)` runs on the calling thread
    pub max_workers: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            backend: BackendPreference::Auto,
            small_vote_threshold: DEFAULT_SMALL_VOTE_THRESHOLD,
            max_workers: None,
        }
    }
}

impl EngineConfig {
    /// Reference kernels only.
    pub fn scalar_only() -> Self {
        EngineConfig {
            backend: BackendPreference::Scalar,
            ..Self::default()
        }
    }

    /// Everything on the calling thread.
    pub fn sequential() -> Self {
        EngineConfig {
            max_workers: Some(1),
            ..Self::default()
        }
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env()
    }

    /// Apply `BITCONSENSUS_*` overrides from the process environment.
    pub fn with_env(self) -> Result<Self> {
        self.with_vars(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn with_vars<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_BACKEND) {
            self.backend = value.parse()?;
        }
        if let Some(value) = lookup(ENV_WORKERS) {
            self.max_workers = Some(parse_workers(&value)?);
        }
        self.validate()?;
        Ok(self)
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&text).map_err(|e| {
            ConsensusError::config(format!("{}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ConsensusError::config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == Some(0) {
            return Err(ConsensusError::config("max_workers must be at least 1"));
        }
        Ok(())
    }
}

fn parse_workers(value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConsensusError::config(format!(
            "{ENV_WORKERS} must be a positive integer, got '{value}'"
        ))),
    }
}

static ENV_MAX_WORKERS: OnceLock<Option<usize>> = OnceLock::new();

/// Process-wide worker cap from `BITCONSENSUS_WORKERS`, read on first use.
pub fn env_max_workers() -> Option<usize> {
    *ENV_MAX_WORKERS.get_or_init(|| max_workers_from(|key| std::env::var(key).ok()))
}

/// A malformed value is logged and ignored, leaving the cap unset.
fn max_workers_from<F>(lookup: F) -> Option<usize>
where
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(ENV_WORKERS)?;
    match parse_workers(&value) {
        Ok(n) => Some(n),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring malformed worker environment");
            None
        }
    }
}

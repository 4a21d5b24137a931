//! CLI interface for bitconsensus
//!
//! Provides command-line access to:
//! - Backend detection and configuration
//! - Popcount over vectors read from JSON
//! - Majority over a literal vote string
//! - Bit and matrix consensus over vectors read from JSON

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;

use crate::backend::available_backends;
use crate::bitvec::PackedBitVec;
use crate::config::{BackendPreference, EngineConfig};
use crate::engine::ConsensusEngine;
use crate::error::{ConsensusError, Result};

/// Matrix dimensions used by `consensus`.
const MATRIX_ROWS: usize = 8;
const MATRIX_COLS: usize = 8;

#[derive(Parser)]
#[command(name = "bitconsensus")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "SIMD packed-bitvector consensus kernel")]
#[command(
    long_about = "bitconsensus - popcount, bitwise reductions and majority voting over packed bitvectors\n\n\
    Vectors are read from JSON files holding an array of objects:\n\
      [{ \"bit_len\": 128, \"words\": [12297829382473034410, 1] }, ...]\n\
    Bit i lives in word i / 64 at position i % 64 (little-endian).\n\n\
    The kernel backend (scalar, avx2, wide) is detected once at startup and can be\n\
    forced with --backend or BITCONSENSUS_BACKEND.\n\n\
    Examples:\n\
      bitconsensus backend --json\n\
      bitconsensus majority --votes 11010\n\
      bitconsensus consensus -i votes.json --weights 1,2,1 --threshold 2\n\
      bitconsensus --backend scalar popcount -i vectors.json"
)]
#[command(author = "Bitconsensus Contributors")]
pub struct Cli {
    /// JSON engine configuration file
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Kernel backend: auto, scalar, avx2 or wide
    #[arg(long, global = true, value_name = "BACKEND")]
    pub backend: Option<BackendPreference>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the selected kernel backend
    #[command(
        long_about = "Show the selected kernel backend\n\n\
        Prints the descriptor of the backend the engine resolved from the configuration\n\
        and CPU capabilities, followed by every backend this process could run.\n\n\
        Example:\n\
          bitconsensus backend\n\
          bitconsensus --backend avx2 backend --json"
    )]
    Backend {
        /// Print descriptors as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective engine configuration as JSON
    Config,

    /// Count set bits in each vector of a JSON file
    Popcount {
        /// JSON array of packed bitvectors
        #[arg(short, long, value_name = "FILE", help_heading = "Required")]
        input: PathBuf,
    },

    /// Strict majority over a vote string such as 11010
    #[command(
        long_about = "Strict majority over a vote string\n\n\
        Each '1' is a yes vote and each '0' a no vote; '_', ',' and whitespace are ignored.\n\
        The result is true only when more than half the votes are yes, so ties are false.\n\n\
        Example:\n\
          bitconsensus majority --votes 11010     # true\n\
          bitconsensus majority --votes 1100      # false"
    )]
    Majority {
        /// Vote string of 0s and 1s
        #[arg(long, value_name = "BITS")]
        votes: String,

        /// Print a timed report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Per-bit and 8×8 matrix consensus over a JSON file of vectors
    #[command(
        long_about = "Per-bit and matrix consensus over a JSON file of vectors\n\n\
        All vectors must share the same bit length. Without weights or a threshold each\n\
        output bit is set when a strict majority of inputs set it. With weights, a bit is\n\
        set when the summed weight of inputs setting it reaches the threshold (default:\n\
        half the total weight).\n\n\
        The matrix view lays the first 64 words out as an 8×8 grid of strict-majority words.\n\n\
        Example:\n\
          bitconsensus consensus -i votes.json\n\
          bitconsensus consensus -i votes.json --weights 0.5,1,2 --threshold 1.5 --json"
    )]
    Consensus {
        /// JSON array of packed bitvectors
        #[arg(short, long, value_name = "FILE", help_heading = "Required")]
        input: PathBuf,

        /// Comma-separated weight per input vector
        #[arg(long, value_delimiter = ',', value_name = "W,...")]
        weights: Option<Vec<f64>>,

        /// Minimum summed weight for an output bit to be set
        #[arg(long, value_name = "T")]
        threshold: Option<f64>,

        /// Print timed reports as JSON
        #[arg(long)]
        json: bool,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    }
    .with_env()?;
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }

    let engine = ConsensusEngine::new(config);

    match cli.command {
        Commands::Backend { json } => {
            let selected = engine.describe_backend();
            let available = available_backends();
            if json {
                #[derive(Serialize)]
                struct BackendInfo<T> {
                    selected: T,
                    available: Vec<T>,
                }
                print_json(&BackendInfo { selected, available })?;
            } else {
                println!("Selected backend: {}", selected.kind);
                println!("  lane width:         {} × u64", selected.lane_width);
                println!("  hardware popcount:  {}", selected.has_hardware_popcount);
                println!("  alignment required: {}", selected.alignment_required);
                println!("  scalar fallback:    {}", selected.fallback_available);
                let names: Vec<_> = available.iter().map(|d| d.kind.as_str()).collect();
                println!("Available: {}", names.join(", "));
            }
            Ok(())
        }

        Commands::Config => print_json(engine.config()),

        Commands::Popcount { input } => {
            let vectors = load_vectors(&input)?;
            for (i, v) in vectors.iter().enumerate() {
                println!("{i}: {} / {}", engine.popcount(v), v.len());
            }
            Ok(())
        }

        Commands::Majority { votes, json } => {
            let votes = parse_votes(&votes)?;
            if json {
                print_json(&engine.majority_report(&votes)?)
            } else {
                println!("{}", engine.majority(&votes)?);
                Ok(())
            }
        }

        Commands::Consensus {
            input,
            weights,
            threshold,
            json,
        } => {
            let vectors = load_vectors(&input)?;
            let bits = engine.bit_consensus_report(&vectors, weights.as_deref(), threshold)?;
            let matrix = engine.matrix_consensus_report::<MATRIX_ROWS, MATRIX_COLS>(&vectors)?;

            if json {
                #[derive(Serialize)]
                struct ConsensusOutput<A, B> {
                    bit_consensus: A,
                    matrix_consensus: B,
                }
                return print_json(&ConsensusOutput {
                    bit_consensus: bits,
                    matrix_consensus: matrix,
                });
            }

            println!("Inputs: {} × {} bits", vectors.len(), bits.value.len());
            println!("Consensus: {}", bit_string(&bits.value));
            println!("Set bits:  {}", engine.popcount(&bits.value));
            println!("Matrix ({MATRIX_ROWS}×{MATRIX_COLS}, strict majority):");
            for row in matrix.value.rows() {
                let cells: Vec<String> = row.iter().map(|w| format!("{w:016x}")).collect();
                println!("  {}", cells.join(" "));
            }
            println!(
                "Backend: {}  ({} µs + {} µs)",
                bits.backend,
                bits.elapsed.as_micros(),
                matrix.elapsed.as_micros()
            );
            Ok(())
        }
    }
}

#[cfg(feature = "logging")]
fn init_logging(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // A subscriber may already be installed when embedded in another binary.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(not(feature = "logging"))]
fn init_logging(_verbose: u8) {}

fn load_vectors(path: &Path) -> Result<Vec<PackedBitVec>> {
    let reader = BufReader::new(File::open(path)?);
    serde_json::from_reader(reader)
        .map_err(|e| ConsensusError::invalid(format!("{}: {e}", path.display())))
}

fn parse_votes(s: &str) -> Result<Vec<bool>> {
    s.chars()
        .filter(|c| !(c.is_whitespace() || *c == '_' || *c == ','))
        .map(|c| match c {
            '1' => Ok(true),
            '0' => Ok(false),
            other => Err(ConsensusError::invalid(format!(
                "vote string may only contain 0 and 1, found '{other}'"
            ))),
        })
        .collect()
}

fn bit_string(v: &PackedBitVec) -> String {
    v.to_bools().iter().map(|&b| if b { '1' } else { '0' }).collect()
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| ConsensusError::invalid(format!("cannot serialize output: {e}")))?;
    println!("{text}");
    Ok(())
}

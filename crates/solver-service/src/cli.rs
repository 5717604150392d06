//! Command-line interface definitions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "solver-orchestrator")]
#[command(about = "Races optimization solvers and returns the verified best answer", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
	/// Path to configuration file (TOML, JSON or YAML)
	#[arg(short, long, global = true, env = "SOLVER_CONFIG")]
	pub config: Option<PathBuf>,

	/// Log level override (trace, debug, info, warn, error)
	#[arg(short, long, global = true)]
	pub log_level: Option<String>,

	/// Emit logs as JSON lines
	#[arg(long, global = true)]
	pub json_logs: bool,

	#[command(subcommand)]
	pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
	/// Solve a model and print the race result as JSON
	Solve(SolveArgs),

	/// Validate the configuration file
	Validate,

	/// List the configured solvers with their classes and learned history
	Solvers,
}

#[derive(clap::Args, Debug)]
pub struct SolveArgs {
	/// Model file (.json or .toml)
	pub model: PathBuf,

	/// Global deadline for the whole request in milliseconds
	#[arg(long)]
	pub max_wall_time_ms: Option<u64>,

	/// Number of solvers raced in parallel
	#[arg(long)]
	pub max_candidates: Option<usize>,

	/// Relative objective tolerance for cross-validation
	#[arg(long)]
	pub tolerance: Option<f64>,

	/// Pretty-print the result
	#[arg(long)]
	pub pretty: bool,
}

//! Configuration types for the orchestrator.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Complete orchestrator configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorConfig {
	/// Race budgets and verification tolerances
	pub engine: EngineSettings,
	/// Shortlist scoring weights
	pub selector: SelectorSettings,
	/// Performance history settings
	pub tuner: TunerSettings,
	/// Where performance history is kept
	pub storage: StorageSettings,
	/// Preprocessing settings
	pub presolve: PresolveSettings,
	/// Solver catalog, keyed by solver id
	pub solvers: BTreeMap<String, SolverEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineSettings {
	/// Log level used when RUST_LOG is unset
	pub log_level: String,
	/// Default global deadline of a race
	pub max_wall_time_ms: u64,
	/// Default shortlist size
	pub max_candidates: usize,
	/// Relative objective agreement tolerance (tau)
	pub tolerance: f64,
	/// Constraint feasibility tolerance (epsilon)
	pub epsilon: f64,
	/// Multiplier applied to a solver's historical estimate to get its deadline
	pub safety_margin: f64,
	/// How long a stopped worker may take to acknowledge cancellation
	pub grace_period_ms: u64,
}

impl Default for EngineSettings {
	fn default() -> Self {
		Self {
			log_level: "info".to_string(),
			max_wall_time_ms: 30_000,
			max_candidates: 3,
			tolerance: 1e-4,
			epsilon: 1e-6,
			safety_margin: 3.0,
			grace_period_ms: 250,
		}
	}
}

impl EngineSettings {
	pub fn max_wall_time(&self) -> Duration {
		Duration::from_millis(self.max_wall_time_ms)
	}

	pub fn grace_period(&self) -> Duration {
		Duration::from_millis(self.grace_period_ms)
	}
}

/// Weights of the three selector score components.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SelectorSettings {
	pub capability_weight: f64,
	pub success_weight: f64,
	pub speed_weight: f64,
}

impl Default for SelectorSettings {
	fn default() -> Self {
		Self {
			capability_weight: 0.5,
			success_weight: 0.3,
			speed_weight: 0.2,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TunerSettings {
	/// EMA decay factor
	pub alpha: f64,
}

impl Default for TunerSettings {
	fn default() -> Self {
		Self { alpha: 0.2 }
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
	/// History is lost when the process exits
	#[default]
	Memory,
	/// History is written through to `path`
	File,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageSettings {
	pub backend: StorageBackend,
	pub path: PathBuf,
}

impl Default for StorageSettings {
	fn default() -> Self {
		Self {
			backend: StorageBackend::Memory,
			path: PathBuf::from("./data/performance"),
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PresolveSettings {
	pub enabled: bool,
	pub max_passes: usize,
	pub tolerance: f64,
}

impl Default for PresolveSettings {
	fn default() -> Self {
		Self {
			enabled: true,
			max_passes: 10,
			tolerance: 1e-9,
		}
	}
}

/// One `[solvers.<id>]` table.
///
/// Unset fields fall back to what the implementation declares for itself.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SolverEntry {
	/// Adapter implementation name, e.g. `microlp`
	#[serde(rename = "type")]
	pub implementation: String,
	#[serde(default = "default_enabled")]
	pub enabled: bool,
	/// Whether the solver can certify optimality
	pub exact: Option<bool>,
	/// Suitability per model class name, in `0..=1`
	pub classes: Option<BTreeMap<String, f64>>,
	/// Prior seconds per thousand nonzeros
	pub nominal_rate: Option<f64>,
	pub strengths: Option<Vec<String>>,
	/// Default run parameters, merged over the implementation's own
	#[serde(default)]
	pub parameters: toml::Table,
	/// Adapter construction config
	#[serde(default = "default_adapter_config")]
	pub config: toml::Value,
}

fn default_enabled() -> bool {
	true
}

fn default_adapter_config() -> toml::Value {
	toml::Value::Table(toml::Table::new())
}

impl OrchestratorConfig {
	/// Enabled solver entries in id order.
	pub fn enabled_solvers(&self) -> impl Iterator<Item = (&String, &SolverEntry)> {
		self.solvers.iter().filter(|(_, entry)| entry.enabled)
	}
}

//! Solver catalog entries.

use crate::model::{ModelClass, OptimizationModel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Named solver parameters, passed verbatim to the backend adapter.
pub type ParameterSet = toml::Table;

/// Registry-wide identifier of a solver entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SolverId(String);

impl SolverId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for SolverId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for SolverId {
	fn from(s: &str) -> Self {
		Self(s.to_string())
	}
}

/// Static description of one registered solver backend.
///
/// Owned by the registry and handed out as read-only copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverDescriptor {
	pub id: SolverId,
	/// Adapter implementation name (e.g. `microlp`, `local-search`).
	pub implementation: String,
	/// Suitability score in `[0, 1]` per supported class. Absent = unsupported.
	pub suitability: BTreeMap<ModelClass, f64>,
	/// Whether an `Optimal` status from this solver is a certificate of optimality.
	pub exact: bool,
	#[serde(default)]
	pub default_parameters: ParameterSet,
	/// Prior solve-time estimate in seconds per thousand nonzeros, used until
	/// the performance history has data for this solver.
	pub nominal_rate: f64,
	#[serde(default)]
	pub strengths: Vec<String>,
}

impl SolverDescriptor {
	pub fn supports(&self, class: ModelClass) -> bool {
		self.suitability.contains_key(&class)
	}

	pub fn suitability(&self, class: ModelClass) -> Option<f64> {
		self.suitability.get(&class).copied()
	}

	/// Solve-time guess for `model` before any history exists.
	pub fn prior_estimate(&self, model: &OptimizationModel) -> Duration {
		let size = (model.nonzeros().max(model.num_variables()) as f64 / 1000.0).max(1.0);
		Duration::from_secs_f64((self.nominal_rate * size).max(0.0))
	}
}

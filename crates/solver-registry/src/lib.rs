//! Solver registry for the orchestration engine.
//!
//! The registry is the catalog of solver backends. Every entry pairs a
//! [`SolverDescriptor`] (what the backend is good at) with a factory that
//! builds fresh [`SolverAdapter`] instances, so each race worker owns its own
//! adapter and no backend state leaks between concurrent runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use solver_types::{
	CancelToken, ConfigSchema, ModelClass, OptimizationModel, ParameterSet, SolverDescriptor,
	SolverId,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub mod implementations {
	pub mod command;
	pub mod local_search;
	pub mod microlp;
}

/// Errors reported by a backend adapter for a single run.
#[derive(Debug, Error)]
pub enum AdapterError {
	/// The backend cannot handle this model.
	#[error("Unsupported model: {0}")]
	Unsupported(String),
	/// The adapter's construction config is invalid.
	#[error("Invalid adapter config: {0}")]
	InvalidConfig(String),
	/// The parameter set handed to `solve` is invalid.
	#[error("Invalid parameters: {0}")]
	InvalidParameters(String),
	/// The backend ran but produced no usable answer.
	#[error("No solution: {0}")]
	NoSolution(String),
	/// The backend stopped on cancellation without an incumbent.
	#[error("Interrupted before a solution was found")]
	Interrupted,
	/// Internal backend failure.
	#[error("Backend error: {0}")]
	Backend(String),
}

/// Errors raised while building or querying the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
	#[error("Solver '{0}' is already registered")]
	DuplicateSolver(SolverId),
	#[error("Unknown solver: {0}")]
	UnknownSolver(SolverId),
	#[error("Unknown solver implementation: {0}")]
	UnknownImplementation(String),
	#[error("Invalid configuration for solver '{solver}': {message}")]
	InvalidConfig { solver: SolverId, message: String },
}

/// Status a backend reports for a completed solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
	Optimal,
	Feasible,
	Infeasible,
	Unbounded,
}

/// What a backend returns when `solve` completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveOutcome {
	pub status: OutcomeStatus,
	#[serde(default)]
	pub objective: Option<f64>,
	#[serde(default)]
	pub values: Option<Vec<f64>>,
	#[serde(default)]
	pub gap: Option<f64>,
	#[serde(default)]
	pub message: String,
}

impl SolveOutcome {
	pub fn solution(status: OutcomeStatus, objective: f64, values: Vec<f64>) -> Self {
		Self {
			status,
			objective: Some(objective),
			values: Some(values),
			gap: matches!(status, OutcomeStatus::Optimal).then_some(0.0),
			message: String::new(),
		}
	}

	/// An outcome without a solution vector (infeasible or unbounded proofs).
	pub fn proof(status: OutcomeStatus, message: impl Into<String>) -> Self {
		Self {
			status,
			objective: None,
			values: None,
			gap: None,
			message: message.into(),
		}
	}

	pub fn with_message(mut self, message: impl Into<String>) -> Self {
		self.message = message.into();
		self
	}
}

/// Capability interface every solver backend implements.
///
/// `solve` must not mutate the model. Cooperative backends poll
/// [`CancelToken::should_stop`]; non-cooperative backends are dropped by the
/// race worker once the grace period after cancellation has elapsed.
#[async_trait]
pub trait SolverAdapter: Send + Sync {
	/// Schema of the per-run parameter set.
	fn parameter_schema(&self) -> Box<dyn ConfigSchema>;

	async fn solve(
		&self,
		model: Arc<OptimizationModel>,
		params: &ParameterSet,
		cancel: CancelToken,
	) -> Result<SolveOutcome, AdapterError>;
}

/// Builds a fresh adapter from its construction config.
pub type AdapterFactory =
	Arc<dyn Fn(&toml::Value) -> Result<Box<dyn SolverAdapter>, AdapterError> + Send + Sync>;

/// A registrable backend type: its factory plus the descriptor used when
/// configuration does not override it.
#[derive(Clone)]
pub struct Implementation {
	pub factory: AdapterFactory,
	pub defaults: SolverDescriptor,
}

impl Implementation {
	pub fn new<F>(defaults: SolverDescriptor, factory: F) -> Self
	where
		F: Fn(&toml::Value) -> Result<Box<dyn SolverAdapter>, AdapterError> + Send + Sync + 'static,
	{
		Self {
			factory: Arc::new(factory),
			defaults,
		}
	}

	/// The default descriptor renamed to `id`.
	pub fn descriptor(&self, id: SolverId) -> SolverDescriptor {
		SolverDescriptor {
			id,
			..self.defaults.clone()
		}
	}
}

/// The backend types that ship with the engine, keyed by implementation name.
pub fn builtin_implementations() -> BTreeMap<String, Implementation> {
	let mut map = BTreeMap::new();
	map.insert(
		implementations::microlp::NAME.to_string(),
		Implementation::new(
			implementations::microlp::default_descriptor(),
			implementations::microlp::create_solver,
		),
	);
	map.insert(
		implementations::local_search::NAME.to_string(),
		Implementation::new(
			implementations::local_search::default_descriptor(),
			implementations::local_search::create_solver,
		),
	);
	map.insert(
		implementations::command::NAME.to_string(),
		Implementation::new(
			implementations::command::default_descriptor(),
			implementations::command::create_solver,
		),
	);
	map
}

struct SolverEntry {
	descriptor: SolverDescriptor,
	config: toml::Value,
	factory: AdapterFactory,
}

/// Catalog of registered solvers.
///
/// Immutable once handed to the engine; the engine swaps whole registries
/// rather than mutating one in place.
#[derive(Default)]
pub struct SolverRegistry {
	entries: Vec<SolverEntry>,
}

impl SolverRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registry with one entry per built-in backend that needs no config.
	pub fn builtin() -> Self {
		let implementations = builtin_implementations();
		let mut registry = Self::new();
		for name in [
			implementations::microlp::NAME,
			implementations::local_search::NAME,
		] {
			if let Some(imp) = implementations.get(name) {
				let empty = toml::Value::Table(toml::Table::new());
				if let Err(e) =
					registry.register(imp.descriptor(SolverId::new(name)), empty, imp.factory.clone())
				{
					tracing::warn!(solver = name, error = %e, "Skipping built-in solver");
				}
			}
		}
		registry
	}

	/// Adds a solver. The factory is invoked once to validate `config`.
	pub fn register(
		&mut self,
		descriptor: SolverDescriptor,
		config: toml::Value,
		factory: AdapterFactory,
	) -> Result<(), RegistryError> {
		if self.descriptor(&descriptor.id).is_some() {
			return Err(RegistryError::DuplicateSolver(descriptor.id));
		}
		let adapter = factory(&config).map_err(|e| RegistryError::InvalidConfig {
			solver: descriptor.id.clone(),
			message: e.to_string(),
		})?;
		adapter
			.parameter_schema()
			.validate(&toml::Value::Table(descriptor.default_parameters.clone()))
			.map_err(|e| RegistryError::InvalidConfig {
				solver: descriptor.id.clone(),
				message: format!("default parameters: {}", e),
			})?;

		info!(
			solver = %descriptor.id,
			implementation = %descriptor.implementation,
			classes = ?descriptor.suitability.keys().collect::<Vec<_>>(),
			"Registered solver"
		);
		self.entries.push(SolverEntry {
			descriptor,
			config,
			factory,
		});
		Ok(())
	}

	/// Solvers supporting `class`, most suitable first, then in registration order.
	pub fn list_candidates(&self, class: ModelClass) -> Vec<SolverDescriptor> {
		let mut candidates: Vec<(f64, &SolverDescriptor)> = self
			.entries
			.iter()
			.filter_map(|e| e.descriptor.suitability(class).map(|s| (s, &e.descriptor)))
			.collect();
		// Stable sort keeps registration order among equal scores.
		candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
		debug!(%class, count = candidates.len(), "Listed candidates");
		candidates.into_iter().map(|(_, d)| d.clone()).collect()
	}

	/// A fresh adapter instance for `id`.
	pub fn instantiate(&self, id: &SolverId) -> Result<Box<dyn SolverAdapter>, RegistryError> {
		let entry = self
			.entries
			.iter()
			.find(|e| &e.descriptor.id == id)
			.ok_or_else(|| RegistryError::UnknownSolver(id.clone()))?;
		(entry.factory)(&entry.config).map_err(|e| RegistryError::InvalidConfig {
			solver: id.clone(),
			message: e.to_string(),
		})
	}

	pub fn descriptor(&self, id: &SolverId) -> Option<&SolverDescriptor> {
		self.entries
			.iter()
			.map(|e| &e.descriptor)
			.find(|d| &d.id == id)
	}

	/// All descriptors in registration order.
	pub fn descriptors(&self) -> impl Iterator<Item = &SolverDescriptor> {
		self.entries.iter().map(|e| &e.descriptor)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

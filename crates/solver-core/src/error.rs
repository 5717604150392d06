use solver_registry::RegistryError;
use solver_storage::StorageError;
use solver_tuner::TunerError;
use solver_types::{ModelClass, ModelError, RaceResult};
use thiserror::Error;

/// Request-level failures of [`crate::Orchestrator::solve`].
///
/// Per-worker failures never surface here; they are recorded on their
/// attempt. The variants that carry a result keep the full diagnostic record.
#[derive(Debug, Error)]
pub enum OrchestrationError {
	#[error("Invalid model: {0}")]
	InvalidModel(#[from] ModelError),

	#[error("Invalid solve options: {0}")]
	InvalidOptions(String),

	#[error("No registered solver supports {class} models")]
	NoCapableSolver { class: ModelClass },

	#[error("Model is statically infeasible: {}", .result.presolve.reason.as_deref().unwrap_or("proven by presolve"))]
	StaticInfeasible { result: Box<RaceResult> },

	#[error("All solver attempts failed ({:?})", .result.status)]
	AllAttemptsFailed { result: Box<RaceResult> },

	#[error("Registry error: {0}")]
	Registry(#[from] RegistryError),
}

impl OrchestrationError {
	/// The diagnostic result attached to the error, if any.
	pub fn result(&self) -> Option<&RaceResult> {
		match self {
			Self::StaticInfeasible { result } | Self::AllAttemptsFailed { result } => Some(result),
			_ => None,
		}
	}

	pub fn into_result(self) -> Option<RaceResult> {
		match self {
			Self::StaticInfeasible { result } | Self::AllAttemptsFailed { result } => Some(*result),
			_ => None,
		}
	}
}

/// Failures while assembling an [`crate::Orchestrator`] from configuration.
#[derive(Debug, Error)]
pub enum BuildError {
	#[error("Configuration error: {0}")]
	Config(String),

	#[error("Registry error: {0}")]
	Registry(#[from] RegistryError),

	#[error("Performance store error: {0}")]
	Tuner(#[from] TunerError),

	#[error("Storage error: {0}")]
	Storage(#[from] StorageError),
}

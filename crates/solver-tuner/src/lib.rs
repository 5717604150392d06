//! Performance history and parameter tuning.
//!
//! The [`Tuner`] learns, per problem signature and solver, how long runs take
//! and how often they succeed, and remembers the parameters of the fastest
//! successful run. The selector reads estimates from it and the race
//! coordinator feeds every finished attempt back into it.

use async_trait::async_trait;
use solver_storage::StorageError;
use solver_types::{ParameterSet, ProblemSignature, RunStatus, SolverDescriptor, SolverId};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

mod record;

pub use record::{AttemptOutcome, PerformanceKey, PerformanceRecord};

pub mod implementations {
	pub mod memory;
	pub mod persistent;
}

#[derive(Debug, Error)]
pub enum TunerError {
	#[error("Storage error: {0}")]
	Storage(#[from] StorageError),
}

/// Injectable store of performance records.
///
/// `update` must be atomic per key: concurrent updates of one key are applied
/// one after the other, never interleaved.
#[async_trait]
pub trait PerformanceStore: Send + Sync {
	async fn get(&self, key: &PerformanceKey) -> Result<Option<PerformanceRecord>, TunerError>;

	/// Folds `outcome` into the record for `key` and returns the new record.
	async fn update(
		&self,
		key: &PerformanceKey,
		outcome: &AttemptOutcome,
		alpha: f64,
	) -> Result<PerformanceRecord, TunerError>;

	async fn snapshot(&self) -> Result<Vec<(PerformanceKey, PerformanceRecord)>, TunerError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TunerConfig {
	/// EMA decay in `(0, 1]`.
	pub alpha: f64,
}

impl Default for TunerConfig {
	fn default() -> Self {
		Self { alpha: 0.2 }
	}
}

/// What the history predicts for one solver on one signature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
	pub mean: Duration,
	pub variance: f64,
	pub success_rate: f64,
	pub samples: u64,
	/// Whether the estimate came from the coarse fallback key.
	pub coarse: bool,
}

pub struct Tuner {
	store: Arc<dyn PerformanceStore>,
	config: TunerConfig,
}

impl Tuner {
	pub fn new(store: Arc<dyn PerformanceStore>, config: TunerConfig) -> Self {
		Self { store, config }
	}

	pub fn store(&self) -> &Arc<dyn PerformanceStore> {
		&self.store
	}

	async fn lookup(&self, key: &PerformanceKey) -> Option<PerformanceRecord> {
		match self.store.get(key).await {
			Ok(record) => record,
			Err(e) => {
				warn!(%key, error = %e, "Performance lookup failed");
				None
			}
		}
	}

	/// The exact record for `(signature, solver)`, falling back to the coarse one.
	pub async fn history(
		&self,
		signature: &ProblemSignature,
		solver: &SolverId,
	) -> Option<(PerformanceRecord, bool)> {
		let exact = PerformanceKey::new(*signature, solver.clone());
		if let Some(record) = self.lookup(&exact).await.filter(|r| r.samples > 0) {
			return Some((record, false));
		}
		let coarse = PerformanceKey::new(signature.coarse(), solver.clone());
		self.lookup(&coarse)
			.await
			.filter(|r| r.samples > 0)
			.map(|r| (r, true))
	}

	/// Best known parameters merged over the descriptor defaults.
	///
	/// Tries the exact signature first, then the coarse one.
	pub async fn get_parameters(
		&self,
		signature: &ProblemSignature,
		descriptor: &SolverDescriptor,
	) -> ParameterSet {
		let mut params = descriptor.default_parameters.clone();
		for key in [
			PerformanceKey::new(*signature, descriptor.id.clone()),
			PerformanceKey::new(signature.coarse(), descriptor.id.clone()),
		] {
			if let Some(best) = self.lookup(&key).await.and_then(|r| r.best_parameters) {
				debug!(%key, "Using tuned parameters");
				params.extend(best);
				return params;
			}
		}
		params
	}

	/// Learns from a finished attempt under both the exact and the coarse key.
	///
	/// Coordinator cancellations say nothing about the solver and are ignored.
	pub async fn record_outcome(
		&self,
		signature: &ProblemSignature,
		solver: &SolverId,
		outcome: &AttemptOutcome,
	) -> Result<bool, TunerError> {
		if matches!(
			outcome.status,
			RunStatus::Cancelled | RunStatus::Pending | RunStatus::Running
		) {
			return Ok(false);
		}
		let exact = PerformanceKey::new(*signature, solver.clone());
		let record = self.store.update(&exact, outcome, self.config.alpha).await?;
		self.store
			.update(
				&PerformanceKey::new(signature.coarse(), solver.clone()),
				outcome,
				self.config.alpha,
			)
			.await?;
		debug!(
			key = %exact,
			status = %outcome.status,
			samples = record.samples,
			mean_seconds = record.mean_seconds,
			"Recorded outcome"
		);
		Ok(true)
	}

	pub async fn estimate(&self, signature: &ProblemSignature, solver: &SolverId) -> Option<Estimate> {
		self.history(signature, solver)
			.await
			.map(|(record, coarse)| Estimate {
				mean: record.mean(),
				variance: record.variance_seconds,
				success_rate: record.success_rate,
				samples: record.samples,
				coarse,
			})
	}
}

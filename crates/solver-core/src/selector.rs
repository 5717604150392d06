//! Shortlisting of solvers for a model.

use crate::error::OrchestrationError;
use solver_registry::SolverRegistry;
use solver_tuner::Tuner;
use solver_types::{OptimizationModel, ParameterSet, ProblemSignature, SolverDescriptor};
use std::cmp::Ordering;
use std::time::Duration;
use tracing::debug;

/// Success rate assumed for a solver with no history.
const PRIOR_SUCCESS_RATE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectorWeights {
	pub capability: f64,
	pub success: f64,
	pub speed: f64,
}

impl Default for SelectorWeights {
	fn default() -> Self {
		Self {
			capability: 0.5,
			success: 0.3,
			speed: 0.2,
		}
	}
}

/// A shortlisted solver with everything the race needs to launch it.
#[derive(Debug, Clone)]
pub struct Candidate {
	pub descriptor: SolverDescriptor,
	pub score: f64,
	/// Run parameters: tuned where history has them, else the defaults.
	pub parameters: ParameterSet,
	/// Mean solve time from history, when there is any.
	pub historical_estimate: Option<Duration>,
	/// Historical estimate, or the descriptor's prior when there is no history.
	pub expected: Duration,
	pub variance: Option<f64>,
}

pub struct Selector {
	weights: SelectorWeights,
}

impl Selector {
	pub fn new(weights: SelectorWeights) -> Self {
		Self { weights }
	}

	/// Ranks the capable solvers and keeps the best `k`.
	///
	/// For a frozen registry and history the ordering is deterministic.
	pub async fn select(
		&self,
		registry: &SolverRegistry,
		tuner: &Tuner,
		model: &OptimizationModel,
		signature: &ProblemSignature,
		k: usize,
		max_wall_time: Duration,
	) -> Result<Vec<Candidate>, OrchestrationError> {
		let class = model.class();
		let capable = registry.list_candidates(class);
		if capable.is_empty() {
			return Err(OrchestrationError::NoCapableSolver { class });
		}

		let size_factor = (model.nonzeros() as f64 / 1000.0).max(1.0);
		let wall = max_wall_time.as_secs_f64();

		let mut ranked = Vec::with_capacity(capable.len());
		for descriptor in capable {
			let estimate = tuner.estimate(signature, &descriptor.id).await;
			let expected = estimate
				.map(|e| e.mean)
				.unwrap_or_else(|| descriptor.prior_estimate(model));
			let success_rate = estimate.map_or(PRIOR_SUCCESS_RATE, |e| e.success_rate);
			let suitability = descriptor.suitability(class).unwrap_or(0.0);

			let est_seconds = expected.as_secs_f64();
			let speed = 1.0 / (1.0 + est_seconds / size_factor);
			let mut score = self.weights.capability * suitability
				+ self.weights.success * success_rate
				+ self.weights.speed * speed;
			if est_seconds > wall && est_seconds > 0.0 {
				score *= wall / est_seconds;
			}

			debug!(
				solver = %descriptor.id,
				score,
				suitability,
				success_rate,
				expected_seconds = est_seconds,
				history = estimate.is_some(),
				"Scored candidate"
			);

			let parameters = tuner.get_parameters(signature, &descriptor).await;
			ranked.push(Candidate {
				descriptor,
				score,
				parameters,
				historical_estimate: estimate.map(|e| e.mean),
				expected,
				variance: estimate.map(|e| e.variance),
			});
		}

		// Stable: equal keys keep the registry's listing order.
		ranked.sort_by(|a, b| {
			b.score.total_cmp(&a.score).then_with(|| {
				let va = a.variance.unwrap_or(f64::INFINITY);
				let vb = b.variance.unwrap_or(f64::INFINITY);
				va.partial_cmp(&vb).unwrap_or(Ordering::Equal)
			})
		});
		ranked.truncate(k.max(1));
		Ok(ranked)
	}
}

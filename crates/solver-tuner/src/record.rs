//! Per-(signature, solver) performance history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solver_types::{ParameterSet, ProblemSignature, RunStatus, SolverId};
use std::fmt;
use std::time::Duration;

/// Key of one performance record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PerformanceKey {
	pub signature: ProblemSignature,
	pub solver: SolverId,
}

impl PerformanceKey {
	pub fn new(signature: ProblemSignature, solver: SolverId) -> Self {
		Self { signature, solver }
	}
}

impl fmt::Display for PerformanceKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.signature, self.solver)
	}
}

/// The part of a finished run attempt the history learns from.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
	pub status: RunStatus,
	pub elapsed: Duration,
	pub gap: Option<f64>,
	pub parameters: ParameterSet,
}

impl AttemptOutcome {
	/// Whether the solver did its job: a solution or a proof.
	pub fn succeeded(&self) -> bool {
		matches!(
			self.status,
			RunStatus::Optimal | RunStatus::Feasible | RunStatus::Infeasible | RunStatus::Unbounded
		)
	}
}

/// Exponentially weighted statistics of past runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
	/// EMA of solve time in seconds.
	pub mean_seconds: f64,
	/// EMA variance of solve time.
	pub variance_seconds: f64,
	/// Bernoulli EMA of success.
	pub success_rate: f64,
	/// EMA of the reported optimality gap, over runs that reported one.
	pub mean_gap: Option<f64>,
	pub samples: u64,
	pub best_parameters: Option<ParameterSet>,
	pub best_seconds: Option<f64>,
	pub updated_at: DateTime<Utc>,
}

impl Default for PerformanceRecord {
	fn default() -> Self {
		Self {
			mean_seconds: 0.0,
			variance_seconds: 0.0,
			success_rate: 0.0,
			mean_gap: None,
			samples: 0,
			best_parameters: None,
			best_seconds: None,
			updated_at: Utc::now(),
		}
	}
}

impl PerformanceRecord {
	/// Folds one outcome into the averages with decay `alpha`.
	pub fn apply(&mut self, outcome: &AttemptOutcome, alpha: f64) {
		let seconds = outcome.elapsed.as_secs_f64();
		let success = if outcome.succeeded() { 1.0 } else { 0.0 };

		if self.samples == 0 {
			self.mean_seconds = seconds;
			self.variance_seconds = 0.0;
			self.success_rate = success;
			self.mean_gap = outcome.gap;
		} else {
			let diff = seconds - self.mean_seconds;
			self.mean_seconds += alpha * diff;
			self.variance_seconds = (1.0 - alpha) * (self.variance_seconds + alpha * diff * diff);
			self.success_rate += alpha * (success - self.success_rate);
			self.mean_gap = match (self.mean_gap, outcome.gap) {
				(Some(mean), Some(gap)) => Some(mean + alpha * (gap - mean)),
				(None, gap) => gap,
				(mean, None) => mean,
			};
		}
		self.samples += 1;

		if outcome.status.is_success() && self.best_seconds.map_or(true, |best| seconds < best) {
			self.best_seconds = Some(seconds);
			self.best_parameters = Some(outcome.parameters.clone());
		}
		self.updated_at = Utc::now();
	}

	pub fn mean(&self) -> Duration {
		Duration::from_secs_f64(self.mean_seconds.max(0.0))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn outcome(status: RunStatus, seconds: f64) -> AttemptOutcome {
		AttemptOutcome {
			status,
			elapsed: Duration::from_secs_f64(seconds),
			gap: None,
			parameters: ParameterSet::new(),
		}
	}

	#[test]
	fn test_first_sample_initializes() {
		let mut record = PerformanceRecord::default();
		record.apply(&outcome(RunStatus::Optimal, 2.0), 0.2);
		assert_eq!(record.samples, 1);
		assert_eq!(record.mean_seconds, 2.0);
		assert_eq!(record.variance_seconds, 0.0);
		assert_eq!(record.success_rate, 1.0);
		assert_eq!(record.best_seconds, Some(2.0));
	}

	#[test]
	fn test_exponential_averages() {
		let mut record = PerformanceRecord::default();
		record.apply(&outcome(RunStatus::Optimal, 1.0), 0.5);
		record.apply(&outcome(RunStatus::Error, 3.0), 0.5);

		assert!((record.mean_seconds - 2.0).abs() < 1e-12);
		// (1 - a) * (0 + a * diff^2) = 0.5 * 0.5 * 4
		assert!((record.variance_seconds - 1.0).abs() < 1e-12);
		assert!((record.success_rate - 0.5).abs() < 1e-12);
		// Failures never become the best run.
		assert_eq!(record.best_seconds, Some(1.0));
	}

	#[test]
	fn test_proofs_count_as_success_but_not_as_best() {
		let mut record = PerformanceRecord::default();
		record.apply(&outcome(RunStatus::Infeasible, 0.1), 0.2);
		assert_eq!(record.success_rate, 1.0);
		assert_eq!(record.best_parameters, None);

		record.apply(&outcome(RunStatus::TimedOut, 5.0), 0.2);
		assert!((record.success_rate - 0.8).abs() < 1e-12);
	}
}

//! Request options and the final product of an orchestration request.

use crate::attempt::RunAttempt;
use crate::signature::ProblemSignature;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Per-request limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolveOptions {
	/// Global deadline for the whole request, measured from submission.
	pub max_wall_time: Duration,
	/// Shortlist size handed to the race.
	pub max_candidates: usize,
	/// Relative objective tolerance used by cross-validation.
	pub tolerance: f64,
}

impl Default for SolveOptions {
	fn default() -> Self {
		Self {
			max_wall_time: Duration::from_secs(30),
			max_candidates: 3,
			tolerance: 1e-4,
		}
	}
}

/// Outcome of comparing the successful attempts of a race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
	/// Two or more successful attempts agree within tolerance.
	Agreed,
	/// Successful attempts disagree; all of them are kept.
	Disputed,
	/// Only one successful attempt, nothing to compare against.
	Unverified,
	/// No successful attempts.
	NotApplicable,
}

/// Overall status reported for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaceStatus {
	Optimal,
	Feasible,
	Infeasible,
	Unbounded,
	Failed,
}

/// What presolve did before the race.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresolveSummary {
	pub eliminated_constraints: usize,
	pub tightened_bounds: usize,
	pub statically_infeasible: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
}

/// Final result of one orchestration request, with full provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaceResult {
	pub id: Uuid,
	pub status: RaceStatus,
	pub winning_attempt: Option<RunAttempt>,
	/// Every terminal attempt, in completion order.
	pub attempts: Vec<RunAttempt>,
	pub verdict: Verdict,
	pub disputed: bool,
	pub warnings: Vec<String>,
	pub elapsed: Duration,
	pub signature: Option<ProblemSignature>,
	pub presolve: PresolveSummary,
}

impl RaceResult {
	pub fn objective(&self) -> Option<f64> {
		self.winning_attempt.as_ref().and_then(|a| a.objective())
	}

	pub fn values(&self) -> Option<&[f64]> {
		self.winning_attempt.as_ref().and_then(|a| a.values())
	}

	pub fn is_success(&self) -> bool {
		matches!(self.status, RaceStatus::Optimal | RaceStatus::Feasible)
	}
}

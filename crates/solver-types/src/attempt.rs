//! Run attempts: one per solver worker in a race.

use crate::descriptor::{ParameterSet, SolverId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle of a run attempt.
///
/// `Pending -> Running -> {Optimal | Feasible | Infeasible | Unbounded |
/// Error | TimedOut | Cancelled}`. Terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
	Pending,
	Running,
	/// Solver-certified optimum.
	Optimal,
	/// A feasible point without an optimality certificate.
	Feasible,
	Infeasible,
	Unbounded,
	/// Backend crashed or reported an internal error.
	Error,
	/// The worker exceeded its own deadline.
	TimedOut,
	/// The coordinator stopped the worker.
	Cancelled,
}

impl RunStatus {
	pub fn is_terminal(self) -> bool {
		!matches!(self, RunStatus::Pending | RunStatus::Running)
	}

	/// A usable solution was produced.
	pub fn is_success(self) -> bool {
		matches!(self, RunStatus::Optimal | RunStatus::Feasible)
	}
}

impl fmt::Display for RunStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			RunStatus::Pending => "pending",
			RunStatus::Running => "running",
			RunStatus::Optimal => "optimal",
			RunStatus::Feasible => "feasible",
			RunStatus::Infeasible => "infeasible",
			RunStatus::Unbounded => "unbounded",
			RunStatus::Error => "error",
			RunStatus::TimedOut => "timed_out",
			RunStatus::Cancelled => "cancelled",
		};
		f.write_str(s)
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid run attempt transition from {from} to {to}")]
pub struct TransitionError {
	pub from: RunStatus,
	pub to: RunStatus,
}

/// What a worker observed when its attempt ended.
#[derive(Debug, Clone, Default)]
pub struct AttemptReport {
	pub objective: Option<f64>,
	pub values: Option<Vec<f64>>,
	pub gap: Option<f64>,
	pub termination: String,
}

impl AttemptReport {
	pub fn reason(termination: impl Into<String>) -> Self {
		Self {
			termination: termination.into(),
			..Default::default()
		}
	}
}

/// A single solver invocation within a race.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunAttempt {
	id: Uuid,
	solver: SolverId,
	parameters: ParameterSet,
	status: RunStatus,
	started_at: Option<DateTime<Utc>>,
	finished_at: Option<DateTime<Utc>>,
	elapsed: Duration,
	deadline: Duration,
	objective: Option<f64>,
	values: Option<Vec<f64>>,
	gap: Option<f64>,
	termination: String,
	completion_index: Option<usize>,
	outcome_recorded: bool,
	#[serde(skip)]
	clock: Option<Instant>,
}

impl RunAttempt {
	pub fn new(solver: SolverId, parameters: ParameterSet, deadline: Duration) -> Self {
		Self {
			id: Uuid::new_v4(),
			solver,
			parameters,
			status: RunStatus::Pending,
			started_at: None,
			finished_at: None,
			elapsed: Duration::ZERO,
			deadline,
			objective: None,
			values: None,
			gap: None,
			termination: String::new(),
			completion_index: None,
			outcome_recorded: false,
			clock: None,
		}
	}

	/// `Pending -> Running`.
	pub fn start(&mut self) -> Result<(), TransitionError> {
		self.start_from(Instant::now())
	}

	/// `Pending -> Running`, timing the attempt from `clock` instead of now.
	pub fn start_from(&mut self, clock: Instant) -> Result<(), TransitionError> {
		if self.status != RunStatus::Pending {
			return Err(TransitionError {
				from: self.status,
				to: RunStatus::Running,
			});
		}
		self.status = RunStatus::Running;
		let waited = chrono::Duration::from_std(clock.elapsed()).unwrap_or_default();
		self.started_at = Some(Utc::now() - waited);
		self.clock = Some(clock);
		Ok(())
	}

	/// `Running -> terminal`.
	pub fn finish(&mut self, status: RunStatus, report: AttemptReport) -> Result<(), TransitionError> {
		if self.status != RunStatus::Running || !status.is_terminal() {
			return Err(TransitionError {
				from: self.status,
				to: status,
			});
		}
		self.status = status;
		self.finished_at = Some(Utc::now());
		self.elapsed = self.clock.map(|c| c.elapsed()).unwrap_or_default();
		self.objective = report.objective;
		self.values = report.values;
		self.gap = report.gap;
		self.termination = report.termination;
		Ok(())
	}

	/// Replaces the backend-reported objective with one evaluated on the model.
	pub fn restate_objective(&mut self, objective: f64) {
		self.objective = Some(objective);
	}

	/// Sets the arrival position of this attempt at the coordinator.
	pub fn set_completion_index(&mut self, index: usize) {
		self.completion_index = Some(index);
	}

	/// Flags that the outcome has been applied to the performance history.
	pub fn mark_outcome_recorded(&mut self) {
		self.outcome_recorded = true;
	}

	pub fn id(&self) -> Uuid {
		self.id
	}

	pub fn solver(&self) -> &SolverId {
		&self.solver
	}

	pub fn parameters(&self) -> &ParameterSet {
		&self.parameters
	}

	pub fn status(&self) -> RunStatus {
		self.status
	}

	pub fn started_at(&self) -> Option<DateTime<Utc>> {
		self.started_at
	}

	pub fn finished_at(&self) -> Option<DateTime<Utc>> {
		self.finished_at
	}

	pub fn elapsed(&self) -> Duration {
		self.elapsed
	}

	pub fn deadline(&self) -> Duration {
		self.deadline
	}

	pub fn objective(&self) -> Option<f64> {
		self.objective
	}

	pub fn values(&self) -> Option<&[f64]> {
		self.values.as_deref()
	}

	pub fn gap(&self) -> Option<f64> {
		self.gap
	}

	pub fn termination(&self) -> &str {
		&self.termination
	}

	pub fn completion_index(&self) -> Option<usize> {
		self.completion_index
	}

	pub fn outcome_recorded(&self) -> bool {
		self.outcome_recorded
	}

	pub fn is_terminal(&self) -> bool {
		self.status.is_terminal()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn attempt() -> RunAttempt {
		RunAttempt::new(SolverId::from("microlp"), ParameterSet::new(), Duration::from_secs(1))
	}

	#[test]
	fn test_attempt_lifecycle() {
		let mut a = attempt();
		assert_eq!(a.status(), RunStatus::Pending);
		a.start().unwrap();
		assert_eq!(a.status(), RunStatus::Running);
		assert!(a.started_at().is_some());

		a.finish(
			RunStatus::Optimal,
			AttemptReport {
				objective: Some(10.0),
				values: Some(vec![10.0, 0.0]),
				gap: Some(0.0),
				termination: "optimality proven".into(),
			},
		)
		.unwrap();
		assert!(a.is_terminal());
		assert_eq!(a.objective(), Some(10.0));
		assert!(a.finished_at() >= a.started_at());
	}

	#[test]
	fn test_start_from_earlier_clock() {
		let mut a = attempt();
		let dispatched = Instant::now() - Duration::from_millis(200);
		a.start_from(dispatched).unwrap();
		a.finish(RunStatus::Error, AttemptReport::reason("crashed")).unwrap();
		assert!(a.elapsed() >= Duration::from_millis(200));
		let span = a.finished_at().unwrap() - a.started_at().unwrap();
		assert!(span >= chrono::Duration::milliseconds(200));
	}

	#[test]
	fn test_terminal_attempt_is_immutable() {
		let mut a = attempt();
		a.start().unwrap();
		a.finish(RunStatus::TimedOut, AttemptReport::reason("deadline"))
			.unwrap();

		let err = a
			.finish(RunStatus::Optimal, AttemptReport::default())
			.unwrap_err();
		assert_eq!(err.from, RunStatus::TimedOut);
		assert_eq!(a.status(), RunStatus::TimedOut);
		assert!(a.start().is_err());
	}

	#[test]
	fn test_cannot_finish_before_start_or_into_running() {
		let mut a = attempt();
		assert!(a.finish(RunStatus::Error, AttemptReport::default()).is_err());
		a.start().unwrap();
		assert!(a.finish(RunStatus::Pending, AttemptReport::default()).is_err());
	}
}

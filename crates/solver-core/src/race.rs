//! Concurrent racing of shortlisted solvers.
//!
//! Every candidate runs on its own tokio task with its own adapter instance
//! and a child of the race's [`CancelToken`]. Results are collected in
//! completion order. The race stops early on a certified optimum or at the
//! global deadline; workers that do not acknowledge the stop within the grace
//! period have their backend future dropped.

use crate::selector::Candidate;
use futures::stream::{FuturesUnordered, StreamExt};
use solver_registry::{AdapterError, OutcomeStatus, SolveOutcome, SolverAdapter, SolverRegistry};
use solver_tuner::{AttemptOutcome, Tuner, TunerError};
use solver_types::{
	AttemptReport, CancelToken, OptimizationModel, ParameterSet, ProblemSignature, RunAttempt,
	RunStatus, StopReason,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RaceConfig {
	/// Multiplier on a solver's historical mean to derive its own deadline.
	pub safety_margin: f64,
	/// Time a stopped worker gets to return before it is dropped.
	pub grace_period: Duration,
}

impl Default for RaceConfig {
	fn default() -> Self {
		Self {
			safety_margin: 3.0,
			grace_period: Duration::from_millis(250),
		}
	}
}

pub struct RaceCoordinator {
	config: RaceConfig,
	tuner: Arc<Tuner>,
}

impl RaceCoordinator {
	pub fn new(config: RaceConfig, tuner: Arc<Tuner>) -> Self {
		Self { config, tuner }
	}

	/// `min(remaining, safety_margin × historical mean)`, or `remaining`
	/// without history.
	pub fn worker_budget(&self, candidate: &Candidate, remaining: Duration) -> Duration {
		match candidate.historical_estimate {
			Some(estimate) => {
				Duration::try_from_secs_f64(estimate.as_secs_f64() * self.config.safety_margin)
					.map_or(remaining, |budget| budget.min(remaining))
			}
			None => remaining,
		}
	}

	/// Races `candidates` on `model` until `deadline` and returns every
	/// attempt in completion order.
	#[instrument(skip_all, fields(signature = %signature, candidates = candidates.len()))]
	pub async fn run(
		&self,
		registry: Arc<SolverRegistry>,
		model: Arc<OptimizationModel>,
		signature: ProblemSignature,
		candidates: Vec<Candidate>,
		deadline: Instant,
	) -> Vec<RunAttempt> {
		let race = CancelToken::with_deadline(deadline);
		let started = Instant::now();
		let remaining = deadline.saturating_duration_since(started);

		let mut templates = Vec::with_capacity(candidates.len());
		let mut running = FuturesUnordered::new();

		for (slot, candidate) in candidates.into_iter().enumerate() {
			let budget = self.worker_budget(&candidate, remaining);
			let attempt = RunAttempt::new(
				candidate.descriptor.id.clone(),
				candidate.parameters,
				budget,
			);
			debug!(
				solver = %candidate.descriptor.id,
				budget_ms = budget.as_millis() as u64,
				"Launching worker"
			);

			let dispatched = std::time::Instant::now();
			let handle = tokio::spawn(run_worker(
				registry.clone(),
				model.clone(),
				attempt.clone(),
				race.child(started + budget),
				self.config.grace_period,
				candidate.descriptor.exact,
			));
			running.push(async move { (slot, handle.await) });
			templates.push((attempt, dispatched));
		}
		info!(workers = templates.len(), "Race started");

		let mut attempts: Vec<RunAttempt> = Vec::with_capacity(templates.len());
		let mut recordings = Vec::new();
		let global_deadline = tokio::time::sleep_until(deadline);
		tokio::pin!(global_deadline);
		let mut deadline_passed = false;

		loop {
			tokio::select! {
				next = running.next() => {
					let Some((slot, joined)) = next else { break };
					let mut attempt = match joined {
						Ok(attempt) => attempt,
						Err(e) => {
							let (template, dispatched) = &templates[slot];
							crashed(template.clone(), *dispatched, e)
						}
					};
					attempt.set_completion_index(attempts.len());
					debug!(
						solver = %attempt.solver(),
						status = %attempt.status(),
						elapsed_ms = attempt.elapsed().as_millis() as u64,
						objective = ?attempt.objective(),
						"Worker finished"
					);

					if attempt.status() == RunStatus::Optimal && !race.is_cancelled() {
						info!(solver = %attempt.solver(), "Certified optimum, stopping race");
						race.cancel(StopReason::EarlyStop);
					}
					if attempt.status() != RunStatus::Cancelled {
						recordings.push((attempts.len(), self.record(signature, &attempt)));
					}
					attempts.push(attempt);
				}
				_ = &mut global_deadline, if !deadline_passed => {
					deadline_passed = true;
					if !race.is_cancelled() {
						warn!("Global deadline reached, stopping race");
						race.cancel(StopReason::GlobalDeadline);
					}
				}
			}
		}

		self.flush(&mut attempts, recordings).await;
		info!(
			attempts = attempts.len(),
			elapsed_ms = started.elapsed().as_millis() as u64,
			"Race finished"
		);
		attempts
	}

	fn record(
		&self,
		signature: ProblemSignature,
		attempt: &RunAttempt,
	) -> JoinHandle<Result<bool, TunerError>> {
		let tuner = self.tuner.clone();
		let solver = attempt.solver().clone();
		let outcome = AttemptOutcome {
			status: attempt.status(),
			elapsed: attempt.elapsed(),
			gap: attempt.gap(),
			parameters: attempt.parameters().clone(),
		};
		tokio::spawn(async move { tuner.record_outcome(&signature, &solver, &outcome).await })
	}

	/// Waits for outcome recording, bounded by the grace period. Recordings
	/// still running afterwards complete in the background, unflagged.
	async fn flush(
		&self,
		attempts: &mut [RunAttempt],
		recordings: Vec<(usize, JoinHandle<Result<bool, TunerError>>)>,
	) {
		let flush_by = Instant::now() + self.config.grace_period;
		for (index, handle) in recordings {
			match tokio::time::timeout_at(flush_by, handle).await {
				Ok(Ok(Ok(true))) => attempts[index].mark_outcome_recorded(),
				Ok(Ok(Ok(false))) => {}
				Ok(Ok(Err(e))) => warn!(error = %e, "Failed to record outcome"),
				Ok(Err(e)) => warn!(error = %e, "Outcome recording task failed"),
				Err(_) => warn!(
					solver = %attempts[index].solver(),
					"Outcome recording still in flight"
				),
			}
		}
	}
}

async fn run_worker(
	registry: Arc<SolverRegistry>,
	model: Arc<OptimizationModel>,
	mut attempt: RunAttempt,
	token: CancelToken,
	grace: Duration,
	exact: bool,
) -> RunAttempt {
	if let Err(e) = attempt.start() {
		warn!(error = %e, "Worker received a started attempt");
		return attempt;
	}

	let (mut status, report) = match registry.instantiate(attempt.solver()) {
		Ok(adapter) => drive(adapter.as_ref(), model, attempt.parameters(), &token, grace).await,
		Err(e) => (RunStatus::Error, AttemptReport::reason(e.to_string())),
	};
	// Only exact solvers certify optimality.
	if status == RunStatus::Optimal && !exact {
		status = RunStatus::Feasible;
	}

	if matches!(status, RunStatus::Error | RunStatus::TimedOut) {
		warn!(solver = %attempt.solver(), %status, reason = %report.termination, "Attempt failed");
	}
	if let Err(e) = attempt.finish(status, report) {
		warn!(error = %e, "Could not finish attempt");
	}
	attempt
}

async fn drive(
	adapter: &dyn SolverAdapter,
	model: Arc<OptimizationModel>,
	params: &ParameterSet,
	token: &CancelToken,
	grace: Duration,
) -> (RunStatus, AttemptReport) {
	if let Err(e) = adapter
		.parameter_schema()
		.validate(&toml::Value::Table(params.clone()))
	{
		return completed(Err(AdapterError::InvalidParameters(e.to_string())));
	}

	let mut solve = adapter.solve(model, params, token.clone());
	tokio::select! {
		biased;
		result = &mut solve => match token.stop_reason() {
			None => completed(result),
			// Finished, but only after the stop.
			Some(reason) => stopped(reason, Some(result)),
		},
		reason = token.stopped() => {
			match tokio::time::timeout(grace, &mut solve).await {
				Ok(result) => stopped(reason, Some(result)),
				Err(_) => stopped(reason, None),
			}
		}
	}
}

fn completed(result: Result<SolveOutcome, AdapterError>) -> (RunStatus, AttemptReport) {
	match result {
		Ok(outcome) => {
			let status = match outcome.status {
				OutcomeStatus::Optimal => RunStatus::Optimal,
				OutcomeStatus::Feasible => RunStatus::Feasible,
				OutcomeStatus::Infeasible => RunStatus::Infeasible,
				OutcomeStatus::Unbounded => RunStatus::Unbounded,
			};
			let termination = if outcome.message.is_empty() {
				status.to_string()
			} else {
				outcome.message.clone()
			};
			(status, report(outcome, termination))
		}
		Err(e) => (RunStatus::Error, AttemptReport::reason(e.to_string())),
	}
}

/// Deadlines give `TimedOut`, coordinator stops give `Cancelled`. An
/// incumbent returned within the grace period is kept for audit only.
fn stopped(
	reason: StopReason,
	result: Option<Result<SolveOutcome, AdapterError>>,
) -> (RunStatus, AttemptReport) {
	let (status, cause) = match reason {
		StopReason::Deadline => (RunStatus::TimedOut, "worker deadline exceeded"),
		StopReason::GlobalDeadline => (RunStatus::TimedOut, "global deadline reached"),
		StopReason::EarlyStop => (RunStatus::Cancelled, "race stopped on a certified optimum"),
		StopReason::Shutdown => (RunStatus::Cancelled, "race shut down"),
	};
	let details = match result {
		Some(Ok(outcome)) => {
			let termination = format!("{}; incumbent retained", cause);
			report(outcome, termination)
		}
		Some(Err(AdapterError::Interrupted)) => AttemptReport::reason(cause),
		Some(Err(e)) => AttemptReport::reason(format!("{}: {}", cause, e)),
		None => AttemptReport::reason(format!("{}; hard-terminated after grace period", cause)),
	};
	(status, details)
}

fn report(outcome: SolveOutcome, termination: String) -> AttemptReport {
	AttemptReport {
		objective: outcome.objective,
		values: outcome.values,
		gap: outcome.gap,
		termination,
	}
}

/// Attempt for a worker task that panicked, timed from its dispatch.
fn crashed(mut attempt: RunAttempt, dispatched: std::time::Instant, error: JoinError) -> RunAttempt {
	let reason = if error.is_panic() {
		"backend panicked".to_string()
	} else {
		format!("worker task failed: {}", error)
	};
	warn!(solver = %attempt.solver(), %reason, "Worker crashed");
	let finished = attempt
		.start_from(dispatched)
		.and_then(|_| attempt.finish(RunStatus::Error, AttemptReport::reason(reason)));
	if let Err(e) = finished {
		warn!(error = %e, "Could not finish crashed attempt");
	}
	attempt
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::test_support::{registry_with, Behaviour};
	use solver_tuner::implementations::memory::MemoryPerformanceStore;
	use solver_tuner::TunerConfig;
	use solver_types::{ModelBuilder, ModelClass, ParameterSet, RelOp, SolverDescriptor, SolverId};

	fn model() -> Arc<OptimizationModel> {
		let mut b = ModelBuilder::maximize();
		let x = b.continuous("x", 0.0, 10.0);
		let y = b.continuous("y", 0.0, 10.0);
		b.constraint(&[(x, 1.0), (y, 1.0)], RelOp::Le, 10.0)
			.objective(x, 1.0)
			.objective(y, 1.0);
		Arc::new(b.build().unwrap())
	}

	fn candidate(id: &str, exact: bool, history: Option<Duration>) -> Candidate {
		Candidate {
			descriptor: SolverDescriptor {
				id: SolverId::from(id),
				implementation: "scripted".into(),
				suitability: [(ModelClass::Linear, 0.5)].into_iter().collect(),
				exact,
				default_parameters: ParameterSet::new(),
				nominal_rate: 0.01,
				strengths: vec![],
			},
			score: 0.5,
			parameters: ParameterSet::new(),
			historical_estimate: history,
			expected: history.unwrap_or(Duration::from_millis(10)),
			variance: None,
		}
	}

	fn coordinator(grace: Duration) -> (RaceCoordinator, Arc<Tuner>) {
		let tuner = Arc::new(Tuner::new(
			Arc::new(MemoryPerformanceStore::new()),
			TunerConfig::default(),
		));
		let config = RaceConfig {
			safety_margin: 3.0,
			grace_period: grace,
		};
		(RaceCoordinator::new(config, tuner.clone()), tuner)
	}

	fn status_of(attempts: &[RunAttempt], id: &str) -> RunStatus {
		attempts
			.iter()
			.find(|a| a.solver().as_str() == id)
			.map(|a| a.status())
			.unwrap()
	}

	#[test]
	fn test_worker_budget() {
		let (coordinator, _) = coordinator(Duration::from_millis(10));
		let remaining = Duration::from_secs(2);
		assert_eq!(
			coordinator.worker_budget(&candidate("a", false, None), remaining),
			remaining
		);
		assert_eq!(
			coordinator.worker_budget(
				&candidate("a", false, Some(Duration::from_millis(100))),
				remaining
			),
			Duration::from_millis(300)
		);
		assert_eq!(
			coordinator.worker_budget(
				&candidate("a", false, Some(Duration::from_secs(10))),
				remaining
			),
			remaining
		);
	}

	#[tokio::test]
	async fn test_certified_optimum_stops_the_race() {
		let slow = Behaviour::feasible(9.0, vec![4.5, 4.5]).after(Duration::from_secs(5));
		let registry = Arc::new(registry_with(vec![
			("exact", vec![(ModelClass::Linear, 0.9)], true, Behaviour::optimal(10.0, vec![5.0, 5.0])),
			("slow", vec![(ModelClass::Linear, 0.5)], false, slow),
		]));
		let (coordinator, _) = coordinator(Duration::from_millis(100));
		let model = model();
		let started = Instant::now();

		let attempts = coordinator
			.run(
				registry,
				model.clone(),
				ProblemSignature::of(&model),
				vec![candidate("exact", true, None), candidate("slow", false, None)],
				Instant::now() + Duration::from_secs(10),
			)
			.await;

		assert!(started.elapsed() < Duration::from_secs(2));
		assert_eq!(attempts.len(), 2);
		assert_eq!(attempts[0].solver().as_str(), "exact");
		assert_eq!(attempts[0].completion_index(), Some(0));
		assert_eq!(status_of(&attempts, "exact"), RunStatus::Optimal);
		assert_eq!(status_of(&attempts, "slow"), RunStatus::Cancelled);
	}

	#[tokio::test]
	async fn test_failures_are_isolated() {
		let registry = Arc::new(registry_with(vec![
			("crash", vec![(ModelClass::Linear, 0.5)], false, Behaviour::panic()),
			("broken", vec![(ModelClass::Linear, 0.5)], false, Behaviour::fail("license expired")),
			("good", vec![(ModelClass::Linear, 0.5)], false, Behaviour::feasible(8.0, vec![4.0, 4.0])),
		]));
		let (coordinator, tuner) = coordinator(Duration::from_millis(200));
		let model = model();
		let signature = ProblemSignature::of(&model);

		let attempts = coordinator
			.run(
				registry,
				model,
				signature,
				vec![
					candidate("crash", false, None),
					candidate("broken", false, None),
					candidate("good", false, None),
				],
				Instant::now() + Duration::from_secs(5),
			)
			.await;

		assert_eq!(attempts.len(), 3);
		assert_eq!(status_of(&attempts, "crash"), RunStatus::Error);
		assert_eq!(status_of(&attempts, "broken"), RunStatus::Error);
		assert_eq!(status_of(&attempts, "good"), RunStatus::Feasible);
		assert!(attempts.iter().all(|a| a.is_terminal()));
		assert!(attempts.iter().all(|a| a.outcome_recorded()));

		let indices: Vec<_> = attempts.iter().map(|a| a.completion_index()).collect();
		assert_eq!(indices, vec![Some(0), Some(1), Some(2)]);

		let estimate = tuner
			.estimate(&signature, &SolverId::from("broken"))
			.await
			.unwrap();
		assert_eq!(estimate.success_rate, 0.0);
	}

	#[tokio::test]
	async fn test_stubborn_worker_is_hard_terminated_at_deadline() {
		let stubborn = Behaviour::feasible(1.0, vec![0.5, 0.5])
			.after(Duration::from_secs(10))
			.stubborn();
		let registry = Arc::new(registry_with(vec![
			("stubborn", vec![(ModelClass::Linear, 0.5)], false, stubborn),
			(
				"quick",
				vec![(ModelClass::Linear, 0.5)],
				false,
				Behaviour::feasible(7.0, vec![3.5, 3.5]).after(Duration::from_millis(20)),
			),
		]));
		let (coordinator, _) = coordinator(Duration::from_millis(100));
		let model = model();
		let wall = Duration::from_millis(300);
		let started = Instant::now();

		let attempts = coordinator
			.run(
				registry,
				model.clone(),
				ProblemSignature::of(&model),
				vec![candidate("stubborn", false, None), candidate("quick", false, None)],
				started + wall,
			)
			.await;

		let elapsed = started.elapsed();
		assert!(elapsed >= wall);
		// Deadline, grace period and scheduling slack.
		assert!(elapsed < wall + Duration::from_millis(100) + Duration::from_millis(500));
		assert_eq!(status_of(&attempts, "quick"), RunStatus::Feasible);
		assert_eq!(status_of(&attempts, "stubborn"), RunStatus::TimedOut);
		let stubborn = attempts.iter().find(|a| a.solver().as_str() == "stubborn").unwrap();
		assert!(stubborn.termination().contains("hard-terminated"));
		// The timeout still counts as history; only cancellations are skipped.
		assert!(stubborn.outcome_recorded());
	}

	#[tokio::test]
	async fn test_short_history_budget_times_out_worker() {
		let registry = Arc::new(registry_with(vec![(
			"slow",
			vec![(ModelClass::Linear, 0.5)],
			false,
			Behaviour::optimal(10.0, vec![5.0, 5.0]).after(Duration::from_secs(5)),
		)]));
		let (coordinator, _) = coordinator(Duration::from_millis(50));
		let model = model();
		let started = Instant::now();

		let attempts = coordinator
			.run(
				registry,
				model.clone(),
				ProblemSignature::of(&model),
				vec![candidate("slow", false, Some(Duration::from_millis(50)))],
				started + Duration::from_secs(5),
			)
			.await;

		assert!(started.elapsed() < Duration::from_secs(2));
		assert_eq!(attempts[0].status(), RunStatus::TimedOut);
		assert_eq!(attempts[0].deadline(), Duration::from_millis(150));
	}

	#[tokio::test]
	async fn test_invalid_parameters_fail_the_attempt() {
		let registry = Arc::new(solver_registry::SolverRegistry::builtin());
		let (coordinator, _) = coordinator(Duration::from_millis(50));
		let model = model();
		let mut bad = candidate("local-search", false, None);
		bad.parameters
			.insert("step".into(), toml::Value::String("large".into()));

		let attempts = coordinator
			.run(
				registry,
				model.clone(),
				ProblemSignature::of(&model),
				vec![bad],
				Instant::now() + Duration::from_secs(5),
			)
			.await;

		assert_eq!(attempts[0].status(), RunStatus::Error);
		assert!(attempts[0].termination().contains("Invalid parameters"));
	}

	#[tokio::test]
	async fn test_crashed_worker_keeps_its_running_time() {
		let crash = Behaviour::panic().after(Duration::from_millis(150));
		let registry = Arc::new(registry_with(vec![(
			"crash",
			vec![(ModelClass::Linear, 0.5)],
			false,
			crash,
		)]));
		let (coordinator, tuner) = coordinator(Duration::from_millis(50));
		let model = model();
		let signature = ProblemSignature::of(&model);

		let attempts = coordinator
			.run(
				registry,
				model,
				signature,
				vec![candidate("crash", false, None)],
				Instant::now() + Duration::from_secs(5),
			)
			.await;

		assert_eq!(attempts[0].status(), RunStatus::Error);
		assert!(attempts[0].termination().contains("panicked"));
		assert!(attempts[0].elapsed() >= Duration::from_millis(150));

		let estimate = tuner
			.estimate(&signature, &SolverId::from("crash"))
			.await
			.unwrap();
		assert!(estimate.mean >= Duration::from_millis(150));
		assert_eq!(estimate.success_rate, 0.0);
	}
}

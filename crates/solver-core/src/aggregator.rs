//! Winner selection over the attempts of a race.

use crate::validator::{evaluated_objective, violation};
use solver_types::{OptimizationModel, RaceStatus, RunAttempt, RunStatus};
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
	pub status: RaceStatus,
	/// Index into the attempts slice.
	pub winner: Option<usize>,
	pub warnings: Vec<String>,
}

/// Picks the winner: best `Optimal`, else best `Feasible`, earliest
/// completion on ties. Objectives are evaluated from the solution vectors on
/// the original model, never taken from the backend's report. Solutions
/// violating the model beyond `epsilon` never win.
///
/// Without a winner the status is the most informative failure: infeasible,
/// then unbounded, then failed, with one reason per attempt.
pub fn aggregate(model: &OptimizationModel, attempts: &[RunAttempt], epsilon: f64) -> Aggregation {
	let mut warnings = Vec::new();
	let mut eligible = Vec::new();

	for (index, attempt) in attempts.iter().enumerate() {
		if !attempt.status().is_success() {
			continue;
		}
		match violation(model, attempt) {
			Some(v) if v <= epsilon => eligible.push(index),
			Some(v) => {
				warn!(solver = %attempt.solver(), violation = v, "Excluding infeasible solution");
				warnings.push(format!(
					"Excluded '{}' from winning: solution violates the model by {:.3e}",
					attempt.solver(),
					v
				));
			}
			None => warnings.push(format!(
				"Excluded '{}' from winning: no solution vector of length {}",
				attempt.solver(),
				model.num_variables()
			)),
		}
	}

	for (status, race_status) in [
		(RunStatus::Optimal, RaceStatus::Optimal),
		(RunStatus::Feasible, RaceStatus::Feasible),
	] {
		let winner = best(
			model,
			attempts,
			eligible
				.iter()
				.copied()
				.filter(|&i| attempts[i].status() == status),
		);
		if let Some(winner) = winner {
			return Aggregation {
				status: race_status,
				winner: Some(winner),
				warnings,
			};
		}
	}

	let declared = |status: RunStatus| attempts.iter().any(|a| a.status() == status);
	let status = if declared(RunStatus::Infeasible) {
		RaceStatus::Infeasible
	} else if declared(RunStatus::Unbounded) {
		RaceStatus::Unbounded
	} else {
		RaceStatus::Failed
	};
	warnings.extend(attempts.iter().map(|a| {
		format!(
			"'{}' ended {}: {}",
			a.solver(),
			a.status(),
			if a.termination().is_empty() {
				"no details"
			} else {
				a.termination()
			}
		)
	}));

	Aggregation {
		status,
		winner: None,
		warnings,
	}
}

fn objective(model: &OptimizationModel, attempt: &RunAttempt) -> f64 {
	evaluated_objective(model, attempt).unwrap_or(f64::NAN)
}

fn best(
	model: &OptimizationModel,
	attempts: &[RunAttempt],
	indices: impl Iterator<Item = usize>,
) -> Option<usize> {
	let direction = model.objective.direction;
	indices.fold(None, |best: Option<usize>, i| {
		let Some(b) = best else {
			return Some(i);
		};
		let (oi, ob) = (objective(model, &attempts[i]), objective(model, &attempts[b]));
		let earlier = attempts[i].completion_index() < attempts[b].completion_index();
		if direction.is_better(oi, ob) || (oi == ob && earlier) {
			Some(i)
		} else {
			Some(b)
		}
	})
}

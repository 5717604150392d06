//! Cross-validation of successful attempts against each other and against the
//! original model.

use solver_types::{OptimizationModel, RunAttempt, Verdict};

#[derive(Debug, Clone, PartialEq)]
pub struct CrossValidation {
	pub verdict: Verdict,
	pub warnings: Vec<String>,
}

/// `|a - b| / max(1, |a|)`
pub fn relative_difference(a: f64, b: f64) -> f64 {
	(a - b).abs() / a.abs().max(1.0)
}

/// Compares every pair of successful attempts.
///
/// Objectives are evaluated from each solution vector on the original model.
/// Two solutions agree when those objectives are within `tolerance` of each
/// other and both satisfy the model within `epsilon`. A reported objective
/// that does not match its own solution is a dispute as well; with a single
/// success it only leaves a warning.
pub fn cross_validate(
	model: &OptimizationModel,
	attempts: &[RunAttempt],
	tolerance: f64,
	epsilon: f64,
) -> CrossValidation {
	let successful: Vec<&RunAttempt> = attempts.iter().filter(|a| a.status().is_success()).collect();

	let mut warnings = Vec::new();
	for attempt in &successful {
		let evaluated = evaluated_objective(model, attempt);
		if let (Some(reported), Some(evaluated)) = (attempt.objective(), evaluated) {
			let diff = relative_difference(evaluated, reported);
			if diff > tolerance {
				warnings.push(format!(
					"'{}' reported objective {} but its solution evaluates to {} (relative difference {:.3e})",
					attempt.solver(),
					reported,
					evaluated,
					diff
				));
			}
		}
	}

	// A lone success has nothing to be checked against.
	let verdict = match successful.len() {
		0 => Verdict::NotApplicable,
		1 => Verdict::Unverified,
		_ => Verdict::Agreed,
	};
	if verdict != Verdict::Agreed {
		return CrossValidation { verdict, warnings };
	}

	for attempt in &successful {
		match violation(model, attempt) {
			Some(v) if v <= epsilon => {}
			Some(v) => {
				warnings.push(format!(
					"Solution from '{}' violates the model by {:.3e} (epsilon {:.1e})",
					attempt.solver(),
					v,
					epsilon
				));
			}
			None => {
				warnings.push(format!(
					"'{}' reported success without a usable solution",
					attempt.solver()
				));
			}
		}
	}

	for (i, a) in successful.iter().enumerate() {
		for b in &successful[i + 1..] {
			// Attempts without any objective were already flagged above.
			let (Some(oa), Some(ob)) = (evaluated_objective(model, a), evaluated_objective(model, b))
			else {
				continue;
			};
			let diff = relative_difference(oa, ob);
			if diff > tolerance {
				warnings.push(format!(
					"Objectives disagree: '{}' = {} vs '{}' = {} (relative difference {:.3e} > {:.1e})",
					a.solver(),
					oa,
					b.solver(),
					ob,
					diff,
					tolerance
				));
			}
		}
	}

	// Every violation and every disagreement leaves a warning.
	let verdict = if warnings.is_empty() {
		Verdict::Agreed
	} else {
		Verdict::Disputed
	};
	CrossValidation { verdict, warnings }
}

/// Objective of `attempt`'s solution on `model`, falling back to the reported
/// value when there is no usable solution vector.
pub(crate) fn evaluated_objective(model: &OptimizationModel, attempt: &RunAttempt) -> Option<f64> {
	usable_values(model, attempt)
		.map(|values| model.objective_value(values))
		.or_else(|| attempt.objective())
}

fn usable_values<'a>(model: &OptimizationModel, attempt: &'a RunAttempt) -> Option<&'a [f64]> {
	attempt
		.values()
		.filter(|values| values.len() == model.num_variables())
}

/// Worst violation of `attempt`'s solution, `None` if it has no usable one.
pub(crate) fn violation(model: &OptimizationModel, attempt: &RunAttempt) -> Option<f64> {
	usable_values(model, attempt).map(|values| model.max_violation(values))
}

#[cfg(test)]
mod tests {
	use super::*;
	use solver_types::{AttemptReport, ModelBuilder, ParameterSet, RelOp, RunStatus, SolverId};
	use std::time::Duration;

	fn model() -> OptimizationModel {
		let mut b = ModelBuilder::maximize();
		let x = b.continuous("x", 0.0, 10.0);
		let y = b.continuous("y", 0.0, 10.0);
		b.constraint(&[(x, 1.0), (y, 1.0)], RelOp::Le, 10.0)
			.objective(x, 1.0)
			.objective(y, 1.0);
		b.build().unwrap()
	}

	fn attempt(id: &str, status: RunStatus, objective: f64, values: Vec<f64>) -> RunAttempt {
		let mut a = RunAttempt::new(SolverId::from(id), ParameterSet::new(), Duration::from_secs(1));
		a.start().unwrap();
		a.finish(
			status,
			AttemptReport {
				objective: Some(objective),
				values: Some(values),
				gap: None,
				termination: String::new(),
			},
		)
		.unwrap();
		a
	}

	#[test]
	fn test_agreement() {
		let attempts = vec![
			attempt("a", RunStatus::Optimal, 10.0, vec![5.0, 5.0]),
			attempt("b", RunStatus::Feasible, 10.00001, vec![10.0, 0.0]),
		];
		let result = cross_validate(&model(), &attempts, 1e-4, 1e-6);
		assert_eq!(result.verdict, Verdict::Agreed);
		assert!(result.warnings.is_empty());
	}

	#[test]
	fn test_five_percent_gap_is_disputed() {
		let attempts = vec![
			attempt("a", RunStatus::Optimal, 10.0, vec![5.0, 5.0]),
			attempt("b", RunStatus::Feasible, 9.5, vec![5.0, 4.5]),
		];
		let result = cross_validate(&model(), &attempts, 1e-4, 1e-6);
		assert_eq!(result.verdict, Verdict::Disputed);
		assert_eq!(result.warnings.len(), 1);
		assert!(result.warnings[0].contains("disagree"));
	}

	#[test]
	fn test_constraint_violation_is_disputed() {
		let attempts = vec![
			attempt("a", RunStatus::Optimal, 10.0, vec![5.0, 5.0]),
			attempt("b", RunStatus::Feasible, 10.0, vec![6.0, 6.0]),
		];
		let result = cross_validate(&model(), &attempts, 1e-4, 1e-6);
		assert_eq!(result.verdict, Verdict::Disputed);
		assert!(result.warnings.iter().any(|w| w.contains("violates")));
	}

	#[test]
	fn test_reported_objective_must_match_solution() {
		let attempts = vec![
			attempt("liar", RunStatus::Feasible, 50.0, vec![1.0, 1.0]),
			attempt("honest", RunStatus::Feasible, 10.0, vec![5.0, 5.0]),
		];
		let result = cross_validate(&model(), &attempts, 1e-4, 1e-6);
		assert_eq!(result.verdict, Verdict::Disputed);
		assert!(result
			.warnings
			.iter()
			.any(|w| w.contains("'liar' reported objective 50") && w.contains("evaluates to 2")));
		assert_eq!(evaluated_objective(&model(), &attempts[0]), Some(2.0));
	}

	#[test]
	fn test_missing_objective_is_evaluated_from_values() {
		let mut silent = RunAttempt::new(SolverId::from("silent"), ParameterSet::new(), Duration::from_secs(1));
		silent.start().unwrap();
		silent
			.finish(
				RunStatus::Feasible,
				AttemptReport {
					objective: None,
					values: Some(vec![2.0, 2.0]),
					gap: None,
					termination: String::new(),
				},
			)
			.unwrap();
		let attempts = vec![attempt("a", RunStatus::Optimal, 10.0, vec![5.0, 5.0]), silent];

		let result = cross_validate(&model(), &attempts, 1e-4, 1e-6);
		assert_eq!(result.verdict, Verdict::Disputed);
		assert!(result.warnings.iter().any(|w| w.contains("'silent' = 4")));
	}

	#[test]
	fn test_single_and_zero_successes() {
		let one = vec![
			attempt("a", RunStatus::Feasible, 3.0, vec![1.0, 2.0]),
			attempt("b", RunStatus::TimedOut, 99.0, vec![9.0, 9.0]),
		];
		assert_eq!(
			cross_validate(&model(), &one, 1e-4, 1e-6).verdict,
			Verdict::Unverified
		);

		let none = vec![attempt("b", RunStatus::Error, 0.0, vec![])];
		assert_eq!(
			cross_validate(&model(), &none, 1e-4, 1e-6).verdict,
			Verdict::NotApplicable
		);
	}

	#[test]
	fn test_relative_difference() {
		assert_eq!(relative_difference(0.5, 0.25), 0.25);
		assert_eq!(relative_difference(200.0, 190.0), 0.05);
	}
}

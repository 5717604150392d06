//! Exact LP/MIP backend built on the pure-Rust `microlp` simplex solver.
//!
//! `microlp` cannot be interrupted, so the solve runs on the blocking pool.
//! When the race worker gives up on it the join handle is dropped and the
//! thread keeps its core until `microlp` returns. Each solve holds a permit
//! from a per-adapter semaphore for the life of that thread, so abandoned
//! solves count against `max_concurrent` and cannot pile up. Use the
//! `command` adapter when a backend must be killed on a hard stop.

use crate::{AdapterError, OutcomeStatus, SolveOutcome, SolverAdapter};
use async_trait::async_trait;
use microlp::{ComparisonOp, LinearExpr, OptimizationDirection, Problem};
use solver_types::{
	CancelToken, ConfigSchema, Direction, Field, FieldType, ModelClass, OptimizationModel,
	ParameterSet, RelOp, Schema, SolverDescriptor, SolverId, ValidationError,
};
use std::sync::Arc;
use tokio::sync::Semaphore;

pub const NAME: &str = "microlp";

/// Magnitude used in place of infinite bounds on integer variables.
const DEFAULT_INTEGER_BOUND: i64 = 1_000_000_000;

/// Solves allowed on the blocking pool at once, abandoned ones included.
const DEFAULT_MAX_CONCURRENT: i64 = 4;

pub fn default_descriptor() -> SolverDescriptor {
	SolverDescriptor {
		id: SolverId::new(NAME),
		implementation: NAME.to_string(),
		suitability: [(ModelClass::Linear, 0.95), (ModelClass::MixedInteger, 0.8)]
			.into_iter()
			.collect(),
		exact: true,
		default_parameters: ParameterSet::new(),
		nominal_rate: 0.05,
		strengths: vec!["dual simplex".into(), "branch and bound".into()],
	}
}

pub struct MicrolpConfigSchema;

impl ConfigSchema for MicrolpConfigSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::strict(
			vec![],
			vec![Field::new(
				"max_concurrent",
				FieldType::Integer {
					min: Some(1),
					max: Some(1024),
				},
			)],
		)
		.validate(config)
	}
}

pub struct MicrolpParameterSchema;

impl ConfigSchema for MicrolpParameterSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::strict(
			vec![],
			vec![Field::new(
				"integer_bound",
				FieldType::Integer {
					min: Some(1),
					max: Some(i32::MAX as i64),
				},
			)],
		)
		.validate(config)
	}
}

pub struct MicrolpSolver {
	inflight: Arc<Semaphore>,
}

impl MicrolpSolver {
	pub fn new(max_concurrent: usize) -> Self {
		Self {
			inflight: Arc::new(Semaphore::new(max_concurrent.max(1))),
		}
	}
}

impl Default for MicrolpSolver {
	fn default() -> Self {
		Self::new(DEFAULT_MAX_CONCURRENT as usize)
	}
}

fn solve_blocking(model: &OptimizationModel, integer_bound: f64) -> Result<SolveOutcome, AdapterError> {
	let direction = match model.objective.direction {
		Direction::Minimize => OptimizationDirection::Minimize,
		Direction::Maximize => OptimizationDirection::Maximize,
	};
	let mut problem = Problem::new(direction);

	let mut costs = vec![0.0; model.num_variables()];
	for term in &model.objective.linear {
		costs[term.var.index()] += term.coef;
	}

	let mut vars = Vec::with_capacity(model.num_variables());
	for (var, &cost) in model.variables.iter().zip(&costs) {
		if var.kind.is_integral() {
			let (mut lower, mut upper) = (var.lower, var.upper);
			if var.kind == solver_types::VarKind::Binary {
				lower = lower.max(0.0);
				upper = upper.min(1.0);
			}
			let lower = lower.max(-integer_bound).ceil();
			let upper = upper.min(integer_bound).floor();
			if lower > upper {
				return Ok(SolveOutcome::proof(
					OutcomeStatus::Infeasible,
					format!("integer variable {} has an empty domain", var.name),
				));
			}
			vars.push(problem.add_integer_var(cost, (lower as i32, upper as i32)));
		} else {
			vars.push(problem.add_var(cost, (var.lower, var.upper)));
		}
	}

	for constraint in &model.constraints {
		if constraint.terms.is_empty() {
			if constraint.violation(&[]) > 0.0 {
				return Ok(SolveOutcome::proof(
					OutcomeStatus::Infeasible,
					"empty constraint cannot be satisfied",
				));
			}
			continue;
		}
		let mut expr = LinearExpr::empty();
		for term in &constraint.terms {
			expr.add(vars[term.var.index()], term.coef);
		}
		let op = match constraint.op {
			RelOp::Le => ComparisonOp::Le,
			RelOp::Ge => ComparisonOp::Ge,
			RelOp::Eq => ComparisonOp::Eq,
		};
		problem.add_constraint(expr, op, constraint.rhs);
	}

	match problem.solve() {
		Ok(solution) => {
			let values: Vec<f64> = model
				.variables
				.iter()
				.zip(&vars)
				.map(|(var, &v)| {
					let value = solution[v];
					if var.kind.is_integral() {
						value.round()
					} else {
						value
					}
				})
				.collect();
			let objective = model.objective_value(&values);
			Ok(SolveOutcome::solution(OutcomeStatus::Optimal, objective, values)
				.with_message("optimality proven"))
		}
		Err(microlp::Error::Infeasible) => Ok(SolveOutcome::proof(
			OutcomeStatus::Infeasible,
			"simplex proved infeasibility",
		)),
		Err(microlp::Error::Unbounded) => Ok(SolveOutcome::proof(
			OutcomeStatus::Unbounded,
			"simplex proved unboundedness",
		)),
		Err(e) => Err(AdapterError::Backend(e.to_string())),
	}
}

#[async_trait]
impl SolverAdapter for MicrolpSolver {
	fn parameter_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MicrolpParameterSchema)
	}

	async fn solve(
		&self,
		model: Arc<OptimizationModel>,
		params: &ParameterSet,
		cancel: CancelToken,
	) -> Result<SolveOutcome, AdapterError> {
		if !model.objective.quadratic.is_empty() {
			return Err(AdapterError::Unsupported(
				"quadratic objectives are not supported".into(),
			));
		}
		let integer_bound = params
			.get("integer_bound")
			.and_then(|v| v.as_integer())
			.unwrap_or(DEFAULT_INTEGER_BOUND)
			.clamp(1, i32::MAX as i64) as f64;

		let permit = tokio::select! {
			permit = self.inflight.clone().acquire_owned() => permit
				.map_err(|e| AdapterError::Backend(format!("solver pool closed: {}", e)))?,
			_ = cancel.stopped() => return Err(AdapterError::Interrupted),
		};
		if cancel.should_stop() {
			return Err(AdapterError::Interrupted);
		}

		tokio::task::spawn_blocking(move || {
			let _permit = permit;
			solve_blocking(&model, integer_bound)
		})
		.await
			.map_err(|e| AdapterError::Backend(format!("solver thread failed: {}", e)))?
	}
}

/// Factory function to create a microlp adapter from configuration.
///
/// Accepts an optional `max_concurrent` bound on blocking solves.
pub fn create_solver(config: &toml::Value) -> Result<Box<dyn SolverAdapter>, AdapterError> {
	MicrolpConfigSchema
		.validate(config)
		.map_err(|e| AdapterError::InvalidConfig(e.to_string()))?;
	let max_concurrent = config
		.get("max_concurrent")
		.and_then(|v| v.as_integer())
		.unwrap_or(DEFAULT_MAX_CONCURRENT);
	Ok(Box::new(MicrolpSolver::new(max_concurrent as usize)))
}

#[cfg(test)]
mod tests {
	use super::*;
	use solver_types::ModelBuilder;

	async fn run(model: OptimizationModel) -> Result<SolveOutcome, AdapterError> {
		MicrolpSolver::default()
			.solve(Arc::new(model), &ParameterSet::new(), CancelToken::new())
			.await
	}

	#[tokio::test]
	async fn test_linear_optimum() {
		let mut b = ModelBuilder::maximize();
		let x = b.continuous("x", 0.0, f64::INFINITY);
		let y = b.continuous("y", 0.0, f64::INFINITY);
		b.constraint(&[(x, 1.0), (y, 2.0)], RelOp::Le, 4.0)
			.constraint(&[(x, 3.0), (y, 1.0)], RelOp::Le, 6.0)
			.objective(x, 1.0)
			.objective(y, 1.0);
		let outcome = run(b.build().unwrap()).await.unwrap();

		assert_eq!(outcome.status, OutcomeStatus::Optimal);
		assert!((outcome.objective.unwrap() - 2.8).abs() < 1e-6);
		let values = outcome.values.unwrap();
		assert!((values[0] - 1.6).abs() < 1e-6);
		assert!((values[1] - 1.2).abs() < 1e-6);
	}

	#[tokio::test]
	async fn test_integer_optimum() {
		let mut b = ModelBuilder::maximize();
		let x = b.integer("x", 0.0, f64::INFINITY);
		let y = b.integer("y", 0.0, f64::INFINITY);
		b.constraint(&[(x, 6.0), (y, 4.0)], RelOp::Le, 24.0)
			.constraint(&[(x, 1.0), (y, 2.0)], RelOp::Le, 6.0)
			.objective(x, 5.0)
			.objective(y, 4.0);
		let outcome = run(b.build().unwrap()).await.unwrap();

		assert_eq!(outcome.status, OutcomeStatus::Optimal);
		assert_eq!(outcome.objective, Some(20.0));
		assert_eq!(outcome.values, Some(vec![4.0, 0.0]));
	}

	#[tokio::test]
	async fn test_infeasible_and_unbounded() {
		let mut b = ModelBuilder::minimize();
		let x = b.continuous("x", 0.0, 10.0);
		b.constraint(&[(x, 1.0)], RelOp::Ge, 5.0)
			.constraint(&[(x, 1.0)], RelOp::Le, 3.0)
			.objective(x, 1.0);
		let outcome = run(b.build().unwrap()).await.unwrap();
		assert_eq!(outcome.status, OutcomeStatus::Infeasible);

		let mut b = ModelBuilder::maximize();
		let x = b.continuous("x", 0.0, f64::INFINITY);
		b.objective(x, 1.0);
		let outcome = run(b.build().unwrap()).await.unwrap();
		assert_eq!(outcome.status, OutcomeStatus::Unbounded);
	}

	#[tokio::test]
	async fn test_quadratic_is_unsupported() {
		let mut b = ModelBuilder::minimize();
		let x = b.continuous("x", -1.0, 1.0);
		b.quadratic(x, x, 1.0);
		assert!(matches!(
			run(b.build().unwrap()).await,
			Err(AdapterError::Unsupported(_))
		));
	}

	#[test]
	fn test_parameter_schema_rejects_unknown_keys() {
		let params: toml::Value = toml::from_str("pivot_rule = \"steepest\"").unwrap();
		assert!(MicrolpParameterSchema.validate(&params).is_err());
		let params: toml::Value = toml::from_str("integer_bound = 1000").unwrap();
		assert!(MicrolpParameterSchema.validate(&params).is_ok());
	}

	#[tokio::test]
	async fn test_saturated_pool_waits_until_stopped() {
		let solver = MicrolpSolver::new(1);
		let mut b = ModelBuilder::minimize();
		let x = b.continuous("x", 1.0, 3.0);
		b.objective(x, 1.0);
		let model = Arc::new(b.build().unwrap());

		// An abandoned solve still owns the only slot.
		let held = solver.inflight.clone().acquire_owned().await.unwrap();
		let cancel = CancelToken::new();
		let params = ParameterSet::new();
		let waiting = solver.solve(model.clone(), &params, cancel.clone());
		let stopper = async {
			tokio::time::sleep(std::time::Duration::from_millis(50)).await;
			cancel.cancel(solver_types::StopReason::Deadline);
		};
		let (outcome, _) = tokio::join!(waiting, stopper);
		assert!(matches!(outcome, Err(AdapterError::Interrupted)));

		drop(held);
		let outcome = solver
			.solve(model, &ParameterSet::new(), CancelToken::new())
			.await
			.unwrap();
		assert_eq!(outcome.objective, Some(1.0));
	}

	#[test]
	fn test_max_concurrent_must_be_positive() {
		let config: toml::Value = toml::from_str("max_concurrent = 0").unwrap();
		assert!(matches!(
			create_solver(&config),
			Err(AdapterError::InvalidConfig(_))
		));
		let config: toml::Value = toml::from_str("max_concurrent = 2").unwrap();
		assert!(create_solver(&config).is_ok());
	}
}

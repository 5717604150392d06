//! Randomized local search over the variable box.
//!
//! Handles every model class, including quadratic objectives, but never
//! certifies optimality: a successful run always reports `Feasible`. The
//! search minimizes `objective + penalty * total violation` with two move
//! kinds (repairing a violated constraint through one of its variables, and
//! a random step along one coordinate) and keeps the best feasible point
//! seen. The cancel token is polled every few hundred moves.

use crate::{AdapterError, OutcomeStatus, SolveOutcome, SolverAdapter};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use solver_types::{
	CancelToken, ConfigSchema, Direction, Field, FieldType, ModelClass, OptimizationModel,
	ParameterSet, Schema, SolverDescriptor, SolverId, ValidationError, VarKind,
};
use std::sync::Arc;

pub const NAME: &str = "local-search";

const POLL_INTERVAL: u64 = 256;
const FEASIBILITY_TOLERANCE: f64 = 1e-9;

pub fn default_descriptor() -> SolverDescriptor {
	SolverDescriptor {
		id: SolverId::new(NAME),
		implementation: NAME.to_string(),
		suitability: [
			(ModelClass::Linear, 0.3),
			(ModelClass::MixedInteger, 0.5),
			(ModelClass::Quadratic, 0.7),
			(ModelClass::Convex, 0.6),
		]
		.into_iter()
		.collect(),
		exact: false,
		default_parameters: ParameterSet::new(),
		nominal_rate: 0.5,
		strengths: vec!["any objective".into(), "cooperative cancellation".into()],
	}
}

pub struct LocalSearchConfigSchema;

impl ConfigSchema for LocalSearchConfigSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::strict(vec![], vec![]).validate(config)
	}
}

pub struct LocalSearchParameterSchema;

impl ConfigSchema for LocalSearchParameterSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::strict(
			vec![],
			vec![
				Field::new(
					"iterations",
					FieldType::Integer {
						min: Some(1),
						max: None,
					},
				),
				Field::new(
					"restarts",
					FieldType::Integer {
						min: Some(0),
						max: Some(1000),
					},
				),
				Field::new(
					"seed",
					FieldType::Integer {
						min: Some(0),
						max: None,
					},
				),
				Field::new(
					"step",
					FieldType::Float {
						min: Some(0.0),
						max: Some(1.0),
					},
				)
				.with_validator(|v| match v.as_float() {
					Some(step) if step <= 0.0 => Err("step must be positive".into()),
					_ => Ok(()),
				}),
				Field::new(
					"penalty",
					FieldType::Float {
						min: Some(0.0),
						max: None,
					},
				),
				Field::new(
					"box",
					FieldType::Float {
						min: Some(1.0),
						max: None,
					},
				),
			],
		);
		schema.validate(config)
	}
}

#[derive(Debug, Clone, Copy)]
struct Settings {
	iterations: u64,
	restarts: u64,
	seed: u64,
	step: f64,
	penalty: f64,
	bound_box: f64,
}

impl Settings {
	fn from_params(params: &ParameterSet) -> Self {
		let int = |key: &str, default: i64| {
			params
				.get(key)
				.and_then(|v| v.as_integer())
				.unwrap_or(default)
				.max(0) as u64
		};
		let float = |key: &str, default: f64| {
			params
				.get(key)
				.and_then(|v| v.as_float().or_else(|| v.as_integer().map(|i| i as f64)))
				.unwrap_or(default)
		};
		Self {
			iterations: int("iterations", 50_000).max(1),
			restarts: int("restarts", 3),
			seed: int("seed", 42),
			step: float("step", 0.1),
			penalty: float("penalty", 1_000.0),
			bound_box: float("box", 1_000.0),
		}
	}
}

struct Search<'a> {
	model: &'a OptimizationModel,
	lower: Vec<f64>,
	upper: Vec<f64>,
	sense: f64,
	settings: Settings,
}

impl<'a> Search<'a> {
	fn new(model: &'a OptimizationModel, settings: Settings) -> Result<Self, AdapterError> {
		let mut lower = Vec::with_capacity(model.num_variables());
		let mut upper = Vec::with_capacity(model.num_variables());
		for var in &model.variables {
			let (mut lo, mut hi) = (
				var.lower.max(-settings.bound_box),
				var.upper.min(settings.bound_box),
			);
			if var.kind == VarKind::Binary {
				lo = lo.max(0.0);
				hi = hi.min(1.0);
			}
			if var.kind.is_integral() {
				lo = lo.ceil();
				hi = hi.floor();
			}
			if lo > hi {
				return Err(AdapterError::NoSolution(format!(
					"variable {} has an empty domain",
					var.name
				)));
			}
			lower.push(lo);
			upper.push(hi);
		}
		let sense = match model.objective.direction {
			Direction::Minimize => 1.0,
			Direction::Maximize => -1.0,
		};
		Ok(Self {
			model,
			lower,
			upper,
			sense,
			settings,
		})
	}

	fn project(&self, j: usize, value: f64) -> f64 {
		let value = if self.model.variables[j].kind.is_integral() {
			value.round()
		} else {
			value
		};
		value.clamp(self.lower[j], self.upper[j])
	}

	fn total_violation(&self, x: &[f64]) -> f64 {
		self.model.constraints.iter().map(|c| c.violation(x)).sum()
	}

	fn score(&self, x: &[f64]) -> (f64, f64) {
		let violation = self.total_violation(x);
		let score = self.sense * self.model.objective_value(x) + self.settings.penalty * violation;
		(score, violation)
	}

	fn start_point(&self, rng: &mut StdRng, restart: u64) -> Vec<f64> {
		(0..self.lower.len())
			.map(|j| {
				let value = if restart == 0 || self.lower[j] == self.upper[j] {
					0.0
				} else {
					rng.gen_range(self.lower[j]..=self.upper[j])
				};
				self.project(j, value)
			})
			.collect()
	}

	/// A coordinate and its proposed new value.
	fn propose(&self, rng: &mut StdRng, x: &[f64]) -> Option<(usize, f64)> {
		if !self.model.constraints.is_empty() && rng.gen_bool(0.5) {
			let violated: Vec<usize> = self
				.model
				.constraints
				.iter()
				.enumerate()
				.filter(|(_, c)| c.violation(x) > 0.0)
				.map(|(i, _)| i)
				.collect();
			if !violated.is_empty() {
				let constraint = &self.model.constraints[violated[rng.gen_range(0..violated.len())]];
				let terms: Vec<_> = constraint.terms.iter().filter(|t| t.coef != 0.0).collect();
				if terms.is_empty() {
					return None;
				}
				let term = terms[rng.gen_range(0..terms.len())];
				let delta = (constraint.rhs - constraint.activity(x)) / term.coef;
				let j = term.var.index();
				return Some((j, self.project(j, x[j] + delta)));
			}
		}

		let j = rng.gen_range(0..x.len());
		let width = (self.upper[j] - self.lower[j]).max(1.0);
		let mut delta = rng.gen_range(-1.0..=1.0) * self.settings.step * width;
		if self.model.variables[j].kind.is_integral() && delta.abs() < 1.0 {
			delta = if delta < 0.0 { -1.0 } else { 1.0 };
		}
		Some((j, self.project(j, x[j] + delta)))
	}

	fn run(&self, cancel: &CancelToken) -> Result<SolveOutcome, AdapterError> {
		let mut rng = StdRng::seed_from_u64(self.settings.seed);
		let direction = self.model.objective.direction;
		let mut best: Option<(f64, Vec<f64>)> = None;
		let mut moves = 0u64;
		let mut stopped = false;

		let consider = |x: &[f64], violation: f64, best: &mut Option<(f64, Vec<f64>)>| {
			if violation > FEASIBILITY_TOLERANCE {
				return;
			}
			let objective = self.model.objective_value(x);
			if best
				.as_ref()
				.map_or(true, |(incumbent, _)| direction.is_better(objective, *incumbent))
			{
				*best = Some((objective, x.to_vec()));
			}
		};

		'restarts: for restart in 0..=self.settings.restarts {
			let mut x = self.start_point(&mut rng, restart);
			let (mut current, violation) = self.score(&x);
			consider(&x, violation, &mut best);

			for _ in 0..self.settings.iterations {
				if moves % POLL_INTERVAL == 0 && cancel.should_stop() {
					stopped = true;
					break 'restarts;
				}
				moves += 1;

				let Some((j, value)) = self.propose(&mut rng, &x) else {
					continue;
				};
				if value == x[j] {
					continue;
				}
				let old = x[j];
				x[j] = value;
				let (score, violation) = self.score(&x);
				if score <= current {
					current = score;
					consider(&x, violation, &mut best);
				} else {
					x[j] = old;
				}
			}
		}

		match best {
			Some((objective, values)) => {
				let message = if stopped {
					format!("interrupted after {} moves", moves)
				} else {
					format!("best of {} moves", moves)
				};
				Ok(SolveOutcome::solution(OutcomeStatus::Feasible, objective, values)
					.with_message(message))
			}
			None if stopped => Err(AdapterError::Interrupted),
			None => Err(AdapterError::NoSolution(format!(
				"no feasible point found in {} moves",
				moves
			))),
		}
	}
}

pub struct LocalSearchSolver;

#[async_trait]
impl SolverAdapter for LocalSearchSolver {
	fn parameter_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(LocalSearchParameterSchema)
	}

	async fn solve(
		&self,
		model: Arc<OptimizationModel>,
		params: &ParameterSet,
		cancel: CancelToken,
	) -> Result<SolveOutcome, AdapterError> {
		let settings = Settings::from_params(params);
		tokio::task::spawn_blocking(move || Search::new(&model, settings)?.run(&cancel))
			.await
			.map_err(|e| AdapterError::Backend(format!("search thread failed: {}", e)))?
	}
}

/// Factory function to create a local search adapter from configuration.
///
/// The adapter takes no construction options; tuning happens via parameters.
pub fn create_solver(config: &toml::Value) -> Result<Box<dyn SolverAdapter>, AdapterError> {
	LocalSearchConfigSchema
		.validate(config)
		.map_err(|e| AdapterError::InvalidConfig(e.to_string()))?;
	Ok(Box::new(LocalSearchSolver))
}

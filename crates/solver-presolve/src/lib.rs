//! Model preprocessing ahead of the solver race.
//!
//! Presolve produces an equivalent model with tighter variable bounds and
//! fewer constraints, or proves that no feasible point exists. Variables are
//! never removed or reordered, so a solution of the reduced model is also a
//! value vector for the submitted model.

use solver_types::{Constraint, OptimizationModel, PresolveSummary, RelOp, Term, VarKind};
use std::collections::HashMap;
use tracing::{debug, info};

/// Relative coefficient difference below which two normalized rows are parallel.
const PARALLEL_TOL: f64 = 1e-9;

/// Presolve tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresolveConfig {
	/// When false the model is passed through untouched.
	pub enabled: bool,
	/// Upper limit on bound-propagation sweeps.
	pub max_passes: usize,
	/// Slack used when comparing activities and bounds.
	pub tolerance: f64,
}

impl Default for PresolveConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			max_passes: 10,
			tolerance: 1e-9,
		}
	}
}

/// Result of [`preprocess`].
#[derive(Debug, Clone)]
pub struct PresolveOutcome {
	/// The reduced model. Equal to the input when infeasibility was proven.
	pub model: OptimizationModel,
	pub statically_infeasible: bool,
	/// Constraints removed (singletons, redundant rows, duplicates).
	pub eliminated_count: usize,
	/// Variable bounds made strictly tighter.
	pub tightened_bounds: usize,
	pub reason: Option<String>,
}

impl PresolveOutcome {
	pub fn summary(&self) -> PresolveSummary {
		PresolveSummary {
			eliminated_constraints: self.eliminated_count,
			tightened_bounds: self.tightened_bounds,
			statically_infeasible: self.statically_infeasible,
			reason: self.reason.clone(),
		}
	}

	fn unchanged(model: &OptimizationModel) -> Self {
		Self {
			model: model.clone(),
			statically_infeasible: false,
			eliminated_count: 0,
			tightened_bounds: 0,
			reason: None,
		}
	}
}

/// Proof that the model has no feasible point.
struct Infeasible(String);

type Step<T> = Result<T, Infeasible>;

/// Tighten bounds, drop redundant constraints and look for a static proof of
/// infeasibility.
pub fn preprocess(model: &OptimizationModel, config: &PresolveConfig) -> PresolveOutcome {
	if !config.enabled {
		return PresolveOutcome::unchanged(model);
	}

	let mut presolver = Presolver::new(model, config.tolerance);
	match presolver.run(config.max_passes) {
		Ok(()) => {
			let outcome = presolver.finish(model);
			info!(
				eliminated = outcome.eliminated_count,
				tightened = outcome.tightened_bounds,
				constraints = outcome.model.num_constraints(),
				"Presolve complete"
			);
			outcome
		}
		Err(Infeasible(reason)) => {
			info!(%reason, "Presolve proved infeasibility");
			PresolveOutcome {
				model: model.clone(),
				statically_infeasible: true,
				eliminated_count: 0,
				tightened_bounds: 0,
				reason: Some(reason),
			}
		}
	}
}

struct Presolver<'a> {
	source: &'a OptimizationModel,
	lower: Vec<f64>,
	upper: Vec<f64>,
	rows: Vec<Constraint>,
	eliminated: usize,
	tol: f64,
}

/// Minimum and maximum of a row's activity over the current box.
/// Infinite contributions are counted separately so that residuals stay finite.
#[derive(Debug, Default)]
struct Activity {
	min: f64,
	min_inf: usize,
	max: f64,
	max_inf: usize,
}

impl Activity {
	fn min(&self) -> f64 {
		if self.min_inf > 0 {
			f64::NEG_INFINITY
		} else {
			self.min
		}
	}

	fn max(&self) -> f64 {
		if self.max_inf > 0 {
			f64::INFINITY
		} else {
			self.max
		}
	}
}

/// Whether two normalized rows over the same support are proportional.
fn same_direction(a: &[Term], b: &[Term]) -> bool {
	a.iter().zip(b).all(|(x, y)| {
		(x.coef - y.coef).abs() <= PARALLEL_TOL * x.coef.abs().max(y.coef.abs())
	})
}

fn row_label(row: &Constraint, index: usize) -> String {
	row.name
		.clone()
		.unwrap_or_else(|| format!("constraint {}", index))
}

/// Drops zero coefficients and merges repeated variables.
fn normalize_terms(terms: &[Term]) -> Vec<Term> {
	let mut merged: Vec<Term> = Vec::with_capacity(terms.len());
	for term in terms {
		match merged.iter_mut().find(|t| t.var == term.var) {
			Some(existing) => existing.coef += term.coef,
			None => merged.push(*term),
		}
	}
	merged.retain(|t| t.coef != 0.0);
	merged
}

impl<'a> Presolver<'a> {
	fn new(model: &'a OptimizationModel, tol: f64) -> Self {
		let rows = model
			.constraints
			.iter()
			.map(|c| Constraint {
				terms: normalize_terms(&c.terms),
				..c.clone()
			})
			.collect();
		Self {
			source: model,
			lower: model.variables.iter().map(|v| v.lower).collect(),
			upper: model.variables.iter().map(|v| v.upper).collect(),
			rows,
			eliminated: 0,
			tol,
		}
	}

	fn run(&mut self, max_passes: usize) -> Step<()> {
		for j in 0..self.lower.len() {
			if self.source.variables[j].kind == VarKind::Binary {
				self.tighten_lower(j, 0.0)?;
				self.tighten_upper(j, 1.0)?;
			}
			let (lo, hi) = (self.lower[j], self.upper[j]);
			self.tighten_lower(j, lo)?;
			self.tighten_upper(j, hi)?;
		}

		for pass in 0..max_passes.max(1) {
			let changed = self.sweep()?;
			debug!(pass, changed, rows = self.rows.len(), "Presolve sweep");
			if !changed {
				break;
			}
		}

		self.merge_parallel_rows()
	}

	fn is_integral(&self, j: usize) -> bool {
		self.source.variables[j].kind.is_integral()
	}

	fn check_domain(&self, j: usize) -> Step<()> {
		if self.lower[j] > self.upper[j] + self.tol {
			return Err(Infeasible(format!(
				"variable {} has empty domain [{}, {}]",
				self.source.variables[j].name, self.lower[j], self.upper[j]
			)));
		}
		Ok(())
	}

	/// Raises the lower bound of `j` to `value` if that is tighter.
	fn tighten_lower(&mut self, j: usize, value: f64) -> Step<bool> {
		let value = if self.is_integral(j) {
			(value - self.tol).ceil()
		} else {
			value
		};
		let current = self.lower[j];
		let improvement = self.tol * current.abs().max(1.0);
		let changed = current == f64::NEG_INFINITY && value > f64::NEG_INFINITY
			|| value > current + improvement;
		if changed {
			self.lower[j] = value;
		}
		self.check_domain(j)?;
		Ok(changed)
	}

	/// Lowers the upper bound of `j` to `value` if that is tighter.
	fn tighten_upper(&mut self, j: usize, value: f64) -> Step<bool> {
		let value = if self.is_integral(j) {
			(value + self.tol).floor()
		} else {
			value
		};
		let current = self.upper[j];
		let improvement = self.tol * current.abs().max(1.0);
		let changed =
			current == f64::INFINITY && value < f64::INFINITY || value < current - improvement;
		if changed {
			self.upper[j] = value;
		}
		self.check_domain(j)?;
		Ok(changed)
	}

	fn activity(&self, row: &Constraint) -> Activity {
		let mut act = Activity::default();
		for term in &row.terms {
			let j = term.var.index();
			let (at_min, at_max) = if term.coef > 0.0 {
				(self.lower[j], self.upper[j])
			} else {
				(self.upper[j], self.lower[j])
			};
			let lo = term.coef * at_min;
			let hi = term.coef * at_max;
			if lo.is_finite() {
				act.min += lo;
			} else {
				act.min_inf += 1;
			}
			if hi.is_finite() {
				act.max += hi;
			} else {
				act.max_inf += 1;
			}
		}
		act
	}

	/// One pass over all rows. Returns whether anything changed.
	fn sweep(&mut self) -> Step<bool> {
		let mut changed = false;
		let rows = std::mem::take(&mut self.rows);
		let mut kept = Vec::with_capacity(rows.len());

		for (index, row) in rows.into_iter().enumerate() {
			match row.terms.len() {
				0 => {
					if row.violation(&[]) > self.tol {
						return Err(Infeasible(format!(
							"{} reads 0 {} {}",
							row_label(&row, index),
							row.op,
							row.rhs
						)));
					}
					self.eliminated += 1;
					changed = true;
				}
				1 => {
					self.apply_singleton(&row)?;
					self.eliminated += 1;
					changed = true;
				}
				_ => {
					let act = self.activity(&row);
					let (min, max) = (act.min(), act.max());
					let slack = self.tol * row.rhs.abs().max(1.0);
					let (never, always) = match row.op {
						RelOp::Le => (min > row.rhs + slack, max <= row.rhs + slack),
						RelOp::Ge => (max < row.rhs - slack, min >= row.rhs - slack),
						RelOp::Eq => (
							min > row.rhs + slack || max < row.rhs - slack,
							(max - min).abs() <= slack && (min - row.rhs).abs() <= slack,
						),
					};
					if never {
						return Err(Infeasible(format!(
							"{} can never be satisfied (activity range [{}, {}], {} {})",
							row_label(&row, index),
							min,
							max,
							row.op,
							row.rhs
						)));
					}
					if always {
						debug!(row = %row_label(&row, index), "Dropping redundant constraint");
						self.eliminated += 1;
						changed = true;
						continue;
					}
					changed |= self.propagate(&row, &act)?;
					kept.push(row);
				}
			}
		}

		self.rows = kept;
		Ok(changed)
	}

	fn apply_singleton(&mut self, row: &Constraint) -> Step<()> {
		let term = row.terms[0];
		let j = term.var.index();
		let bound = row.rhs / term.coef;
		let op = if term.coef < 0.0 {
			row.op.flipped()
		} else {
			row.op
		};
		match op {
			RelOp::Le => {
				self.tighten_upper(j, bound)?;
			}
			RelOp::Ge => {
				self.tighten_lower(j, bound)?;
			}
			RelOp::Eq => {
				self.tighten_lower(j, bound)?;
				self.tighten_upper(j, bound)?;
			}
		}
		Ok(())
	}

	/// Bounds implied for each variable by the finite activity of the others.
	fn propagate(&mut self, row: &Constraint, act: &Activity) -> Step<bool> {
		let mut changed = false;
		for term in &row.terms {
			let j = term.var.index();
			let a = term.coef;
			let (own_min, own_max) = if a > 0.0 {
				(a * self.lower[j], a * self.upper[j])
			} else {
				(a * self.upper[j], a * self.lower[j])
			};

			if matches!(row.op, RelOp::Le | RelOp::Eq) {
				// a x <= rhs - min activity of the other terms
				let residual = if own_min.is_finite() {
					(act.min_inf == 0).then(|| act.min - own_min)
				} else {
					(act.min_inf == 1).then_some(act.min)
				};
				if let Some(rest) = residual {
					let limit = (row.rhs - rest) / a;
					changed |= if a > 0.0 {
						self.tighten_upper(j, limit)?
					} else {
						self.tighten_lower(j, limit)?
					};
				}
			}

			if matches!(row.op, RelOp::Ge | RelOp::Eq) {
				// a x >= rhs - max activity of the other terms
				let residual = if own_max.is_finite() {
					(act.max_inf == 0).then(|| act.max - own_max)
				} else {
					(act.max_inf == 1).then_some(act.max)
				};
				if let Some(rest) = residual {
					let limit = (row.rhs - rest) / a;
					changed |= if a > 0.0 {
						self.tighten_lower(j, limit)?
					} else {
						self.tighten_upper(j, limit)?
					};
				}
			}
		}
		Ok(changed)
	}

	/// Collapses rows with proportional left-hand sides into at most one
	/// `<=`/`>=` pair (or one equality), keeping the tightest right-hand sides.
	fn merge_parallel_rows(&mut self) -> Step<()> {
		#[derive(Default)]
		struct Group {
			first: usize,
			terms: Vec<Term>,
			name: Option<String>,
			upper: Option<f64>,
			lower: Option<f64>,
			equal: Option<f64>,
		}

		let mut groups: Vec<Group> = Vec::new();
		let mut by_support: HashMap<Vec<usize>, Vec<usize>> = HashMap::new();

		for (index, row) in self.rows.iter().enumerate() {
			let mut terms = row.terms.clone();
			terms.sort_by_key(|t| t.var);
			let scale = terms[0].coef;
			let (op, rhs) = if scale < 0.0 {
				(row.op.flipped(), row.rhs / scale)
			} else {
				(row.op, row.rhs / scale)
			};
			for t in &mut terms {
				t.coef /= scale;
			}

			let support: Vec<usize> = terms.iter().map(|t| t.var.index()).collect();
			let candidates = by_support.entry(support).or_default();
			let found = candidates
				.iter()
				.copied()
				.find(|&g| same_direction(&groups[g].terms, &terms));
			let slot = match found {
				Some(g) => g,
				None => {
					candidates.push(groups.len());
					groups.push(Group {
						first: index,
						terms,
						name: row.name.clone(),
						..Default::default()
					});
					groups.len() - 1
				}
			};
			let group = &mut groups[slot];
			match op {
				RelOp::Le => group.upper = Some(group.upper.map_or(rhs, |u| u.min(rhs))),
				RelOp::Ge => group.lower = Some(group.lower.map_or(rhs, |l| l.max(rhs))),
				RelOp::Eq => {
					if let Some(existing) = group.equal {
						if (existing - rhs).abs() > self.tol * rhs.abs().max(1.0) {
							return Err(Infeasible(format!(
								"{} and {} require different values",
								row_label(&self.rows[group.first], group.first),
								row_label(row, index)
							)));
						}
					}
					group.equal = Some(rhs);
				}
			}
		}

		let before = self.rows.len();
		let mut merged = Vec::with_capacity(groups.len());
		for group in groups {
			let label = row_label(&self.rows[group.first], group.first);
			let slack = |v: f64| self.tol * v.abs().max(1.0);
			if let (Some(lo), Some(hi)) = (group.lower, group.upper) {
				if lo > hi + slack(hi) {
					return Err(Infeasible(format!(
						"{} requires {} <= activity <= {}",
						label, lo, hi
					)));
				}
			}

			let make = |op: RelOp, rhs: f64| Constraint {
				name: group.name.clone(),
				terms: group.terms.clone(),
				op,
				rhs,
			};
			if let Some(eq) = group.equal {
				if group.lower.is_some_and(|lo| eq < lo - slack(lo))
					|| group.upper.is_some_and(|hi| eq > hi + slack(hi))
				{
					return Err(Infeasible(format!(
						"{} fixes activity to {} outside its other limits",
						label, eq
					)));
				}
				merged.push(make(RelOp::Eq, eq));
				continue;
			}
			match (group.lower, group.upper) {
				(Some(lo), Some(hi)) if (hi - lo).abs() <= slack(hi) => {
					merged.push(make(RelOp::Eq, hi))
				}
				(lo, hi) => {
					if let Some(lo) = lo {
						merged.push(make(RelOp::Ge, lo));
					}
					if let Some(hi) = hi {
						merged.push(make(RelOp::Le, hi));
					}
				}
			}
		}

		self.eliminated += before.saturating_sub(merged.len());
		self.rows = merged;
		Ok(())
	}

	fn finish(self, model: &OptimizationModel) -> PresolveOutcome {
		let tightened = model
			.variables
			.iter()
			.enumerate()
			.map(|(j, v)| {
				usize::from(self.lower[j] > v.lower) + usize::from(self.upper[j] < v.upper)
			})
			.sum();

		let mut reduced = model.clone();
		for (j, var) in reduced.variables.iter_mut().enumerate() {
			var.lower = self.lower[j];
			var.upper = self.upper[j];
		}
		reduced.constraints = self.rows;

		PresolveOutcome {
			model: reduced,
			statically_infeasible: false,
			eliminated_count: self.eliminated,
			tightened_bounds: tightened,
			reason: None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use solver_types::ModelBuilder;

	fn run(model: &OptimizationModel) -> PresolveOutcome {
		preprocess(model, &PresolveConfig::default())
	}

	#[test]
	fn test_contradicting_singletons_are_infeasible() {
		let mut b = ModelBuilder::minimize();
		let x = b.continuous("x", f64::NEG_INFINITY, f64::INFINITY);
		b.constraint(&[(x, 1.0)], RelOp::Ge, 5.0)
			.constraint(&[(x, 1.0)], RelOp::Le, 3.0)
			.objective(x, 1.0);
		let outcome = run(&b.build().unwrap());

		assert!(outcome.statically_infeasible);
		assert!(outcome.reason.as_ref().unwrap().contains('x'));
		assert!(outcome.summary().statically_infeasible);
	}

	#[test]
	fn test_singletons_become_bounds() {
		let mut b = ModelBuilder::maximize();
		let x = b.continuous("x", 0.0, f64::INFINITY);
		let y = b.continuous("y", 0.0, f64::INFINITY);
		b.constraint(&[(x, 2.0)], RelOp::Le, 8.0)
			.constraint(&[(y, -1.0)], RelOp::Le, -1.0)
			.constraint(&[(x, 1.0), (y, 1.0)], RelOp::Le, 10.0)
			.objective(x, 1.0);
		let outcome = run(&b.build().unwrap());

		assert!(!outcome.statically_infeasible);
		let vars = &outcome.model.variables;
		assert_eq!(vars[0].upper, 4.0);
		assert_eq!(vars[1].lower, 1.0);
		// y <= 10 - min(x) = 10
		assert_eq!(vars[1].upper, 10.0);
		assert_eq!(outcome.model.num_constraints(), 1);
		assert_eq!(outcome.eliminated_count, 2);
		assert_eq!(outcome.tightened_bounds, 3);
	}

	#[test]
	fn test_redundant_row_is_dropped() {
		let mut b = ModelBuilder::minimize();
		let x = b.continuous("x", 0.0, 1.0);
		let y = b.continuous("y", 0.0, 1.0);
		b.constraint(&[(x, 1.0), (y, 1.0)], RelOp::Le, 5.0)
			.constraint(&[(x, 1.0), (y, -1.0)], RelOp::Le, 0.5)
			.objective(x, 1.0);
		let outcome = run(&b.build().unwrap());
		assert_eq!(outcome.model.num_constraints(), 1);
		assert_eq!(outcome.model.constraints[0].rhs, 0.5);
	}

	#[test]
	fn test_unsatisfiable_row_is_infeasible() {
		let mut b = ModelBuilder::minimize();
		let x = b.continuous("x", 0.0, 1.0);
		let y = b.continuous("y", 0.0, 1.0);
		b.constraint(&[(x, 1.0), (y, 1.0)], RelOp::Ge, 3.0)
			.objective(x, 1.0);
		assert!(run(&b.build().unwrap()).statically_infeasible);
	}

	#[test]
	fn test_integer_bounds_round_inward() {
		let mut b = ModelBuilder::minimize();
		let n = b.integer("n", 0.5, 7.9);
		let m = b.integer("m", 0.0, 100.0);
		b.constraint(&[(n, 2.0), (m, 2.0)], RelOp::Le, 7.0)
			.objective(n, 1.0);
		let outcome = run(&b.build().unwrap());
		let vars = &outcome.model.variables;
		assert_eq!((vars[0].lower, vars[0].upper), (1.0, 3.0));
		assert_eq!(vars[1].upper, 2.0);
	}

	#[test]
	fn test_parallel_rows_are_merged() {
		let mut b = ModelBuilder::minimize();
		let x = b.continuous("x", 0.0, 100.0);
		let y = b.continuous("y", 0.0, 100.0);
		b.constraint(&[(x, 1.0), (y, 2.0)], RelOp::Le, 40.0)
			.constraint(&[(x, 2.0), (y, 4.0)], RelOp::Le, 60.0)
			.constraint(&[(y, -2.0), (x, -1.0)], RelOp::Le, -10.0)
			.objective(x, 1.0);
		let outcome = run(&b.build().unwrap());

		let rows = &outcome.model.constraints;
		assert_eq!(rows.len(), 2);
		assert!(rows.iter().any(|r| r.op == RelOp::Le && r.rhs == 30.0));
		assert!(rows.iter().any(|r| r.op == RelOp::Ge && r.rhs == 10.0));
	}

	#[test]
	fn test_large_coefficient_ratios_stay_distinct() {
		let mut b = ModelBuilder::minimize();
		let x = b.continuous("x", 0.0, 1e11);
		let y = b.continuous("y", 0.0, 1.0);
		b.constraint(&[(x, 1.0), (y, 1e10)], RelOp::Le, 1e10)
			.constraint(&[(x, 1.0), (y, 2e10)], RelOp::Le, 1e10)
			.objective(x, 1.0);
		let outcome = run(&b.build().unwrap());
		assert!(!outcome.statically_infeasible);
		assert_eq!(outcome.model.constraints.len(), 2);

		let mut b = ModelBuilder::minimize();
		let x = b.continuous("x", 0.0, 100.0);
		let y = b.continuous("y", 0.0, 100.0);
		b.constraint(&[(x, 1.0), (y, 3.0)], RelOp::Le, 50.0)
			.constraint(&[(x, 2.0), (y, 6.000_000_000_001)], RelOp::Le, 80.0)
			.objective(x, 1.0);
		let rows = run(&b.build().unwrap()).model.constraints;
		assert_eq!(rows.len(), 1);
		assert_eq!(rows[0].rhs, 40.0);
	}

	#[test]
	fn test_contradicting_parallel_rows_are_infeasible() {
		let mut b = ModelBuilder::minimize();
		let x = b.continuous("x", 0.0, 100.0);
		let y = b.continuous("y", 0.0, 100.0);
		b.constraint(&[(x, 1.0), (y, 1.0)], RelOp::Eq, 10.0)
			.constraint(&[(x, 3.0), (y, 3.0)], RelOp::Eq, 36.0)
			.objective(x, 1.0);
		assert!(run(&b.build().unwrap()).statically_infeasible);
	}

	#[test]
	fn test_reduced_model_keeps_feasible_points() {
		let mut b = ModelBuilder::maximize();
		let x = b.continuous("x", 0.0, f64::INFINITY);
		let y = b.continuous("y", 0.0, f64::INFINITY);
		b.constraint(&[(x, 1.0), (y, 2.0)], RelOp::Le, 4.0)
			.constraint(&[(x, 3.0), (y, 1.0)], RelOp::Le, 6.0)
			.objective(x, 1.0)
			.objective(y, 1.0);
		let model = b.build().unwrap();
		let outcome = run(&model);

		let optimum = [1.6, 1.2];
		assert!(model.is_feasible(&optimum, 1e-9));
		assert!(outcome.model.is_feasible(&optimum, 1e-9));
		assert_eq!(outcome.model.variables[0].upper, 2.0);
		assert_eq!(outcome.model.variables[1].upper, 2.0);
	}

	#[test]
	fn test_disabled_is_passthrough() {
		let mut b = ModelBuilder::minimize();
		let x = b.continuous("x", 0.0, 1.0);
		b.constraint(&[(x, 1.0)], RelOp::Ge, 5.0).objective(x, 1.0);
		let model = b.build().unwrap();
		let config = PresolveConfig {
			enabled: false,
			..Default::default()
		};
		let outcome = preprocess(&model, &config);
		assert!(!outcome.statically_infeasible);
		assert_eq!(outcome.model, model);
	}
}

//! Optimization model definitions.
//!
//! An [`OptimizationModel`] is the immutable input of one orchestration
//! request: decision variables with bounds, linear constraints and an
//! objective that may carry quadratic terms. Inside the engine variables are
//! addressed by [`VarId`]; the serialized form addresses them by name and is
//! resolved (and checked) when the model is deserialized.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Errors raised while building or validating a model.
#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
	/// A term references a variable name that was never declared.
	#[error("Unknown variable: {0}")]
	UnknownVariable(String),
	/// Two variables share the same name.
	#[error("Duplicate variable: {0}")]
	DuplicateVariable(String),
	/// A term references a variable index past the end of the variable list.
	#[error("Variable index {0} out of range")]
	IndexOutOfRange(usize),
	/// A coefficient, bound or right-hand side is NaN or infinite where it must be finite.
	#[error("Non-finite value in {0}")]
	NonFinite(String),
	/// The model declares no variables.
	#[error("Model has no variables")]
	Empty,
}

/// Index of a variable inside [`OptimizationModel::variables`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VarId(pub usize);

impl VarId {
	pub fn index(self) -> usize {
		self.0
	}
}

/// Domain of a decision variable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarKind {
	#[default]
	Continuous,
	Integer,
	Binary,
}

impl VarKind {
	/// Whether values of this kind must be integral.
	pub fn is_integral(self) -> bool {
		matches!(self, VarKind::Integer | VarKind::Binary)
	}
}

/// A decision variable. Infinite bounds mean "unbounded on that side".
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
	pub name: String,
	pub kind: VarKind,
	pub lower: f64,
	pub upper: f64,
}

/// Relational operator of a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelOp {
	#[serde(rename = "<=", alias = "le")]
	Le,
	#[serde(rename = ">=", alias = "ge")]
	Ge,
	#[serde(rename = "=", alias = "eq", alias = "==")]
	Eq,
}

impl RelOp {
	/// The operator obtained when both sides are multiplied by a negative number.
	pub fn flipped(self) -> Self {
		match self {
			RelOp::Le => RelOp::Ge,
			RelOp::Ge => RelOp::Le,
			RelOp::Eq => RelOp::Eq,
		}
	}
}

impl fmt::Display for RelOp {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RelOp::Le => write!(f, "<="),
			RelOp::Ge => write!(f, ">="),
			RelOp::Eq => write!(f, "="),
		}
	}
}

/// A single `coef * var` term.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Term {
	pub var: VarId,
	pub coef: f64,
}

impl Term {
	pub fn new(var: VarId, coef: f64) -> Self {
		Self { var, coef }
	}
}

/// A `coef * a * b` objective term.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadTerm {
	pub a: VarId,
	pub b: VarId,
	pub coef: f64,
}

/// A linear constraint `sum(terms) op rhs`.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
	pub name: Option<String>,
	pub terms: Vec<Term>,
	pub op: RelOp,
	pub rhs: f64,
}

impl Constraint {
	pub fn new(terms: Vec<Term>, op: RelOp, rhs: f64) -> Self {
		Self {
			name: None,
			terms,
			op,
			rhs,
		}
	}

	/// Left-hand side value at `x`.
	pub fn activity(&self, x: &[f64]) -> f64 {
		self.terms.iter().map(|t| t.coef * x[t.var.0]).sum()
	}

	/// Amount by which `x` violates this constraint (zero when satisfied).
	pub fn violation(&self, x: &[f64]) -> f64 {
		let lhs = self.activity(x);
		match self.op {
			RelOp::Le => (lhs - self.rhs).max(0.0),
			RelOp::Ge => (self.rhs - lhs).max(0.0),
			RelOp::Eq => (lhs - self.rhs).abs(),
		}
	}
}

/// Optimization direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
	#[serde(alias = "min")]
	Minimize,
	#[serde(alias = "max")]
	Maximize,
}

impl Direction {
	/// Whether objective value `a` is strictly better than `b`.
	pub fn is_better(self, a: f64, b: f64) -> bool {
		match self {
			Direction::Minimize => a < b,
			Direction::Maximize => a > b,
		}
	}
}

/// Objective function: linear terms, optional quadratic terms and a constant.
#[derive(Debug, Clone, PartialEq)]
pub struct Objective {
	pub direction: Direction,
	pub linear: Vec<Term>,
	pub quadratic: Vec<QuadTerm>,
	pub constant: f64,
}

impl Objective {
	pub fn new(direction: Direction) -> Self {
		Self {
			direction,
			linear: Vec::new(),
			quadratic: Vec::new(),
			constant: 0.0,
		}
	}

	pub fn value(&self, x: &[f64]) -> f64 {
		let linear: f64 = self.linear.iter().map(|t| t.coef * x[t.var.0]).sum();
		let quadratic: f64 = self
			.quadratic
			.iter()
			.map(|q| q.coef * x[q.a.0] * x[q.b.0])
			.sum();
		self.constant + linear + quadratic
	}
}

/// Problem class used for solver capability matching.
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ModelClass {
	Linear,
	MixedInteger,
	Quadratic,
	Convex,
}

impl ModelClass {
	pub fn all() -> [ModelClass; 4] {
		[
			ModelClass::Linear,
			ModelClass::MixedInteger,
			ModelClass::Quadratic,
			ModelClass::Convex,
		]
	}

	pub fn as_str(self) -> &'static str {
		match self {
			ModelClass::Linear => "linear",
			ModelClass::MixedInteger => "mixed_integer",
			ModelClass::Quadratic => "quadratic",
			ModelClass::Convex => "convex",
		}
	}
}

impl fmt::Display for ModelClass {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl std::str::FromStr for ModelClass {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"linear" | "lp" => Ok(ModelClass::Linear),
			"mixed_integer" | "mip" => Ok(ModelClass::MixedInteger),
			"quadratic" | "qp" => Ok(ModelClass::Quadratic),
			"convex" => Ok(ModelClass::Convex),
			other => Err(format!("Unknown model class: {}", other)),
		}
	}
}

/// A fully specified optimization model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ModelDocument", into = "ModelDocument")]
pub struct OptimizationModel {
	pub name: Option<String>,
	pub variables: Vec<Variable>,
	pub constraints: Vec<Constraint>,
	pub objective: Objective,
	/// Overrides the derived class, e.g. to mark a model as general convex.
	pub class_hint: Option<ModelClass>,
}

impl OptimizationModel {
	pub fn num_variables(&self) -> usize {
		self.variables.len()
	}

	pub fn num_constraints(&self) -> usize {
		self.constraints.len()
	}

	/// Number of nonzero constraint coefficients.
	pub fn nonzeros(&self) -> usize {
		self.constraints
			.iter()
			.map(|c| c.terms.iter().filter(|t| t.coef != 0.0).count())
			.sum()
	}

	/// Fraction of the constraint matrix that is nonzero.
	pub fn density(&self) -> f64 {
		let cells = self.num_variables() * self.num_constraints();
		if cells == 0 {
			return 0.0;
		}
		self.nonzeros() as f64 / cells as f64
	}

	pub fn has_integers(&self) -> bool {
		self.variables.iter().any(|v| v.kind.is_integral())
	}

	pub fn class(&self) -> ModelClass {
		if let Some(hint) = self.class_hint {
			return hint;
		}
		if !self.objective.quadratic.is_empty() {
			ModelClass::Quadratic
		} else if self.has_integers() {
			ModelClass::MixedInteger
		} else {
			ModelClass::Linear
		}
	}

	pub fn objective_value(&self, x: &[f64]) -> f64 {
		self.objective.value(x)
	}

	/// Largest violation of any bound, constraint or integrality requirement.
	///
	/// A vector of the wrong length is infinitely infeasible.
	pub fn max_violation(&self, x: &[f64]) -> f64 {
		if x.len() != self.variables.len() || x.iter().any(|v| !v.is_finite()) {
			return f64::INFINITY;
		}

		let bounds = self
			.variables
			.iter()
			.zip(x)
			.map(|(var, &value)| {
				let bound = (var.lower - value).max(value - var.upper).max(0.0);
				let integrality = if var.kind.is_integral() {
					(value - value.round()).abs()
				} else {
					0.0
				};
				bound.max(integrality)
			})
			.fold(0.0, f64::max);

		self.constraints
			.iter()
			.map(|c| c.violation(x))
			.fold(bounds, f64::max)
	}

	pub fn is_feasible(&self, x: &[f64], epsilon: f64) -> bool {
		self.max_violation(x) <= epsilon
	}

	/// Checks indices and numeric sanity. Bound consistency is left to presolve.
	pub fn validate(&self) -> Result<(), ModelError> {
		if self.variables.is_empty() {
			return Err(ModelError::Empty);
		}
		let n = self.variables.len();

		for var in &self.variables {
			if var.lower.is_nan()
				|| var.upper.is_nan()
				|| var.lower == f64::INFINITY
				|| var.upper == f64::NEG_INFINITY
			{
				return Err(ModelError::NonFinite(format!("bounds of {}", var.name)));
			}
		}

		let check_term = |var: VarId, coef: f64, context: &str| -> Result<(), ModelError> {
			if var.0 >= n {
				return Err(ModelError::IndexOutOfRange(var.0));
			}
			if !coef.is_finite() {
				return Err(ModelError::NonFinite(context.to_string()));
			}
			Ok(())
		};

		for (i, constraint) in self.constraints.iter().enumerate() {
			let context = constraint
				.name
				.clone()
				.unwrap_or_else(|| format!("constraint {}", i));
			for term in &constraint.terms {
				check_term(term.var, term.coef, &context)?;
			}
			if !constraint.rhs.is_finite() {
				return Err(ModelError::NonFinite(context));
			}
		}

		for term in &self.objective.linear {
			check_term(term.var, term.coef, "objective")?;
		}
		for term in &self.objective.quadratic {
			check_term(term.a, term.coef, "objective")?;
			check_term(term.b, term.coef, "objective")?;
		}
		if !self.objective.constant.is_finite() {
			return Err(ModelError::NonFinite("objective constant".to_string()));
		}

		Ok(())
	}
}

/// Programmatic model construction.
pub struct ModelBuilder {
	name: Option<String>,
	variables: Vec<Variable>,
	constraints: Vec<Constraint>,
	objective: Objective,
	class_hint: Option<ModelClass>,
}

impl ModelBuilder {
	pub fn new(direction: Direction) -> Self {
		Self {
			name: None,
			variables: Vec::new(),
			constraints: Vec::new(),
			objective: Objective::new(direction),
			class_hint: None,
		}
	}

	pub fn minimize() -> Self {
		Self::new(Direction::Minimize)
	}

	pub fn maximize() -> Self {
		Self::new(Direction::Maximize)
	}

	pub fn name(mut self, name: impl Into<String>) -> Self {
		self.name = Some(name.into());
		self
	}

	pub fn class_hint(mut self, class: ModelClass) -> Self {
		self.class_hint = Some(class);
		self
	}

	pub fn variable(&mut self, name: impl Into<String>, kind: VarKind, lower: f64, upper: f64) -> VarId {
		let id = VarId(self.variables.len());
		self.variables.push(Variable {
			name: name.into(),
			kind,
			lower,
			upper,
		});
		id
	}

	pub fn continuous(&mut self, name: impl Into<String>, lower: f64, upper: f64) -> VarId {
		self.variable(name, VarKind::Continuous, lower, upper)
	}

	pub fn integer(&mut self, name: impl Into<String>, lower: f64, upper: f64) -> VarId {
		self.variable(name, VarKind::Integer, lower, upper)
	}

	pub fn binary(&mut self, name: impl Into<String>) -> VarId {
		self.variable(name, VarKind::Binary, 0.0, 1.0)
	}

	pub fn constraint(&mut self, terms: &[(VarId, f64)], op: RelOp, rhs: f64) -> &mut Self {
		let terms = terms.iter().map(|&(var, coef)| Term::new(var, coef)).collect();
		self.constraints.push(Constraint::new(terms, op, rhs));
		self
	}

	pub fn objective(&mut self, var: VarId, coef: f64) -> &mut Self {
		self.objective.linear.push(Term::new(var, coef));
		self
	}

	pub fn quadratic(&mut self, a: VarId, b: VarId, coef: f64) -> &mut Self {
		self.objective.quadratic.push(QuadTerm { a, b, coef });
		self
	}

	pub fn build(self) -> Result<OptimizationModel, ModelError> {
		let model = OptimizationModel {
			name: self.name,
			variables: self.variables,
			constraints: self.constraints,
			objective: self.objective,
			class_hint: self.class_hint,
		};
		model.validate()?;
		Ok(model)
	}
}

// Serialized form: variables are referenced by name, infinite bounds are omitted.

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModelDocument {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	name: Option<String>,
	variables: Vec<VariableDocument>,
	#[serde(default)]
	constraints: Vec<ConstraintDocument>,
	objective: ObjectiveDocument,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	class: Option<ModelClass>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VariableDocument {
	name: String,
	#[serde(default)]
	kind: VarKind,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	lower: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	upper: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TermDocument {
	var: String,
	coef: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QuadTermDocument {
	a: String,
	b: String,
	coef: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConstraintDocument {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	name: Option<String>,
	terms: Vec<TermDocument>,
	op: RelOp,
	rhs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObjectiveDocument {
	direction: Direction,
	#[serde(default)]
	terms: Vec<TermDocument>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	quadratic: Vec<QuadTermDocument>,
	#[serde(default)]
	constant: f64,
}

impl TryFrom<ModelDocument> for OptimizationModel {
	type Error = ModelError;

	fn try_from(doc: ModelDocument) -> Result<Self, Self::Error> {
		let mut index = HashMap::with_capacity(doc.variables.len());
		let mut variables = Vec::with_capacity(doc.variables.len());

		for (i, var) in doc.variables.into_iter().enumerate() {
			if index.insert(var.name.clone(), VarId(i)).is_some() {
				return Err(ModelError::DuplicateVariable(var.name));
			}
			let (lower, upper) = match var.kind {
				VarKind::Binary => (var.lower.unwrap_or(0.0), var.upper.unwrap_or(1.0)),
				_ => (
					var.lower.unwrap_or(f64::NEG_INFINITY),
					var.upper.unwrap_or(f64::INFINITY),
				),
			};
			variables.push(Variable {
				name: var.name,
				kind: var.kind,
				lower,
				upper,
			});
		}

		let resolve = |name: &str| -> Result<VarId, ModelError> {
			index
				.get(name)
				.copied()
				.ok_or_else(|| ModelError::UnknownVariable(name.to_string()))
		};
		let resolve_terms = |terms: Vec<TermDocument>| -> Result<Vec<Term>, ModelError> {
			terms
				.into_iter()
				.map(|t| Ok(Term::new(resolve(&t.var)?, t.coef)))
				.collect()
		};

		let constraints = doc
			.constraints
			.into_iter()
			.map(|c| {
				Ok(Constraint {
					name: c.name,
					terms: resolve_terms(c.terms)?,
					op: c.op,
					rhs: c.rhs,
				})
			})
			.collect::<Result<Vec<_>, ModelError>>()?;

		let quadratic = doc
			.objective
			.quadratic
			.into_iter()
			.map(|q| {
				Ok(QuadTerm {
					a: resolve(&q.a)?,
					b: resolve(&q.b)?,
					coef: q.coef,
				})
			})
			.collect::<Result<Vec<_>, ModelError>>()?;

		let model = OptimizationModel {
			name: doc.name,
			variables,
			constraints,
			objective: Objective {
				direction: doc.objective.direction,
				linear: resolve_terms(doc.objective.terms)?,
				quadratic,
				constant: doc.objective.constant,
			},
			class_hint: doc.class,
		};
		model.validate()?;
		Ok(model)
	}
}

impl From<OptimizationModel> for ModelDocument {
	fn from(model: OptimizationModel) -> Self {
		let names: Vec<String> = model.variables.iter().map(|v| v.name.clone()).collect();
		let term_docs = |terms: &[Term]| -> Vec<TermDocument> {
			terms
				.iter()
				.map(|t| TermDocument {
					var: names[t.var.0].clone(),
					coef: t.coef,
				})
				.collect()
		};
		let finite = |v: f64| if v.is_finite() { Some(v) } else { None };

		ModelDocument {
			name: model.name,
			variables: model
				.variables
				.iter()
				.map(|v| VariableDocument {
					name: v.name.clone(),
					kind: v.kind,
					lower: finite(v.lower),
					upper: finite(v.upper),
				})
				.collect(),
			constraints: model
				.constraints
				.iter()
				.map(|c| ConstraintDocument {
					name: c.name.clone(),
					terms: term_docs(&c.terms),
					op: c.op,
					rhs: c.rhs,
				})
				.collect(),
			objective: ObjectiveDocument {
				direction: model.objective.direction,
				terms: term_docs(&model.objective.linear),
				quadratic: model
					.objective
					.quadratic
					.iter()
					.map(|q| QuadTermDocument {
						a: names[q.a.0].clone(),
						b: names[q.b.0].clone(),
						coef: q.coef,
					})
					.collect(),
				constant: model.objective.constant,
			},
			class: model.class_hint,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn knapsack() -> OptimizationModel {
		let mut b = ModelBuilder::maximize();
		let x = b.binary("x");
		let y = b.integer("y", 0.0, 4.0);
		b.constraint(&[(x, 3.0), (y, 2.0)], RelOp::Le, 7.0);
		b.objective(x, 5.0).objective(y, 2.0);
		b.build().unwrap()
	}

	#[test]
	fn test_class_derivation() {
		assert_eq!(knapsack().class(), ModelClass::MixedInteger);

		let mut b = ModelBuilder::minimize();
		let x = b.continuous("x", 0.0, 1.0);
		b.objective(x, 1.0);
		assert_eq!(b.build().unwrap().class(), ModelClass::Linear);

		let mut b = ModelBuilder::minimize();
		let x = b.continuous("x", 0.0, 1.0);
		b.quadratic(x, x, 1.0);
		assert_eq!(b.build().unwrap().class(), ModelClass::Quadratic);
	}

	#[test]
	fn test_max_violation_covers_integrality_and_constraints() {
		let model = knapsack();
		assert_eq!(model.max_violation(&[1.0, 2.0]), 0.0);
		// 3 + 2*2.5 = 8 > 7 and y is fractional
		assert!((model.max_violation(&[1.0, 2.5]) - 1.0).abs() < 1e-12);
		assert!(model.max_violation(&[1.0]).is_infinite());
	}

	#[test]
	fn test_document_resolves_names() {
		let json = r#"{
			"variables": [
				{"name": "x", "lower": 0},
				{"name": "y", "lower": 0}
			],
			"constraints": [
				{"terms": [{"var": "x", "coef": 1}, {"var": "y", "coef": 1}], "op": "<=", "rhs": 10}
			],
			"objective": {"direction": "max", "terms": [{"var": "x", "coef": 1}, {"var": "y", "coef": 1}]}
		}"#;
		let model: OptimizationModel = serde_json::from_str(json).unwrap();
		assert_eq!(model.num_variables(), 2);
		assert_eq!(model.variables[0].upper, f64::INFINITY);
		assert_eq!(model.constraints[0].terms[1].var, VarId(1));
		assert_eq!(model.objective.direction, Direction::Maximize);

		let round_trip: OptimizationModel =
			serde_json::from_str(&serde_json::to_string(&model).unwrap()).unwrap();
		assert_eq!(round_trip, model);
	}

	#[test]
	fn test_document_rejects_unknown_variable() {
		let json = r#"{
			"variables": [{"name": "x"}],
			"constraints": [{"terms": [{"var": "z", "coef": 1}], "op": "le", "rhs": 1}],
			"objective": {"direction": "minimize"}
		}"#;
		let err = serde_json::from_str::<OptimizationModel>(json).unwrap_err();
		assert!(err.to_string().contains("Unknown variable: z"));
	}

	#[test]
	fn test_validate_rejects_nan_coefficient() {
		let mut b = ModelBuilder::minimize();
		let x = b.continuous("x", 0.0, 1.0);
		b.constraint(&[(x, f64::NAN)], RelOp::Le, 1.0);
		assert!(matches!(b.build(), Err(ModelError::NonFinite(_))));
	}
}

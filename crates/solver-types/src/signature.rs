//! Coarse problem fingerprints used as keys into the performance history.

use crate::model::{ModelClass, OptimizationModel};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How finely a signature partitions the space of models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
	Exact,
	Coarse,
}

/// Fingerprint of a model's shape.
///
/// Two different models with similar size, class and density share a
/// signature, so performance learned on one generalizes to the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProblemSignature {
	pub class: ModelClass,
	pub variable_bucket: u8,
	pub constraint_bucket: u8,
	pub density_bucket: u8,
	pub has_integers: bool,
	pub granularity: Granularity,
}

/// `0` for an empty count, otherwise `ceil(log2(n)) + 1`.
fn size_bucket(n: usize) -> u8 {
	if n == 0 {
		return 0;
	}
	(usize::BITS - (n - 1).leading_zeros()) as u8 + 1
}

impl ProblemSignature {
	pub fn of(model: &OptimizationModel) -> Self {
		let density_bucket = (model.density() * 10.0).ceil().clamp(0.0, 10.0) as u8;
		Self {
			class: model.class(),
			variable_bucket: size_bucket(model.num_variables()),
			constraint_bucket: size_bucket(model.num_constraints()),
			density_bucket,
			has_integers: model.has_integers(),
			granularity: Granularity::Exact,
		}
	}

	/// The fallback key: density dropped, size buckets merged pairwise.
	pub fn coarse(&self) -> Self {
		match self.granularity {
			Granularity::Coarse => *self,
			Granularity::Exact => Self {
				class: self.class,
				variable_bucket: self.variable_bucket.div_ceil(2),
				constraint_bucket: self.constraint_bucket.div_ceil(2),
				density_bucket: 0,
				has_integers: self.has_integers,
				granularity: Granularity::Coarse,
			},
		}
	}

	pub fn is_coarse(&self) -> bool {
		self.granularity == Granularity::Coarse
	}
}

impl fmt::Display for ProblemSignature {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{}-v{}-c{}-d{}{}{}",
			self.class,
			self.variable_bucket,
			self.constraint_bucket,
			self.density_bucket,
			if self.has_integers { "-int" } else { "" },
			if self.is_coarse() { "-coarse" } else { "" },
		)
	}
}

//! Scripted solver adapters for engine tests.

use async_trait::async_trait;
use solver_registry::{
	AdapterError, Implementation, OutcomeStatus, SolveOutcome, SolverAdapter, SolverRegistry,
};
use solver_types::{
	CancelToken, ConfigSchema, ModelClass, OptimizationModel, ParameterSet, Schema,
	SolverDescriptor, SolverId,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub(crate) enum Action {
	Return(SolveOutcome),
	Fail(String),
	Panic,
}

/// What a scripted adapter does when asked to solve.
#[derive(Clone)]
pub(crate) struct Behaviour {
	pub action: Action,
	pub delay: Duration,
	/// Whether the delay is cut short by cancellation.
	pub cooperative: bool,
	pub calls: Arc<AtomicUsize>,
}

impl Behaviour {
	fn new(action: Action) -> Self {
		Self {
			action,
			delay: Duration::ZERO,
			cooperative: true,
			calls: Arc::new(AtomicUsize::new(0)),
		}
	}

	pub fn optimal(objective: f64, values: Vec<f64>) -> Self {
		Self::new(Action::Return(SolveOutcome::solution(
			OutcomeStatus::Optimal,
			objective,
			values,
		)))
	}

	pub fn feasible(objective: f64, values: Vec<f64>) -> Self {
		Self::new(Action::Return(SolveOutcome::solution(
			OutcomeStatus::Feasible,
			objective,
			values,
		)))
	}

	pub fn proof(status: OutcomeStatus) -> Self {
		Self::new(Action::Return(SolveOutcome::proof(status, "scripted proof")))
	}

	pub fn fail(message: &str) -> Self {
		Self::new(Action::Fail(message.to_string()))
	}

	pub fn panic() -> Self {
		Self::new(Action::Panic)
	}

	pub fn after(mut self, delay: Duration) -> Self {
		self.delay = delay;
		self
	}

	/// Ignores cancellation while sleeping.
	pub fn stubborn(mut self) -> Self {
		self.cooperative = false;
		self
	}

	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

struct ScriptedAdapter {
	behaviour: Behaviour,
}

#[async_trait]
impl SolverAdapter for ScriptedAdapter {
	fn parameter_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(Schema::new(vec![], vec![]))
	}

	async fn solve(
		&self,
		_model: Arc<OptimizationModel>,
		_params: &ParameterSet,
		cancel: CancelToken,
	) -> Result<SolveOutcome, AdapterError> {
		self.behaviour.calls.fetch_add(1, Ordering::SeqCst);
		if !self.behaviour.delay.is_zero() {
			if self.behaviour.cooperative {
				tokio::select! {
					_ = tokio::time::sleep(self.behaviour.delay) => {}
					_ = cancel.stopped() => return Err(AdapterError::Interrupted),
				}
			} else {
				tokio::time::sleep(self.behaviour.delay).await;
			}
		}
		match &self.behaviour.action {
			Action::Return(outcome) => Ok(outcome.clone()),
			Action::Fail(message) => Err(AdapterError::Backend(message.clone())),
			Action::Panic => panic!("scripted backend crash"),
		}
	}
}

pub(crate) fn descriptor(id: &str, classes: Vec<(ModelClass, f64)>, exact: bool) -> SolverDescriptor {
	SolverDescriptor {
		id: SolverId::from(id),
		implementation: "scripted".into(),
		suitability: classes.into_iter().collect(),
		exact,
		default_parameters: ParameterSet::new(),
		nominal_rate: 0.01,
		strengths: vec![],
	}
}

/// Factory building adapters that follow `behaviour`.
pub(crate) fn scripted(
	behaviour: Behaviour,
) -> impl Fn(&toml::Value) -> Result<Box<dyn SolverAdapter>, AdapterError> + Send + Sync + 'static {
	move |_config: &toml::Value| {
		Ok(Box::new(ScriptedAdapter {
			behaviour: behaviour.clone(),
		}) as Box<dyn SolverAdapter>)
	}
}

pub(crate) fn implementation(defaults: SolverDescriptor, behaviour: Behaviour) -> Implementation {
	Implementation::new(defaults, scripted(behaviour))
}

pub(crate) fn registry_with(
	entries: Vec<(&str, Vec<(ModelClass, f64)>, bool, Behaviour)>,
) -> SolverRegistry {
	let mut registry = SolverRegistry::new();
	for (id, classes, exact, behaviour) in entries {
		let imp = implementation(descriptor(id, classes, exact), behaviour);
		registry
			.register(
				imp.descriptor(SolverId::from(id)),
				toml::Value::Table(toml::Table::new()),
				imp.factory.clone(),
			)
			.unwrap();
	}
	registry
}

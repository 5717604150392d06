//! Solver orchestration engine.
//!
//! [`Orchestrator::solve`] runs one request end to end: validate the model,
//! presolve it, shortlist solvers, race them, cross-validate the successful
//! results and pick the winner. The only state that outlives a request is the
//! performance history behind the [`Tuner`].

use arc_swap::ArcSwap;
use solver_config::{OrchestratorConfig, StorageBackend};
use solver_presolve::{preprocess, PresolveConfig};
use solver_registry::{
	builtin_implementations, AdapterError, Implementation, SolverAdapter, SolverRegistry,
};
use solver_storage::implementations::file::FileStorage;
use solver_storage::StorageService;
use solver_tuner::implementations::memory::MemoryPerformanceStore;
use solver_tuner::implementations::persistent::PersistentPerformanceStore;
use solver_tuner::{PerformanceStore, Tuner, TunerConfig};
use solver_types::{
	ModelClass, OptimizationModel, ProblemSignature, RaceResult, RaceStatus, SolveOptions,
	SolverDescriptor, SolverId, Verdict,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub mod aggregator;
pub mod error;
pub mod race;
pub mod selector;
pub mod validator;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{BuildError, OrchestrationError};
pub use race::{RaceConfig, RaceCoordinator};
pub use selector::{Candidate, Selector, SelectorWeights};

/// Runtime settings of the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
	/// Options used by callers that have no request-specific ones.
	pub defaults: SolveOptions,
	/// Feasibility tolerance against the original model.
	pub epsilon: f64,
	pub race: RaceConfig,
	pub weights: SelectorWeights,
	pub presolve: PresolveConfig,
	pub tuner: TunerConfig,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			defaults: SolveOptions::default(),
			epsilon: 1e-6,
			race: RaceConfig::default(),
			weights: SelectorWeights::default(),
			presolve: PresolveConfig::default(),
			tuner: TunerConfig::default(),
		}
	}
}

impl From<&OrchestratorConfig> for EngineConfig {
	fn from(config: &OrchestratorConfig) -> Self {
		let engine = &config.engine;
		Self {
			defaults: SolveOptions {
				max_wall_time: engine.max_wall_time(),
				max_candidates: engine.max_candidates,
				tolerance: engine.tolerance,
			},
			epsilon: engine.epsilon,
			race: RaceConfig {
				safety_margin: engine.safety_margin,
				grace_period: engine.grace_period(),
			},
			weights: SelectorWeights {
				capability: config.selector.capability_weight,
				success: config.selector.success_weight,
				speed: config.selector.speed_weight,
			},
			presolve: PresolveConfig {
				enabled: config.presolve.enabled,
				max_passes: config.presolve.max_passes,
				tolerance: config.presolve.tolerance,
			},
			tuner: TunerConfig {
				alpha: config.tuner.alpha,
			},
		}
	}
}

pub struct Orchestrator {
	registry: ArcSwap<SolverRegistry>,
	tuner: Arc<Tuner>,
	selector: Selector,
	coordinator: RaceCoordinator,
	config: EngineConfig,
}

impl Orchestrator {
	pub fn new(
		registry: SolverRegistry,
		store: Arc<dyn PerformanceStore>,
		config: EngineConfig,
	) -> Self {
		let tuner = Arc::new(Tuner::new(store, config.tuner));
		Self {
			registry: ArcSwap::from_pointee(registry),
			selector: Selector::new(config.weights),
			coordinator: RaceCoordinator::new(config.race, tuner.clone()),
			tuner,
			config,
		}
	}

	/// The current catalog snapshot.
	pub fn registry(&self) -> Arc<SolverRegistry> {
		self.registry.load_full()
	}

	/// Swaps in a new catalog. Races already running keep their snapshot.
	pub fn replace_registry(&self, registry: SolverRegistry) {
		info!(solvers = registry.len(), "Replacing solver registry");
		self.registry.store(Arc::new(registry));
	}

	pub fn tuner(&self) -> &Arc<Tuner> {
		&self.tuner
	}

	pub fn config(&self) -> &EngineConfig {
		&self.config
	}

	pub fn default_options(&self) -> SolveOptions {
		self.config.defaults
	}

	/// Solves `model` within `options.max_wall_time`.
	///
	/// Returns the winning result, or an error carrying the diagnostic result
	/// when presolve proves infeasibility or no attempt succeeds.
	#[instrument(skip_all, fields(model = model.name.as_deref().unwrap_or("unnamed")))]
	pub async fn solve(
		&self,
		model: OptimizationModel,
		options: SolveOptions,
	) -> Result<RaceResult, OrchestrationError> {
		let started = Instant::now();
		let deadline = started + options.max_wall_time;
		check_options(&options)?;
		model.validate()?;

		let original = Arc::new(model);
		let signature = ProblemSignature::of(&original);
		info!(
			%signature,
			variables = original.num_variables(),
			constraints = original.num_constraints(),
			"Solving model"
		);

		let presolved = preprocess(&original, &self.config.presolve);
		let presolve = presolved.summary();
		if presolved.statically_infeasible {
			info!(reason = ?presolve.reason, "Presolve proved infeasibility");
			let result = RaceResult {
				id: Uuid::new_v4(),
				status: RaceStatus::Infeasible,
				winning_attempt: None,
				attempts: Vec::new(),
				verdict: Verdict::NotApplicable,
				disputed: false,
				warnings: Vec::new(),
				elapsed: started.elapsed(),
				signature: Some(signature),
				presolve,
			};
			return Err(OrchestrationError::StaticInfeasible {
				result: Box::new(result),
			});
		}

		let registry = self.registry.load_full();
		let tightened = presolved.model;
		let candidates = self
			.selector
			.select(
				&registry,
				&self.tuner,
				&tightened,
				&signature,
				options.max_candidates,
				options.max_wall_time,
			)
			.await?;
		info!(
			shortlist = ?candidates.iter().map(|c| c.descriptor.id.as_str()).collect::<Vec<_>>(),
			"Selected candidates"
		);

		let attempts = self
			.coordinator
			.run(registry, Arc::new(tightened), signature, candidates, deadline)
			.await;

		let validation =
			validator::cross_validate(&original, &attempts, options.tolerance, self.config.epsilon);
		let aggregation = aggregator::aggregate(&original, &attempts, self.config.epsilon);
		if validation.verdict == Verdict::Disputed {
			warn!(warnings = ?validation.warnings, "Successful solvers disagree");
		}

		let mut warnings = validation.warnings;
		warnings.extend(aggregation.warnings);
		let result = RaceResult {
			id: Uuid::new_v4(),
			status: aggregation.status,
			winning_attempt: aggregation.winner.map(|i| {
				let mut winner = attempts[i].clone();
				if let Some(objective) = validator::evaluated_objective(&original, &winner) {
					winner.restate_objective(objective);
				}
				winner
			}),
			verdict: validation.verdict,
			disputed: validation.verdict == Verdict::Disputed,
			attempts,
			warnings,
			elapsed: started.elapsed(),
			signature: Some(signature),
			presolve,
		};
		info!(
			status = ?result.status,
			verdict = ?result.verdict,
			objective = ?result.objective(),
			elapsed_ms = result.elapsed.as_millis() as u64,
			"Solve finished"
		);

		if result.is_success() {
			Ok(result)
		} else {
			Err(OrchestrationError::AllAttemptsFailed {
				result: Box::new(result),
			})
		}
	}
}

fn check_options(options: &SolveOptions) -> Result<(), OrchestrationError> {
	let invalid = |msg: String| Err(OrchestrationError::InvalidOptions(msg));
	if options.max_wall_time.is_zero() {
		return invalid("max_wall_time must be positive".into());
	}
	if options.max_candidates == 0 {
		return invalid("max_candidates must be at least 1".into());
	}
	if !(options.tolerance.is_finite() && options.tolerance > 0.0) {
		return invalid(format!(
			"tolerance must be a positive number, got {}",
			options.tolerance
		));
	}
	Ok(())
}

/// Assembles an [`Orchestrator`] from configuration.
///
/// Each enabled `[solvers.<id>]` entry is matched to an implementation by its
/// `type`. The built-in implementations are always available; more can be
/// added with [`OrchestratorBuilder::with_solver_factory`].
pub struct OrchestratorBuilder {
	config: OrchestratorConfig,
	implementations: BTreeMap<String, Implementation>,
	store: Option<Arc<dyn PerformanceStore>>,
}

impl OrchestratorBuilder {
	pub fn new(config: OrchestratorConfig) -> Self {
		Self {
			config,
			implementations: builtin_implementations(),
			store: None,
		}
	}

	pub fn with_solver_factory<F>(mut self, name: &str, defaults: SolverDescriptor, factory: F) -> Self
	where
		F: Fn(&toml::Value) -> Result<Box<dyn SolverAdapter>, AdapterError> + Send + Sync + 'static,
	{
		self.implementations
			.insert(name.to_string(), Implementation::new(defaults, factory));
		self
	}

	/// Uses `store` instead of the one described by `[storage]`.
	pub fn with_performance_store(mut self, store: Arc<dyn PerformanceStore>) -> Self {
		self.store = Some(store);
		self
	}

	/// Registers every enabled solver, in id order.
	pub fn build_registry(&self) -> Result<SolverRegistry, BuildError> {
		let mut registry = SolverRegistry::new();
		for (id, entry) in self.config.enabled_solvers() {
			let imp = self
				.implementations
				.get(&entry.implementation)
				.ok_or_else(|| {
					solver_registry::RegistryError::UnknownImplementation(entry.implementation.clone())
				})?;

			let mut descriptor = imp.descriptor(SolverId::new(id.as_str()));
			if let Some(classes) = &entry.classes {
				descriptor.suitability = classes
					.iter()
					.map(|(name, score)| {
						name.parse::<ModelClass>()
							.map(|class| (class, *score))
							.map_err(|e| BuildError::Config(format!("solver '{}': {}", id, e)))
					})
					.collect::<Result<_, _>>()?;
			}
			if let Some(exact) = entry.exact {
				descriptor.exact = exact;
			}
			if let Some(rate) = entry.nominal_rate {
				descriptor.nominal_rate = rate;
			}
			if let Some(strengths) = &entry.strengths {
				descriptor.strengths = strengths.clone();
			}
			descriptor
				.default_parameters
				.extend(entry.parameters.clone());

			registry.register(descriptor, entry.config.clone(), imp.factory.clone())?;
		}
		Ok(registry)
	}

	async fn performance_store(&self) -> Result<Arc<dyn PerformanceStore>, BuildError> {
		if let Some(store) = &self.store {
			return Ok(store.clone());
		}
		match self.config.storage.backend {
			StorageBackend::Memory => Ok(Arc::new(MemoryPerformanceStore::new())),
			StorageBackend::File => {
				let backend = FileStorage::new(self.config.storage.path.clone());
				let storage = Arc::new(StorageService::new(Box::new(backend)));
				Ok(Arc::new(PersistentPerformanceStore::load(storage).await?))
			}
		}
	}

	pub async fn build(self) -> Result<Orchestrator, BuildError> {
		let registry = self.build_registry()?;
		if registry.is_empty() {
			return Err(BuildError::Config("No solvers enabled".into()));
		}
		let store = self.performance_store().await?;
		let config = EngineConfig::from(&self.config);
		info!(
			solvers = registry.len(),
			storage = ?self.config.storage.backend,
			"Orchestrator ready"
		);
		Ok(Orchestrator::new(registry, store, config))
	}
}

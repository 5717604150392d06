use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use solver_config::{ConfigLoader, OrchestratorConfig};
use solver_core::{Orchestrator, OrchestratorBuilder};
use solver_registry::builtin_implementations;
use solver_types::{OptimizationModel, RaceResult, SolveOptions};
use std::path::Path;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{
	layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

mod cli;

use cli::{Args, Command, SolveArgs};

#[tokio::main]
async fn main() -> Result<()> {
	let args = Args::parse();

	let env_directive = std::env::var(EnvFilter::DEFAULT_ENV)
		.ok()
		.filter(|v| !v.is_empty());
	let (directive, from_config) = startup_directive(args.log_level.as_deref(), env_directive);
	let filter = setup_tracing(&directive, args.json_logs);

	let config = load_config(&args).await?;
	if from_config && config.engine.log_level != directive {
		if let Err(e) = filter.reload(EnvFilter::new(&config.engine.log_level)) {
			warn!(error = %e, "Failed to apply configured log level");
		}
	}

	match &args.command {
		Command::Solve(solve) => solve_model(config, solve).await,
		Command::Validate => validate_config(config),
		Command::Solvers => list_solvers(config).await,
	}
}

async fn load_config(args: &Args) -> Result<OrchestratorConfig> {
	let mut loader =
		ConfigLoader::new().with_known_types(builtin_implementations().into_keys());
	if let Some(path) = &args.config {
		loader = loader.with_file(path);
	}
	loader.load().await.context("Failed to load configuration")
}

async fn build_orchestrator(config: OrchestratorConfig) -> Result<Orchestrator> {
	OrchestratorBuilder::new(config)
		.build()
		.await
		.context("Failed to build orchestrator")
}

async fn solve_model(config: OrchestratorConfig, args: &SolveArgs) -> Result<()> {
	let model = read_model(&args.model).await?;
	let orchestrator = build_orchestrator(config).await?;
	let options = solve_options(orchestrator.default_options(), args);

	info!(
		model = %args.model.display(),
		variables = model.num_variables(),
		constraints = model.num_constraints(),
		max_wall_time_ms = options.max_wall_time.as_millis() as u64,
		"Solving model"
	);

	let outcome = tokio::select! {
		outcome = orchestrator.solve(model, options) => outcome,
		_ = shutdown_signal() => bail!("Interrupted before the race finished"),
	};

	match outcome {
		Ok(result) => {
			print_result(&result, args.pretty)?;
			info!(status = ?result.status, verdict = ?result.verdict, "Solve finished");
			Ok(())
		}
		Err(e) => {
			if let Some(result) = e.result() {
				print_result(result, args.pretty)?;
			}
			Err(anyhow!(e))
		}
	}
}

fn solve_options(defaults: SolveOptions, args: &SolveArgs) -> SolveOptions {
	let mut options = defaults;
	if let Some(ms) = args.max_wall_time_ms {
		options.max_wall_time = Duration::from_millis(ms);
	}
	if let Some(k) = args.max_candidates {
		options.max_candidates = k;
	}
	if let Some(tolerance) = args.tolerance {
		options.tolerance = tolerance;
	}
	options
}

/// Reads a model document, choosing the format by extension.
async fn read_model(path: &Path) -> Result<OptimizationModel> {
	let content = tokio::fs::read_to_string(path)
		.await
		.with_context(|| format!("Failed to read model file {}", path.display()))?;
	parse_model(&content, path)
}

fn parse_model(content: &str, path: &Path) -> Result<OptimizationModel> {
	let extension = path
		.extension()
		.and_then(|e| e.to_str())
		.map(|e| e.to_ascii_lowercase());
	match extension.as_deref() {
		Some("json") => serde_json::from_str(content)
			.with_context(|| format!("Invalid JSON model {}", path.display())),
		Some("toml") => {
			toml::from_str(content).with_context(|| format!("Invalid TOML model {}", path.display()))
		}
		_ => bail!(
			"Unsupported model format {}: expected .json or .toml",
			path.display()
		),
	}
}

fn print_result(result: &RaceResult, pretty: bool) -> Result<()> {
	let json = if pretty {
		serde_json::to_string_pretty(result)
	} else {
		serde_json::to_string(result)
	}
	.context("Failed to serialize race result")?;
	println!("{}", json);
	Ok(())
}

fn validate_config(config: OrchestratorConfig) -> Result<()> {
	let registry = OrchestratorBuilder::new(config.clone())
		.build_registry()
		.context("Failed to instantiate configured solvers")?;

	info!("Configuration is valid");
	info!(
		max_wall_time_ms = config.engine.max_wall_time_ms,
		max_candidates = config.engine.max_candidates,
		storage = ?config.storage.backend,
		"Engine settings"
	);
	for descriptor in registry.descriptors() {
		info!(
			"  Solver: {} ({}{})",
			descriptor.id,
			descriptor.implementation,
			if descriptor.exact { ", exact" } else { "" }
		);
	}
	for (name, entry) in &config.solvers {
		if !entry.enabled {
			warn!("  Disabled: {} ({})", name, entry.implementation);
		}
	}

	Ok(())
}

async fn list_solvers(config: OrchestratorConfig) -> Result<()> {
	let orchestrator = build_orchestrator(config).await?;
	let registry = orchestrator.registry();
	let history = orchestrator
		.tuner()
		.store()
		.snapshot()
		.await
		.context("Failed to read performance history")?;

	for descriptor in registry.descriptors() {
		let classes: Vec<String> = descriptor
			.suitability
			.iter()
			.map(|(class, score)| format!("{}={:.2}", class.as_str(), score))
			.collect();
		println!(
			"{} [{}]{} classes: {}",
			descriptor.id,
			descriptor.implementation,
			if descriptor.exact { " exact" } else { "" },
			classes.join(", ")
		);

		let mut records: Vec<_> = history
			.iter()
			.filter(|(key, _)| key.solver == descriptor.id)
			.collect();
		records.sort_by(|a, b| a.0.signature.cmp(&b.0.signature));
		if records.is_empty() {
			println!("    no history");
		}
		for (key, record) in records {
			println!(
				"    {}: {} runs, mean {:.3}s, success {:.0}%",
				key.signature,
				record.samples,
				record.mean_seconds,
				record.success_rate * 100.0
			);
		}
	}

	Ok(())
}

/// Filter used until the configuration is loaded, and whether the configured
/// level replaces it. `RUST_LOG` wins over `--log-level`, which wins over the
/// configuration file.
fn startup_directive(cli_level: Option<&str>, env: Option<String>) -> (String, bool) {
	match (env, cli_level) {
		(Some(env), _) => (env, false),
		(None, Some(level)) => (level.to_string(), false),
		(None, None) => ("info".to_string(), true),
	}
}

fn setup_tracing(directive: &str, json: bool) -> reload::Handle<EnvFilter, Registry> {
	let (filter, handle) = reload::Layer::new(EnvFilter::new(directive));

	// stdout carries the result document.
	let registry = tracing_subscriber::registry().with(filter);
	if json {
		registry
			.with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
			.init();
	} else {
		registry
			.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
			.init();
	}
	handle
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if signal::ctrl_c().await.is_err() {
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut stream) => {
				stream.recv().await;
			}
			Err(_) => std::future::pending::<()>().await,
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use solver_types::RaceStatus;
	use std::path::PathBuf;

	const KNAPSACK: &str = r#"
name = "knapsack"

[[variables]]
name = "x"
kind = "continuous"
lower = 0.0
upper = 4.0

[[variables]]
name = "y"
kind = "continuous"
lower = 0.0
upper = 4.0

[[constraints]]
terms = [{ var = "x", coef = 1.0 }, { var = "y", coef = 1.0 }]
op = "le"
rhs = 5.0

[objective]
direction = "maximize"
terms = [{ var = "x", coef = 3.0 }, { var = "y", coef = 2.0 }]
"#;

	fn solve_args(model: PathBuf) -> SolveArgs {
		SolveArgs {
			model,
			max_wall_time_ms: Some(5_000),
			max_candidates: None,
			tolerance: None,
			pretty: false,
		}
	}

	#[test]
	fn test_parse_model_by_extension() {
		let model = parse_model(KNAPSACK, Path::new("knapsack.toml")).unwrap();
		assert_eq!(model.num_variables(), 2);
		assert_eq!(model.num_constraints(), 1);

		let json = serde_json::to_string(&model).unwrap();
		let again = parse_model(&json, Path::new("knapsack.JSON")).unwrap();
		assert_eq!(again, model);

		assert!(parse_model(KNAPSACK, Path::new("knapsack.lp")).is_err());
	}

	#[test]
	fn test_log_level_precedence() {
		assert_eq!(
			startup_directive(Some("debug"), Some("warn".into())),
			("warn".to_string(), false)
		);
		assert_eq!(
			startup_directive(Some("debug"), None),
			("debug".to_string(), false)
		);
		assert_eq!(startup_directive(None, None), ("info".to_string(), true));
	}

	#[test]
	fn test_solve_options_override_defaults() {
		let mut args = solve_args(PathBuf::from("m.json"));
		args.tolerance = Some(0.01);
		let options = solve_options(SolveOptions::default(), &args);
		assert_eq!(options.max_wall_time, Duration::from_millis(5_000));
		assert_eq!(options.max_candidates, SolveOptions::default().max_candidates);
		assert_eq!(options.tolerance, 0.01);
	}

	#[tokio::test]
	async fn test_solve_with_builtin_solvers() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("knapsack.toml");
		std::fs::write(&path, KNAPSACK).unwrap();

		let model = read_model(&path).await.unwrap();
		let orchestrator = build_orchestrator(OrchestratorConfig::default()).await.unwrap();
		let options = solve_options(orchestrator.default_options(), &solve_args(path));
		let result = orchestrator.solve(model, options).await.unwrap();

		assert_eq!(result.status, RaceStatus::Optimal);
		assert!((result.objective().unwrap() - 14.0).abs() < 1e-6);
	}
}

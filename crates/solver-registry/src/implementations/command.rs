//! External solver executables driven over stdin/stdout.
//!
//! The child receives one JSON document on stdin:
//! `{"model": <model>, "parameters": {...}, "time_limit_ms": n}` and must
//! print a single [`SolveOutcome`] as JSON on stdout before exiting with
//! status zero. The child is killed when the token stops or when the
//! running future is dropped.

use crate::{AdapterError, SolveOutcome, SolverAdapter};
use async_trait::async_trait;
use serde::Serialize;
use solver_types::{
	CancelToken, ConfigSchema, Field, FieldType, ModelClass, OptimizationModel, ParameterSet,
	Schema, SolverDescriptor, SolverId, ValidationError,
};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

pub const NAME: &str = "command";

pub fn default_descriptor() -> SolverDescriptor {
	SolverDescriptor {
		id: SolverId::new(NAME),
		implementation: NAME.to_string(),
		suitability: ModelClass::all().into_iter().map(|c| (c, 0.5)).collect(),
		exact: false,
		default_parameters: ParameterSet::new(),
		nominal_rate: 1.0,
		strengths: vec!["external executable".into()],
	}
}

pub struct CommandConfigSchema;

impl ConfigSchema for CommandConfigSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::strict(
			vec![Field::new("program", FieldType::String).with_validator(|v| {
				match v.as_str() {
					Some(p) if p.trim().is_empty() => Err("program must not be empty".into()),
					_ => Ok(()),
				}
			})],
			vec![
				Field::new("args", FieldType::Array(Box::new(FieldType::String))),
				Field::new("working_dir", FieldType::String),
			],
		);
		schema.validate(config)
	}
}

/// Parameters are forwarded to the executable untouched.
pub struct PassThroughSchema;

impl ConfigSchema for PassThroughSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		Schema::new(vec![], vec![]).validate(config)
	}
}

#[derive(Serialize)]
struct CommandRequest<'a> {
	model: &'a OptimizationModel,
	parameters: &'a ParameterSet,
	#[serde(skip_serializing_if = "Option::is_none")]
	time_limit_ms: Option<u64>,
}

pub struct CommandSolver {
	program: String,
	args: Vec<String>,
	working_dir: Option<PathBuf>,
}

impl CommandSolver {
	pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
		Self {
			program: program.into(),
			args,
			working_dir: None,
		}
	}

	async fn run(
		&self,
		model: &OptimizationModel,
		params: &ParameterSet,
		cancel: &CancelToken,
	) -> Result<SolveOutcome, AdapterError> {
		let request = CommandRequest {
			model,
			parameters: params,
			time_limit_ms: cancel.deadline().map(|deadline| {
				deadline
					.saturating_duration_since(tokio::time::Instant::now())
					.as_millis() as u64
			}),
		};
		let payload =
			serde_json::to_vec(&request).map_err(|e| AdapterError::Backend(e.to_string()))?;

		let mut command = Command::new(&self.program);
		command
			.args(&self.args)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true);
		if let Some(dir) = &self.working_dir {
			command.current_dir(dir);
		}
		let mut child = command
			.spawn()
			.map_err(|e| AdapterError::Backend(format!("failed to spawn {}: {}", self.program, e)))?;
		debug!(program = %self.program, pid = ?child.id(), "Spawned solver process");

		let mut stdin = child
			.stdin
			.take()
			.ok_or_else(|| AdapterError::Backend("child stdin unavailable".into()))?;
		// Written concurrently so a child that prints early cannot deadlock on a full pipe.
		let writer = tokio::spawn(async move {
			let result = stdin.write_all(&payload).await;
			drop(stdin);
			result
		});

		let output = child
			.wait_with_output()
			.await
			.map_err(|e| AdapterError::Backend(e.to_string()))?;
		if let Ok(Err(e)) = writer.await {
			debug!(error = %e, "Solver process closed stdin early");
		}

		if !output.status.success() {
			let stderr = String::from_utf8_lossy(&output.stderr);
			return Err(AdapterError::Backend(format!(
				"{} exited with {}: {}",
				self.program,
				output.status,
				stderr.trim()
			)));
		}

		let outcome: SolveOutcome = serde_json::from_slice(&output.stdout)
			.map_err(|e| AdapterError::Backend(format!("malformed solver output: {}", e)))?;
		if let Some(values) = &outcome.values {
			if values.len() != model.num_variables() {
				return Err(AdapterError::Backend(format!(
					"solver returned {} values for {} variables",
					values.len(),
					model.num_variables()
				)));
			}
		}
		Ok(outcome)
	}
}

#[async_trait]
impl SolverAdapter for CommandSolver {
	fn parameter_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(PassThroughSchema)
	}

	async fn solve(
		&self,
		model: Arc<OptimizationModel>,
		params: &ParameterSet,
		cancel: CancelToken,
	) -> Result<SolveOutcome, AdapterError> {
		tokio::select! {
			outcome = self.run(&model, params, &cancel) => outcome,
			reason = cancel.stopped() => {
				// Dropping the run future kills the child.
				warn!(program = %self.program, ?reason, "Killing solver process");
				Err(AdapterError::Interrupted)
			}
		}
	}
}

/// Factory function to create a command adapter from configuration.
///
/// Configuration parameters:
/// - `program`: executable to run (required)
/// - `args`: extra command-line arguments
/// - `working_dir`: directory to run the executable in
pub fn create_solver(config: &toml::Value) -> Result<Box<dyn SolverAdapter>, AdapterError> {
	CommandConfigSchema
		.validate(config)
		.map_err(|e| AdapterError::InvalidConfig(e.to_string()))?;

	let program = config
		.get("program")
		.and_then(|v| v.as_str())
		.unwrap_or_default()
		.to_string();
	let args = config
		.get("args")
		.and_then(|v| v.as_array())
		.map(|args| {
			args.iter()
				.filter_map(|a| a.as_str().map(str::to_string))
				.collect()
		})
		.unwrap_or_default();
	let mut solver = CommandSolver::new(program, args);
	solver.working_dir = config
		.get("working_dir")
		.and_then(|v| v.as_str())
		.map(PathBuf::from);

	Ok(Box::new(solver))
}

#[cfg(all(test, unix))]
mod tests {
	use super::*;
	use crate::OutcomeStatus;
	use solver_types::{ModelBuilder, RelOp, StopReason};
	use std::time::Duration;
	use tokio::time::Instant;

	fn model() -> Arc<OptimizationModel> {
		let mut b = ModelBuilder::minimize();
		let x = b.continuous("x", 0.0, 10.0);
		let y = b.continuous("y", 0.0, 10.0);
		b.constraint(&[(x, 1.0), (y, 1.0)], RelOp::Ge, 2.0)
			.objective(x, 1.0)
			.objective(y, 1.0);
		Arc::new(b.build().unwrap())
	}

	fn shell(script: &str) -> CommandSolver {
		CommandSolver::new("sh", vec!["-c".into(), script.into()])
	}

	#[tokio::test]
	async fn test_reads_outcome_from_stdout() {
		let solver = shell(
			r#"cat > /dev/null; echo '{"status":"optimal","objective":2.0,"values":[1.0,1.0],"gap":0.0}'"#,
		);
		let outcome = solver
			.solve(model(), &ParameterSet::new(), CancelToken::new())
			.await
			.unwrap();
		assert_eq!(outcome.status, OutcomeStatus::Optimal);
		assert_eq!(outcome.values, Some(vec![1.0, 1.0]));
	}

	#[tokio::test]
	async fn test_request_carries_model_and_parameters() {
		let solver = shell(
			r#"input=$(cat); case "$input" in *'"variables"'*'"seed":7'*) echo '{"status":"infeasible"}';; *) exit 9;; esac"#,
		);
		let mut params = ParameterSet::new();
		params.insert("seed".into(), toml::Value::Integer(7));
		let outcome = solver
			.solve(model(), &params, CancelToken::new())
			.await
			.unwrap();
		assert_eq!(outcome.status, OutcomeStatus::Infeasible);
		assert_eq!(outcome.values, None);
	}

	#[tokio::test]
	async fn test_nonzero_exit_and_bad_output_are_errors() {
		let failing = shell("cat > /dev/null; echo boom >&2; exit 3");
		let err = failing
			.solve(model(), &ParameterSet::new(), CancelToken::new())
			.await
			.unwrap_err();
		assert!(err.to_string().contains("boom"));

		let garbage = shell("cat > /dev/null; echo not-json");
		assert!(matches!(
			garbage
				.solve(model(), &ParameterSet::new(), CancelToken::new())
				.await,
			Err(AdapterError::Backend(_))
		));

		let short = shell(r#"cat > /dev/null; echo '{"status":"feasible","values":[1.0]}'"#);
		assert!(short
			.solve(model(), &ParameterSet::new(), CancelToken::new())
			.await
			.is_err());
	}

	#[tokio::test]
	async fn test_stops_child_on_deadline() {
		let solver = shell("sleep 30");
		let cancel = CancelToken::with_deadline(Instant::now() + Duration::from_millis(50));
		let started = std::time::Instant::now();
		let result = solver.solve(model(), &ParameterSet::new(), cancel).await;
		assert!(matches!(result, Err(AdapterError::Interrupted)));
		assert!(started.elapsed() < Duration::from_secs(5));

		let cancel = CancelToken::new();
		cancel.cancel(StopReason::Shutdown);
		let result = solver.solve(model(), &ParameterSet::new(), cancel).await;
		assert!(matches!(result, Err(AdapterError::Interrupted)));
	}

	#[test]
	fn test_factory_requires_program() {
		let config: toml::Value = toml::from_str("args = [\"-v\"]").unwrap();
		assert!(matches!(
			create_solver(&config),
			Err(AdapterError::InvalidConfig(_))
		));
		let config: toml::Value = toml::from_str("program = \"/usr/bin/true\"").unwrap();
		assert!(create_solver(&config).is_ok());
	}
}

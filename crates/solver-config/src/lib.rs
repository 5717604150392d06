//! Configuration loading for the orchestrator.
//!
//! Configuration is read from a TOML, JSON or YAML file (chosen by
//! extension), `${VAR}` references are substituted from the environment, and
//! `SOLVER_*` variables override individual settings before validation.

use solver_types::ModelClass;
use std::collections::BTreeSet;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, info};

mod types;

pub use types::*;

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("File not found: {0}")]
	FileNotFound(String),

	#[error("Parse error: {0}")]
	ParseError(String),

	#[error("Validation error: {0}")]
	ValidationError(String),

	#[error("Environment variable not found: {0}")]
	EnvVarNotFound(String),

	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
	Toml,
	Json,
	Yaml,
}

impl ConfigFormat {
	pub fn from_path(path: &Path) -> Option<Self> {
		match path.extension().and_then(|s| s.to_str()) {
			Some("toml") => Some(Self::Toml),
			Some("json") => Some(Self::Json),
			Some("yaml") | Some("yml") => Some(Self::Yaml),
			_ => None,
		}
	}
}

impl Default for OrchestratorConfig {
	fn default() -> Self {
		let solvers = ["microlp", "local-search"]
			.into_iter()
			.map(|name| {
				(
					name.to_string(),
					SolverEntry {
						implementation: name.to_string(),
						enabled: true,
						exact: None,
						classes: None,
						nominal_rate: None,
						strengths: None,
						parameters: toml::Table::new(),
						config: toml::Value::Table(toml::Table::new()),
					},
				)
			})
			.collect();
		Self {
			engine: EngineSettings::default(),
			selector: SelectorSettings::default(),
			tuner: TunerSettings::default(),
			storage: StorageSettings::default(),
			presolve: PresolveSettings::default(),
			solvers,
		}
	}
}

/// Configuration loader with environment variable substitution
pub struct ConfigLoader {
	file_path: Option<PathBuf>,
	env_prefix: String,
	known_types: Option<BTreeSet<String>>,
}

impl Default for ConfigLoader {
	fn default() -> Self {
		Self::new()
	}
}

impl ConfigLoader {
	pub fn new() -> Self {
		Self {
			file_path: None,
			env_prefix: "SOLVER_".to_string(),
			known_types: None,
		}
	}

	pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
		self.file_path = Some(path.as_ref().to_path_buf());
		self
	}

	pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.env_prefix = prefix.into();
		self
	}

	/// Restricts `[solvers.*] type` to the given implementation names.
	pub fn with_known_types<I, S>(mut self, types: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.known_types = Some(types.into_iter().map(Into::into).collect());
		self
	}

	/// Loads the configured file, or the defaults when no file was given.
	pub async fn load(&self) -> Result<OrchestratorConfig, ConfigError> {
		let mut config = match &self.file_path {
			Some(path) => self.load_from_file(path).await?,
			None => {
				debug!("No configuration file given, using defaults");
				OrchestratorConfig::default()
			}
		};

		self.apply_env_overrides(&mut config)?;
		self.validate_config(&config)?;

		Ok(config)
	}

	async fn load_from_file(&self, path: &Path) -> Result<OrchestratorConfig, ConfigError> {
		if !path.exists() {
			return Err(ConfigError::FileNotFound(path.display().to_string()));
		}
		info!("Loading configuration from {:?}", path);

		let format = ConfigFormat::from_path(path).ok_or_else(|| {
			ConfigError::ParseError(format!("Unsupported config format: {:?}", path))
		})?;
		let content = tokio::fs::read_to_string(path).await?;

		Self::parse(&content, format)
	}

	/// Parses a configuration document after substituting `${VAR}` references.
	pub fn parse(content: &str, format: ConfigFormat) -> Result<OrchestratorConfig, ConfigError> {
		let substituted = substitute_env_vars(content)?;
		match format {
			ConfigFormat::Toml => {
				toml::from_str(&substituted).map_err(|e| ConfigError::ParseError(e.to_string()))
			}
			ConfigFormat::Json => serde_json::from_str(&substituted)
				.map_err(|e| ConfigError::ParseError(e.to_string())),
			ConfigFormat::Yaml => serde_yaml::from_str(&substituted)
				.map_err(|e| ConfigError::ParseError(e.to_string())),
		}
	}

	fn env(&self, name: &str) -> Option<String> {
		env::var(format!("{}{}", self.env_prefix, name)).ok()
	}

	fn apply_env_overrides(&self, config: &mut OrchestratorConfig) -> Result<(), ConfigError> {
		if let Some(log_level) = self.env("LOG_LEVEL") {
			config.engine.log_level = log_level;
		}

		if let Some(wall) = self.env("MAX_WALL_TIME_MS") {
			config.engine.max_wall_time_ms = wall.parse().map_err(|e| {
				ConfigError::ValidationError(format!("Invalid max wall time: {}", e))
			})?;
		}

		if let Some(k) = self.env("MAX_CANDIDATES") {
			config.engine.max_candidates = k.parse().map_err(|e| {
				ConfigError::ValidationError(format!("Invalid max candidates: {}", e))
			})?;
		}

		if let Some(tolerance) = self.env("TOLERANCE") {
			config.engine.tolerance = tolerance
				.parse()
				.map_err(|e| ConfigError::ValidationError(format!("Invalid tolerance: {}", e)))?;
		}

		if let Some(path) = self.env("STORAGE_PATH") {
			config.storage.path = PathBuf::from(path);
		}

		Ok(())
	}

	fn validate_config(&self, config: &OrchestratorConfig) -> Result<(), ConfigError> {
		let invalid = |msg: String| Err(ConfigError::ValidationError(msg));
		let engine = &config.engine;

		if engine.max_wall_time_ms == 0 {
			return invalid("engine.max_wall_time_ms must be positive".into());
		}
		if engine.max_candidates == 0 {
			return invalid("engine.max_candidates must be at least 1".into());
		}
		for (name, value) in [
			("engine.tolerance", engine.tolerance),
			("engine.epsilon", engine.epsilon),
			("engine.safety_margin", engine.safety_margin),
		] {
			if !(value.is_finite() && value > 0.0) {
				return invalid(format!("{} must be a positive number, got {}", name, value));
			}
		}

		let alpha = config.tuner.alpha;
		if !(alpha > 0.0 && alpha <= 1.0) {
			return invalid(format!("tuner.alpha must be in (0, 1], got {}", alpha));
		}

		let weights = config.selector;
		let all = [
			weights.capability_weight,
			weights.success_weight,
			weights.speed_weight,
		];
		if all.iter().any(|w| !w.is_finite() || *w < 0.0) || all.iter().sum::<f64>() <= 0.0 {
			return invalid("selector weights must be non-negative and not all zero".into());
		}

		if config.presolve.max_passes == 0 {
			return invalid("presolve.max_passes must be at least 1".into());
		}

		if config.enabled_solvers().next().is_none() {
			return invalid("At least one solver must be enabled".into());
		}

		for (id, entry) in &config.solvers {
			if let Some(known) = &self.known_types {
				if !known.contains(&entry.implementation) {
					return invalid(format!(
						"Solver '{}' has unknown type '{}'",
						id, entry.implementation
					));
				}
			}
			for (class, score) in entry.classes.iter().flatten() {
				if class.parse::<ModelClass>().is_err() {
					return invalid(format!("Solver '{}' names unknown class '{}'", id, class));
				}
				if !(0.0..=1.0).contains(score) {
					return invalid(format!(
						"Solver '{}' suitability for '{}' must be in [0, 1]",
						id, class
					));
				}
			}
			if let Some(rate) = entry.nominal_rate {
				if !(rate.is_finite() && rate > 0.0) {
					return invalid(format!("Solver '{}' nominal_rate must be positive", id));
				}
			}
		}

		Ok(())
	}
}

fn env_var_pattern() -> &'static regex::Regex {
	static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
	PATTERN.get_or_init(|| {
		regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
			.expect("static pattern is valid")
	})
}

/// Replaces `${VAR}` and `${VAR:-default}` with environment values.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
	let mut missing = None;
	let result = env_var_pattern().replace_all(content, |caps: &regex::Captures| {
		match (env::var(&caps[1]), caps.get(2)) {
			(Ok(value), _) => value,
			(Err(_), Some(default)) => default.as_str().to_string(),
			(Err(_), None) => {
				missing.get_or_insert_with(|| caps[1].to_string());
				String::new()
			}
		}
	});

	match missing {
		Some(var) => Err(ConfigError::EnvVarNotFound(var)),
		None => Ok(result.into_owned()),
	}
}

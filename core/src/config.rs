use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::default_db_path;
use crate::engine::exporter::DEFAULT_TOOL_VERSION;
use crate::engine::filter::ResourceFilter;
use crate::engine::importer::DEFAULT_PARALLELISM;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read {path}: {message}")]
	Read { path: String, message: String },

	#[error("failed to parse {path}: {message}")]
	Parse { path: String, message: String },

	#[error("failed to write {path}: {message}")]
	Write { path: String, message: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
	pub store: StoreConfig,
	pub import: ImportConfig,
	pub filter: ResourceFilter,
	pub export: ExportConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
	/// Database directory; the platform data dir when unset.
	pub path: Option<PathBuf>,
	/// Keep everything in memory for the lifetime of the process.
	pub in_memory: bool,
}

impl StoreConfig {
	pub fn resolved_path(&self) -> PathBuf {
		self.path.clone().unwrap_or_else(default_db_path)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImportConfig {
	pub parallelism: usize,
}

impl Default for ImportConfig {
	fn default() -> Self {
		Self { parallelism: DEFAULT_PARALLELISM }
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExportConfig {
	pub tool_version: String,
}

impl Default for ExportConfig {
	fn default() -> Self {
		Self { tool_version: DEFAULT_TOOL_VERSION.to_string() }
	}
}

pub fn config_path() -> PathBuf {
	dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("tflineage").join("config.toml")
}

/// Missing file means defaults.
pub fn load_file(path: &Path) -> Result<Config, ConfigError> {
	if !path.exists() {
		return Ok(Config::default());
	}
	let contents = fs::read_to_string(path)
		.map_err(|e| ConfigError::Read { path: path.display().to_string(), message: e.to_string() })?;
	toml::from_str(&contents).map_err(|e| ConfigError::Parse { path: path.display().to_string(), message: e.to_string() })
}

/// Config file (explicit path or the default location) plus `TFLINEAGE_*` overrides.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
	let mut config = match path {
		Some(path) => load_file(path)?,
		None => load_file(&config_path())?,
	};
	apply_env_overrides(&mut config);
	Ok(config)
}

pub fn write_config(path: &Path, config: &Config) -> Result<(), ConfigError> {
	let write_err = |message: String| ConfigError::Write { path: path.display().to_string(), message };
	if let Some(dir) = path.parent() {
		fs::create_dir_all(dir).map_err(|e| write_err(e.to_string()))?;
	}
	let contents = toml::to_string_pretty(config).map_err(|e| write_err(e.to_string()))?;
	fs::write(path, contents).map_err(|e| write_err(e.to_string()))
}

pub fn apply_env_overrides(config: &mut Config) {
	apply_overrides_from(config, |key| std::env::var(key).ok());
}

fn apply_overrides_from(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
	if let Some(raw) = var("TFLINEAGE_DB_PATH") {
		let trimmed = raw.trim();
		if !trimmed.is_empty() {
			config.store.path = Some(PathBuf::from(trimmed));
		}
	}

	if let Some(raw) = var("TFLINEAGE_PARALLELISM") {
		let trimmed = raw.trim();
		if !trimmed.is_empty() {
			match trimmed.parse::<usize>() {
				Ok(0) => tracing::warn!("TFLINEAGE_PARALLELISM must be at least 1, ignoring"),
				Ok(value) => config.import.parallelism = value,
				Err(err) => tracing::warn!("invalid TFLINEAGE_PARALLELISM, ignoring: {err}"),
			}
		}
	}

	if let Some(raw) = var("TFLINEAGE_TOOL_VERSION") {
		let trimmed = raw.trim();
		if !trimmed.is_empty() {
			config.export.tool_version = trimmed.to_string();
		}
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	#[test]
	fn missing_file_gives_defaults() {
		let tmp = tempfile::tempdir().unwrap();
		let config = load_file(&tmp.path().join("nope.toml")).unwrap();
		assert_eq!(config, Config::default());
		assert_eq!(config.import.parallelism, 5);
		assert_eq!(config.export.tool_version, DEFAULT_TOOL_VERSION);
	}

	#[test]
	fn parses_partial_file() {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join("config.toml");
		fs::write(
			&path,
			r#"
[store]
in_memory = true

[filter]
include = ["aws_instance.*"]
providers = ["aws"]
"#,
		)
		.unwrap();

		let config = load_file(&path).unwrap();

		assert!(config.store.in_memory);
		assert_eq!(config.filter.include, vec!["aws_instance.*"]);
		assert_eq!(config.filter.providers, vec!["aws"]);
		assert_eq!(config.import.parallelism, DEFAULT_PARALLELISM);
	}

	#[test]
	fn roundtrip() {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join("nested/config.toml");
		let mut config = Config::default();
		config.store.path = Some(PathBuf::from("/var/lib/tflineage"));
		config.import.parallelism = 9;
		config.filter.exclude = vec!["data.*".into()];

		write_config(&path, &config).unwrap();

		assert_eq!(load_file(&path).unwrap(), config);
	}

	#[test]
	fn bad_toml_is_a_parse_error() {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join("config.toml");
		fs::write(&path, "[import\nparallelism = ").unwrap();
		assert!(matches!(load_file(&path), Err(ConfigError::Parse { .. })));
	}

	#[test]
	fn env_overrides_apply_and_invalid_values_are_ignored() {
		let vars: HashMap<&str, &str> = HashMap::from([
			("TFLINEAGE_DB_PATH", " /data/db "),
			("TFLINEAGE_PARALLELISM", "many"),
			("TFLINEAGE_TOOL_VERSION", "1.9.0"),
		]);
		let mut config = Config::default();

		apply_overrides_from(&mut config, |key| vars.get(key).map(|v| v.to_string()));

		assert_eq!(config.store.path, Some(PathBuf::from("/data/db")));
		assert_eq!(config.import.parallelism, DEFAULT_PARALLELISM);
		assert_eq!(config.export.tool_version, "1.9.0");

		apply_overrides_from(&mut config, |key| (key == "TFLINEAGE_PARALLELISM").then(|| "12".to_string()));
		assert_eq!(config.import.parallelism, 12);

		apply_overrides_from(&mut config, |key| (key == "TFLINEAGE_PARALLELISM").then(|| "0".to_string()));
		assert_eq!(config.import.parallelism, 12);
	}
}

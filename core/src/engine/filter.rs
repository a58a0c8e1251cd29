use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::glob::AddressPattern;

#[derive(Debug, Error)]
#[error("invalid filter pattern `{pattern}`: {message}")]
pub struct FilterError {
	pub pattern: String,
	pub message: String,
}

/// Which extracted resources get persisted. Empty lists impose nothing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceFilter {
	/// Address globs; when non-empty a record must match one.
	pub include: Vec<String>,
	/// Address globs that reject an otherwise kept record.
	pub exclude: Vec<String>,
	pub types: Vec<String>,
	pub providers: Vec<String>,
}

impl ResourceFilter {
	pub fn is_empty(&self) -> bool {
		self.include.is_empty() && self.exclude.is_empty() && self.types.is_empty() && self.providers.is_empty()
	}

	pub fn compile(&self) -> Result<CompiledFilter, FilterError> {
		Ok(CompiledFilter {
			include: compile_all(&self.include)?,
			exclude: compile_all(&self.exclude)?,
			types: self.types.clone(),
			providers: self.providers.clone(),
		})
	}
}

fn compile_all(patterns: &[String]) -> Result<Vec<AddressPattern>, FilterError> {
	patterns
		.iter()
		.map(|p| AddressPattern::new(p).map_err(|e| FilterError { pattern: p.clone(), message: e.to_string() }))
		.collect()
}

#[derive(Debug, Clone, Default)]
pub struct CompiledFilter {
	include: Vec<AddressPattern>,
	exclude: Vec<AddressPattern>,
	types: Vec<String>,
	providers: Vec<String>,
}

impl CompiledFilter {
	/// include, then types, then providers, then exclude.
	pub fn keeps(&self, address: &str, resource_type: &str, provider: &str) -> bool {
		if !self.include.is_empty() && !self.include.iter().any(|p| p.matches(address)) {
			return false;
		}
		if !self.types.is_empty() && !self.types.iter().any(|t| t == resource_type) {
			return false;
		}
		if !self.providers.is_empty() && !self.providers.iter().any(|p| p == provider) {
			return false;
		}
		!self.exclude.iter().any(|p| p.matches(address))
	}
}

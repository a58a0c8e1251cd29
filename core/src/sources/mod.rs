//! Where state documents come from.
//!
//! The engine only ever calls the six operations of [`SourceDriver`]; the
//! filesystem and object-store drivers are interchangeable behind it.

pub mod local;
pub mod object;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub use local::LocalDriver;
pub use object::ObjectStoreDriver;

#[derive(Debug, Error)]
pub enum SourceError {
	#[error("state file not found: {0}")]
	NotFound(String),

	#[error("permission denied: {0}")]
	PermissionDenied(String),

	#[error("failed to parse {path}: {message}")]
	Parse { path: String, message: String },

	#[error("invalid pattern `{pattern}`: {message}")]
	InvalidPattern { pattern: String, message: String },

	#[error("source root does not exist: {0}")]
	RootNotFound(String),

	#[error("I/O error: {0}")]
	IoError(String),

	#[error("object store error: {0}")]
	ObjectStore(String),
}

impl SourceError {
	pub(crate) fn from_io(err: std::io::Error, path: &str) -> Self {
		match err.kind() {
			std::io::ErrorKind::NotFound => SourceError::NotFound(path.to_string()),
			std::io::ErrorKind::PermissionDenied => SourceError::PermissionDenied(path.to_string()),
			_ => SourceError::IoError(format!("{path}: {err}")),
		}
	}
}

/// Listing entry for one state file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateFileInfo {
	pub path: String,
	pub last_modified: DateTime<Utc>,
	pub size: u64,
	pub etag: Option<String>,
}

#[async_trait]
pub trait SourceDriver: Send + Sync {
	/// Short label for logs (`local`, `s3`, ...).
	fn kind(&self) -> &'static str;

	async fn initialize(&self) -> Result<(), SourceError>;

	/// Every state file the driver's pattern selects.
	async fn list_state_files(&self) -> Result<Vec<StateFileInfo>, SourceError>;

	async fn read_state_file(&self, path: &str) -> Result<Value, SourceError>;

	async fn get_state_file_metadata(&self, path: &str) -> Result<StateFileInfo, SourceError>;

	async fn has_been_modified(&self, path: &str, since: DateTime<Utc>) -> Result<bool, SourceError> {
		Ok(self.get_state_file_metadata(path).await?.last_modified > since)
	}

	async fn close(&self) -> Result<(), SourceError>;
}

pub(crate) fn parse_document(bytes: &[u8], path: &str) -> Result<Value, SourceError> {
	serde_json::from_slice(bytes).map_err(|e| SourceError::Parse { path: path.to_string(), message: e.to_string() })
}

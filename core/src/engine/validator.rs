use serde_json::Value;
use thiserror::Error;

/// State format versions the extractor understands.
pub const SUPPORTED_FORMAT_VERSIONS: [u64; 2] = [3, 4];

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
	#[error("invalid document: {0}")]
	InvalidDocument(String),

	#[error("unsupported state format version {0} (supported: 3, 4)")]
	UnsupportedFormatVersion(u64),
}

/// Header fields every accepted document carries.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentHeader {
	pub format_version: u64,
	pub serial: u64,
	pub lineage: String,
	pub tool_version: Option<String>,
}

/// Structural check of a raw state document. Runs before any write.
pub fn validate(document: &Value) -> Result<DocumentHeader, ValidationError> {
	let obj = document
		.as_object()
		.ok_or_else(|| ValidationError::InvalidDocument("document is not a JSON object".into()))?;

	let format_version = match obj.get("version") {
		None => return Err(ValidationError::InvalidDocument("missing `version`".into())),
		Some(v) => v
			.as_u64()
			.ok_or_else(|| ValidationError::InvalidDocument(format!("`version` is not a non-negative integer: {v}")))?,
	};

	let serial = match obj.get("serial") {
		None => return Err(ValidationError::InvalidDocument("missing `serial`".into())),
		Some(v) => v
			.as_u64()
			.ok_or_else(|| ValidationError::InvalidDocument(format!("`serial` is not a non-negative integer: {v}")))?,
	};

	let lineage = match obj.get("lineage") {
		Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
		Some(_) => return Err(ValidationError::InvalidDocument("`lineage` must be a non-empty string".into())),
		None => return Err(ValidationError::InvalidDocument("missing `lineage`".into())),
	};

	if !SUPPORTED_FORMAT_VERSIONS.contains(&format_version) {
		return Err(ValidationError::UnsupportedFormatVersion(format_version));
	}

	match obj.get("resources") {
		None | Some(Value::Null) | Some(Value::Array(_)) => {}
		Some(_) => return Err(ValidationError::InvalidDocument("`resources` must be an array".into())),
	}

	let tool_version = obj.get("terraform_version").and_then(Value::as_str).map(str::to_string);

	Ok(DocumentHeader { format_version, serial, lineage, tool_version })
}

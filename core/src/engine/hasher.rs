//! Content digest and canonical JSON.
//!
//! Canonical form is RFC 8785 (JCS): compact JSON with object keys sorted at
//! every depth, so two documents that differ only in key order hash and
//! compare equal.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to canonicalize JSON: {0}")]
pub struct CanonicalizationError(#[from] serde_json::Error);

/// JCS serialization of `value`.
pub fn canonical_json(value: &Value) -> Result<String, CanonicalizationError> {
	Ok(serde_jcs::to_string(value)?)
}

/// Rebuilds `value` with object keys in canonical order.
pub fn canonicalize(value: &Value) -> Result<Value, CanonicalizationError> {
	Ok(serde_json::from_str(&canonical_json(value)?)?)
}

/// blake3 over the canonical serialization, hex encoded.
pub fn content_hash(document: &Value) -> Result<String, CanonicalizationError> {
	Ok(blake3::hash(canonical_json(document)?.as_bytes()).to_hex().to_string())
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn key_order_does_not_change_hash() {
		let a: Value = serde_json::from_str(r#"{"serial": 1, "lineage": "x", "nested": {"b": 2, "a": 1}}"#).unwrap();
		let b: Value = serde_json::from_str(r#"{"nested": {"a": 1, "b": 2}, "lineage": "x", "serial": 1}"#).unwrap();

		assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
	}

	#[test]
	fn different_content_different_hash() {
		assert_ne!(content_hash(&json!({"serial": 1})).unwrap(), content_hash(&json!({"serial": 2})).unwrap());
	}

	#[test]
	fn hash_is_blake3_hex() {
		let hash = content_hash(&json!({})).unwrap();
		assert_eq!(hash.len(), 64);
		assert_eq!(hash, blake3::hash(b"{}").to_hex().to_string());
	}

	#[test]
	fn canonical_json_sorts_nested_keys_and_escapes() {
		let v = json!({"z": [ {"b": 1, "a": "q\"uote"} ], "a": null});
		assert_eq!(canonical_json(&v).unwrap(), r#"{"a":null,"z":[{"a":"q\"uote","b":1}]}"#);
	}

	#[test]
	fn numbers_use_shortest_form() {
		let v = json!({"f": 1.0, "g": 1e21, "n": -0.5});
		assert_eq!(canonical_json(&v).unwrap(), r#"{"f":1,"g":1e+21,"n":-0.5}"#);
	}

	#[test]
	fn canonicalize_round_trips_through_canonical_json() {
		let v = json!({"b": {"d": 1, "c": 2}, "a": [3, 2]});
		assert_eq!(canonicalize(&v).unwrap().to_string(), canonical_json(&v).unwrap());
	}
}

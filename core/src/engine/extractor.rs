//! Flattens a state document's resource/instance tree into records.

use std::collections::HashSet;

use serde_json::{Map, Value};
use thiserror::Error;

use super::filter::CompiledFilter;
use crate::models::{ResourceMode, ResourceRecord};

/// Resource type prefix -> provider name. First match wins.
pub const PROVIDER_PREFIXES: &[(&str, &str)] = &[
	("aws_", "aws"),
	("google_", "google"),
	("azurerm_", "azure"),
	("azuread_", "azure"),
	("azuredevops_", "azure"),
	("kubernetes_", "kubernetes"),
	("helm_", "kubernetes"),
	("digitalocean_", "digitalocean"),
	("cloudflare_", "cloudflare"),
	("github_", "github"),
	("gitlab_", "gitlab"),
	("datadog_", "datadog"),
	("vault_", "vault"),
	("oci_", "oracle"),
	("alicloud_", "alibaba"),
	("ibm_", "ibm"),
	("linode_", "linode"),
	("vsphere_", "vmware"),
	("random_", "random"),
	("null_", "null"),
	("local_", "local"),
	("tls_", "tls"),
	("time_", "time"),
	("archive_", "archive"),
	("external", "external"),
	("terraform_", "terraform"),
];

pub const UNKNOWN_PROVIDER: &str = "unknown";

pub fn provider_for_type(resource_type: &str) -> &'static str {
	PROVIDER_PREFIXES
		.iter()
		.find(|(prefix, _)| resource_type.starts_with(prefix))
		.map(|(_, provider)| *provider)
		.unwrap_or(UNKNOWN_PROVIDER)
}

#[derive(Debug, Error, PartialEq)]
#[error("failed to extract {address}: {reason}")]
pub struct ExtractionError {
	pub address: String,
	pub reason: String,
}

#[derive(Debug, Clone)]
pub struct Extraction {
	pub records: Vec<ResourceRecord>,
	/// Every instance seen, kept or filtered out.
	pub total_before_filter: u64,
}

/// Identity stamped onto every record of one snapshot.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotRef<'a> {
	pub snapshot_id: &'a str,
	pub lineage_id: &'a str,
	pub version: u64,
}

/// Builds the diffing key: `[module.]` + `[data.]` + type.name + `[index]`.
pub fn resource_address(module: Option<&str>, mode: ResourceMode, resource_type: &str, name: &str, index_key: Option<&Value>) -> String {
	let mut address = String::new();
	if let Some(module) = module {
		address.push_str(module);
		address.push('.');
	}
	if mode == ResourceMode::Data {
		address.push_str("data.");
	}
	address.push_str(resource_type);
	address.push('.');
	address.push_str(name);
	match index_key {
		Some(Value::Number(n)) => address.push_str(&format!("[{n}]")),
		Some(Value::String(s)) => address.push_str(&format!("[{}]", Value::String(s.clone()))),
		_ => {}
	}
	address
}

/// Any malformed resource aborts the whole snapshot; no partial record set
/// is ever returned.
pub fn extract(document: &Value, snapshot: SnapshotRef<'_>, filter: &CompiledFilter) -> Result<Extraction, ExtractionError> {
	let resources: &[Value] = match document.get("resources") {
		Some(Value::Array(items)) => items.as_slice(),
		_ => &[],
	};

	let mut records = Vec::new();
	let mut seen = HashSet::new();
	let mut total_before_filter = 0u64;

	for (position, resource) in resources.iter().enumerate() {
		let resource = resource.as_object().ok_or_else(|| ExtractionError {
			address: format!("resources[{position}]"),
			reason: "resource entry is not an object".into(),
		})?;

		let resource_type = required_str(resource, "type", position)?;
		let name = required_str(resource, "name", position)?;
		let label = format!("{resource_type}.{name}");

		let mode = match resource.get("mode") {
			None | Some(Value::Null) => ResourceMode::Managed,
			Some(Value::String(raw)) => ResourceMode::parse(raw)
				.ok_or_else(|| ExtractionError { address: label.clone(), reason: format!("unknown mode `{raw}`") })?,
			Some(other) => return Err(ExtractionError { address: label, reason: format!("mode is not a string: {other}") }),
		};
		let module = optional_str(resource, "module", &label)?;
		let provider_config = optional_str(resource, "provider", &label)?;
		let provider_name = provider_for_type(resource_type);
		let resource_deps = string_list(resource, &["depends_on", "dependencies"], &label)?;

		let instances: Vec<&Map<String, Value>> = match resource.get("instances") {
			Some(Value::Array(items)) => items
				.iter()
				.map(|item| {
					item.as_object().ok_or_else(|| ExtractionError {
						address: label.clone(),
						reason: "instance is not an object".into(),
					})
				})
				.collect::<Result<_, _>>()?,
			Some(Value::Null) | None => vec![resource],
			Some(other) => {
				return Err(ExtractionError { address: label, reason: format!("instances is not an array: {other}") })
			}
		};

		for instance in instances {
			total_before_filter += 1;

			let index_key = instance.get("index_key").filter(|v| !v.is_null()).cloned();
			let address = resource_address(module.as_deref(), mode, resource_type, name, index_key.as_ref());

			let attributes = instance_attributes(instance, &address)?;
			let schema_version = match instance.get("schema_version") {
				None | Some(Value::Null) => None,
				Some(v) => Some(v.as_u64().ok_or_else(|| ExtractionError {
					address: address.clone(),
					reason: format!("schema_version is not an integer: {v}"),
				})?),
			};

			let mut dependencies = resource_deps.clone();
			// The flat (instance-less) shape reuses the resource map; don't count its deps twice.
			if !std::ptr::eq(instance, resource) {
				for dep in string_list(instance, &["dependencies"], &address)? {
					if !dependencies.contains(&dep) {
						dependencies.push(dep);
					}
				}
			}

			if !seen.insert(address.clone()) {
				return Err(ExtractionError { address, reason: "duplicate resource address in snapshot".into() });
			}

			if !filter.keeps(&address, resource_type, provider_name) {
				continue;
			}

			records.push(ResourceRecord {
				id: format!("{}:{address}", snapshot.snapshot_id),
				snapshot_id: snapshot.snapshot_id.to_string(),
				lineage_id: snapshot.lineage_id.to_string(),
				snapshot_version: snapshot.version,
				resource_type: resource_type.to_string(),
				resource_name: name.to_string(),
				resource_address: address,
				provider_name: provider_name.to_string(),
				provider_config: provider_config.clone(),
				module: module.clone(),
				mode,
				index_key,
				schema_version,
				attributes,
				dependencies,
			});
		}
	}

	Ok(Extraction { records, total_before_filter })
}

fn required_str<'a>(resource: &'a Map<String, Value>, field: &str, position: usize) -> Result<&'a str, ExtractionError> {
	match resource.get(field) {
		Some(Value::String(s)) if !s.is_empty() => Ok(s),
		_ => {
			let address = match (resource.get("type").and_then(Value::as_str), resource.get("name").and_then(Value::as_str)) {
				(Some(t), Some(n)) => format!("{t}.{n}"),
				(Some(t), None) => format!("{t}.<unnamed>"),
				_ => format!("resources[{position}]"),
			};
			Err(ExtractionError { address, reason: format!("missing or empty `{field}`") })
		}
	}
}

fn optional_str(map: &Map<String, Value>, field: &str, address: &str) -> Result<Option<String>, ExtractionError> {
	match map.get(field) {
		None | Some(Value::Null) => Ok(None),
		Some(Value::String(s)) if s.is_empty() => Ok(None),
		Some(Value::String(s)) => Ok(Some(s.clone())),
		Some(other) => Err(ExtractionError { address: address.to_string(), reason: format!("`{field}` is not a string: {other}") }),
	}
}

fn string_list(map: &Map<String, Value>, fields: &[&str], address: &str) -> Result<Vec<String>, ExtractionError> {
	let mut out: Vec<String> = Vec::new();
	for field in fields {
		match map.get(*field) {
			None | Some(Value::Null) => {}
			Some(Value::Array(items)) => {
				for item in items {
					let dep = item.as_str().ok_or_else(|| ExtractionError {
						address: address.to_string(),
						reason: format!("`{field}` entry is not a string: {item}"),
					})?;
					if !out.iter().any(|d| d == dep) {
						out.push(dep.to_string());
					}
				}
			}
			Some(other) => {
				return Err(ExtractionError {
					address: address.to_string(),
					reason: format!("`{field}` is not an array: {other}"),
				})
			}
		}
	}
	Ok(out)
}

/// `attributes` (format 4) or `attributes_flat` (older writers).
fn instance_attributes(instance: &Map<String, Value>, address: &str) -> Result<Map<String, Value>, ExtractionError> {
	for field in ["attributes", "attributes_flat"] {
		match instance.get(field) {
			None | Some(Value::Null) => continue,
			Some(Value::Object(attrs)) => return Ok(attrs.clone()),
			Some(other) => {
				return Err(ExtractionError {
					address: address.to_string(),
					reason: format!("`{field}` is not an object: {other}"),
				})
			}
		}
	}
	Ok(Map::new())
}

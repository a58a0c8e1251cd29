//! Rebuilds a state document from stored resource records.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::hasher::{canonical_json, canonicalize, CanonicalizationError};
use super::ingestor::LastSeenTracker;
use crate::models::{Lineage, ResourceRecord, Snapshot};
use crate::store::{ListQuery, Lookup, StoreError, Table};

/// Format version of every exported document.
pub const EXPORT_FORMAT_VERSION: u64 = 4;
pub const DEFAULT_TOOL_VERSION: &str = "1.6.0";
/// Version used when nothing else selects one.
pub const FALLBACK_VERSION: u64 = 1;

#[derive(Debug, Error)]
pub enum ExportError {
	#[error("no snapshot for lineage {lineage_id} at version {version}")]
	VersionNotFound { lineage_id: String, version: u64 },

	#[error("no snapshot imported from {locator} at version {version}")]
	SourceVersionNotFound { locator: String, version: u64 },

	#[error("no lineage selected and none could be inferred ({available} stored)")]
	NoLineage { available: usize },

	#[error(transparent)]
	Canonicalization(#[from] CanonicalizationError),

	#[error("database error: {0}")]
	DbError(#[from] StoreError),
}

/// Which snapshot to export and how to stamp the output.
#[derive(Debug, Clone, Default)]
pub struct ExportSelector {
	pub lineage_id: Option<String>,
	pub source_locator: Option<String>,
	pub version: Option<u64>,
	/// Only these resource types; empty keeps everything.
	pub resource_types: Vec<String>,
	pub tool_version: Option<String>,
	/// Lineage written into the output; a fresh UUID when absent.
	pub output_lineage: Option<String>,
	pub outputs: Option<Map<String, Value>>,
}

#[derive(Debug, Clone)]
pub struct ExportedDocument {
	pub snapshot_id: String,
	pub lineage_id: String,
	pub version: u64,
	pub resource_count: usize,
	pub document: Value,
}

#[derive(Clone)]
pub struct Exporter {
	lookup: Lookup,
	last_seen: LastSeenTracker,
	default_tool_version: String,
}

impl Exporter {
	pub fn new(lookup: Lookup, last_seen: LastSeenTracker) -> Self {
		Self { lookup, last_seen, default_tool_version: DEFAULT_TOOL_VERSION.to_string() }
	}

	pub fn with_tool_version(mut self, tool_version: impl Into<String>) -> Self {
		self.default_tool_version = tool_version.into();
		self
	}

	pub async fn export_snapshot(&self, selector: &ExportSelector) -> Result<ExportedDocument, ExportError> {
		let snapshot = self.resolve_snapshot(selector).await?;
		debug!(lineage = %snapshot.lineage_id, version = snapshot.version, snapshot = %snapshot.id, "export target");

		let mut records = self.records_for(&snapshot).await?;
		if !selector.resource_types.is_empty() {
			records.retain(|r| selector.resource_types.contains(&r.resource_type));
		}

		let resources = group_resources(&records)?;
		let document = json!({
			"version": EXPORT_FORMAT_VERSION,
			"terraform_version": selector.tool_version.clone().unwrap_or_else(|| self.default_tool_version.clone()),
			"serial": snapshot.version,
			"lineage": selector.output_lineage.clone().unwrap_or_else(|| Uuid::new_v4().to_string()),
			"outputs": selector.outputs.clone().unwrap_or_default(),
			"resources": resources,
		});

		info!(lineage = %snapshot.lineage_id, version = snapshot.version, resources = records.len(), "snapshot exported");
		Ok(ExportedDocument {
			snapshot_id: snapshot.id,
			lineage_id: snapshot.lineage_id,
			version: snapshot.version,
			resource_count: records.len(),
			document: canonicalize(&document)?,
		})
	}

	/// Version: explicit, else latest for the source filter, else last seen,
	/// else [`FALLBACK_VERSION`].
	async fn resolve_snapshot(&self, selector: &ExportSelector) -> Result<Snapshot, ExportError> {
		if let Some(locator) = &selector.source_locator {
			let mut snapshots: Vec<Snapshot> =
				self.lookup.fetch_where(Table::Snapshot, &[("source_locator", json!(locator))]).await?;
			if let Some(lineage) = &selector.lineage_id {
				snapshots.retain(|s| &s.lineage_id == lineage);
			}
			let version = match selector.version {
				Some(v) => Some(v),
				None => snapshots.iter().map(|s| s.version).max(),
			};
			let version = version.unwrap_or(FALLBACK_VERSION);
			return Snapshot::newest(snapshots.into_iter().filter(|s| s.version == version))
				.ok_or_else(|| ExportError::SourceVersionNotFound { locator: locator.clone(), version });
		}

		let last_seen = self.last_seen.get();
		let lineage_id = match (&selector.lineage_id, &last_seen) {
			(Some(lineage), _) => lineage.clone(),
			(None, Some(seen)) => seen.lineage_id.clone(),
			(None, None) => self.only_lineage().await?,
		};

		let version = match selector.version {
			Some(v) => v,
			None if selector.lineage_id.is_some() => match self.lookup.get::<Lineage>(Table::Lineage, &lineage_id).await? {
				Some(lineage) => lineage.latest_version,
				None => last_seen.filter(|s| s.lineage_id == lineage_id).map_or(FALLBACK_VERSION, |s| s.version),
			},
			None => last_seen.map_or(FALLBACK_VERSION, |s| s.version),
		};

		let snapshots: Vec<Snapshot> = self
			.lookup
			.fetch_where(Table::Snapshot, &[("lineage_id", json!(lineage_id)), ("version", json!(version))])
			.await?;
		Snapshot::newest(snapshots).ok_or(ExportError::VersionNotFound { lineage_id, version })
	}

	async fn only_lineage(&self) -> Result<String, ExportError> {
		let mut lineages: Vec<Lineage> = self.lookup.list(Table::Lineage, &ListQuery::all().limit(2)).await?;
		match lineages.len() {
			1 => Ok(lineages.remove(0).id),
			available => Err(ExportError::NoLineage { available }),
		}
	}

	async fn records_for(&self, snapshot: &Snapshot) -> Result<Vec<ResourceRecord>, ExportError> {
		Ok(self.lookup.fetch_where(Table::Resource, &[("snapshot_id", json!(snapshot.id))]).await?)
	}
}

/// Nest flat records back into `{module, mode, type, name, provider, instances}`.
/// Groups come out in `(module, mode, type, name)` order.
pub fn group_resources(records: &[ResourceRecord]) -> Result<Vec<Value>, CanonicalizationError> {
	let mut groups: BTreeMap<(String, &str, &str, &str), Vec<&ResourceRecord>> = BTreeMap::new();
	for record in records {
		let key = (
			record.module.clone().unwrap_or_default(),
			record.mode.as_str(),
			record.resource_type.as_str(),
			record.resource_name.as_str(),
		);
		groups.entry(key).or_default().push(record);
	}

	groups
		.into_values()
		.map(|members| -> Result<Value, CanonicalizationError> {
			let mut keyed = members
				.into_iter()
				.map(|r| instance_order(r).map(|key| (key, r)))
				.collect::<Result<Vec<_>, _>>()?;
			keyed.sort_by(|a, b| a.0.cmp(&b.0));
			let members: Vec<&ResourceRecord> = keyed.into_iter().map(|(_, r)| r).collect();
			let first = members[0];
			let mut group = Map::new();
			if let Some(module) = &first.module {
				group.insert("module".into(), json!(module));
			}
			group.insert("mode".into(), json!(first.mode.as_str()));
			group.insert("type".into(), json!(first.resource_type));
			group.insert("name".into(), json!(first.resource_name));
			group.insert("provider".into(), json!(provider_string(first)));
			group.insert("instances".into(), Value::Array(members.iter().map(|r| instance(r)).collect()));
			Ok(Value::Object(group))
		})
		.collect()
}

fn provider_string(record: &ResourceRecord) -> String {
	match &record.provider_config {
		Some(provider) => provider.clone(),
		None => format!("provider[\"registry.terraform.io/hashicorp/{}\"]", record.provider_name),
	}
}

fn instance(record: &ResourceRecord) -> Value {
	let mut instance = Map::new();
	if let Some(index_key) = &record.index_key {
		instance.insert("index_key".into(), index_key.clone());
	}
	instance.insert("schema_version".into(), json!(record.schema_version.unwrap_or(0)));
	instance.insert("attributes".into(), Value::Object(record.attributes.clone()));
	if !record.dependencies.is_empty() {
		instance.insert("dependencies".into(), json!(record.dependencies));
	}
	Value::Object(instance)
}

/// Sort key for instances of one group: those carrying an `id` attribute
/// sort by it, ahead of those without; ties fall back to the canonical
/// attribute map.
fn instance_order(record: &ResourceRecord) -> Result<(u8, String, String), CanonicalizationError> {
	let attrs = canonical_json(&Value::Object(record.attributes.clone()))?;
	Ok(match record.attributes.get("id").filter(|v| !v.is_null()) {
		Some(id) => (0, canonical_json(id)?, attrs),
		None => (1, String::new(), attrs),
	})
}

//! Structural diff between two versions of one lineage.
//!
//! The comparison itself is a pure function of two record sets
//! ([`diff_records`]). [`DiffEngine`] loads those sets through the
//! partition-aware lookup and persists each result under its
//! `(lineage, old, new)` key; later requests for the same triple read the
//! stored row back instead of recomputing.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

use super::hasher::{canonical_json, CanonicalizationError};
use crate::models::{Diff, DiffChanges, FieldChange, ModifiedResource, ResourceRecord, ResourceRef, Snapshot};
use crate::store::lookup::encode;
use crate::store::{Lookup, StoreError, Table};

#[derive(Debug, Error)]
pub enum DiffError {
	#[error("lineage {lineage_id} has no snapshot at version {version}")]
	VersionNotFound { lineage_id: String, version: u64 },

	#[error("address {address} appears twice at version {version}")]
	DuplicateAddress { address: String, version: u64 },

	#[error(transparent)]
	Canonicalization(#[from] CanonicalizationError),

	#[error("database error: {0}")]
	DbError(#[from] StoreError),
}

/// Result of diffing a snapshot against its predecessor.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffOutcome {
	/// First snapshot of a lineage: nothing to compare, nothing stored.
	First,
	Computed(Diff),
}

impl DiffOutcome {
	pub fn is_first(&self) -> bool {
		matches!(self, DiffOutcome::First)
	}

	pub fn changes(&self) -> DiffChanges {
		match self {
			DiffOutcome::First => DiffChanges::default(),
			DiffOutcome::Computed(diff) => diff.changes.clone(),
		}
	}
}

#[derive(Clone)]
pub struct DiffEngine {
	lookup: Lookup,
}

impl DiffEngine {
	pub fn new(lookup: Lookup) -> Self {
		Self { lookup }
	}

	/// Diff `new_version` against `previous`; `None` means first snapshot and
	/// short-circuits without touching the store.
	pub async fn diff_against(
		&self,
		lineage_id: &str,
		previous: Option<u64>,
		new_version: u64,
	) -> Result<DiffOutcome, DiffError> {
		match previous {
			None => Ok(DiffOutcome::First),
			Some(old_version) => self.compute_diff(lineage_id, old_version, new_version).await.map(DiffOutcome::Computed),
		}
	}

	/// Diff for `(lineage, old, new)`, computed on first request and read back after.
	pub async fn compute_diff(&self, lineage_id: &str, old_version: u64, new_version: u64) -> Result<Diff, DiffError> {
		let key = Diff::key(lineage_id, old_version, new_version);
		if let Some(existing) = self.lookup.get::<Diff>(Table::Diff, &key).await? {
			debug!(lineage = lineage_id, old_version, new_version, "diff cache hit");
			return Ok(existing);
		}

		let old_snapshot = self.snapshot_at(lineage_id, old_version).await?;
		let new_snapshot = self.snapshot_at(lineage_id, new_version).await?;
		let old_records = self.records_of(&old_snapshot.id).await?;
		let new_records = self.records_of(&new_snapshot.id).await?;

		let changes = diff_records(&old_records, &new_records, old_version, new_version)?;
		let diff = Diff {
			id: key.clone(),
			lineage_id: lineage_id.to_string(),
			old_version,
			new_version,
			old_snapshot_id: old_snapshot.id,
			new_snapshot_id: new_snapshot.id,
			calculated_at: Utc::now(),
			summary: changes.summary(),
			changes,
		};

		match self.lookup.store().insert(Table::Diff, &key, encode(Table::Diff, &diff)?).await {
			Ok(()) => {
				info!(
					lineage = lineage_id,
					old_version,
					new_version,
					added = diff.summary.added_count,
					modified = diff.summary.modified_count,
					deleted = diff.summary.deleted_count,
					"diff computed"
				);
				Ok(diff)
			}
			// Someone else stored this triple first; theirs is authoritative.
			Err(StoreError::Conflict { .. }) => self
				.lookup
				.get::<Diff>(Table::Diff, &key)
				.await?
				.ok_or_else(|| DiffError::DbError(StoreError::NotFound { table: Table::Diff.as_str(), id: key.clone() })),
			Err(e) => Err(e.into()),
		}
	}

	/// Stored diffs of one lineage, oldest pair first.
	pub async fn list_diffs(&self, lineage_id: &str) -> Result<Vec<Diff>, DiffError> {
		let mut diffs: Vec<Diff> = self.lookup.fetch_where(Table::Diff, &[("lineage_id", json!(lineage_id))]).await?;
		diffs.sort_by_key(|d| (d.new_version, d.old_version));
		Ok(diffs)
	}

	/// The snapshot holding `version`; the most recently imported one when
	/// the version was imported more than once.
	async fn snapshot_at(&self, lineage_id: &str, version: u64) -> Result<Snapshot, DiffError> {
		let found: Vec<Snapshot> = self
			.lookup
			.fetch_where(Table::Snapshot, &[("lineage_id", json!(lineage_id)), ("version", json!(version))])
			.await?;
		if found.len() > 1 {
			debug!(lineage = lineage_id, version, count = found.len(), "version imported more than once; using newest");
		}
		Snapshot::newest(found).ok_or_else(|| DiffError::VersionNotFound { lineage_id: lineage_id.to_string(), version })
	}

	async fn records_of(&self, snapshot_id: &str) -> Result<Vec<ResourceRecord>, DiffError> {
		Ok(self.lookup.fetch_where(Table::Resource, &[("snapshot_id", json!(snapshot_id))]).await?)
	}
}

/// Added / deleted by address; modified where the canonical attribute maps differ.
pub fn diff_records(
	old: &[ResourceRecord],
	new: &[ResourceRecord],
	old_version: u64,
	new_version: u64,
) -> Result<DiffChanges, DiffError> {
	let old_map = by_address(old, old_version)?;
	let new_map = by_address(new, new_version)?;
	let mut changes = DiffChanges::default();

	for (address, record) in &new_map {
		match old_map.get(address) {
			None => changes.added.push(resource_ref(record)),
			Some(before) => {
				let fields = attribute_changes(before, record)?;
				if !fields.is_empty() {
					changes.modified.push(ModifiedResource {
						address: address.to_string(),
						resource_type: record.resource_type.clone(),
						changes: fields,
					});
				}
			}
		}
	}
	for (address, record) in &old_map {
		if !new_map.contains_key(address) {
			changes.deleted.push(resource_ref(record));
		}
	}

	Ok(changes)
}

fn by_address(records: &[ResourceRecord], version: u64) -> Result<BTreeMap<&str, &ResourceRecord>, DiffError> {
	let mut map = BTreeMap::new();
	for record in records {
		if map.insert(record.resource_address.as_str(), record).is_some() {
			return Err(DiffError::DuplicateAddress { address: record.resource_address.clone(), version });
		}
	}
	Ok(map)
}

fn resource_ref(record: &ResourceRecord) -> ResourceRef {
	ResourceRef {
		address: record.resource_address.clone(),
		resource_type: record.resource_type.clone(),
		resource_name: record.resource_name.clone(),
		mode: record.mode,
	}
}

/// Per-key changes; a key missing on one side counts as `null`.
fn attribute_changes(old: &ResourceRecord, new: &ResourceRecord) -> Result<Vec<FieldChange>, CanonicalizationError> {
	let keys: BTreeSet<&String> = old.attributes.keys().chain(new.attributes.keys()).collect();
	let mut changes = Vec::new();
	for field in keys {
		let before = old.attributes.get(field).cloned().unwrap_or(Value::Null);
		let after = new.attributes.get(field).cloned().unwrap_or(Value::Null);
		if canonical_json(&before)? != canonical_json(&after)? {
			changes.push(FieldChange { field: field.clone(), old_value: before, new_value: after });
		}
	}
	Ok(changes)
}

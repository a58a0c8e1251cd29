//! Keyed, partitioned row store the engine persists into.
//!
//! Rows are JSON objects addressed by a string id inside one of four tables.
//! Partitions are named secondary indexes over one or more top-level fields;
//! a store advertises them through [`ResourceStore::find_partition`] and serves
//! point lookups through [`ResourceStore::list_by_partition`].

pub mod lookup;
pub mod memory;

use std::cmp::Ordering;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use lookup::{Lookup, PartitionCache};
pub use memory::{MemoryStore, StoreOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
	Snapshot,
	Lineage,
	Resource,
	Diff,
}

impl Table {
	pub const ALL: [Table; 4] = [Table::Snapshot, Table::Lineage, Table::Resource, Table::Diff];

	pub fn as_str(&self) -> &'static str {
		match self {
			Table::Snapshot => "snapshot",
			Table::Lineage => "lineage",
			Table::Resource => "resource",
			Table::Diff => "diff",
		}
	}
}

/// A named secondary index over `fields` of `table`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDef {
	pub table: Table,
	pub name: &'static str,
	pub fields: &'static [&'static str],
}

/// Partitions both concrete stores provision.
pub const DEFAULT_PARTITIONS: &[PartitionDef] = &[
	PartitionDef { table: Table::Snapshot, name: "idx_snapshot_content_hash", fields: &["content_hash"] },
	PartitionDef { table: Table::Snapshot, name: "idx_snapshot_lineage", fields: &["lineage_id"] },
	PartitionDef { table: Table::Snapshot, name: "idx_snapshot_lineage_version", fields: &["lineage_id", "version"] },
	PartitionDef { table: Table::Snapshot, name: "idx_snapshot_source", fields: &["source_locator"] },
	PartitionDef {
		table: Table::Resource,
		name: "idx_resource_lineage_version",
		fields: &["lineage_id", "snapshot_version"],
	},
	PartitionDef { table: Table::Resource, name: "idx_resource_snapshot", fields: &["snapshot_id"] },
	PartitionDef { table: Table::Diff, name: "idx_diff_lineage", fields: &["lineage_id"] },
];

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("row already exists: {table}/{id}")]
	Conflict { table: &'static str, id: String },

	#[error("row not found: {table}/{id}")]
	NotFound { table: &'static str, id: String },

	#[error("unknown partition {partition} on {table}")]
	UnknownPartition { table: &'static str, partition: String },

	#[error("partition {partition} expects {expected} values, got {actual}")]
	PartitionArity {
		partition: String,
		expected: usize,
		actual: usize,
	},

	#[error("row is not a JSON object: {0}")]
	InvalidRow(String),

	#[error("failed to decode {table} row: {message}")]
	Decode { table: &'static str, message: String },

	#[error("database error: {0}")]
	DbError(String),
}

/// Sort applied to `list` results.
#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
	pub field: String,
	pub descending: bool,
}

/// Full-scan query: equality filter, optional sort and limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListQuery {
	pub filter: Vec<(String, Value)>,
	pub sort: Option<SortKey>,
	pub limit: Option<usize>,
}

impl ListQuery {
	pub fn all() -> Self {
		Self::default()
	}

	pub fn matching(mut self, field: &str, value: impl Into<Value>) -> Self {
		self.filter.push((field.to_string(), value.into()));
		self
	}

	pub fn sorted_by(mut self, field: &str, descending: bool) -> Self {
		self.sort = Some(SortKey { field: field.to_string(), descending });
		self
	}

	pub fn limit(mut self, limit: usize) -> Self {
		self.limit = Some(limit);
		self
	}

	pub fn matches(&self, row: &Value) -> bool {
		self.filter.iter().all(|(field, expected)| row.get(field) == Some(expected))
	}

	/// Applies filter, sort and limit to rows that came back from a scan.
	pub fn apply(&self, rows: Vec<Value>) -> Vec<Value> {
		let mut rows: Vec<Value> = rows.into_iter().filter(|row| self.matches(row)).collect();
		if let Some(sort) = &self.sort {
			rows.sort_by(|a, b| {
				let ord = compare_json(a.get(&sort.field), b.get(&sort.field));
				if sort.descending { ord.reverse() } else { ord }
			});
		}
		if let Some(limit) = self.limit {
			rows.truncate(limit);
		}
		rows
	}
}

/// Orders missing < null < bool < number < string; arrays and objects by their text.
pub fn compare_json(a: Option<&Value>, b: Option<&Value>) -> Ordering {
	fn rank(v: Option<&Value>) -> u8 {
		match v {
			None => 0,
			Some(Value::Null) => 1,
			Some(Value::Bool(_)) => 2,
			Some(Value::Number(_)) => 3,
			Some(Value::String(_)) => 4,
			Some(Value::Array(_)) => 5,
			Some(Value::Object(_)) => 6,
		}
	}

	match (a, b) {
		(Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
		(Some(Value::Number(x)), Some(Value::Number(y))) => match (x.as_u64(), y.as_u64()) {
			(Some(x), Some(y)) => x.cmp(&y),
			_ => {
				let x = x.as_f64().unwrap_or(0.0);
				let y = y.as_f64().unwrap_or(0.0);
				x.partial_cmp(&y).unwrap_or(Ordering::Equal)
			}
		},
		(Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
		(Some(x @ Value::Array(_)), Some(y @ Value::Array(_)))
		| (Some(x @ Value::Object(_)), Some(y @ Value::Object(_))) => x.to_string().cmp(&y.to_string()),
		_ => rank(a).cmp(&rank(b)),
	}
}

/// The collaborator every persisted row goes through.
///
/// Stores do no locking of their own. Imports of one lineage are serialised
/// inside the ingestor; across processes only [`StoreError::Conflict`] on
/// insert keeps ids unique.
#[async_trait]
pub trait ResourceStore: Send + Sync {
	/// Stable name used to key the partition discovery cache.
	fn name(&self) -> &str;

	async fn get(&self, table: Table, id: &str) -> Result<Option<Value>, StoreError>;

	/// Fails with [`StoreError::Conflict`] when `id` already exists.
	async fn insert(&self, table: Table, id: &str, row: Value) -> Result<(), StoreError>;

	async fn insert_many(&self, table: Table, rows: Vec<(String, Value)>) -> Result<(), StoreError> {
		for (id, row) in rows {
			self.insert(table, &id, row).await?;
		}
		Ok(())
	}

	/// Shallow merge of the object `patch` into the stored row.
	async fn update(&self, table: Table, id: &str, patch: Value) -> Result<(), StoreError>;

	async fn list(&self, table: Table, query: &ListQuery) -> Result<Vec<Value>, StoreError>;

	/// Name of a partition indexing exactly `fields`, if the store has one.
	async fn find_partition(&self, table: Table, fields: &[&str]) -> Result<Option<String>, StoreError>;

	/// Point lookup: rows whose partition fields equal `values`, in field order.
	async fn list_by_partition(
		&self,
		table: Table,
		partition: &str,
		values: &[Value],
	) -> Result<Vec<Value>, StoreError>;
}

/// Merges the top-level keys of `patch` into `row`.
pub(crate) fn merge_patch(row: &mut Value, patch: Value) -> Result<(), StoreError> {
	let fields = match patch {
		Value::Object(fields) => fields,
		other => return Err(StoreError::InvalidRow(other.to_string())),
	};
	match row {
		Value::Object(target) => {
			target.extend(fields);
			Ok(())
		}
		other => Err(StoreError::InvalidRow(other.to_string())),
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn list_query_filters_sorts_and_limits() {
		let rows = vec![
			json!({"lineage_id": "a", "version": 2}),
			json!({"lineage_id": "b", "version": 9}),
			json!({"lineage_id": "a", "version": 7}),
			json!({"lineage_id": "a", "version": 1}),
		];

		let query = ListQuery::all().matching("lineage_id", "a").sorted_by("version", true).limit(2);
		let out = query.apply(rows);

		assert_eq!(out, vec![json!({"lineage_id": "a", "version": 7}), json!({"lineage_id": "a", "version": 2})]);
	}

	#[test]
	fn numbers_compare_numerically() {
		let a = json!(10);
		let b = json!(9);
		assert_eq!(compare_json(Some(&a), Some(&b)), Ordering::Greater);
		assert_eq!(compare_json(None, Some(&b)), Ordering::Less);
	}

	#[test]
	fn merge_patch_overwrites_top_level_keys() {
		let mut row = json!({"a": 1, "b": {"c": 2}});
		merge_patch(&mut row, json!({"b": 3, "d": 4})).unwrap();
		assert_eq!(row, json!({"a": 1, "b": 3, "d": 4}));
	}

	#[test]
	fn merge_patch_rejects_non_objects() {
		let mut row = json!({"a": 1});
		assert!(matches!(merge_patch(&mut row, json!([1])), Err(StoreError::InvalidRow(_))));
	}

	#[test]
	fn merge_patch_rejects_non_object_rows() {
		let mut row = json!("scalar");
		assert!(matches!(merge_patch(&mut row, json!({"a": 1})), Err(StoreError::InvalidRow(text)) if text == "\"scalar\""));
		assert_eq!(row, json!("scalar"));
	}
}

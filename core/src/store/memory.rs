//! In-memory store with real partition indexes and an operation log.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use super::{merge_patch, ListQuery, PartitionDef, ResourceStore, StoreError, Table, DEFAULT_PARTITIONS};
use crate::engine::hasher::canonical_json;

/// Record of a store call, for asserting which lookup path the engine took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
	Get { table: Table },
	Insert { table: Table, rows: usize },
	Update { table: Table },
	Scan { table: Table },
	PartitionLookup { table: Table, partition: String },
	Discover { table: Table },
}

#[derive(Default)]
struct Tables {
	rows: HashMap<Table, BTreeMap<String, Value>>,
	/// (table, partition) -> canonical key of the partition values -> row ids
	indexes: HashMap<(Table, &'static str), HashMap<String, Vec<String>>>,
}

#[derive(Clone)]
pub struct MemoryStore {
	name: String,
	partitions: Arc<Vec<PartitionDef>>,
	data: Arc<RwLock<Tables>>,
	ops: Arc<Mutex<Vec<StoreOp>>>,
}

impl Default for MemoryStore {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::with_partitions(DEFAULT_PARTITIONS.to_vec())
	}

	/// A store with no partitions; every lookup goes through a full scan.
	pub fn without_partitions() -> Self {
		Self::with_partitions(Vec::new())
	}

	pub fn with_partitions(partitions: Vec<PartitionDef>) -> Self {
		Self {
			name: format!("memory-{}", ulid::Ulid::new()),
			partitions: Arc::new(partitions),
			data: Arc::new(RwLock::new(Tables::default())),
			ops: Arc::new(Mutex::new(Vec::new())),
		}
	}

	pub fn operations(&self) -> Vec<StoreOp> {
		self.ops.lock().clone()
	}

	pub fn clear_operations(&self) {
		self.ops.lock().clear();
	}

	pub fn count(&self, table: Table) -> usize {
		self.data.read().rows.get(&table).map(|rows| rows.len()).unwrap_or(0)
	}

	fn record(&self, op: StoreOp) {
		self.ops.lock().push(op);
	}

	fn partition(&self, table: Table, name: &str) -> Result<&PartitionDef, StoreError> {
		self.partitions
			.iter()
			.find(|p| p.table == table && p.name == name)
			.ok_or_else(|| StoreError::UnknownPartition { table: table.as_str(), partition: name.to_string() })
	}

	/// `(partition, key)` pairs `row` is filed under.
	fn row_keys(partitions: &[PartitionDef], table: Table, row: &Value) -> Result<Vec<(&'static str, String)>, StoreError> {
		partitions
			.iter()
			.filter(|p| p.table == table)
			.map(|def| {
				let values: Vec<Value> = def.fields.iter().map(|f| row.get(*f).cloned().unwrap_or(Value::Null)).collect();
				Ok((def.name, partition_key(&values)?))
			})
			.collect()
	}

	fn index_row(tables: &mut Tables, table: Table, id: &str, keys: Vec<(&'static str, String)>) {
		for (name, key) in keys {
			tables.indexes.entry((table, name)).or_default().entry(key).or_default().push(id.to_string());
		}
	}

	fn unindex_row(tables: &mut Tables, table: Table, id: &str, keys: Vec<(&'static str, String)>) {
		for (name, key) in keys {
			if let Some(ids) = tables.indexes.get_mut(&(table, name)).and_then(|idx| idx.get_mut(&key)) {
				ids.retain(|existing| existing != id);
			}
		}
	}
}

fn partition_key(values: &[Value]) -> Result<String, StoreError> {
	let parts = values
		.iter()
		.map(canonical_json)
		.collect::<Result<Vec<_>, _>>()
		.map_err(|e| StoreError::InvalidRow(e.to_string()))?;
	Ok(parts.join("\u{1f}"))
}

#[async_trait]
impl ResourceStore for MemoryStore {
	fn name(&self) -> &str {
		&self.name
	}

	async fn get(&self, table: Table, id: &str) -> Result<Option<Value>, StoreError> {
		self.record(StoreOp::Get { table });
		Ok(self.data.read().rows.get(&table).and_then(|rows| rows.get(id)).cloned())
	}

	async fn insert(&self, table: Table, id: &str, row: Value) -> Result<(), StoreError> {
		self.insert_many(table, vec![(id.to_string(), row)]).await
	}

	async fn insert_many(&self, table: Table, rows: Vec<(String, Value)>) -> Result<(), StoreError> {
		self.record(StoreOp::Insert { table, rows: rows.len() });
		let mut data = self.data.write();

		// All-or-nothing: check every id and key before touching the table.
		let mut keyed = Vec::with_capacity(rows.len());
		{
			let existing = data.rows.entry(table).or_default();
			for (id, row) in rows {
				if !row.is_object() {
					return Err(StoreError::InvalidRow(row.to_string()));
				}
				if existing.contains_key(&id) {
					return Err(StoreError::Conflict { table: table.as_str(), id });
				}
				let keys = Self::row_keys(&self.partitions, table, &row)?;
				keyed.push((id, row, keys));
			}
		}

		for (id, row, keys) in keyed {
			Self::index_row(&mut data, table, &id, keys);
			data.rows.entry(table).or_default().insert(id, row);
		}
		Ok(())
	}

	async fn update(&self, table: Table, id: &str, patch: Value) -> Result<(), StoreError> {
		self.record(StoreOp::Update { table });
		let mut data = self.data.write();
		let mut row = data
			.rows
			.get(&table)
			.and_then(|rows| rows.get(id))
			.cloned()
			.ok_or_else(|| StoreError::NotFound { table: table.as_str(), id: id.to_string() })?;

		let old_keys = Self::row_keys(&self.partitions, table, &row)?;
		merge_patch(&mut row, patch)?;
		let new_keys = Self::row_keys(&self.partitions, table, &row)?;
		Self::unindex_row(&mut data, table, id, old_keys);
		Self::index_row(&mut data, table, id, new_keys);
		data.rows.entry(table).or_default().insert(id.to_string(), row);
		Ok(())
	}

	async fn list(&self, table: Table, query: &ListQuery) -> Result<Vec<Value>, StoreError> {
		self.record(StoreOp::Scan { table });
		let rows: Vec<Value> = self
			.data
			.read()
			.rows
			.get(&table)
			.map(|rows| rows.values().cloned().collect())
			.unwrap_or_default();
		Ok(query.apply(rows))
	}

	async fn find_partition(&self, table: Table, fields: &[&str]) -> Result<Option<String>, StoreError> {
		self.record(StoreOp::Discover { table });
		Ok(self
			.partitions
			.iter()
			.find(|p| p.table == table && p.fields == fields)
			.map(|p| p.name.to_string()))
	}

	async fn list_by_partition(
		&self,
		table: Table,
		partition: &str,
		values: &[Value],
	) -> Result<Vec<Value>, StoreError> {
		let def = self.partition(table, partition)?;
		if def.fields.len() != values.len() {
			return Err(StoreError::PartitionArity {
				partition: partition.to_string(),
				expected: def.fields.len(),
				actual: values.len(),
			});
		}
		self.record(StoreOp::PartitionLookup { table, partition: partition.to_string() });

		let key = partition_key(values)?;
		let data = self.data.read();
		let Some(ids) = data.indexes.get(&(table, def.name)).and_then(|idx| idx.get(&key)) else {
			return Ok(Vec::new());
		};
		let rows = data.rows.get(&table);
		Ok(ids.iter().filter_map(|id| rows.and_then(|r| r.get(id)).cloned()).collect())
	}
}

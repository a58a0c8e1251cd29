//! Fast-path / slow-path row lookup.
//!
//! A lookup by field values first asks the store for a partition covering
//! exactly those fields. The answer is memoized per `(store, fields)` for the
//! life of the process. With a partition the rows come from a point lookup;
//! without one the whole table is scanned and filtered here. Both paths return
//! the same rows.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::{ListQuery, ResourceStore, StoreError, Table};

/// `(store name, comma-joined fields)` -> partition name, or `None` when the
/// store has none for those fields.
#[derive(Clone, Default)]
pub struct PartitionCache {
	entries: Arc<RwLock<HashMap<(String, String), Option<String>>>>,
}

impl PartitionCache {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, store: &str, fields: &str) -> Option<Option<String>> {
		self.entries.read().get(&(store.to_string(), fields.to_string())).cloned()
	}

	pub fn put(&self, store: &str, fields: &str, partition: Option<String>) {
		self.entries.write().insert((store.to_string(), fields.to_string()), partition);
	}

	pub fn len(&self) -> usize {
		self.entries.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// Store handle plus the discovery cache. Clone is cheap.
#[derive(Clone)]
pub struct Lookup {
	store: Arc<dyn ResourceStore>,
	cache: PartitionCache,
}

impl Lookup {
	pub fn new(store: Arc<dyn ResourceStore>) -> Self {
		Self { store, cache: PartitionCache::new() }
	}

	pub fn with_cache(store: Arc<dyn ResourceStore>, cache: PartitionCache) -> Self {
		Self { store, cache }
	}

	pub fn store(&self) -> &Arc<dyn ResourceStore> {
		&self.store
	}

	pub fn cache(&self) -> &PartitionCache {
		&self.cache
	}

	/// Partition covering `fields` on `table`, discovered once per store.
	pub async fn partition_for(&self, table: Table, fields: &[&str]) -> Result<Option<String>, StoreError> {
		let key = format!("{}.{}", table.as_str(), fields.join(","));
		if let Some(known) = self.cache.get(self.store.name(), &key) {
			return Ok(known);
		}

		let found = self.store.find_partition(table, fields).await?;
		debug!(store = self.store.name(), fields = %key, partition = ?found, "partition discovery");
		self.cache.put(self.store.name(), &key, found.clone());
		Ok(found)
	}

	/// Rows of `table` whose fields equal the given values.
	pub async fn rows_where(&self, table: Table, conditions: &[(&str, Value)]) -> Result<Vec<Value>, StoreError> {
		let fields: Vec<&str> = conditions.iter().map(|(field, _)| *field).collect();

		match self.partition_for(table, &fields).await? {
			Some(partition) => {
				let values: Vec<Value> = conditions.iter().map(|(_, value)| value.clone()).collect();
				debug!(table = table.as_str(), %partition, "fast path");
				self.store.list_by_partition(table, &partition, &values).await
			}
			None => {
				debug!(table = table.as_str(), fields = ?fields, "slow path: full scan");
				let mut filter = ListQuery::all();
				for (field, value) in conditions {
					filter = filter.matching(field, value.clone());
				}
				let rows = self.store.list(table, &ListQuery::all()).await?;
				Ok(filter.apply(rows))
			}
		}
	}

	/// Like [`Lookup::rows_where`], decoding each row into `T`.
	pub async fn fetch_where<T: DeserializeOwned>(
		&self,
		table: Table,
		conditions: &[(&str, Value)],
	) -> Result<Vec<T>, StoreError> {
		self.rows_where(table, conditions).await?.into_iter().map(|row| decode(table, row)).collect()
	}

	pub async fn get<T: DeserializeOwned>(&self, table: Table, id: &str) -> Result<Option<T>, StoreError> {
		match self.store.get(table, id).await? {
			Some(row) => decode(table, row).map(Some),
			None => Ok(None),
		}
	}

	pub async fn list<T: DeserializeOwned>(&self, table: Table, query: &ListQuery) -> Result<Vec<T>, StoreError> {
		self.store.list(table, query).await?.into_iter().map(|row| decode(table, row)).collect()
	}
}

pub fn decode<T: DeserializeOwned>(table: Table, row: Value) -> Result<T, StoreError> {
	serde_json::from_value(row).map_err(|e| StoreError::Decode { table: table.as_str(), message: e.to_string() })
}

pub fn encode<T: serde::Serialize>(table: Table, value: &T) -> Result<Value, StoreError> {
	serde_json::to_value(value).map_err(|e| StoreError::Decode { table: table.as_str(), message: e.to_string() })
}

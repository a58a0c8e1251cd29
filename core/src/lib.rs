//! Terraform / OpenTofu state lineage tracking: dedup on import, per-lineage
//! version history, memoized structural diffs and document reconstruction.

pub mod config;
pub mod db;
pub mod engine;
pub mod models;
pub mod sources;
pub mod store;

use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;

use crate::config::Config;
use crate::db::SurrealStore;
use crate::engine::differ::{DiffEngine, DiffError};
use crate::engine::exporter::{ExportError, ExportSelector, ExportedDocument, Exporter};
use crate::engine::filter::{FilterError, ResourceFilter};
use crate::engine::importer::{BatchImporter, BatchReport, SourceSpec};
use crate::engine::ingestor::{ImportError, ImportResult, Ingestor, LastSeen, LastSeenTracker};
use crate::models::{Diff, Lineage, Snapshot};
use crate::store::{ListQuery, Lookup, ResourceStore, StoreError, Table};

#[derive(Debug, Error)]
pub enum EngineError {
	#[error(transparent)]
	Store(#[from] StoreError),

	#[error(transparent)]
	Filter(#[from] FilterError),
}

/// Everything wired over one store. Clone is cheap.
#[derive(Clone)]
pub struct Engine {
	lookup: Lookup,
	ingestor: Ingestor,
	importer: BatchImporter,
	differ: DiffEngine,
	exporter: Exporter,
}

impl Engine {
	pub fn new(store: Arc<dyn ResourceStore>, filter: &ResourceFilter) -> Result<Self, FilterError> {
		let lookup = Lookup::new(store);
		let tracker = LastSeenTracker::default();
		let ingestor = Ingestor::new(lookup.clone(), filter)?.with_tracker(tracker.clone());
		Ok(Self {
			importer: BatchImporter::new(ingestor.clone()),
			differ: DiffEngine::new(lookup.clone()),
			exporter: Exporter::new(lookup.clone(), tracker),
			ingestor,
			lookup,
		})
	}

	/// Filter and export defaults from `config`, over an existing store.
	pub fn with_config(store: Arc<dyn ResourceStore>, config: &Config) -> Result<Self, FilterError> {
		let mut engine = Self::new(store, &config.filter)?;
		engine.exporter = engine.exporter.with_tool_version(config.export.tool_version.clone());
		Ok(engine)
	}

	/// Open the configured SurrealDB store.
	pub async fn open(config: &Config) -> Result<Self, EngineError> {
		let store = if config.store.in_memory {
			SurrealStore::in_memory().await?
		} else {
			SurrealStore::open(&config.store.resolved_path()).await?
		};
		Ok(Self::with_config(Arc::new(store), config)?)
	}

	pub fn store(&self) -> &Arc<dyn ResourceStore> {
		self.lookup.store()
	}

	pub async fn import_snapshot(&self, source_locator: &str, document: &Value) -> Result<ImportResult, ImportError> {
		self.ingestor.import_snapshot(source_locator, document).await
	}

	pub async fn import_many(&self, spec: &SourceSpec, parallelism: usize) -> Result<BatchReport, ImportError> {
		self.importer.import_many(spec, parallelism).await
	}

	pub async fn compute_diff(&self, lineage_id: &str, old_version: u64, new_version: u64) -> Result<Diff, DiffError> {
		self.differ.compute_diff(lineage_id, old_version, new_version).await
	}

	pub async fn list_diffs(&self, lineage_id: &str) -> Result<Vec<Diff>, DiffError> {
		self.differ.list_diffs(lineage_id).await
	}

	pub async fn export_snapshot(&self, selector: &ExportSelector) -> Result<ExportedDocument, ExportError> {
		self.exporter.export_snapshot(selector).await
	}

	/// Most recently imported first.
	pub async fn list_lineages(&self) -> Result<Vec<Lineage>, StoreError> {
		let mut lineages: Vec<Lineage> = self.lookup.list(Table::Lineage, &ListQuery::all()).await?;
		lineages.sort_by(|a, b| b.last_imported_at.cmp(&a.last_imported_at).then_with(|| a.id.cmp(&b.id)));
		Ok(lineages)
	}

	pub async fn get_lineage(&self, lineage_id: &str) -> Result<Option<Lineage>, StoreError> {
		self.lookup.get(Table::Lineage, lineage_id).await
	}

	/// Snapshots of one lineage by version, then import time.
	pub async fn lineage_history(&self, lineage_id: &str) -> Result<Vec<Snapshot>, StoreError> {
		let mut snapshots: Vec<Snapshot> =
			self.lookup.fetch_where(Table::Snapshot, &[("lineage_id", json!(lineage_id))]).await?;
		snapshots.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.imported_at.cmp(&b.imported_at)));
		Ok(snapshots)
	}

	pub fn last_seen(&self) -> Option<LastSeen> {
		self.ingestor.last_seen().get()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::MemoryStore;

	fn doc(lineage: &str, serial: u64) -> Value {
		json!({"version": 4, "serial": serial, "lineage": lineage, "resources": []})
	}

	#[tokio::test]
	async fn history_and_lineage_listing() {
		let engine = Engine::new(Arc::new(MemoryStore::new()), &ResourceFilter::default()).unwrap();
		engine.import_snapshot("a", &doc("lin-a", 2)).await.unwrap();
		engine.import_snapshot("a", &doc("lin-a", 1)).await.unwrap();
		engine.import_snapshot("b", &doc("lin-b", 1)).await.unwrap();

		let history = engine.lineage_history("lin-a").await.unwrap();
		assert_eq!(history.iter().map(|s| s.version).collect::<Vec<_>>(), vec![1, 2]);

		let lineages = engine.list_lineages().await.unwrap();
		assert_eq!(lineages.len(), 2);
		assert_eq!(lineages[0].id, "lin-b");
		assert_eq!(engine.get_lineage("lin-a").await.unwrap().unwrap().latest_version, 2);
		assert_eq!(engine.last_seen(), Some(LastSeen { lineage_id: "lin-b".into(), version: 1 }));
	}

	#[tokio::test]
	async fn export_defaults_to_last_seen() {
		let engine = Engine::new(Arc::new(MemoryStore::new()), &ResourceFilter::default()).unwrap();
		engine.import_snapshot("a", &doc("lin-a", 1)).await.unwrap();
		engine.import_snapshot("b", &doc("lin-b", 4)).await.unwrap();

		let out = engine.export_snapshot(&ExportSelector::default()).await.unwrap();

		assert_eq!(out.lineage_id, "lin-b");
		assert_eq!(out.version, 4);
	}

	#[tokio::test]
	async fn config_supplies_export_tool_version() {
		let mut config = Config::default();
		config.export.tool_version = "1.8.2".into();
		let engine = Engine::with_config(Arc::new(MemoryStore::new()), &config).unwrap();
		engine.import_snapshot("a", &doc("lin-a", 1)).await.unwrap();

		let out = engine.export_snapshot(&ExportSelector::default()).await.unwrap();

		assert_eq!(out.document["terraform_version"], "1.8.2");
	}
}

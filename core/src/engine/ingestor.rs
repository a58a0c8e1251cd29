//! Single-document import: validate, dedup, persist, diff.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};
use ulid::Ulid;

use super::differ::{DiffEngine, DiffError};
use super::extractor::{extract, ExtractionError, SnapshotRef};
use super::filter::{CompiledFilter, FilterError, ResourceFilter};
use super::hasher::{content_hash, CanonicalizationError};
use super::lineage::upsert_lineage;
use super::validator::{validate, ValidationError};
use crate::models::{DiffSummary, Snapshot};
use crate::sources::{SourceDriver, SourceError};
use crate::store::lookup::encode;
use crate::store::{Lookup, StoreError, Table};

#[derive(Debug, Error)]
pub enum ImportError {
	#[error("invalid document: {0}")]
	InvalidDocument(String),

	#[error("unsupported state format version {0} (supported: 3, 4)")]
	UnsupportedFormatVersion(u64),

	#[error("state file not found: {0}")]
	SourceNotFound(String),

	#[error("failed to extract {address}: {reason}")]
	ExtractionFailure { address: String, reason: String },

	#[error("diff failed for snapshot {snapshot_id}: {source}")]
	DiffComputationFailure {
		snapshot_id: String,
		#[source]
		source: DiffError,
	},

	#[error("invalid document: {0}")]
	Canonicalization(#[from] CanonicalizationError),

	#[error(transparent)]
	InvalidFilter(#[from] FilterError),

	#[error("source error: {0}")]
	Source(SourceError),

	#[error("database error: {0}")]
	Store(#[from] StoreError),
}

impl ImportError {
	/// Stable label for reports and logs.
	pub fn kind(&self) -> &'static str {
		match self {
			ImportError::InvalidDocument(_) | ImportError::Canonicalization(_) => "invalid_document",
			ImportError::UnsupportedFormatVersion(_) => "unsupported_format_version",
			ImportError::SourceNotFound(_) => "source_not_found",
			ImportError::ExtractionFailure { .. } => "extraction_failure",
			ImportError::DiffComputationFailure { .. } => "diff_computation_failure",
			ImportError::InvalidFilter(_) => "invalid_filter",
			ImportError::Source(_) => "source_error",
			ImportError::Store(_) => "internal",
		}
	}
}

impl From<ValidationError> for ImportError {
	fn from(err: ValidationError) -> Self {
		match err {
			ValidationError::InvalidDocument(message) => ImportError::InvalidDocument(message),
			ValidationError::UnsupportedFormatVersion(v) => ImportError::UnsupportedFormatVersion(v),
		}
	}
}

impl From<ExtractionError> for ImportError {
	fn from(err: ExtractionError) -> Self {
		ImportError::ExtractionFailure { address: err.address, reason: err.reason }
	}
}

impl From<SourceError> for ImportError {
	fn from(err: SourceError) -> Self {
		match err {
			SourceError::NotFound(path) => ImportError::SourceNotFound(path),
			SourceError::Parse { path, message } => ImportError::InvalidDocument(format!("{path}: {message}")),
			other => ImportError::Source(other),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
	Duplicate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ImportResult {
	/// Identical content is already stored; nothing was written.
	Skipped { reason: SkipReason, existing_snapshot_id: String },
	Imported(ImportedSnapshot),
}

impl ImportResult {
	pub fn is_skipped(&self) -> bool {
		matches!(self, ImportResult::Skipped { .. })
	}

	pub fn imported(&self) -> Option<&ImportedSnapshot> {
		match self {
			ImportResult::Imported(snapshot) => Some(snapshot),
			ImportResult::Skipped { .. } => None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportedSnapshot {
	pub snapshot_id: String,
	pub lineage_id: String,
	pub version: u64,
	/// Instances seen in the document, before filtering.
	pub resources_extracted: u64,
	pub resources_inserted: u64,
	/// No earlier version to compare against.
	pub is_first: bool,
	pub diff_summary: Option<DiffSummary>,
}

/// The most recent successful import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastSeen {
	pub lineage_id: String,
	pub version: u64,
}

#[derive(Debug, Clone, Default)]
pub struct LastSeenTracker(Arc<Mutex<Option<LastSeen>>>);

impl LastSeenTracker {
	pub fn get(&self) -> Option<LastSeen> {
		self.0.lock().clone()
	}

	pub fn record(&self, lineage_id: &str, version: u64) {
		*self.0.lock() = Some(LastSeen { lineage_id: lineage_id.to_string(), version });
	}
}

/// One async lock per lineage; dedup, lineage upsert and diff of one
/// lineage never interleave.
#[derive(Clone, Default)]
struct LineageLocks(Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>);

impl LineageLocks {
	fn lock_for(&self, lineage_id: &str) -> Arc<tokio::sync::Mutex<()>> {
		self.0.lock().entry(lineage_id.to_string()).or_default().clone()
	}
}

/// What the new snapshot should be compared with.
enum Predecessor {
	None,
	Version(u64),
	/// Another snapshot already holds this version.
	SameVersion(String),
}

#[derive(Clone)]
pub struct Ingestor {
	lookup: Lookup,
	filter: Arc<CompiledFilter>,
	differ: DiffEngine,
	last_seen: LastSeenTracker,
	locks: LineageLocks,
}

impl Ingestor {
	pub fn new(lookup: Lookup, filter: &ResourceFilter) -> Result<Self, FilterError> {
		Ok(Self {
			differ: DiffEngine::new(lookup.clone()),
			filter: Arc::new(filter.compile()?),
			last_seen: LastSeenTracker::default(),
			locks: LineageLocks::default(),
			lookup,
		})
	}

	/// Share a tracker with other components (the exporter reads it).
	pub fn with_tracker(mut self, tracker: LastSeenTracker) -> Self {
		self.last_seen = tracker;
		self
	}

	pub fn last_seen(&self) -> &LastSeenTracker {
		&self.last_seen
	}

	/// Read `path` through `driver` and import it under that locator.
	pub async fn import_from(&self, driver: &dyn SourceDriver, path: &str) -> Result<ImportResult, ImportError> {
		let document = driver.read_state_file(path).await?;
		self.import_snapshot(path, &document).await
	}

	/// Validation and extraction both complete before the first write, so a
	/// rejected document leaves the store untouched. Snapshot, lineage and
	/// record writes are not transactional; the diff runs last. Everything
	/// after validation holds the lineage's lock.
	pub async fn import_snapshot(
		&self,
		source_locator: &str,
		document: &serde_json::Value,
	) -> Result<ImportResult, ImportError> {
		let header = validate(document)?;
		let hash = content_hash(document)?;

		let lock = self.locks.lock_for(&header.lineage);
		let _guard = lock.lock().await;

		let existing: Vec<Snapshot> =
			self.lookup.fetch_where(Table::Snapshot, &[("content_hash", json!(hash))]).await?;
		if let Some(existing) = existing.into_iter().next() {
			info!(locator = source_locator, snapshot = %existing.id, "duplicate content, skipped");
			return Ok(ImportResult::Skipped { reason: SkipReason::Duplicate, existing_snapshot_id: existing.id });
		}

		let snapshot_id = Ulid::new().to_string();
		let lineage_id = header.lineage.as_str();
		let version = header.serial;
		let extraction = extract(
			document,
			SnapshotRef { snapshot_id: &snapshot_id, lineage_id, version },
			&self.filter,
		)?;

		let now = Utc::now();
		let snapshot = Snapshot {
			id: snapshot_id.clone(),
			lineage_id: lineage_id.to_string(),
			source_locator: source_locator.to_string(),
			version,
			tool_version: header.tool_version.clone(),
			format_version: header.format_version,
			resource_count: extraction.records.len() as u64,
			content_hash: hash,
			imported_at: now,
		};
		self.lookup.store().insert(Table::Snapshot, &snapshot_id, encode(Table::Snapshot, &snapshot)?).await?;

		let update = upsert_lineage(&self.lookup, lineage_id, version, &snapshot_id, now).await?;

		let resources_inserted = extraction.records.len() as u64;
		if !extraction.records.is_empty() {
			let rows = extraction
				.records
				.iter()
				.map(|record| Ok((record.id.clone(), encode(Table::Resource, record)?)))
				.collect::<Result<Vec<_>, StoreError>>()?;
			self.lookup.store().insert_many(Table::Resource, rows).await?;
		}

		let predecessor = match &update.previous {
			None => Predecessor::None,
			Some(prev) if update.advanced() => Predecessor::Version(prev.latest_version),
			Some(_) => self.predecessor_below(lineage_id, version, &snapshot_id).await?,
		};

		let (is_first, diff_summary) = match predecessor {
			Predecessor::SameVersion(other) => {
				warn!(
					lineage = lineage_id,
					version,
					snapshot = %snapshot_id,
					other = %other,
					"version already imported with different content; not diffed"
				);
				(false, None)
			}
			Predecessor::None => self.run_diff(lineage_id, None, version, &snapshot_id).await?,
			Predecessor::Version(old) => self.run_diff(lineage_id, Some(old), version, &snapshot_id).await?,
		};

		self.last_seen.record(lineage_id, version);
		info!(
			locator = source_locator,
			lineage = lineage_id,
			version,
			snapshot = %snapshot_id,
			extracted = extraction.total_before_filter,
			inserted = resources_inserted,
			is_first,
			"snapshot imported"
		);

		Ok(ImportResult::Imported(ImportedSnapshot {
			snapshot_id,
			lineage_id: lineage_id.to_string(),
			version,
			resources_extracted: extraction.total_before_filter,
			resources_inserted,
			is_first,
			diff_summary,
		}))
	}

	async fn run_diff(
		&self,
		lineage_id: &str,
		previous: Option<u64>,
		version: u64,
		snapshot_id: &str,
	) -> Result<(bool, Option<DiffSummary>), ImportError> {
		let outcome = self
			.differ
			.diff_against(lineage_id, previous, version)
			.await
			.map_err(|source| ImportError::DiffComputationFailure { snapshot_id: snapshot_id.to_string(), source })?;
		let summary = (!outcome.is_first()).then(|| outcome.changes().summary());
		Ok((outcome.is_first(), summary))
	}

	/// Greatest stored version below `version` for an out-of-order import.
	async fn predecessor_below(&self, lineage_id: &str, version: u64, snapshot_id: &str) -> Result<Predecessor, StoreError> {
		let snapshots: Vec<Snapshot> = self.lookup.fetch_where(Table::Snapshot, &[("lineage_id", json!(lineage_id))]).await?;

		if let Some(same) = snapshots.iter().find(|s| s.version == version && s.id != snapshot_id) {
			return Ok(Predecessor::SameVersion(same.id.clone()));
		}
		let below = snapshots.iter().map(|s| s.version).filter(|v| *v < version).max();
		debug!(lineage = lineage_id, version, predecessor = ?below, "out-of-order import");
		Ok(below.map_or(Predecessor::None, Predecessor::Version))
	}
}

#[cfg(test)]
mod tests {
	use serde_json::{json, Value};

	use super::*;
	use crate::models::{Diff, Lineage, ResourceRecord};
	use crate::store::{MemoryStore, StoreOp};

	fn doc(serial: u64, resources: Value) -> Value {
		json!({"version": 4, "serial": serial, "lineage": "lin-a", "terraform_version": "1.6.0", "resources": resources})
	}

	fn instance(resource_type: &str, name: &str, attrs: Value) -> Value {
		json!({"mode": "managed", "type": resource_type, "name": name, "instances": [{"attributes": attrs}]})
	}

	fn ingestor(store: &MemoryStore) -> Ingestor {
		Ingestor::new(Lookup::new(Arc::new(store.clone())), &ResourceFilter::default()).unwrap()
	}

	#[tokio::test]
	async fn first_import_is_first_and_stores_everything() {
		let store = MemoryStore::new();
		let result = ingestor(&store)
			.import_snapshot("a.tfstate", &doc(1, json!([instance("aws_instance", "web", json!({"x": 1}))])))
			.await
			.unwrap();

		let imported = result.imported().unwrap();
		assert!(imported.is_first);
		assert_eq!(imported.diff_summary, None);
		assert_eq!(imported.resources_extracted, 1);
		assert_eq!(imported.resources_inserted, 1);
		assert_eq!(store.count(Table::Snapshot), 1);
		assert_eq!(store.count(Table::Resource), 1);
		assert_eq!(store.count(Table::Diff), 0);

		let snapshot: Snapshot = Lookup::new(Arc::new(store.clone()))
			.get(Table::Snapshot, &imported.snapshot_id)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(snapshot.tool_version.as_deref(), Some("1.6.0"));
		assert_eq!(snapshot.source_locator, "a.tfstate");
	}

	#[tokio::test]
	async fn same_content_twice_is_skipped() {
		let store = MemoryStore::new();
		let ingestor = ingestor(&store);
		let d = doc(1, json!([instance("aws_instance", "web", json!({}))]));

		let first = ingestor.import_snapshot("a.tfstate", &d).await.unwrap();
		let second = ingestor.import_snapshot("b.tfstate", &d).await.unwrap();

		assert_eq!(
			second,
			ImportResult::Skipped {
				reason: SkipReason::Duplicate,
				existing_snapshot_id: first.imported().unwrap().snapshot_id.clone(),
			}
		);
		assert_eq!(store.count(Table::Resource), 1);
		assert_eq!(store.count(Table::Snapshot), 1);
	}

	#[tokio::test]
	async fn dedup_uses_content_hash_partition() {
		let store = MemoryStore::new();
		ingestor(&store).import_snapshot("a.tfstate", &doc(1, json!([]))).await.unwrap();

		assert!(store.operations().contains(&StoreOp::PartitionLookup {
			table: Table::Snapshot,
			partition: "idx_snapshot_content_hash".into(),
		}));
	}

	#[tokio::test]
	async fn next_version_persists_a_diff() {
		let store = MemoryStore::new();
		let ingestor = ingestor(&store);
		ingestor
			.import_snapshot("s", &doc(1, json!([instance("aws_instance", "web", json!({"x": 1}))])))
			.await
			.unwrap();

		let result = ingestor
			.import_snapshot(
				"s",
				&doc(
					2,
					json!([
						instance("aws_instance", "web", json!({"x": 2})),
						instance("aws_s3_bucket", "logs", json!({}))
					]),
				),
			)
			.await
			.unwrap();

		let imported = result.imported().unwrap();
		assert!(!imported.is_first);
		assert_eq!(imported.diff_summary, Some(DiffSummary { added_count: 1, modified_count: 1, deleted_count: 0 }));
		let stored: Option<Diff> =
			Lookup::new(Arc::new(store.clone())).get(Table::Diff, &Diff::key("lin-a", 1, 2)).await.unwrap();
		assert!(stored.is_some());
	}

	#[tokio::test]
	async fn out_of_order_diffs_against_lower_version() {
		let store = MemoryStore::new();
		let ingestor = ingestor(&store);
		for serial in [1, 5, 3] {
			ingestor
				.import_snapshot("s", &doc(serial, json!([instance("aws_vpc", "main", json!({"serial": serial}))])))
				.await
				.unwrap();
		}

		let lookup = Lookup::new(Arc::new(store.clone()));
		let lineage: Lineage = lookup.get(Table::Lineage, "lin-a").await.unwrap().unwrap();
		assert_eq!(lineage.latest_version, 5);
		assert_eq!(lineage.total_snapshots, 3);
		assert!(lookup.get::<Diff>(Table::Diff, &Diff::key("lin-a", 1, 5)).await.unwrap().is_some());
		assert!(lookup.get::<Diff>(Table::Diff, &Diff::key("lin-a", 1, 3)).await.unwrap().is_some());
	}

	#[tokio::test]
	async fn older_than_everything_has_nothing_to_diff() {
		let store = MemoryStore::new();
		let ingestor = ingestor(&store);
		ingestor.import_snapshot("s", &doc(4, json!([]))).await.unwrap();

		let result = ingestor.import_snapshot("s", &doc(2, json!([instance("aws_vpc", "v", json!({}))]))).await.unwrap();

		assert!(result.imported().unwrap().is_first);
		assert_eq!(store.count(Table::Diff), 0);
	}

	#[tokio::test]
	async fn repeated_version_with_new_content_is_not_diffed() {
		let store = MemoryStore::new();
		let ingestor = ingestor(&store);
		ingestor.import_snapshot("s", &doc(1, json!([]))).await.unwrap();
		ingestor.import_snapshot("s", &doc(2, json!([]))).await.unwrap();

		let result = ingestor
			.import_snapshot("s", &doc(2, json!([instance("aws_vpc", "v", json!({}))])))
			.await
			.unwrap();

		let imported = result.imported().unwrap();
		assert!(!imported.is_first);
		assert_eq!(imported.diff_summary, None);
		assert_eq!(store.count(Table::Snapshot), 3);
	}

	#[tokio::test]
	async fn invalid_documents_write_nothing() {
		let store = MemoryStore::new();
		let ingestor = ingestor(&store);

		let err = ingestor.import_snapshot("s", &json!({"version": 4, "lineage": "x"})).await.unwrap_err();
		assert_eq!(err.kind(), "invalid_document");

		let err = ingestor
			.import_snapshot("s", &json!({"version": 2, "serial": 1, "lineage": "x"}))
			.await
			.unwrap_err();
		assert!(matches!(err, ImportError::UnsupportedFormatVersion(2)));

		assert!(store.operations().is_empty());
	}

	#[tokio::test]
	async fn extraction_failure_aborts_whole_snapshot() {
		let store = MemoryStore::new();
		let d = doc(
			1,
			json!([
				instance("aws_instance", "ok", json!({})),
				{"type": "aws_instance", "name": "bad", "instances": [{"attributes": 7}]}
			]),
		);

		let err = ingestor(&store).import_snapshot("s", &d).await.unwrap_err();

		assert!(matches!(&err, ImportError::ExtractionFailure { address, .. } if address == "aws_instance.bad"));
		assert_eq!(store.count(Table::Snapshot), 0);
		assert_eq!(store.count(Table::Lineage), 0);
		assert_eq!(store.count(Table::Resource), 0);
	}

	#[tokio::test]
	async fn filter_drops_records_but_counts_them() {
		let store = MemoryStore::new();
		let filter = ResourceFilter { include: vec!["aws_instance.*".into()], ..Default::default() };
		let ingestor = Ingestor::new(Lookup::new(Arc::new(store.clone())), &filter).unwrap();

		let result = ingestor
			.import_snapshot(
				"s",
				&doc(1, json!([instance("aws_instance", "web", json!({})), instance("aws_s3_bucket", "logs", json!({}))])),
			)
			.await
			.unwrap();

		let imported = result.imported().unwrap();
		assert_eq!(imported.resources_extracted, 2);
		assert_eq!(imported.resources_inserted, 1);
		let records: Vec<ResourceRecord> = Lookup::new(Arc::new(store.clone()))
			.fetch_where(Table::Resource, &[("snapshot_id", json!(imported.snapshot_id))])
			.await
			.unwrap();
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].resource_address, "aws_instance.web");
	}

	#[tokio::test]
	async fn tracks_last_seen() {
		let store = MemoryStore::new();
		let ingestor = ingestor(&store);
		assert_eq!(ingestor.last_seen().get(), None);

		ingestor.import_snapshot("s", &doc(7, json!([]))).await.unwrap();

		assert_eq!(ingestor.last_seen().get(), Some(LastSeen { lineage_id: "lin-a".into(), version: 7 }));
	}

	#[test]
	fn source_errors_map_to_import_kinds() {
		assert_eq!(ImportError::from(SourceError::NotFound("x".into())).kind(), "source_not_found");
		assert_eq!(
			ImportError::from(SourceError::Parse { path: "x".into(), message: "eof".into() }).kind(),
			"invalid_document"
		);
		assert_eq!(ImportError::from(SourceError::IoError("x".into())).kind(), "source_error");
	}
}

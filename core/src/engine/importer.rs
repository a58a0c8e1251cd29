//! Batch import over a glob pattern or an explicit list of locators.
//!
//! Sources run in fixed-size sequential batches; within one batch every
//! import is its own task. A failing source only lands in the report.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};
use tracing::{info, warn};

use super::glob::has_wildcard;
use super::ingestor::{ImportError, ImportResult, Ingestor};
use crate::sources::object::is_object_url;
use crate::sources::{LocalDriver, ObjectStoreDriver, SourceDriver, SourceError};

pub const DEFAULT_PARALLELISM: usize = 5;

/// What to import: one pattern expanded by a driver, or concrete locators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
	Pattern(String),
	List(Vec<String>),
}

impl SourceSpec {
	/// A single argument containing a wildcard is a pattern; anything else is a list.
	pub fn from_args(args: &[String]) -> Self {
		match args {
			[single] if has_wildcard(single) => SourceSpec::Pattern(single.clone()),
			_ => SourceSpec::List(args.to_vec()),
		}
	}
}

/// Driver for a locator or pattern, chosen by URL scheme.
pub fn driver_for(locator: &str) -> Result<Arc<dyn SourceDriver>, SourceError> {
	if is_object_url(locator) {
		Ok(Arc::new(ObjectStoreDriver::from_url(locator)?))
	} else {
		Ok(Arc::new(LocalDriver::new(locator)?))
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportDetail {
	pub locator: String,
	pub result: ImportResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportFailure {
	pub locator: String,
	pub kind: String,
	pub error: String,
}

/// Totals across one batch run. Skipped duplicates count as successes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
	pub succeeded: u64,
	pub failed: u64,
	pub skipped: u64,
	pub total_resources_extracted: u64,
	pub total_resources_inserted: u64,
	pub imports: Vec<ImportDetail>,
	pub failures: Vec<ImportFailure>,
	#[serde(rename = "duration_ms", serialize_with = "as_millis")]
	pub duration: Duration,
}

impl BatchReport {
	pub fn record_success(&mut self, locator: &str, result: ImportResult) {
		self.succeeded += 1;
		match &result {
			ImportResult::Skipped { .. } => self.skipped += 1,
			ImportResult::Imported(snapshot) => {
				self.total_resources_extracted += snapshot.resources_extracted;
				self.total_resources_inserted += snapshot.resources_inserted;
			}
		}
		self.imports.push(ImportDetail { locator: locator.to_string(), result });
	}

	pub fn record_failure(&mut self, locator: &str, kind: &str, error: String) {
		self.failed += 1;
		self.failures.push(ImportFailure { locator: locator.to_string(), kind: kind.to_string(), error });
	}

	pub fn total(&self) -> u64 {
		self.succeeded + self.failed
	}
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
	serializer.serialize_u64(duration.as_millis() as u64)
}

/// One source to import and the driver that reads it.
struct WorkItem {
	locator: String,
	driver: Result<Arc<dyn SourceDriver>, SourceError>,
}

#[derive(Clone)]
pub struct BatchImporter {
	ingestor: Ingestor,
}

impl BatchImporter {
	pub fn new(ingestor: Ingestor) -> Self {
		Self { ingestor }
	}

	/// Resolve `spec` into locators and import them. Only a failure to expand
	/// a pattern is returned as an error; per-source failures go in the report.
	/// The reported duration includes listing.
	pub async fn import_many(&self, spec: &SourceSpec, parallelism: usize) -> Result<BatchReport, ImportError> {
		let started = Instant::now();
		match spec {
			SourceSpec::Pattern(pattern) => {
				let driver = driver_for(pattern)?;
				self.drive(driver, parallelism, started).await
			}
			SourceSpec::List(locators) => {
				let items = locators
					.iter()
					.map(|locator| WorkItem { locator: locator.clone(), driver: driver_for(locator) })
					.collect();
				Ok(self.run(items, parallelism, started).await)
			}
		}
	}

	/// Import everything `driver` lists.
	pub async fn import_with_driver(
		&self,
		driver: Arc<dyn SourceDriver>,
		parallelism: usize,
	) -> Result<BatchReport, ImportError> {
		self.drive(driver, parallelism, Instant::now()).await
	}

	async fn drive(
		&self,
		driver: Arc<dyn SourceDriver>,
		parallelism: usize,
		started: Instant,
	) -> Result<BatchReport, ImportError> {
		driver.initialize().await?;
		let files = driver.list_state_files().await?;
		info!(driver = driver.kind(), files = files.len(), "resolved sources");

		let items = files
			.into_iter()
			.map(|file| WorkItem { locator: file.path, driver: Ok(driver.clone()) })
			.collect();
		let report = self.run(items, parallelism, started).await;
		if let Err(err) = driver.close().await {
			warn!(driver = driver.kind(), error = %err, "failed to close source driver");
		}
		Ok(report)
	}

	async fn run(&self, items: Vec<WorkItem>, parallelism: usize, started: Instant) -> BatchReport {
		let mut report = BatchReport::default();
		let batch_size = parallelism.max(1);

		let mut pending = items.into_iter().peekable();
		while pending.peek().is_some() {
			let mut handles = Vec::with_capacity(batch_size);

			for item in pending.by_ref().take(batch_size) {
				let driver = match item.driver {
					Ok(driver) => driver,
					Err(err) => {
						let err = ImportError::from(err);
						warn!(locator = %item.locator, kind = err.kind(), error = %err, "import failed");
						report.record_failure(&item.locator, err.kind(), err.to_string());
						continue;
					}
				};
				let ingestor = self.ingestor.clone();
				let locator = item.locator.clone();
				handles.push((
					item.locator,
					tokio::spawn(async move { ingestor.import_from(driver.as_ref(), &locator).await }),
				));
			}

			for (locator, handle) in handles {
				match handle.await {
					Ok(Ok(result)) => report.record_success(&locator, result),
					Ok(Err(err)) => {
						warn!(locator = %locator, kind = err.kind(), error = %err, "import failed");
						report.record_failure(&locator, err.kind(), err.to_string());
					}
					Err(join_err) => {
						warn!(locator = %locator, error = %join_err, "import task aborted");
						report.record_failure(&locator, "internal", format!("task join error: {join_err}"));
					}
				}
			}
		}

		report.duration = started.elapsed();
		info!(
			succeeded = report.succeeded,
			failed = report.failed,
			skipped = report.skipped,
			inserted = report.total_resources_inserted,
			duration_ms = report.duration.as_millis() as u64,
			"batch import finished"
		);
		report
	}
}

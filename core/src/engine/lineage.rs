use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, warn};

use crate::models::Lineage;
use crate::store::lookup::encode;
use crate::store::{Lookup, StoreError, Table};

/// What an upsert did to the lineage row.
#[derive(Debug, Clone, PartialEq)]
pub struct LineageUpdate {
	/// Row as it was before this snapshot, `None` for a new lineage.
	pub previous: Option<Lineage>,
	pub current: Lineage,
}

impl LineageUpdate {
	pub fn is_new(&self) -> bool {
		self.previous.is_none()
	}

	/// Whether this snapshot moved the lineage's latest pointer.
	pub fn advanced(&self) -> bool {
		match &self.previous {
			None => true,
			Some(prev) => self.current.latest_version > prev.latest_version,
		}
	}
}

/// Create or update the lineage row for an incoming snapshot.
///
/// `total_snapshots` always increments; `latest_version` only moves when the
/// incoming version is strictly greater than the stored one.
pub async fn upsert_lineage(
	lookup: &Lookup,
	lineage_id: &str,
	version: u64,
	snapshot_id: &str,
	now: DateTime<Utc>,
) -> Result<LineageUpdate, StoreError> {
	let existing: Option<Lineage> = lookup.get(Table::Lineage, lineage_id).await?;

	match existing {
		None => {
			let lineage = Lineage {
				id: lineage_id.to_string(),
				latest_version: version,
				latest_snapshot_id: snapshot_id.to_string(),
				total_snapshots: 1,
				first_imported_at: now,
				last_imported_at: now,
			};
			lookup.store().insert(Table::Lineage, lineage_id, encode(Table::Lineage, &lineage)?).await?;
			debug!(lineage = lineage_id, version, "new lineage");
			Ok(LineageUpdate { previous: None, current: lineage })
		}
		Some(prev) => {
			let mut current = prev.clone();
			current.total_snapshots += 1;
			current.last_imported_at = now;

			let mut patch = json!({
				"total_snapshots": current.total_snapshots,
				"last_imported_at": now,
			});
			if version > prev.latest_version {
				current.latest_version = version;
				current.latest_snapshot_id = snapshot_id.to_string();
				patch["latest_version"] = json!(version);
				patch["latest_snapshot_id"] = json!(snapshot_id);
			} else {
				warn!(
					lineage = lineage_id,
					version,
					latest = prev.latest_version,
					"out-of-order snapshot; latest pointer unchanged"
				);
			}

			lookup.store().update(Table::Lineage, lineage_id, patch).await?;
			Ok(LineageUpdate { previous: Some(prev), current })
		}
	}
}

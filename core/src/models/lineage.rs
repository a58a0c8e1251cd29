use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One continuously-evolving infrastructure history.
/// Keyed by the lineage UUID written by the producing tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lineage {
    pub id: String,
    pub latest_version: u64,
    pub latest_snapshot_id: String,
    pub total_snapshots: u64,
    pub first_imported_at: DateTime<Utc>,
    pub last_imported_at: DateTime<Utc>,
}

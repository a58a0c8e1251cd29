use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One imported, deduplicated state document. Never mutated after insert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub id: String,
    pub lineage_id: String,
    pub source_locator: String,
    pub version: u64,
    pub tool_version: Option<String>,
    pub format_version: u64,
    pub resource_count: u64,
    pub content_hash: String,
    pub imported_at: DateTime<Utc>,
}

impl Snapshot {
    /// Latest import among `snapshots`, ties broken by id.
    pub fn newest(snapshots: impl IntoIterator<Item = Snapshot>) -> Option<Snapshot> {
        snapshots
            .into_iter()
            .max_by(|a, b| a.imported_at.cmp(&b.imported_at).then_with(|| a.id.cmp(&b.id)))
    }
}

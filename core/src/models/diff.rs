use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::ResourceMode;

/// Structural comparison of two versions of one lineage.
/// Identified by `(lineage_id, old_version, new_version)`; computed once, then read back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Diff {
    pub id: String,
    pub lineage_id: String,
    pub old_version: u64,
    pub new_version: u64,
    pub old_snapshot_id: String,
    pub new_snapshot_id: String,
    pub calculated_at: DateTime<Utc>,
    pub summary: DiffSummary,
    pub changes: DiffChanges,
}

impl Diff {
    /// Deterministic row id for a version pair.
    pub fn key(lineage_id: &str, old_version: u64, new_version: u64) -> String {
        format!("{lineage_id}:{old_version}:{new_version}")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DiffSummary {
    pub added_count: u64,
    pub modified_count: u64,
    pub deleted_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DiffChanges {
    pub added: Vec<ResourceRef>,
    pub modified: Vec<ModifiedResource>,
    pub deleted: Vec<ResourceRef>,
}

impl DiffChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn summary(&self) -> DiffSummary {
        DiffSummary {
            added_count: self.added.len() as u64,
            modified_count: self.modified.len() as u64,
            deleted_count: self.deleted.len() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRef {
    pub address: String,
    pub resource_type: String,
    pub resource_name: String,
    pub mode: ResourceMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModifiedResource {
    pub address: String,
    pub resource_type: String,
    pub changes: Vec<FieldChange>,
}

/// A key missing on one side is reported as `null` on that side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldChange {
    pub field: String,
    pub old_value: Value,
    pub new_value: Value,
}

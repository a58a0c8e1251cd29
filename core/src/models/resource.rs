use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResourceMode {
    #[default]
    Managed,
    Data,
}

impl ResourceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceMode::Managed => "managed",
            ResourceMode::Data => "data",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "managed" => Some(ResourceMode::Managed),
            "data" => Some(ResourceMode::Data),
            _ => None,
        }
    }
}

/// One resource instance as extracted from a snapshot.
/// `lineage_id` and `snapshot_version` are denormalized so diffs and exports
/// can look records up by `(lineage_id, snapshot_version)` directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRecord {
    pub id: String,
    pub snapshot_id: String,
    pub lineage_id: String,
    pub snapshot_version: u64,
    pub resource_type: String,
    pub resource_name: String,
    pub resource_address: String,
    pub provider_name: String,
    #[serde(default)]
    pub provider_config: Option<String>,
    #[serde(default)]
    pub module: Option<String>,
    pub mode: ResourceMode,
    #[serde(default)]
    pub index_key: Option<Value>,
    #[serde(default)]
    pub schema_version: Option<u64>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

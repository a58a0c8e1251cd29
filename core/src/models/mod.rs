pub mod diff;
pub mod lineage;
pub mod resource;
pub mod snapshot;

pub use diff::{Diff, DiffChanges, DiffSummary, FieldChange, ModifiedResource, ResourceRef};
pub use lineage::Lineage;
pub use resource::{ResourceMode, ResourceRecord};
pub use snapshot::Snapshot;

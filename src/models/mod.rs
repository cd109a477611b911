pub mod identity;
pub mod progress;
pub mod snapshot;

pub use identity::Identity;
pub use progress::{
    DiscoveryEvent, DiscoverySet, ProgressRecord, ProgressSummary, CURRENT_SCHEMA_VERSION,
};
pub use snapshot::{SnapshotReason, SnapshotRecord};

/// Schema-level checks applied after a value parses.
///
/// A stored value that parses but fails validation is treated exactly like a
/// value that is absent at that tier.
pub trait Validate {
    fn validate(&self) -> anyhow::Result<()>;
}

impl Validate for serde_json::Value {
    fn validate(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

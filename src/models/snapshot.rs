use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ProgressRecord, Validate, CURRENT_SCHEMA_VERSION};
use crate::storage::TierId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SnapshotReason {
    Interval,
    Hidden,
    Closing,
    Discovery,
    Manual,
    Emergency,
    Sync,
}

impl SnapshotReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotReason::Interval => "interval",
            SnapshotReason::Hidden => "hidden",
            SnapshotReason::Closing => "closing",
            SnapshotReason::Discovery => "discovery",
            SnapshotReason::Manual => "manual",
            SnapshotReason::Emergency => "emergency",
            SnapshotReason::Sync => "sync",
        }
    }
}

/// Immutable, timestamped copy of a `ProgressRecord`.
///
/// `origin_tier` is the tier the live record was last loaded from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub id: String,
    pub schema_version: String,
    pub captured_at_epoch_ms: i64,
    pub progress: ProgressRecord,
    pub origin_tier: TierId,
    pub reason: SnapshotReason,
}

impl SnapshotRecord {
    pub fn capture(
        progress: ProgressRecord,
        origin_tier: TierId,
        reason: SnapshotReason,
        now_ms: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            schema_version: CURRENT_SCHEMA_VERSION.to_string(),
            captured_at_epoch_ms: now_ms,
            progress,
            origin_tier,
            reason,
        }
    }
}

impl Validate for SnapshotRecord {
    fn validate(&self) -> Result<()> {
        if self.schema_version != CURRENT_SCHEMA_VERSION {
            bail!("snapshot {} has schema version {}", self.id, self.schema_version);
        }
        self.progress.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_stamps_current_schema() {
        let snapshot = SnapshotRecord::capture(
            ProgressRecord::new(5),
            TierId::Object,
            SnapshotReason::Interval,
            42,
        );
        assert_eq!(snapshot.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(snapshot.captured_at_epoch_ms, 42);
        assert!(snapshot.validate().is_ok());

        let json = serde_json::to_value(&snapshot).expect("serializes");
        assert_eq!(json["originTier"], "object");
        assert_eq!(json["reason"], "interval");
    }
}

//! The export file and its import path.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{RecoveryCandidate, RecoverySource};
use crate::models::{Identity, ProgressRecord, SnapshotReason, SnapshotRecord};
use crate::schema::upgrade_progress;
use crate::storage::TierId;

pub const EXPORT_FORMAT: &str = "keepsake-export";
const EXPORT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExportMetadata {
    pub schema_version: String,
    pub app_version: String,
    pub last_sync_epoch_ms: Option<i64>,
    pub local_snapshot_count: usize,
    pub pending_retries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub format: String,
    pub format_version: u32,
    pub exported_at_epoch_ms: i64,
    pub identity: Identity,
    pub progress: ProgressRecord,
    pub metadata: ExportMetadata,
}

impl ExportDocument {
    pub fn new(
        identity: Identity,
        progress: ProgressRecord,
        metadata: ExportMetadata,
        now_ms: i64,
    ) -> Self {
        Self {
            format: EXPORT_FORMAT.to_string(),
            format_version: EXPORT_FORMAT_VERSION,
            exported_at_epoch_ms: now_ms,
            identity,
            progress,
            metadata,
        }
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize export")
    }
}

/// Parses an export file into a candidate for the recovery adoption path.
///
/// The embedded progress may be in any supported legacy shape; it is
/// migrated and validated before it is accepted. The file's identity is
/// informational only: adopted progress is stored under the current one.
pub fn parse_import(raw: &str) -> Result<(RecoveryCandidate, Option<Identity>)> {
    let mut document: Value = serde_json::from_str(raw).context("import is not valid JSON")?;

    match document.get("format").and_then(Value::as_str) {
        Some(EXPORT_FORMAT) | None => {}
        Some(other) => bail!("unsupported import format '{other}'"),
    }
    if let Some(version) = document.get("formatVersion").and_then(Value::as_u64) {
        if version > u64::from(EXPORT_FORMAT_VERSION) {
            bail!("import format version {version} is newer than supported");
        }
    }

    let progress = document
        .get_mut("progress")
        .map(Value::take)
        .context("import has no progress")?;
    let progress = upgrade_progress(progress).context("imported progress is not usable")?;

    let identity = document
        .get_mut("identity")
        .map(Value::take)
        .and_then(|value| serde_json::from_value::<Identity>(value).ok());
    let exported_at = document
        .get("exportedAtEpochMs")
        .and_then(Value::as_i64)
        .unwrap_or(progress.last_visit_epoch_ms);

    let snapshot = SnapshotRecord::capture(progress, TierId::Object, SnapshotReason::Manual, exported_at);
    let candidate = RecoveryCandidate {
        source: RecoverySource::Import,
        snapshot,
        origin: TierId::Object,
        location: "import".to_string(),
    };
    Ok((candidate, identity))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn identity() -> Identity {
        Identity {
            primary_id: "p-1".into(),
            backup_id: "b-1".into(),
            created_at_epoch_ms: 3,
        }
    }

    #[test]
    fn export_document_imports_cleanly() {
        let mut progress = ProgressRecord::new(100);
        progress.begin_visit(100);
        progress.record_discovery("owl", "Owl", "hoot", 150);
        let metadata = ExportMetadata {
            schema_version: progress.schema_version.clone(),
            app_version: "0.1.0".into(),
            last_sync_epoch_ms: None,
            local_snapshot_count: 2,
            pending_retries: 0,
        };
        let raw = ExportDocument::new(identity(), progress.clone(), metadata, 200)
            .to_json_pretty()
            .expect("serializes");

        let (candidate, exported_identity) = parse_import(&raw).expect("imports");
        assert_eq!(candidate.snapshot.progress, progress);
        assert_eq!(candidate.snapshot.captured_at_epoch_ms, 200);
        assert_eq!(exported_identity, Some(identity()));
    }

    #[test]
    fn legacy_progress_is_migrated_on_import() {
        let raw = json!({
            "progress": {
                "version": "2.0",
                "discoveries": [{"id": "cellar", "label": "Cellar", "message": "Dark", "timestamp": 5}],
                "visitCount": 2,
                "firstVisit": 1,
                "lastVisit": 9,
                "totalTimeSpent": 4
            }
        })
        .to_string();
        let (candidate, identity) = parse_import(&raw).expect("imports");
        assert!(candidate.snapshot.progress.discoveries.contains("cellar"));
        assert_eq!(candidate.snapshot.progress.total_active_ms, 4_000);
        assert!(identity.is_none());
    }

    #[test]
    fn foreign_formats_are_refused() {
        let raw = json!({"format": "something-else", "progress": {}}).to_string();
        assert!(parse_import(&raw).is_err());
        assert!(parse_import("not json").is_err());
    }
}

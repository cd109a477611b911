//! Stored-record schema migration.
//!
//! Runs once at startup before anything else reads progress. Older shapes
//! are walked up the transform chain and written back immediately; a record
//! from a newer build is left alone and treated as unusable rather than
//! downgraded.

use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

mod versions;

use crate::models::{ProgressRecord, SnapshotRecord, Validate, CURRENT_SCHEMA_VERSION};
use crate::storage::{TierId, TierRead, TieredStore};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("stored schema {stored} is newer than supported {current}")]
    FutureVersion { stored: String, current: String },

    #[error("unrecognised schema version '{0}'")]
    UnknownVersion(String),

    #[error("malformed v{version} record: {reason}")]
    Malformed { version: u32, reason: String },
}

/// Result of migrating one storage key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    Missing,
    Current,
    Migrated { from: String, tier: TierId },
    FutureVersion(String),
    Unusable(String),
}

impl MigrationOutcome {
    /// Whether the key may still be read as progress afterwards.
    pub fn is_loadable(&self) -> bool {
        matches!(self, MigrationOutcome::Current | MigrationOutcome::Migrated { .. })
    }
}

/// Version a stored record declares. Records with no marker are v1.
pub fn detect_version(value: &Value) -> String {
    value
        .get("schemaVersion")
        .or_else(|| value.get("version"))
        .and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| "1.0".to_string())
}

fn major(version: &str) -> Result<u32, MigrationError> {
    version
        .split('.')
        .next()
        .and_then(|part| part.trim().parse::<u32>().ok())
        .ok_or_else(|| MigrationError::UnknownVersion(version.to_string()))
}

/// Walks `value` up to the current schema. Returns the reshaped value and
/// the version it started from when anything changed.
pub fn migrate_value(value: Value) -> Result<(Value, Option<String>), MigrationError> {
    let stored = detect_version(&value);
    let stored_major = major(&stored)?;
    let current_major = major(CURRENT_SCHEMA_VERSION)?;

    if stored_major > current_major {
        return Err(MigrationError::FutureVersion {
            stored,
            current: CURRENT_SCHEMA_VERSION.to_string(),
        });
    }
    if stored_major == current_major {
        return Ok((value, None));
    }

    let mut value = value;
    for (from, transform) in versions::CHAIN.iter() {
        if *from >= stored_major && *from < current_major {
            value = transform(value)?;
        }
    }
    Ok((value, Some(stored)))
}

/// Migrates, parses and validates a stored progress record.
pub fn upgrade_progress(value: Value) -> Result<ProgressRecord, MigrationError> {
    let (value, from) = migrate_value(value)?;
    let version = from
        .as_deref()
        .map(major)
        .transpose()?
        .unwrap_or(major(CURRENT_SCHEMA_VERSION)?);
    let record: ProgressRecord =
        serde_json::from_value(value).map_err(|err| MigrationError::Malformed {
            version,
            reason: err.to_string(),
        })?;
    record.validate().map_err(|err| MigrationError::Malformed {
        version,
        reason: err.to_string(),
    })?;
    Ok(record)
}

/// Brings a stored or downloaded snapshot up to date. The envelope fields a
/// legacy snapshot may lack are filled in; its progress is migrated.
pub fn upgrade_snapshot(value: Value) -> Result<SnapshotRecord, MigrationError> {
    let Value::Object(mut obj) = value else {
        return Err(MigrationError::Malformed {
            version: 0,
            reason: "snapshot is not an object".into(),
        });
    };

    let progress = obj
        .remove("progress")
        .or_else(|| obj.remove("data"))
        .ok_or_else(|| MigrationError::Malformed {
            version: 0,
            reason: "snapshot has no progress".into(),
        })?;
    let progress = upgrade_progress(progress)?;

    let captured_at = obj
        .get("capturedAtEpochMs")
        .or_else(|| obj.get("timestamp"))
        .and_then(Value::as_i64)
        .unwrap_or(progress.last_visit_epoch_ms);

    let snapshot = SnapshotRecord {
        id: obj
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        schema_version: CURRENT_SCHEMA_VERSION.to_string(),
        captured_at_epoch_ms: captured_at,
        origin_tier: obj
            .get("originTier")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(TierId::Object),
        reason: obj
            .get("reason")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(crate::models::SnapshotReason::Manual),
        progress,
    };
    Ok(snapshot)
}

pub struct SchemaMigrator {
    store: TieredStore,
}

impl SchemaMigrator {
    pub fn new(store: TieredStore) -> Self {
        Self { store }
    }

    /// Migrates the record stored under `key`, using the first tier (in
    /// durability order) that holds parsable JSON.
    pub async fn migrate_key(&self, key: &str) -> MigrationOutcome {
        let outcomes = self
            .store
            .read_all_with(key, |raw| Ok(serde_json::from_str::<Value>(raw)?))
            .await;
        let Some((tier, value)) = outcomes
            .into_iter()
            .find_map(|(tier, read)| match read {
                TierRead::Found(value) => Some((tier, value)),
                _ => None,
            })
        else {
            return MigrationOutcome::Missing;
        };

        let stored = detect_version(&value);
        if major(&stored).ok() == major(CURRENT_SCHEMA_VERSION).ok() {
            return MigrationOutcome::Current;
        }

        match upgrade_progress(value) {
            Ok(record) => {
                let report = self.store.write(key, &record).await;
                log_info!(
                    "Migrated {key} from schema {stored} to {CURRENT_SCHEMA_VERSION} ({} tier(s) rewritten)",
                    report.succeeded.len()
                );
                MigrationOutcome::Migrated { from: stored, tier }
            }
            Err(MigrationError::FutureVersion { stored, .. }) => {
                log_warn!("{key} was written by a newer build (schema {stored}); not touching it");
                MigrationOutcome::FutureVersion(stored)
            }
            Err(err) => {
                log_warn!("{key} cannot be migrated: {err}");
                MigrationOutcome::Unusable(err.to_string())
            }
        }
    }

    /// Copies the raw value under `key` to `to` untouched, so a record this
    /// build cannot read survives the rewrite of `key`. Picks the same tier
    /// `migrate_key` would.
    pub async fn quarantine(&self, key: &str, to: &str) -> bool {
        let raw = self
            .store
            .read_all_with(key, |raw| {
                serde_json::from_str::<Value>(raw)?;
                Ok(raw.to_string())
            })
            .await
            .into_iter()
            .find_map(|(_, read)| match read {
                TierRead::Found(raw) => Some(raw),
                _ => None,
            });
        let Some(raw) = raw else {
            return false;
        };
        let kept = self.store.write_raw(to, raw).await.any_succeeded();
        if kept {
            log_warn!("{key} holds a record from a newer build; kept a copy under {to}");
        } else {
            log_warn!("{key} holds a record from a newer build and no tier could keep a copy");
        }
        kept
    }
}

//! Rebuilds progress from the best surviving source when no valid live
//! record exists: the emergency snapshot, then local snapshots, then the
//! cloud, then the compact summary as a last resort.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;

pub mod transfer;

pub use transfer::{parse_import, ExportDocument, ExportMetadata, EXPORT_FORMAT};

use crate::models::{Identity, ProgressSummary, SnapshotReason, SnapshotRecord};
use crate::progress::ProgressStore;
use crate::schema::upgrade_snapshot;
use crate::storage::{KeySpace, TierId, TierRead, TieredStore};
use crate::sync::{fetch_latest, CloudTransport};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySource {
    Emergency,
    LocalSnapshot,
    Cloud,
    /// The compact summary; discovery labels and messages are lost.
    Summary,
    Import,
}

impl RecoverySource {
    /// Automatic search order.
    pub const SEARCH_ORDER: [RecoverySource; 4] = [
        RecoverySource::Emergency,
        RecoverySource::LocalSnapshot,
        RecoverySource::Cloud,
        RecoverySource::Summary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecoverySource::Emergency => "emergency backup",
            RecoverySource::LocalSnapshot => "local backup",
            RecoverySource::Cloud => "cloud backup",
            RecoverySource::Summary => "progress summary",
            RecoverySource::Import => "imported file",
        }
    }
}

impl fmt::Display for RecoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryCandidate {
    pub source: RecoverySource,
    pub snapshot: SnapshotRecord,
    /// Tier the candidate was read from, or the tier recorded in the
    /// snapshot itself when it came from outside local storage.
    pub origin: TierId,
    /// Storage key or identity id it was found under.
    pub location: String,
}

impl RecoveryCandidate {
    pub fn notice(&self) -> RecoveryNotice {
        RecoveryNotice {
            source: self.source,
            captured_at_epoch_ms: self.snapshot.captured_at_epoch_ms,
            visit_count: self.snapshot.progress.visit_count,
            discovery_count: self.snapshot.progress.discoveries.len(),
        }
    }
}

/// The user-visible confirmation of a successful recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryNotice {
    pub source: RecoverySource,
    pub captured_at_epoch_ms: i64,
    pub visit_count: u64,
    pub discovery_count: usize,
}

impl fmt::Display for RecoveryNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let captured = DateTime::<Utc>::from_timestamp_millis(self.captured_at_epoch_ms)
            .map(|at| at.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "an unknown time".to_string());
        write!(
            f,
            "Progress restored from the {} captured {captured}: {} discoveries over {} visits.",
            self.source, self.discovery_count, self.visit_count
        )
    }
}

/// In-memory snapshot taken just before a context closes. Shared by handle
/// so a context restarted in the same process can still see it.
#[derive(Clone, Default)]
pub struct EmergencySlot {
    inner: Arc<Mutex<Option<SnapshotRecord>>>,
}

impl EmergencySlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, snapshot: SnapshotRecord) {
        *self.lock() = Some(snapshot);
    }

    pub fn peek(&self) -> Option<SnapshotRecord> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }

    fn lock(&self) -> MutexGuard<'_, Option<SnapshotRecord>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub struct RecoveryEngine {
    storage: TieredStore,
    keys: KeySpace,
    identity: Identity,
    emergency: EmergencySlot,
    cloud: Option<Arc<dyn CloudTransport>>,
    cloud_timeout: Duration,
}

impl RecoveryEngine {
    pub fn new(
        storage: TieredStore,
        keys: KeySpace,
        identity: Identity,
        emergency: EmergencySlot,
        cloud: Option<Arc<dyn CloudTransport>>,
        cloud_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            keys,
            identity,
            emergency,
            cloud,
            cloud_timeout,
        }
    }

    /// First usable candidate in search order.
    pub async fn find_first(&self) -> Option<RecoveryCandidate> {
        for source in RecoverySource::SEARCH_ORDER {
            if let Some(candidate) = self.find(source).await {
                log_info!("recovery found a candidate in the {source}");
                return Some(candidate);
            }
            log_debug!("recovery: nothing usable in the {source}");
        }
        log_info!("no recovery source holds usable progress; starting fresh");
        None
    }

    /// Searches one source in isolation. Imports are not searchable; they
    /// arrive through `parse_import`.
    pub async fn find(&self, source: RecoverySource) -> Option<RecoveryCandidate> {
        match source {
            RecoverySource::Emergency => self.find_emergency().await,
            RecoverySource::LocalSnapshot => self.find_local().await,
            RecoverySource::Cloud => self.find_cloud().await,
            RecoverySource::Summary => self.find_summary().await,
            RecoverySource::Import => None,
        }
    }

    /// Replaces the live record with the candidate's progress.
    pub async fn adopt(&self, candidate: &RecoveryCandidate, progress: &ProgressStore) -> RecoveryNotice {
        progress
            .replace(candidate.snapshot.progress.clone(), candidate.origin)
            .await;
        let notice = candidate.notice();
        log_info!("{notice}");
        notice
    }

    async fn find_emergency(&self) -> Option<RecoveryCandidate> {
        if let Some(snapshot) = self.emergency.peek() {
            let location = "memory".to_string();
            match revalidate(snapshot) {
                Ok(snapshot) => {
                    return Some(RecoveryCandidate {
                        source: RecoverySource::Emergency,
                        snapshot,
                        origin: TierId::Session,
                        location,
                    })
                }
                Err(err) => log_debug!("in-memory emergency snapshot unusable: {err:#}"),
            }
        }

        for owner in self.identity.key_ids() {
            let key = self.keys.emergency(owner);
            if let Some((snapshot, tier)) = self.read_snapshot(&key).await {
                return Some(RecoveryCandidate {
                    source: RecoverySource::Emergency,
                    snapshot,
                    origin: tier,
                    location: key,
                });
            }
        }
        None
    }

    /// Newest valid snapshot under either identity key.
    async fn find_local(&self) -> Option<RecoveryCandidate> {
        let mut best: Option<RecoveryCandidate> = None;
        for owner in [&self.identity.backup_id, &self.identity.primary_id] {
            let keys = self.storage.keys(&self.keys.snapshot_prefix(owner)).await;
            for key in keys.into_iter().rev() {
                let Some((snapshot, tier)) = self.read_snapshot(&key).await else {
                    continue;
                };
                let newer = best
                    .as_ref()
                    .map_or(true, |b| snapshot.captured_at_epoch_ms > b.snapshot.captured_at_epoch_ms);
                if newer {
                    best = Some(RecoveryCandidate {
                        source: RecoverySource::LocalSnapshot,
                        snapshot,
                        origin: tier,
                        location: key,
                    });
                }
                break;
            }
        }
        best
    }

    async fn find_cloud(&self) -> Option<RecoveryCandidate> {
        let cloud = self.cloud.as_ref()?;
        for owner in self.identity.key_ids() {
            let Some(value) = fetch_latest(cloud.as_ref(), owner, self.cloud_timeout).await else {
                continue;
            };
            match upgrade_snapshot(value) {
                Ok(snapshot) => {
                    return Some(RecoveryCandidate {
                        source: RecoverySource::Cloud,
                        origin: snapshot.origin_tier,
                        snapshot,
                        location: owner.to_string(),
                    })
                }
                Err(err) => log_debug!("cloud snapshot for {owner} unusable: {err}"),
            }
        }
        None
    }

    async fn find_summary(&self) -> Option<RecoveryCandidate> {
        for owner in [&self.identity.backup_id, &self.identity.primary_id] {
            let key = self.keys.summary(owner);
            let Some((summary, tier)) = self
                .storage
                .read_with_origin::<ProgressSummary>(&key)
                .await
            else {
                continue;
            };
            let snapshot = SnapshotRecord::capture(
                summary.to_record(),
                tier,
                SnapshotReason::Manual,
                summary.last_visit_epoch_ms,
            );
            return Some(RecoveryCandidate {
                source: RecoverySource::Summary,
                snapshot,
                origin: tier,
                location: key,
            });
        }
        None
    }

    /// First tier holding a snapshot under `key` that migrates and validates.
    async fn read_snapshot(&self, key: &str) -> Option<(SnapshotRecord, TierId)> {
        self.storage
            .read_all_with(key, |raw| {
                let value: Value = serde_json::from_str(raw)?;
                Ok(upgrade_snapshot(value)?)
            })
            .await
            .into_iter()
            .find_map(|(tier, read)| match read {
                TierRead::Found(snapshot) => Some((snapshot, tier)),
                _ => None,
            })
    }
}

fn revalidate(snapshot: SnapshotRecord) -> Result<SnapshotRecord> {
    Ok(upgrade_snapshot(serde_json::to_value(snapshot)?)?)
}

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::clock::Clock;
use crate::models::{SnapshotReason, SnapshotRecord};
use crate::progress::ProgressStore;
use crate::storage::{KeySpace, TieredStore};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// Captures the live record into rolling snapshots keyed under the backup id.
///
/// At most `max_snapshots + 1` exist between the write of a new snapshot and
/// the end of its pruning pass.
pub struct BackupRotator {
    progress: ProgressStore,
    storage: TieredStore,
    keys: KeySpace,
    clock: Arc<dyn Clock>,
    max_snapshots: usize,
    seq: AtomicU64,
}

impl BackupRotator {
    pub fn new(
        progress: ProgressStore,
        storage: TieredStore,
        keys: KeySpace,
        clock: Arc<dyn Clock>,
        max_snapshots: usize,
    ) -> Self {
        Self {
            progress,
            storage,
            keys,
            clock,
            max_snapshots: max_snapshots.max(1),
            seq: AtomicU64::new(0),
        }
    }

    pub fn max_snapshots(&self) -> usize {
        self.max_snapshots
    }

    /// Rotations attempted since construction.
    pub fn rotation_count(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Captures a snapshot and prunes the oldest beyond the retention bound.
    /// Returns `None` when no tier accepted the write.
    pub async fn rotate(&self, reason: SnapshotReason) -> Option<SnapshotRecord> {
        let snapshot = self.capture_at(reason, self.next_capture_time().await);
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let key = self.keys.snapshot(
            &self.progress.identity().backup_id,
            snapshot.captured_at_epoch_ms,
            seq,
        );

        let report = self.storage.write(&key, &snapshot).await;
        if !report.any_succeeded() {
            log_warn!("{} snapshot could not be stored on any tier", reason.as_str());
            return None;
        }
        log_debug!(
            "{} snapshot {} stored on {:?}",
            reason.as_str(),
            snapshot.id,
            report.succeeded
        );

        self.prune().await;
        Some(snapshot)
    }

    /// A snapshot of the live record without storing it.
    pub fn capture(&self, reason: SnapshotReason) -> SnapshotRecord {
        self.capture_at(reason, self.clock.now_ms())
    }

    fn capture_at(&self, reason: SnapshotReason, at_ms: i64) -> SnapshotRecord {
        SnapshotRecord::capture(self.progress.read(), self.progress.origin(), reason, at_ms)
    }

    /// Never earlier than the newest stored snapshot, so a clock stepping
    /// backwards cannot sort a new snapshot first and have it pruned.
    async fn next_capture_time(&self) -> i64 {
        let now = self.clock.now_ms();
        let newest = self
            .snapshot_keys()
            .await
            .last()
            .and_then(|key| KeySpace::snapshot_time(key));
        match newest {
            Some(newest) if newest >= now => newest + 1,
            _ => now,
        }
    }

    /// Snapshot keys for this identity, oldest first.
    pub async fn snapshot_keys(&self) -> Vec<String> {
        self.storage
            .keys(&self.keys.snapshot_prefix(&self.progress.identity().backup_id))
            .await
    }

    /// Deletes the oldest snapshots until at most `max_snapshots` remain.
    pub async fn prune(&self) -> usize {
        let keys = self.snapshot_keys().await;
        if keys.len() <= self.max_snapshots {
            return 0;
        }
        let excess = keys.len() - self.max_snapshots;
        for key in &keys[..excess] {
            self.storage.delete(key).await;
        }
        log_debug!("pruned {excess} old snapshot(s)");
        excess
    }

    /// Removes every snapshot for this identity.
    pub async fn clear(&self) -> usize {
        let keys = self.snapshot_keys().await;
        for key in &keys {
            self.storage.delete(key).await;
        }
        if !keys.is_empty() {
            log_info!("cleared {} snapshot(s)", keys.len());
        }
        keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{Identity, ProgressRecord};
    use crate::storage::{LocalTier, SessionTier, TierId};

    fn rotator(storage: TieredStore, clock: Arc<ManualClock>, max: usize) -> BackupRotator {
        let keys = KeySpace::new("ks");
        let progress = ProgressStore::new(
            ProgressRecord::new(0),
            TierId::Session,
            storage.clone(),
            keys.clone(),
            Identity {
                primary_id: "p-1".into(),
                backup_id: "b-1".into(),
                created_at_epoch_ms: 0,
            },
            clock.clone(),
        );
        BackupRotator::new(progress, storage, keys, clock, max)
    }

    #[tokio::test]
    async fn keeps_only_the_newest_snapshots() {
        let storage = TieredStore::new(vec![Arc::new(SessionTier::new())]);
        let clock = Arc::new(ManualClock::new(1_000));
        let rotator = rotator(storage, clock.clone(), 3);

        for _ in 0..6 {
            clock.advance(10);
            assert!(rotator.rotate(SnapshotReason::Interval).await.is_some());
        }

        let keys = rotator.snapshot_keys().await;
        assert_eq!(keys.len(), 3);
        assert!(keys[2].contains("0000000001060"));
    }

    #[tokio::test]
    async fn clock_stepping_back_keeps_the_new_snapshot() {
        let storage = TieredStore::new(vec![Arc::new(SessionTier::new())]);
        let clock = Arc::new(ManualClock::new(5_000));
        let rotator = rotator(storage, clock.clone(), 2);

        rotator.rotate(SnapshotReason::Interval).await.expect("stored");
        rotator.rotate(SnapshotReason::Interval).await.expect("stored");
        clock.set(1_000);
        let latest = rotator.rotate(SnapshotReason::Manual).await.expect("stored");

        assert_eq!(latest.captured_at_epoch_ms, 5_002);
        let keys = rotator.snapshot_keys().await;
        assert_eq!(keys.len(), 2);
        assert_eq!(KeySpace::snapshot_time(&keys[1]), Some(5_002));
    }

    #[tokio::test]
    async fn failed_write_skips_pruning() {
        let storage = TieredStore::new(vec![Arc::new(LocalTier::disabled())]);
        let rotator = rotator(storage.clone(), Arc::new(ManualClock::new(0)), 2);

        assert!(rotator.rotate(SnapshotReason::Manual).await.is_none());
        assert!(storage.is_degraded());
        assert_eq!(rotator.rotation_count(), 1);
    }
}

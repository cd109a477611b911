//! Invariants that must hold however the tiers, clock or cloud behave.

mod common;

use std::sync::Arc;

use common::{builder, config, identity, signals, FailingTier, JAN_2026};
use keepsake_lib::backup::BackupRotator;
use keepsake_lib::identity::{resolve_identity, Fingerprinter};
use keepsake_lib::models::Validate;
use keepsake_lib::schema::MigrationOutcome;
use keepsake_lib::storage::{LocalTier, ObjectTier, SessionTier, TagTier};
use keepsake_lib::sync::{RetryPolicy, RetryQueue};
use keepsake_lib::{
    Clock, KeySpace, ManualClock, ProgressRecord, ProgressStore, RecoverySource, Signal,
    SnapshotReason, SnapshotRecord, Tier, TierId, TieredStore,
};
use serde_json::json;

#[tokio::test]
async fn progress_round_trips_with_any_durable_tier_alive() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = config(dir.path());
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(JAN_2026));
    let tiers = [
        FailingTier::new(Arc::new(SessionTier::new())),
        FailingTier::new(Arc::new(LocalTier::open(cfg.local_path(), cfg.local_quota_bytes))),
        FailingTier::new(Arc::new(ObjectTier::open(cfg.object_path()))),
        FailingTier::new(Arc::new(TagTier::open(
            cfg.tag_path(),
            cfg.tag_entry_max_bytes,
            cfg.tag_max_age(),
            clock,
        ))),
    ];
    let store = TieredStore::new(tiers.iter().map(|t| t.clone() as Arc<dyn Tier>).collect());
    let keys = KeySpace::new("rt");

    let mut record = ProgressRecord::new(JAN_2026);
    record.begin_visit(JAN_2026);
    record.record_discovery("glade", "Glade", "Quiet", JAN_2026 + 10);
    record.record_discovery("ridge", "Ridge", "Windy", JAN_2026 + 20);
    record.add_active_ms(42_000);

    for mask in 0u8..16 {
        for (bit, tier) in tiers.iter().enumerate() {
            tier.set_down(mask & (1 << bit) != 0);
        }
        // The tag tier never holds full records.
        if mask & 0b0111 == 0b0111 {
            continue;
        }
        let key = keys.progress(&format!("p-{mask:02}"));
        let report = store.write(&key, &record).await;
        assert!(report.any_succeeded(), "mask {mask:04b}");
        let read: Option<ProgressRecord> = store.read(&key).await;
        assert_eq!(read.as_ref(), Some(&record), "mask {mask:04b}");
    }
}

#[tokio::test]
async fn rotator_never_holds_more_than_its_limit() {
    let clock = Arc::new(ManualClock::new(JAN_2026));
    let storage = TieredStore::new(vec![Arc::new(SessionTier::new())]);
    let keys = KeySpace::new("rot");
    let progress = ProgressStore::new(
        ProgressRecord::new(JAN_2026),
        TierId::Session,
        storage.clone(),
        keys.clone(),
        identity(),
        clock.clone(),
    );
    let rotator = BackupRotator::new(progress.clone(), storage, keys, clock.clone(), 5);

    for tick in 0..1_000u32 {
        clock.advance(1_000);
        if tick % 97 == 0 {
            progress
                .record_discovery(&format!("spot-{tick}"), "Spot", "")
                .await;
        }
        assert!(rotator.rotate(SnapshotReason::Interval).await.is_some());
        assert!(rotator.snapshot_keys().await.len() <= 5, "tick {tick}");
    }
    assert_eq!(rotator.snapshot_keys().await.len(), 5);
    assert_eq!(rotator.rotation_count(), 1_000);
}

#[test]
fn retry_queue_evicts_oldest_beyond_capacity() {
    let mut queue = RetryQueue::new(RetryPolicy {
        max_attempts: 3,
        capacity: 3,
    });
    for n in 0..10u32 {
        let evicted = queue.enqueue(n, JAN_2026 + i64::from(n));
        assert!(queue.len() <= 3);
        if n >= 3 {
            assert_eq!(evicted.map(|entry| entry.payload), Some(n - 3));
        } else {
            assert!(evicted.is_none());
        }
    }
    let left: Vec<u32> = queue.iter().map(|entry| entry.payload).collect();
    assert_eq!(left, vec![7, 8, 9]);
}

#[tokio::test]
async fn v1_record_is_migrated_at_startup_keeping_every_discovery() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = config(dir.path());
    let keys = KeySpace::new(cfg.namespace.clone());
    let ids = identity();

    let v1 = json!({
        "discoveries": {
            "orchard": {"label": "Orchard", "message": "Ripe", "timestamp": "2025-09-01T10:00:00Z"},
            "quarry": {"label": "Quarry", "message": "Deep", "timestamp": "2025-08-01T10:00:00Z"},
            "chapel": {"label": "Chapel", "message": "Still", "timestamp": "2025-10-12T18:30:00Z"}
        },
        "visits": 6,
        "firstVisit": "2025-08-01T09:00:00Z",
        "lastVisit": "2025-10-12T19:00:00Z",
        "timeSpent": 900
    });
    LocalTier::open(cfg.local_path(), cfg.local_quota_bytes)
        .put(&keys.progress(&ids.primary_id), &v1.to_string())
        .await
        .expect("seeds v1 record");

    let keepsake = builder(dir.path()).start().await.expect("starts");
    let (key, outcome) = &keepsake.startup().migrations[0];
    assert_eq!(key, &keys.progress(&ids.primary_id));
    assert!(matches!(
        outcome,
        MigrationOutcome::Migrated { from, tier: TierId::Local } if from.starts_with('1')
    ));

    let record = keepsake.progress().read();
    record.validate().expect("current schema");
    let mut found = record.discoveries.ids();
    found.sort();
    assert_eq!(found, vec!["chapel", "orchard", "quarry"]);
    assert_eq!(record.visit_count, 7);
    assert_eq!(record.total_active_ms, 900_000);
}

#[tokio::test]
async fn newer_build_record_survives_startup_recovery() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = config(dir.path());
    let keys = KeySpace::new(cfg.namespace.clone());
    let ids = identity();

    let future = json!({
        "schemaVersion": "4.0",
        "discoveries": [],
        "visitCount": 40,
        "streaks": {"longest": 12}
    })
    .to_string();
    let local = LocalTier::open(cfg.local_path(), cfg.local_quota_bytes);
    local
        .put(&keys.progress(&ids.primary_id), &future)
        .await
        .expect("seeds newer record");
    drop(local);

    let mut progress = ProgressRecord::new(JAN_2026 - 86_400_000);
    progress.begin_visit(JAN_2026 - 86_400_000);
    progress.begin_visit(JAN_2026 - 3_600_000);
    progress.record_discovery("cellar", "Cellar", "Damp", JAN_2026 - 3_600_000);
    let snapshot = SnapshotRecord::capture(
        progress,
        TierId::Object,
        SnapshotReason::Interval,
        JAN_2026 - 60_000,
    );
    let object = ObjectTier::open(cfg.object_path());
    object
        .put(
            &keys.snapshot(&ids.backup_id, snapshot.captured_at_epoch_ms, 0),
            &serde_json::to_string(&snapshot).expect("serializes"),
        )
        .await
        .expect("seeds snapshot");
    drop(object);

    let keepsake = builder(dir.path()).start().await.expect("starts");
    assert!(keepsake
        .startup()
        .migrations
        .iter()
        .any(|(_, outcome)| matches!(outcome, MigrationOutcome::FutureVersion(v) if v == "4.0")));
    let notice = keepsake.startup().notice().expect("recovered");
    assert_eq!(notice.source, RecoverySource::LocalSnapshot);
    assert!(keepsake.progress().read().discoveries.contains("cellar"));
    keepsake.shutdown().await.expect("shuts down");
    drop(keepsake);

    let local = LocalTier::open(cfg.local_path(), cfg.local_quota_bytes);
    assert_eq!(
        local
            .get(&keys.quarantine(&ids.primary_id))
            .await
            .expect("reads"),
        Some(future)
    );
}

#[test]
fn fingerprint_is_idempotent_and_backup_id_ignores_volatile_signals() {
    let clock = Arc::new(ManualClock::new(JAN_2026));
    let fingerprinter = Fingerprinter::new(Arc::new(signals()), clock.clone());
    let a = fingerprinter.compute_identity();
    let b = fingerprinter.compute_identity();
    assert_eq!(a.primary_id, b.primary_id);
    assert_eq!(a.backup_id, b.backup_id);

    let resized = Fingerprinter::new(
        Arc::new(signals().with(Signal::Viewport, "390x844")),
        clock,
    )
    .compute_identity();
    assert_eq!(resized.backup_id, a.backup_id);
}

#[tokio::test]
async fn stored_identity_keeps_its_creation_time() {
    let clock = Arc::new(ManualClock::new(JAN_2026));
    let storage = TieredStore::new(vec![Arc::new(SessionTier::new())]);
    let keys = KeySpace::new("id");
    let fingerprinter = Fingerprinter::new(Arc::new(signals()), clock.clone());

    let first = resolve_identity(&fingerprinter, &storage, &keys).await;
    clock.advance(86_400_000);
    let second = resolve_identity(&fingerprinter, &storage, &keys).await;
    assert!(first.same_keys(&second));
    assert_eq!(second.created_at_epoch_ms, first.created_at_epoch_ms);
}

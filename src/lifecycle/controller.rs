use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{Context, Result};

use super::{LifecycleEvent, StartupReport, StartupSource, Status};
use crate::backup::{BackupController, BackupRotator};
use crate::clock::Clock;
use crate::config::KeepsakeConfig;
use crate::identity::{resolve_identity, IdentityProvider};
use crate::models::{Identity, ProgressRecord, SnapshotReason, SnapshotRecord};
use crate::progress::{ActivityTracker, ProgressEvent, ProgressStore, SubscriptionId};
use crate::recovery::{
    parse_import, EmergencySlot, ExportDocument, ExportMetadata, RecoveryEngine, RecoveryNotice,
    RecoverySource,
};
use crate::schema::{MigrationOutcome, SchemaMigrator};
use crate::storage::{KeySpace, Tier, TierId, TieredStore};
use crate::sync::{CloudSynchronizer, CloudTransport, RetryReport, SyncResult};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// Knobs the builder passes through to startup.
#[derive(Debug, Clone, Copy)]
pub(super) struct StartOptions {
    pub start_timers: bool,
    /// Off for read-only callers so inspecting progress is not a visit.
    pub count_visit: bool,
}

/// The running persistence layer for one context.
///
/// Feature code gets the `ProgressStore` from here and reports lifecycle
/// transitions; everything else (backups, sync, recovery) hangs off it.
pub struct Keepsake {
    config: KeepsakeConfig,
    keys: KeySpace,
    identity: Identity,
    storage: TieredStore,
    progress: ProgressStore,
    rotator: Arc<BackupRotator>,
    sync: CloudSynchronizer,
    recovery: RecoveryEngine,
    emergency: EmergencySlot,
    clock: Arc<dyn Clock>,
    activity: Mutex<ActivityTracker>,
    backup: tokio::sync::Mutex<BackupController>,
    discovery_hook: Mutex<Option<SubscriptionId>>,
    startup: StartupReport,
}

impl Keepsake {
    /// Startup order: identity, migration, load, recovery when nothing
    /// loads, then a fresh record as the last resort.
    pub(super) async fn start(
        config: KeepsakeConfig,
        clock: Arc<dyn Clock>,
        identity_provider: Arc<dyn IdentityProvider>,
        tiers: Vec<Arc<dyn Tier>>,
        transport: Option<Arc<dyn CloudTransport>>,
        emergency: EmergencySlot,
        options: StartOptions,
    ) -> Result<Self> {
        let keys = KeySpace::new(config.namespace.clone());
        let storage = TieredStore::new(tiers);
        let identity = resolve_identity(identity_provider.as_ref(), &storage, &keys).await;
        log_info!(
            "identity {} (backup {}) over tiers {:?}",
            identity.primary_id,
            identity.backup_id,
            storage.tier_ids()
        );

        let migrator = SchemaMigrator::new(storage.clone());
        let mut migrations = Vec::new();
        let mut loadable = Vec::new();
        for owner in identity.key_ids() {
            let key = keys.progress(owner);
            let outcome = migrator.migrate_key(&key).await;
            if let MigrationOutcome::FutureVersion(_) = &outcome {
                migrator.quarantine(&key, &keys.quarantine(owner)).await;
            }
            if outcome.is_loadable() {
                loadable.push(owner);
            }
            migrations.push((key, outcome));
        }

        let recovery = RecoveryEngine::new(
            storage.clone(),
            keys.clone(),
            identity.clone(),
            emergency.clone(),
            transport.clone(),
            config.sync_settings().request_timeout,
        );

        let (record, origin, source) = match ProgressStore::load(&storage, &keys, &loadable).await {
            Some((record, origin)) => (record, origin, StartupSource::Loaded { origin }),
            None => match recovery.find_first().await {
                Some(candidate) => {
                    let notice = candidate.notice();
                    log_info!("{notice}");
                    (
                        candidate.snapshot.progress,
                        candidate.origin,
                        StartupSource::Recovered(notice),
                    )
                }
                None => {
                    let origin = storage.tier_ids().first().copied().unwrap_or(TierId::Session);
                    (ProgressRecord::new(clock.now_ms()), origin, StartupSource::Fresh)
                }
            },
        };

        let progress = ProgressStore::new(
            record,
            origin,
            storage.clone(),
            keys.clone(),
            identity.clone(),
            clock.clone(),
        );
        let loaded = matches!(source, StartupSource::Loaded { .. });
        if options.count_visit {
            progress.begin_visit().await;
        } else if !loaded {
            progress.persist().await;
        }
        let visit_count = progress.read().visit_count;

        if ProgressStore::load(&storage, &keys, &identity.key_ids())
            .await
            .is_some()
        {
            retire_emergency(&storage, &keys, &identity, &emergency).await;
        }

        let rotator = Arc::new(BackupRotator::new(
            progress.clone(),
            storage.clone(),
            keys.clone(),
            clock.clone(),
            config.max_snapshots,
        ));
        let sync = CloudSynchronizer::new(
            transport,
            progress.clone(),
            storage.clone(),
            keys.clone(),
            clock.clone(),
            config.sync_settings(),
        );
        let restored_retries = sync.restore().await;

        let mut activity = ActivityTracker::new();
        activity.resume(Instant::now());

        let keepsake = Self {
            startup: StartupReport {
                identity: identity.clone(),
                migrations,
                source,
                visit_count,
                restored_retries,
            },
            config,
            keys,
            identity,
            storage,
            progress,
            rotator,
            sync,
            recovery,
            emergency,
            clock,
            activity: Mutex::new(activity),
            backup: tokio::sync::Mutex::new(BackupController::new()),
            discovery_hook: Mutex::new(None),
        };

        if options.start_timers {
            keepsake.start_timers().await?;
        }
        Ok(keepsake)
    }

    pub fn progress(&self) -> &ProgressStore {
        &self.progress
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn storage(&self) -> &TieredStore {
        &self.storage
    }

    pub fn synchronizer(&self) -> &CloudSynchronizer {
        &self.sync
    }

    pub fn startup(&self) -> &StartupReport {
        &self.startup
    }

    pub fn config(&self) -> &KeepsakeConfig {
        &self.config
    }

    /// Starts the backup loop and the cloud retry loop, and routes new
    /// discoveries to the backup loop.
    pub async fn start_timers(&self) -> Result<()> {
        let mut backup = self.backup.lock().await;
        if backup.is_running() {
            return Ok(());
        }
        let trigger = backup.start(
            self.rotator.clone(),
            self.storage.degraded_watch(),
            self.config.backup_intervals(),
        )?;

        let subscription = self.progress.subscribe(move |event, _| {
            if let ProgressEvent::DiscoveryRecorded { .. } = event {
                trigger.request(SnapshotReason::Discovery);
            }
        });
        *lock(&self.discovery_hook) = Some(subscription);

        self.sync.start_retry_loop()
    }

    pub async fn stop_timers(&self) -> Result<()> {
        let hook = lock(&self.discovery_hook).take();
        if let Some(subscription) = hook {
            self.progress.unsubscribe(subscription);
        }
        self.backup.lock().await.stop().await?;
        self.sync.stop_retry_loop().await
    }

    pub async fn timers_running(&self) -> bool {
        self.backup.lock().await.is_running()
    }

    pub async fn handle_event(&self, event: LifecycleEvent) -> Option<SnapshotRecord> {
        log_debug!("lifecycle event {event:?}");
        match event {
            LifecycleEvent::Visible => {
                lock(&self.activity).resume(Instant::now());
                None
            }
            LifecycleEvent::Hidden => {
                self.flush_activity(true).await;
                let snapshot = self.rotator.rotate(SnapshotReason::Hidden).await;
                self.sync.sync_in_background();
                snapshot
            }
            LifecycleEvent::ImportantChange => {
                let snapshot = self.rotator.rotate(SnapshotReason::Manual).await;
                self.sync.sync_in_background();
                snapshot
            }
            LifecycleEvent::Closing => Some(self.close().await),
        }
    }

    /// Emergency path: keep a snapshot in memory and on every tier, rotate
    /// once more, and push to the emergency endpoint.
    async fn close(&self) -> SnapshotRecord {
        self.flush_activity(true).await;

        let snapshot = self.rotator.capture(SnapshotReason::Emergency);
        self.emergency.store(snapshot.clone());
        self.storage
            .write(&self.keys.emergency(&self.identity.backup_id), &snapshot)
            .await;
        self.rotator.rotate(SnapshotReason::Closing).await;

        match self.sync.push_snapshot(snapshot.clone(), true).await {
            SyncResult::Synced { identity_used, .. } => {
                log_info!("emergency snapshot pushed under {identity_used}")
            }
            SyncResult::Disabled => {}
            other => log_warn!("emergency push not delivered: {other:?}"),
        }
        snapshot
    }

    /// Returns false when the id was already discovered.
    pub async fn record_discovery(&self, id: &str, label: &str, message: &str) -> bool {
        let added = self.progress.record_discovery(id, label, message).await;
        if added && !self.timers_running().await {
            self.rotator.rotate(SnapshotReason::Discovery).await;
        }
        added
    }

    pub async fn backup_now(&self) -> Option<SnapshotRecord> {
        self.flush_activity(false).await;
        self.rotator.rotate(SnapshotReason::Manual).await
    }

    pub async fn sync_now(&self) -> SyncResult {
        self.flush_activity(false).await;
        self.sync.sync().await
    }

    pub async fn retry_now(&self) -> RetryReport {
        self.sync.retry_pending().await
    }

    /// Adopts one recovery source in isolation, replacing live progress.
    pub async fn recover_from(&self, source: RecoverySource) -> Option<RecoveryNotice> {
        let candidate = self.recovery.find(source).await?;
        let notice = self.recovery.adopt(&candidate, &self.progress).await;
        self.rotator.rotate(SnapshotReason::Manual).await;
        Some(notice)
    }

    pub async fn export(&self) -> ExportDocument {
        self.flush_activity(false).await;
        let metadata = ExportMetadata {
            schema_version: crate::models::CURRENT_SCHEMA_VERSION.to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            last_sync_epoch_ms: self.sync.last_sync().map(|meta| meta.last_sync_epoch_ms),
            local_snapshot_count: self.rotator.snapshot_keys().await.len(),
            pending_retries: self.sync.pending(),
        };
        ExportDocument::new(
            self.identity.clone(),
            self.progress.read(),
            metadata,
            self.clock.now_ms(),
        )
    }

    /// Feeds an export file through the recovery adoption path.
    pub async fn import(&self, raw: &str) -> Result<RecoveryNotice> {
        let (candidate, exported_identity) = parse_import(raw)?;
        if let Some(exported) = exported_identity.filter(|other| !other.same_keys(&self.identity)) {
            log_info!(
                "importing progress exported under {}; storing it under {}",
                exported.primary_id,
                self.identity.primary_id
            );
        }
        let notice = self.recovery.adopt(&candidate, &self.progress).await;
        self.rotator.rotate(SnapshotReason::Manual).await;
        Ok(notice)
    }

    /// Discards everything stored for the current identity pair, cancels
    /// pending cloud pushes and begins a new record. The identity itself is
    /// kept.
    pub async fn start_fresh(&self) -> Result<()> {
        let timers_were_running = self.timers_running().await;
        if timers_were_running {
            self.stop_timers().await?;
        }
        self.sync.cancel().await.context("failed to cancel cloud sync")?;
        self.emergency.clear();
        self.rotator.clear().await;

        let owned: Vec<String> = self
            .storage
            .keys(&self.keys.root_prefix())
            .await
            .into_iter()
            .filter(|key| {
                self.identity
                    .key_ids()
                    .iter()
                    .any(|owner| self.keys.belongs_to(key, owner))
            })
            .collect();
        for key in &owned {
            self.storage.delete(key).await;
        }
        log_info!("start fresh: discarded {} stored key(s)", owned.len());

        let now = self.clock.now_ms();
        let mut record = ProgressRecord::new(now);
        record.begin_visit(now);
        let origin = self.storage.tier_ids().first().copied().unwrap_or(TierId::Session);
        self.progress.replace(record, origin).await;
        lock(&self.activity).take(Instant::now());

        if timers_were_running {
            self.start_timers().await?;
        }
        Ok(())
    }

    pub async fn status(&self) -> Status {
        let record = self.progress.read();
        Status {
            identity: self.identity.clone(),
            visit_count: record.visit_count,
            discovery_ids: record.discoveries.ids(),
            total_active_ms: record.total_active_ms,
            origin: self.progress.origin(),
            tiers: self.storage.tier_ids(),
            degraded: self.storage.is_degraded(),
            local_snapshots: self.rotator.snapshot_keys().await.len(),
            pending_retries: self.sync.pending(),
            cloud_enabled: self.sync.is_enabled(),
            last_sync: self.sync.last_sync(),
        }
    }

    /// Stops timers and folds pending active time into the record. Does
    /// not run the closing path; send `LifecycleEvent::Closing` for that.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop_timers().await?;
        self.flush_activity(true).await;
        Ok(())
    }

    /// Folds visible time into the record. `pause` also stops the clock
    /// until the next `Visible`.
    async fn flush_activity(&self, pause: bool) {
        let pending = {
            let mut activity = lock(&self.activity);
            let now = Instant::now();
            if pause {
                activity.pause(now);
            }
            activity.take(now)
        };
        self.progress.add_active_time(pending).await;
    }
}

/// Once progress is stored again the closing snapshot is stale; left in
/// place it would outrank newer local snapshots on a later recovery.
async fn retire_emergency(
    storage: &TieredStore,
    keys: &KeySpace,
    identity: &Identity,
    emergency: &EmergencySlot,
) {
    if emergency.peek().is_some() {
        log_debug!("progress is stored; dropping the in-memory emergency snapshot");
    }
    emergency.clear();
    for owner in identity.key_ids() {
        storage.delete(&keys.emergency(owner)).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lifecycle::KeepsakeBuilder;
    use crate::storage::SessionTier;

    struct FixedIdentity;

    impl IdentityProvider for FixedIdentity {
        fn current(&self) -> Identity {
            Identity {
                primary_id: "p-0123".into(),
                backup_id: "b-4567".into(),
                created_at_epoch_ms: 1_000,
            }
        }
    }

    async fn open(session: Arc<SessionTier>, emergency: EmergencySlot) -> Keepsake {
        open_counting(session, emergency, true).await
    }

    async fn open_counting(
        session: Arc<SessionTier>,
        emergency: EmergencySlot,
        count_visit: bool,
    ) -> Keepsake {
        KeepsakeBuilder::new(KeepsakeConfig::default())
            .clock(Arc::new(ManualClock::new(1_000)))
            .identity_provider(Arc::new(FixedIdentity))
            .tiers(vec![session])
            .emergency_slot(emergency)
            .start_timers(false)
            .count_visit(count_visit)
            .start()
            .await
            .expect("starts")
    }

    fn keys() -> KeySpace {
        KeySpace::new(KeepsakeConfig::default().namespace)
    }

    #[tokio::test]
    async fn second_context_loads_first_contexts_progress() {
        let session = Arc::new(SessionTier::new());
        let first = open(session.clone(), EmergencySlot::new()).await;
        assert_eq!(first.startup().source, StartupSource::Fresh);
        assert!(first.record_discovery("attic", "Attic", "Dusty").await);
        assert!(!first.record_discovery("attic", "Attic", "Dusty").await);
        assert_eq!(first.status().await.local_snapshots, 1);

        let second = open(session, EmergencySlot::new()).await;
        assert_eq!(
            second.startup().source,
            StartupSource::Loaded {
                origin: TierId::Session
            }
        );
        assert_eq!(second.startup().visit_count, 2);
        assert!(second.progress().read().discoveries.contains("attic"));
    }

    #[tokio::test]
    async fn closing_leaves_an_emergency_snapshot_for_the_next_context() {
        let emergency = EmergencySlot::new();
        let first = open(Arc::new(SessionTier::new()), emergency.clone()).await;
        first.record_discovery("well", "Well", "Deep").await;
        let snapshot = first
            .handle_event(LifecycleEvent::Closing)
            .await
            .expect("closing captures");
        assert_eq!(snapshot.reason, SnapshotReason::Emergency);
        assert!(emergency.peek().is_some());

        let second = open(Arc::new(SessionTier::new()), emergency).await;
        let notice = second.startup().notice().expect("recovered");
        assert_eq!(notice.source, RecoverySource::Emergency);
        assert!(second.progress().read().discoveries.contains("well"));
    }

    #[tokio::test]
    async fn stored_progress_retires_the_emergency_snapshot() {
        let session = Arc::new(SessionTier::new());
        let emergency = EmergencySlot::new();
        let keys = keys();

        let first = open(session.clone(), emergency.clone()).await;
        first.record_discovery("old", "Old", "Stale").await;
        first.handle_event(LifecycleEvent::Closing).await;
        assert!(session.get(&keys.emergency("b-4567")).await.expect("get").is_some());

        let second = open(session.clone(), emergency.clone()).await;
        assert!(matches!(second.startup().source, StartupSource::Loaded { .. }));
        assert!(emergency.peek().is_none());
        assert!(session.get(&keys.emergency("b-4567")).await.expect("get").is_none());
        for n in 0..4 {
            let id = format!("new-{n}");
            second.record_discovery(&id, &id, "").await;
        }
        second.backup_now().await.expect("snapshot stored");
        second.shutdown().await.expect("shuts down");

        for owner in ["p-0123", "b-4567"] {
            session.remove(&keys.progress(owner)).await.expect("remove");
        }
        let third = open(session, emergency).await;
        let notice = third.startup().notice().expect("recovered");
        assert_eq!(notice.source, RecoverySource::LocalSnapshot);
        let record = third.progress().read();
        assert!(record.discoveries.contains("old"));
        assert!((0..4).all(|n| record.discoveries.contains(&format!("new-{n}"))));
    }

    #[tokio::test]
    async fn non_counting_starts_are_not_visits() {
        let session = Arc::new(SessionTier::new());
        for _ in 0..3 {
            let inspect = open_counting(session.clone(), EmergencySlot::new(), false).await;
            assert_eq!(inspect.startup().visit_count, 0);
        }

        let play = open(session, EmergencySlot::new()).await;
        assert!(matches!(play.startup().source, StartupSource::Loaded { .. }));
        assert_eq!(play.startup().visit_count, 1);
    }

    #[tokio::test]
    async fn newer_build_record_is_kept_before_startup_overwrites_it() {
        let session = Arc::new(SessionTier::new());
        let keys = keys();
        let raw = r#"{"schemaVersion":"4.0","discoveries":[],"visitCount":40}"#;
        session
            .put(&keys.progress("p-0123"), raw)
            .await
            .expect("seeds");

        let keepsake = open(session.clone(), EmergencySlot::new()).await;
        assert!(keepsake
            .startup()
            .migrations
            .iter()
            .any(|(_, outcome)| matches!(outcome, MigrationOutcome::FutureVersion(_))));
        assert_eq!(
            session.get(&keys.quarantine("p-0123")).await.expect("get").as_deref(),
            Some(raw)
        );
        assert_eq!(keepsake.progress().read().visit_count, 1);
    }

    #[tokio::test]
    async fn start_fresh_discards_stored_progress() {
        let session = Arc::new(SessionTier::new());
        let keepsake = open(session.clone(), EmergencySlot::new()).await;
        keepsake.record_discovery("moat", "Moat", "Wet").await;
        keepsake.handle_event(LifecycleEvent::Closing).await;

        keepsake.start_fresh().await.expect("resets");
        let status = keepsake.status().await;
        assert!(status.discovery_ids.is_empty());
        assert_eq!(status.visit_count, 1);
        assert_eq!(status.local_snapshots, 0);

        let reopened = open(session, EmergencySlot::new()).await;
        assert!(reopened.progress().read().discoveries.is_empty());
        assert_eq!(reopened.identity().backup_id, "b-4567");
    }

    #[tokio::test]
    async fn export_then_import_restores_discoveries() {
        let keepsake = open(Arc::new(SessionTier::new()), EmergencySlot::new()).await;
        keepsake.record_discovery("tower", "Tower", "Tall").await;
        let raw = keepsake.export().await.to_json_pretty().expect("serializes");

        keepsake.start_fresh().await.expect("resets");
        let notice = keepsake.import(&raw).await.expect("imports");
        assert_eq!(notice.source, RecoverySource::Import);
        assert!(keepsake.progress().read().discoveries.contains("tower"));
    }
}

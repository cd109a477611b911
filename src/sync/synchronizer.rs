use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::retry_queue::{RetryDisposition, RetryPolicy, RetryQueue, RetryQueueEntry};
use super::transport::{fetch_latest, CloudError, CloudTransport, PushRequest};
use crate::clock::Clock;
use crate::models::{SnapshotReason, SnapshotRecord, Validate};
use crate::progress::ProgressStore;
use crate::storage::{KeySpace, TieredStore};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub request_timeout: Duration,
    pub retry_interval: Duration,
    pub policy: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncResult {
    Synced {
        server_timestamp: Option<i64>,
        identity_used: String,
    },
    /// The push failed and waits in the retry queue.
    Queued { pending: usize },
    /// The push failed and could not be kept for another attempt.
    Dropped,
    /// No cloud endpoint is configured.
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
    pub last_sync_epoch_ms: i64,
    pub server_timestamp: Option<i64>,
    pub identity_used: String,
}

impl Validate for SyncMeta {
    fn validate(&self) -> Result<()> {
        if self.identity_used.is_empty() {
            anyhow::bail!("sync meta without an identity");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueuedPush {
    pub snapshot: SnapshotRecord,
    pub emergency: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedQueue {
    entries: Vec<RetryQueueEntry<QueuedPush>>,
}

impl Validate for PersistedQueue {
    fn validate(&self) -> Result<()> {
        for entry in &self.entries {
            entry.payload.snapshot.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub requeued: usize,
    pub dropped: usize,
}

struct RetryLoop {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

struct SyncInner {
    transport: Option<Arc<dyn CloudTransport>>,
    progress: ProgressStore,
    storage: TieredStore,
    keys: KeySpace,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
    queue: Mutex<RetryQueue<QueuedPush>>,
    last_sync: RwLock<Option<SyncMeta>>,
    retry_loop: Mutex<Option<RetryLoop>>,
    retry_pass: tokio::sync::Mutex<()>,
    /// Bumped by every reset; a push that started before a reset is not
    /// queued after it.
    resets: AtomicU64,
}

/// Pushes snapshots to the cloud and pulls them back for recovery.
///
/// Failed pushes wait in a bounded retry queue that is persisted through the
/// tiered store. Nothing here returns an error to feature code.
#[derive(Clone)]
pub struct CloudSynchronizer {
    inner: Arc<SyncInner>,
}

impl CloudSynchronizer {
    pub fn new(
        transport: Option<Arc<dyn CloudTransport>>,
        progress: ProgressStore,
        storage: TieredStore,
        keys: KeySpace,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                transport,
                progress,
                storage,
                keys,
                clock,
                queue: Mutex::new(RetryQueue::new(settings.policy)),
                settings,
                last_sync: RwLock::new(None),
                retry_loop: Mutex::new(None),
                retry_pass: tokio::sync::Mutex::new(()),
                resets: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.transport.is_some()
    }

    pub fn pending(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    pub fn pending_entries(&self) -> Vec<RetryQueueEntry<QueuedPush>> {
        lock(&self.inner.queue).to_entries()
    }

    pub fn last_sync(&self) -> Option<SyncMeta> {
        match self.inner.last_sync.read() {
            Ok(meta) => meta.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Reloads the persisted retry queue and last-sync metadata.
    pub async fn restore(&self) -> usize {
        let backup_id = &self.inner.progress.identity().backup_id;
        let keys = &self.inner.keys;

        if let Some(meta) = self.inner.storage.read::<SyncMeta>(&keys.sync_meta(backup_id)).await {
            self.set_last_sync(Some(meta));
        }

        let persisted = self
            .inner
            .storage
            .read::<PersistedQueue>(&keys.sync_queue(backup_id))
            .await;
        let Some(persisted) = persisted else {
            return 0;
        };
        let restored = RetryQueue::from_entries(self.inner.settings.policy, persisted.entries);
        let count = restored.len();
        *lock(&self.inner.queue) = restored;
        if count > 0 {
            log_info!("restored {count} queued cloud push(es)");
        }
        count
    }

    /// Pushes the live record as a new snapshot.
    pub async fn sync(&self) -> SyncResult {
        let snapshot = SnapshotRecord::capture(
            self.inner.progress.read(),
            self.inner.progress.origin(),
            SnapshotReason::Sync,
            self.inner.clock.now_ms(),
        );
        self.push_snapshot(snapshot, false).await
    }

    /// Fire-and-forget variant of `sync` for feature code.
    pub fn sync_in_background(&self) -> JoinHandle<SyncResult> {
        let this = self.clone();
        tokio::spawn(async move { this.sync().await })
    }

    pub async fn push_snapshot(&self, snapshot: SnapshotRecord, emergency: bool) -> SyncResult {
        if !self.is_enabled() {
            return SyncResult::Disabled;
        }

        let generation = self.inner.resets.load(Ordering::SeqCst);
        let push = QueuedPush {
            snapshot,
            emergency,
        };
        match self.attempt(&push).await {
            Ok(result) => result,
            Err(err) if self.inner.resets.load(Ordering::SeqCst) != generation => {
                log_info!("cloud push {} failed after a reset: {err}; discarded", push.snapshot.id);
                SyncResult::Dropped
            }
            Err(err) => {
                log_warn!("cloud push {} failed: {err}; queueing for retry", push.snapshot.id);
                let id = push.snapshot.id.clone();
                let result = {
                    let mut queue = lock(&self.inner.queue);
                    match queue.enqueue(push, self.inner.clock.now_ms()) {
                        Some(displaced) if displaced.payload.snapshot.id == id => {
                            log_warn!("push {id} cannot be retried under the current policy");
                            SyncResult::Dropped
                        }
                        Some(displaced) => {
                            log_warn!(
                                "retry queue full; evicted push {}",
                                displaced.payload.snapshot.id
                            );
                            SyncResult::Queued {
                                pending: queue.len(),
                            }
                        }
                        None => SyncResult::Queued {
                            pending: queue.len(),
                        },
                    }
                };
                self.persist_queue().await;
                result
            }
        }
    }

    /// One pass over the queue. Successes leave the queue, failures count an
    /// attempt and are dropped at the bound.
    pub async fn retry_pending(&self) -> RetryReport {
        let _pass = self.inner.retry_pass.lock().await;
        let entries = lock(&self.inner.queue).take_all();
        let mut report = RetryReport {
            attempted: entries.len(),
            ..RetryReport::default()
        };
        if entries.is_empty() {
            return report;
        }

        for entry in entries {
            match self.attempt(&entry.payload).await {
                Ok(_) => report.succeeded += 1,
                Err(err) => {
                    let id = entry.payload.snapshot.id.clone();
                    match lock(&self.inner.queue).settle_failure(entry) {
                        RetryDisposition::Requeued { attempts, evicted } => {
                            log_debug!("retry of {id} failed ({err}); attempt {attempts}");
                            report.requeued += 1;
                            if evicted.is_some() {
                                report.dropped += 1;
                            }
                        }
                        RetryDisposition::Dropped(entry) => {
                            log_warn!(
                                "giving up on push {id} after {} attempts: {err}",
                                entry.attempts
                            );
                            report.dropped += 1;
                        }
                    }
                }
            }
        }

        self.persist_queue().await;
        report
    }

    /// Starts the periodic retry pass. Each wait is jittered by up to a
    /// quarter of the interval.
    pub fn start_retry_loop(&self) -> Result<()> {
        let mut slot = lock(&self.inner.retry_loop);
        if slot.is_some() {
            anyhow::bail!("retry loop already running");
        }
        if !self.is_enabled() {
            return Ok(());
        }

        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        let this = self.clone();
        let base = self.inner.settings.retry_interval;

        let handle = tokio::spawn(async move {
            loop {
                let wait = jittered(base);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        if this.pending() > 0 {
                            let report = this.retry_pending().await;
                            log_debug!("retry pass: {report:?}");
                        }
                    }
                    _ = token.cancelled() => {
                        log_info!("cloud retry loop shutting down");
                        break;
                    }
                }
            }
        });

        *slot = Some(RetryLoop {
            cancel_token,
            handle,
        });
        Ok(())
    }

    pub async fn stop_retry_loop(&self) -> Result<()> {
        let running = lock(&self.inner.retry_loop).take();
        if let Some(RetryLoop {
            cancel_token,
            handle,
        }) = running
        {
            cancel_token.cancel();
            handle.await.context("cloud retry loop failed to join")?;
        }
        Ok(())
    }

    /// Reset path: stops the retry loop and forgets every queued push,
    /// persisted copy included. A push already in flight is not aborted, but
    /// it is no longer queued if it fails. A retry pass in flight finishes
    /// before the queue is cleared.
    pub async fn cancel(&self) -> Result<usize> {
        self.stop_retry_loop().await?;
        let _pass = self.inner.retry_pass.lock().await;
        self.inner.resets.fetch_add(1, Ordering::SeqCst);
        let cleared = lock(&self.inner.queue).clear();
        let backup_id = &self.inner.progress.identity().backup_id;
        self.inner
            .storage
            .delete(&self.inner.keys.sync_queue(backup_id))
            .await;
        self.set_last_sync(None);
        if cleared > 0 {
            log_info!("discarded {cleared} queued cloud push(es)");
        }
        Ok(cleared)
    }

    /// Latest cloud snapshot for `id`. Failures and timeouts read as absent.
    pub async fn fetch(&self, id: &str) -> Option<Value> {
        let transport = self.inner.transport.as_ref()?;
        fetch_latest(transport.as_ref(), id, self.inner.settings.request_timeout).await
    }

    /// Pushes under the primary id, then the backup id if the server does
    /// not know the primary.
    async fn attempt(&self, push: &QueuedPush) -> Result<SyncResult, CloudError> {
        let transport = self
            .inner
            .transport
            .as_ref()
            .ok_or_else(|| CloudError::Network("no cloud endpoint configured".into()))?;
        let identity = self.inner.progress.identity();

        let mut last_err = CloudError::UnknownIdentity;
        for user_id in identity.key_ids() {
            let request = PushRequest {
                user_id: user_id.to_string(),
                identity: identity.clone(),
                progress: push.snapshot.clone(),
                emergency: push.emergency,
            };
            let outcome =
                tokio::time::timeout(self.inner.settings.request_timeout, transport.push(&request))
                    .await
                    .unwrap_or(Err(CloudError::Timeout));

            match outcome {
                Ok(ack) => {
                    let meta = SyncMeta {
                        last_sync_epoch_ms: self.inner.clock.now_ms(),
                        server_timestamp: ack.server_timestamp,
                        identity_used: user_id.to_string(),
                    };
                    self.record_success(meta.clone()).await;
                    return Ok(SyncResult::Synced {
                        server_timestamp: meta.server_timestamp,
                        identity_used: meta.identity_used,
                    });
                }
                Err(CloudError::UnknownIdentity) => {
                    log_debug!("server does not know {user_id}");
                    last_err = CloudError::UnknownIdentity;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    async fn record_success(&self, meta: SyncMeta) {
        let backup_id = &self.inner.progress.identity().backup_id;
        self.inner
            .storage
            .write(&self.inner.keys.sync_meta(backup_id), &meta)
            .await;
        self.set_last_sync(Some(meta));
    }

    async fn persist_queue(&self) {
        let persisted = PersistedQueue {
            entries: lock(&self.inner.queue).to_entries(),
        };
        let key = self
            .inner
            .keys
            .sync_queue(&self.inner.progress.identity().backup_id);
        if persisted.entries.is_empty() {
            self.inner.storage.delete(&key).await;
        } else {
            self.inner.storage.write(&key, &persisted).await;
        }
    }

    fn set_last_sync(&self, meta: Option<SyncMeta>) {
        match self.inner.last_sync.write() {
            Ok(mut slot) => *slot = meta,
            Err(poisoned) => *poisoned.into_inner() = meta,
        }
    }
}

fn jittered(base: Duration) -> Duration {
    let spread = (base.as_millis() as u64 / 4).max(1);
    base + Duration::from_millis(rand::random::<u64>() % spread)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

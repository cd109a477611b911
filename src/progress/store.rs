use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use crate::clock::Clock;
use crate::models::{Identity, ProgressRecord, ProgressSummary};
use crate::storage::{KeySpace, TierId, TieredStore, WriteReport};

pub type SubscriptionId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Mutated,
    DiscoveryRecorded { id: String },
    /// The whole record was swapped out, by recovery, import or reset.
    Replaced { origin: TierId },
}

type Listener = Arc<dyn Fn(&ProgressEvent, &ProgressRecord) + Send + Sync>;

struct StoreInner {
    record: RwLock<ProgressRecord>,
    origin: RwLock<TierId>,
    storage: TieredStore,
    keys: KeySpace,
    identity: Identity,
    clock: Arc<dyn Clock>,
    listeners: RwLock<Vec<(SubscriptionId, Listener)>>,
    next_subscription: AtomicU64,
}

/// Sole owner of the in-memory `ProgressRecord`.
///
/// Feature code reads a copy, mutates through a closure, and subscribes to
/// changes. Every mutation is persisted through the tiered store under both
/// identity keys before listeners run.
#[derive(Clone)]
pub struct ProgressStore {
    inner: Arc<StoreInner>,
}

impl ProgressStore {
    pub fn new(
        record: ProgressRecord,
        origin: TierId,
        storage: TieredStore,
        keys: KeySpace,
        identity: Identity,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                record: RwLock::new(record),
                origin: RwLock::new(origin),
                storage,
                keys,
                identity,
                clock,
                listeners: RwLock::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    /// Loads the first valid record under the given owner ids, in order.
    pub async fn load(
        storage: &TieredStore,
        keys: &KeySpace,
        owners: &[&str],
    ) -> Option<(ProgressRecord, TierId)> {
        for owner in owners {
            if let Some(found) = storage
                .read_with_origin::<ProgressRecord>(&keys.progress(owner))
                .await
            {
                return Some(found);
            }
        }
        None
    }

    pub fn read(&self) -> ProgressRecord {
        read_lock(&self.inner.record).clone()
    }

    pub fn origin(&self) -> TierId {
        *read_lock(&self.inner.origin)
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub async fn mutate<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut ProgressRecord) -> R,
    {
        self.apply(f, |_| Some(ProgressEvent::Mutated)).await
    }

    /// Returns false when the id was already discovered.
    pub async fn record_discovery(&self, id: &str, label: &str, message: &str) -> bool {
        let now = self.inner.clock.now_ms();
        let id_owned = id.to_string();
        self.apply(
            |record| record.record_discovery(id, label, message, now),
            move |added| {
                added.then(|| ProgressEvent::DiscoveryRecorded { id: id_owned })
            },
        )
        .await
    }

    pub async fn begin_visit(&self) -> u64 {
        let now = self.inner.clock.now_ms();
        self.mutate(|record| record.begin_visit(now)).await
    }

    pub async fn add_active_time(&self, delta_ms: u64) {
        if delta_ms == 0 {
            return;
        }
        self.mutate(|record| record.add_active_ms(delta_ms)).await;
    }

    /// Swaps in a whole record, as recovery and import do.
    pub async fn replace(&self, record: ProgressRecord, origin: TierId) -> WriteReport {
        *write_lock(&self.inner.record) = record;
        *write_lock(&self.inner.origin) = origin;
        let report = self.persist().await;
        self.notify(&ProgressEvent::Replaced { origin });
        report
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ProgressEvent, &ProgressRecord) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::SeqCst);
        write_lock(&self.inner.listeners).push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = write_lock(&self.inner.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Writes the record under both identity keys and the compact summary
    /// for the tag tier. Returns the primary-key report.
    pub async fn persist(&self) -> WriteReport {
        let record = self.read();
        let Identity {
            primary_id,
            backup_id,
            ..
        } = &self.inner.identity;
        let storage = &self.inner.storage;
        let keys = &self.inner.keys;

        let report = storage.write(&keys.progress(primary_id), &record).await;
        storage.write(&keys.progress(backup_id), &record).await;
        let summary: ProgressSummary = record.summary();
        storage.write(&keys.summary(backup_id), &summary).await;
        report
    }

    async fn apply<F, R, E>(&self, f: F, event: E) -> R
    where
        F: FnOnce(&mut ProgressRecord) -> R,
        E: FnOnce(&R) -> Option<ProgressEvent>,
    {
        let result = {
            let mut record = write_lock(&self.inner.record);
            f(&mut record)
        };
        self.persist().await;
        let events = [Some(ProgressEvent::Mutated), event(&result)];
        let mut sent_mutated = false;
        for event in events.into_iter().flatten() {
            if event == ProgressEvent::Mutated {
                if sent_mutated {
                    continue;
                }
                sent_mutated = true;
            }
            self.notify(&event);
        }
        result
    }

    fn notify(&self, event: &ProgressEvent) {
        let listeners: Vec<Listener> = read_lock(&self.inner.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        if listeners.is_empty() {
            return;
        }
        let snapshot = self.read();
        for listener in listeners {
            listener(event, &snapshot);
        }
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::SessionTier;

    fn identity() -> Identity {
        Identity {
            primary_id: "p-aaaa".into(),
            backup_id: "b-bbbb".into(),
            created_at_epoch_ms: 0,
        }
    }

    fn store() -> (ProgressStore, TieredStore) {
        let storage = TieredStore::new(vec![Arc::new(SessionTier::new())]);
        let progress = ProgressStore::new(
            ProgressRecord::new(0),
            TierId::Session,
            storage.clone(),
            KeySpace::new("ks"),
            identity(),
            Arc::new(ManualClock::new(1_000)),
        );
        (progress, storage)
    }

    #[tokio::test]
    async fn mutations_persist_under_both_ids() {
        let (progress, storage) = store();
        progress.begin_visit().await;

        let keys = KeySpace::new("ks");
        for owner in ["p-aaaa", "b-bbbb"] {
            let stored: Option<ProgressRecord> = storage.read(&keys.progress(owner)).await;
            assert_eq!(stored.map(|r| r.visit_count), Some(1));
        }
        let loaded = ProgressStore::load(&storage, &keys, &["p-missing", "b-bbbb"]).await;
        assert_eq!(loaded.map(|(r, tier)| (r.visit_count, tier)), Some((1, TierId::Session)));
    }

    #[tokio::test]
    async fn listeners_see_discoveries_once() {
        let (progress, _) = store();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = progress.subscribe(move |event, _| {
            if let Ok(mut events) = sink.lock() {
                events.push(event.clone());
            }
        });

        assert!(progress.record_discovery("owl", "Owl", "hoot").await);
        assert!(!progress.record_discovery("owl", "Owl", "hoot").await);

        let events = seen.lock().expect("lock").clone();
        assert_eq!(
            events,
            vec![
                ProgressEvent::Mutated,
                ProgressEvent::DiscoveryRecorded { id: "owl".into() },
                ProgressEvent::Mutated,
            ]
        );

        assert!(progress.unsubscribe(sub));
        progress.add_active_time(5).await;
        assert_eq!(seen.lock().expect("lock").len(), 3);
    }
}

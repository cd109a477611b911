//! Tiered storage adapter.
//!
//! Writes fan out to every tier at once and never fail the caller; reads walk
//! the tiers in durability order (T2, T1, T3, T0) and return the first value
//! that parses and validates. There is no cross-tier atomicity: two writers
//! racing on one key resolve last-write-wins at each tier independently.

use std::{collections::BTreeSet, sync::Arc};

use serde::{de::DeserializeOwned, Serialize};
use tokio::{sync::watch, task::JoinSet};

pub mod file_map;
pub mod keys;
pub mod local;
pub mod object;
pub mod session;
pub mod tag;
pub mod tier;

pub use keys::KeySpace;
pub use local::LocalTier;
pub use object::ObjectTier;
pub use session::SessionTier;
pub use tag::TagTier;
pub use tier::{Tier, TierError, TierId, TierRead, TierResult};

use crate::models::Validate;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_warn};

/// Per-tier outcome of a fan-out write or delete.
#[derive(Debug, Clone, Default)]
pub struct WriteReport {
    pub succeeded: Vec<TierId>,
    pub failed: Vec<(TierId, String)>,
    pub skipped: Vec<TierId>,
}

impl WriteReport {
    /// Every tier that was asked failed.
    pub fn all_failed(&self) -> bool {
        self.succeeded.is_empty() && !self.failed.is_empty()
    }

    pub fn any_succeeded(&self) -> bool {
        !self.succeeded.is_empty()
    }
}

struct StoreInner {
    tiers: Vec<Arc<dyn Tier>>,
    degraded_tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct TieredStore {
    inner: Arc<StoreInner>,
}

impl TieredStore {
    /// Tiers may be given in any order; they are kept in read order.
    pub fn new(mut tiers: Vec<Arc<dyn Tier>>) -> Self {
        tiers.sort_by_key(|tier| tier.id().read_rank());
        let (degraded_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(StoreInner { tiers, degraded_tx }),
        }
    }

    pub fn tier_ids(&self) -> Vec<TierId> {
        self.inner.tiers.iter().map(|tier| tier.id()).collect()
    }

    /// Set when the most recent write failed on every tier it tried.
    pub fn is_degraded(&self) -> bool {
        *self.inner.degraded_tx.borrow()
    }

    pub fn degraded_watch(&self) -> watch::Receiver<bool> {
        self.inner.degraded_tx.subscribe()
    }

    pub async fn write<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> WriteReport {
        match serde_json::to_string(value) {
            Ok(serialized) => self.write_raw(key, serialized).await,
            Err(err) => {
                log_error!("refusing to write {key}: serialization failed: {err}");
                WriteReport::default()
            }
        }
    }

    pub async fn write_raw(&self, key: &str, value: String) -> WriteReport {
        let value = Arc::new(value);
        let mut report = WriteReport::default();
        let mut writes = JoinSet::new();

        for tier in &self.inner.tiers {
            if !tier.accepts(key) {
                report.skipped.push(tier.id());
                continue;
            }
            let tier = tier.clone();
            let key = key.to_string();
            let value = value.clone();
            writes.spawn(async move {
                let result = tier.put(&key, &value).await;
                (tier.id(), result)
            });
        }

        while let Some(joined) = writes.join_next().await {
            match joined {
                Ok((tier, Ok(()))) => report.succeeded.push(tier),
                Ok((tier, Err(err))) => {
                    log_warn!("write {key} failed on {tier}: {err}");
                    report.failed.push((tier, err.to_string()));
                }
                Err(join_err) => log_error!("tier write task for {key} panicked: {join_err}"),
            }
        }

        self.note_write(key, &report);
        report
    }

    /// First value in durability order that parses and validates.
    pub async fn read<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned + Validate,
    {
        self.read_with_origin(key).await.map(|(value, _)| value)
    }

    pub async fn read_with_origin<T>(&self, key: &str) -> Option<(T, TierId)>
    where
        T: DeserializeOwned + Validate,
    {
        for tier in &self.inner.tiers {
            if let TierRead::Found(value) = read_tier(tier.as_ref(), key, parse_valid::<T>).await {
                return Some((value, tier.id()));
            }
        }
        None
    }

    /// What every tier holds for `key`, in read order. Tests and recovery
    /// use this to see exactly which tiers failed and how.
    pub async fn read_all<T>(&self, key: &str) -> Vec<(TierId, TierRead<T>)>
    where
        T: DeserializeOwned + Validate,
    {
        self.read_all_with(key, parse_valid::<T>).await
    }

    pub async fn read_all_with<T, F>(&self, key: &str, parse: F) -> Vec<(TierId, TierRead<T>)>
    where
        F: Fn(&str) -> anyhow::Result<T>,
    {
        let mut outcomes = Vec::with_capacity(self.inner.tiers.len());
        for tier in &self.inner.tiers {
            outcomes.push((tier.id(), read_tier(tier.as_ref(), key, &parse).await));
        }
        outcomes
    }

    pub async fn delete(&self, key: &str) -> WriteReport {
        let mut report = WriteReport::default();
        for tier in &self.inner.tiers {
            match tier.remove(key).await {
                Ok(()) => report.succeeded.push(tier.id()),
                Err(err) => {
                    log_debug!("delete {key} failed on {}: {err}", tier.id());
                    report.failed.push((tier.id(), err.to_string()));
                }
            }
        }
        report
    }

    /// Sorted union of matching keys across every reachable tier.
    pub async fn keys(&self, prefix: &str) -> Vec<String> {
        let mut all = BTreeSet::new();
        for tier in &self.inner.tiers {
            match tier.keys(prefix).await {
                Ok(keys) => all.extend(keys),
                Err(err) => log_debug!("listing {prefix} skipped {}: {err}", tier.id()),
            }
        }
        all.into_iter().collect()
    }

    fn note_write(&self, key: &str, report: &WriteReport) {
        let degraded = report.all_failed();
        if degraded {
            log_error!("write {key} failed on every tier; entering degraded mode");
        }
        self.inner.degraded_tx.send_if_modified(|current| {
            if *current != degraded && (degraded || report.any_succeeded()) {
                *current = degraded;
                true
            } else {
                false
            }
        });
    }
}

fn parse_valid<T>(raw: &str) -> anyhow::Result<T>
where
    T: DeserializeOwned + Validate,
{
    let value: T = serde_json::from_str(raw)?;
    value.validate()?;
    Ok(value)
}

async fn read_tier<T, F>(tier: &dyn Tier, key: &str, parse: F) -> TierRead<T>
where
    F: Fn(&str) -> anyhow::Result<T>,
{
    match tier.get(key).await {
        Ok(Some(raw)) => match parse(&raw) {
            Ok(value) => TierRead::Found(value),
            Err(err) => {
                log_warn!("ignoring unusable {key} on {}: {err:#}", tier.id());
                TierRead::ParseError(format!("{err:#}"))
            }
        },
        Ok(None) => TierRead::NotFound,
        Err(err) => TierRead::Unavailable(err.to_string()),
    }
}

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::file_map::JsonFileMap;
use super::keys::is_tag_eligible;
use super::tier::{Tier, TierError, TierId, TierResult};
use crate::clock::Clock;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TagEntry {
    value: String,
    expires_at_epoch_ms: i64,
}

/// T3: tiny, expiring entries. Holds the identity pair and the compact
/// progress summary; every other key is skipped.
pub struct TagTier {
    store: JsonFileMap<TagEntry>,
    entry_max_bytes: usize,
    max_age: Duration,
    clock: Arc<dyn Clock>,
}

impl TagTier {
    pub fn open(
        path: PathBuf,
        entry_max_bytes: usize,
        max_age: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let tier = Self {
            store: JsonFileMap::open(path),
            entry_max_bytes,
            max_age,
            clock,
        };
        if let Err(err) = tier.prune_expired() {
            log_warn!("Failed to prune expired tags: {err}");
        }
        tier
    }

    /// Removes expired entries and returns how many were dropped.
    pub fn prune_expired(&self) -> TierResult<usize> {
        let now = self.clock.now_ms();
        let expired = self
            .store
            .read(|data| data.values().filter(|e| e.expires_at_epoch_ms <= now).count());
        if expired == 0 {
            return Ok(0);
        }
        self.store
            .update(|data| data.retain(|_, entry| entry.expires_at_epoch_ms > now))
            .map_err(|err| TierError::Backend(err.to_string()))?;
        log_debug!("pruned {expired} expired tag(s) from {}", self.store.path().display());
        Ok(expired)
    }

    fn max_age_ms(&self) -> i64 {
        i64::try_from(self.max_age.as_millis()).unwrap_or(i64::MAX)
    }
}

#[async_trait]
impl Tier for TagTier {
    fn id(&self) -> TierId {
        TierId::Tag
    }

    fn accepts(&self, key: &str) -> bool {
        is_tag_eligible(key)
    }

    async fn put(&self, key: &str, value: &str) -> TierResult<()> {
        if !self.accepts(key) {
            return Err(TierError::Rejected(key.to_string()));
        }
        let size = key.len() + value.len();
        if size > self.entry_max_bytes {
            return Err(TierError::EntryTooLarge {
                size,
                limit: self.entry_max_bytes,
            });
        }
        let entry = TagEntry {
            value: value.to_string(),
            expires_at_epoch_ms: self.clock.now_ms().saturating_add(self.max_age_ms()),
        };
        self.store
            .update(|data| {
                data.insert(key.to_string(), entry);
            })
            .map_err(|err| TierError::Backend(err.to_string()))
    }

    async fn get(&self, key: &str) -> TierResult<Option<String>> {
        let now = self.clock.now_ms();
        Ok(self.store.read(|data| {
            data.get(key)
                .filter(|entry| entry.expires_at_epoch_ms > now)
                .map(|entry| entry.value.clone())
        }))
    }

    async fn remove(&self, key: &str) -> TierResult<()> {
        if !self.store.read(|data| data.contains_key(key)) {
            return Ok(());
        }
        self.store
            .update(|data| {
                data.remove(key);
            })
            .map_err(|err| TierError::Backend(err.to_string()))
    }

    async fn keys(&self, prefix: &str) -> TierResult<Vec<String>> {
        let now = self.clock.now_ms();
        Ok(self.store.read(|data| {
            data.iter()
                .filter(|(key, entry)| key.starts_with(prefix) && entry.expires_at_epoch_ms > now)
                .map(|(key, _)| key.clone())
                .collect()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::keys::KeySpace;

    fn tier_at(dir: &tempfile::TempDir, clock: Arc<ManualClock>) -> TagTier {
        TagTier::open(
            dir.path().join("tags.json"),
            128,
            Duration::from_secs(60),
            clock,
        )
    }

    #[tokio::test]
    async fn entries_expire() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new(0));
        let tier = tier_at(&dir, clock.clone());
        let key = KeySpace::new("ks").identity();

        tier.put(&key, "pair").await.expect("put");
        assert_eq!(tier.get(&key).await.expect("get"), Some("pair".into()));

        clock.advance(61_000);
        assert_eq!(tier.get(&key).await.expect("get"), None);
        assert_eq!(tier.prune_expired().expect("prune"), 1);
    }

    #[tokio::test]
    async fn rejects_foreign_keys_and_large_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tier = tier_at(&dir, Arc::new(ManualClock::new(0)));
        let keys = KeySpace::new("ks");

        assert!(!tier.accepts(&keys.progress("p-1")));
        assert!(matches!(
            tier.put(&keys.progress("p-1"), "{}").await,
            Err(TierError::Rejected(_))
        ));
        assert!(matches!(
            tier.put(&keys.summary("b-1"), &"x".repeat(200)).await,
            Err(TierError::EntryTooLarge { .. })
        ));
    }
}

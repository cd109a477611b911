use std::path::PathBuf;

use async_trait::async_trait;

use super::file_map::JsonFileMap;
use super::tier::{Tier, TierError, TierId, TierResult};

const ENABLE_LOGS: bool = true;

use crate::log_warn;

/// T1: synchronous key-value file with a small byte quota.
///
/// A disabled tier models private browsing: it exists, and every call
/// reports `Unavailable`.
pub struct LocalTier {
    store: Option<JsonFileMap<String>>,
    quota_bytes: usize,
}

impl LocalTier {
    pub fn open(path: PathBuf, quota_bytes: usize) -> Self {
        Self {
            store: Some(JsonFileMap::open(path)),
            quota_bytes,
        }
    }

    pub fn disabled() -> Self {
        Self {
            store: None,
            quota_bytes: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Drops every entry, as a user clearing site data would.
    pub fn clear(&self) -> TierResult<()> {
        self.store()?
            .update(|data| data.clear())
            .map_err(|err| TierError::Backend(err.to_string()))
    }

    fn store(&self) -> TierResult<&JsonFileMap<String>> {
        self.store
            .as_ref()
            .ok_or_else(|| TierError::Unavailable("local storage disabled".into()))
    }
}

#[async_trait]
impl Tier for LocalTier {
    fn id(&self) -> TierId {
        TierId::Local
    }

    async fn put(&self, key: &str, value: &str) -> TierResult<()> {
        let store = self.store()?;
        let needed = store.read(|data| {
            let others: usize = data
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            others + key.len() + value.len()
        });
        if needed > self.quota_bytes {
            log_warn!(
                "local tier quota exceeded writing {key}: {needed} > {}",
                self.quota_bytes
            );
            return Err(TierError::QuotaExceeded {
                needed,
                quota: self.quota_bytes,
            });
        }
        store
            .update(|data| {
                data.insert(key.to_string(), value.to_string());
            })
            .map_err(|err| TierError::Backend(err.to_string()))
    }

    async fn get(&self, key: &str) -> TierResult<Option<String>> {
        Ok(self.store()?.read(|data| data.get(key).cloned()))
    }

    async fn remove(&self, key: &str) -> TierResult<()> {
        let store = self.store()?;
        if !store.read(|data| data.contains_key(key)) {
            return Ok(());
        }
        store
            .update(|data| {
                data.remove(key);
            })
            .map_err(|err| TierError::Backend(err.to_string()))
    }

    async fn keys(&self, prefix: &str) -> TierResult<Vec<String>> {
        Ok(self.store()?.read(|data| {
            data.keys()
                .filter(|key| key.starts_with(prefix))
                .cloned()
                .collect()
        }))
    }
}

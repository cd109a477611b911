use std::{
    collections::HashMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use async_trait::async_trait;

use super::tier::{Tier, TierError, TierId, TierResult};

/// T0: process memory. Gone when the running context ends, which is also
/// why an `Arc<SessionTier>` can be handed from one context to the next
/// inside the same process.
#[derive(Default)]
pub struct SessionTier {
    entries: RwLock<HashMap<String, String>>,
    capacity: Option<usize>,
}

impl SessionTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits the number of distinct keys held.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: Some(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.read_guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_guard().is_empty()
    }

    pub fn clear(&self) {
        self.write_guard().clear();
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, HashMap<String, String>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, HashMap<String, String>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Tier for SessionTier {
    fn id(&self) -> TierId {
        TierId::Session
    }

    async fn put(&self, key: &str, value: &str) -> TierResult<()> {
        let mut entries = self.write_guard();
        if let Some(capacity) = self.capacity {
            if !entries.contains_key(key) && entries.len() >= capacity {
                return Err(TierError::QuotaExceeded {
                    needed: entries.len() + 1,
                    quota: capacity,
                });
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> TierResult<Option<String>> {
        Ok(self.read_guard().get(key).cloned())
    }

    async fn remove(&self, key: &str) -> TierResult<()> {
        self.write_guard().remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> TierResult<Vec<String>> {
        Ok(self
            .read_guard()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

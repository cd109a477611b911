use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};

const ENABLE_LOGS: bool = true;

use crate::log_warn;

/// A string-keyed map mirrored to a pretty JSON file on every change.
///
/// Backs the local and tag tiers. A missing or unreadable file opens as an
/// empty map.
pub(crate) struct JsonFileMap<V> {
    path: PathBuf,
    data: RwLock<BTreeMap<String, V>>,
}

impl<V> JsonFileMap<V>
where
    V: Serialize + DeserializeOwned + Clone,
{
    pub fn open(path: PathBuf) -> Self {
        let data = if path.exists() {
            match fs::read_to_string(&path) {
                Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|err| {
                    log_warn!("Discarding unparsable store {}: {err}", path.display());
                    BTreeMap::new()
                }),
                Err(err) => {
                    log_warn!("Failed to read store {}: {err}", path.display());
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        Self {
            path,
            data: RwLock::new(data),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read<R>(&self, f: impl FnOnce(&BTreeMap<String, V>) -> R) -> R {
        f(&self.read_guard())
    }

    /// Applies `f` and persists. If the file cannot be written the in-memory
    /// map is rolled back so memory never claims more than disk holds.
    pub fn update<R>(&self, f: impl FnOnce(&mut BTreeMap<String, V>) -> R) -> Result<R> {
        let mut guard = self.write_guard();
        let before = guard.clone();
        let result = f(&mut guard);
        if let Err(err) = self.persist(&guard) {
            *guard = before;
            return Err(err);
        }
        Ok(result)
    }

    fn persist(&self, data: &BTreeMap<String, V>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, serialized)
            .with_context(|| format!("Failed to write store to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to replace store {}", self.path.display()))
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, BTreeMap<String, V>> {
        match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, BTreeMap<String, V>> {
        match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopening_sees_persisted_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("map.json");

        let map: JsonFileMap<String> = JsonFileMap::open(path.clone());
        map.update(|data| data.insert("a".into(), "1".into()))
            .expect("persist");

        let reopened: JsonFileMap<String> = JsonFileMap::open(path);
        assert_eq!(reopened.read(|data| data.get("a").cloned()), Some("1".into()));
    }

    #[test]
    fn writes_replace_the_file_whole() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("map.json");

        let map: JsonFileMap<String> = JsonFileMap::open(path.clone());
        map.update(|data| data.insert("a".into(), "1".into()))
            .expect("persist");
        map.update(|data| data.remove("a")).expect("persist");

        assert!(!path.with_extension("tmp").exists());
        let on_disk: BTreeMap<String, String> =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("parses");
        assert!(on_disk.is_empty());
    }

    #[test]
    fn corrupt_file_opens_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("map.json");
        fs::write(&path, "{not json").expect("write");

        let map: JsonFileMap<String> = JsonFileMap::open(path);
        assert!(map.read(|data| data.is_empty()));
    }
}

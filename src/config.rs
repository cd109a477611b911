use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
    time::Duration,
};

use crate::backup::BackupIntervals;
use crate::sync::{RetryPolicy, SyncSettings};

const DEBUG_INTERVAL_SECS: u64 = 5;

const ENABLE_LOGS: bool = true;

use crate::log_warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct KeepsakeConfig {
    pub data_dir: PathBuf,
    pub namespace: String,
    pub cloud_endpoint: Option<String>,
    pub request_timeout_ms: u64,
    pub backup_interval_secs: u64,
    pub degraded_backup_interval_secs: u64,
    pub max_snapshots: usize,
    pub retry_interval_secs: u64,
    pub retry_max_attempts: u32,
    pub retry_queue_capacity: usize,
    pub local_quota_bytes: usize,
    pub tag_entry_max_bytes: usize,
    pub tag_max_age_days: u64,
    pub session_capacity: Option<usize>,
    /// Disables the local tier, as a private browsing window would.
    pub private_mode: bool,
}

impl Default for KeepsakeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("keepsake-data"),
            namespace: "keepsake".into(),
            cloud_endpoint: None,
            request_timeout_ms: 10_000,
            backup_interval_secs: 60,
            degraded_backup_interval_secs: 15,
            max_snapshots: 5,
            retry_interval_secs: 30,
            retry_max_attempts: 3,
            retry_queue_capacity: 10,
            local_quota_bytes: 5 * 1024 * 1024,
            tag_entry_max_bytes: 4096,
            tag_max_age_days: 365,
            session_capacity: None,
            private_mode: false,
        }
    }
}

impl KeepsakeConfig {
    /// Applies `KEEPSAKE_ENDPOINT`, `KEEPSAKE_DATA_DIR` and `KEEPSAKE_DEBUG`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(endpoint) = std::env::var("KEEPSAKE_ENDPOINT") {
            let endpoint = endpoint.trim();
            self.cloud_endpoint = (!endpoint.is_empty()).then(|| endpoint.to_string());
        }
        if let Ok(dir) = std::env::var("KEEPSAKE_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        let debug_mode = std::env::var("KEEPSAKE_DEBUG")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if debug_mode {
            self.backup_interval_secs = DEBUG_INTERVAL_SECS;
            self.degraded_backup_interval_secs = DEBUG_INTERVAL_SECS.min(self.degraded_backup_interval_secs);
            self.retry_interval_secs = DEBUG_INTERVAL_SECS;
        }
        self
    }

    pub fn local_path(&self) -> PathBuf {
        self.data_dir.join("local.json")
    }

    pub fn object_path(&self) -> PathBuf {
        self.data_dir.join("objects.sqlite3")
    }

    pub fn tag_path(&self) -> PathBuf {
        self.data_dir.join("tags.json")
    }

    pub fn tag_max_age(&self) -> Duration {
        Duration::from_secs(self.tag_max_age_days.saturating_mul(24 * 60 * 60))
    }

    pub fn backup_intervals(&self) -> BackupIntervals {
        BackupIntervals {
            normal: Duration::from_secs(self.backup_interval_secs.max(1)),
            degraded: Duration::from_secs(self.degraded_backup_interval_secs.max(1)),
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            request_timeout: Duration::from_millis(self.request_timeout_ms.max(1)),
            retry_interval: Duration::from_secs(self.retry_interval_secs.max(1)),
            policy: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                capacity: self.retry_queue_capacity,
            },
        }
    }
}

/// `KeepsakeConfig` backed by a JSON file. A missing or unreadable file
/// yields defaults.
pub struct ConfigStore {
    path: PathBuf,
    data: RwLock<KeepsakeConfig>,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                log_warn!("Ignoring unparsable config {}: {err}", path.display());
                KeepsakeConfig::default()
            })
        } else {
            KeepsakeConfig::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> KeepsakeConfig {
        match self.data.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut KeepsakeConfig),
    {
        let mut guard = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
        self.persist(&guard)
    }

    fn persist(&self, data: &KeepsakeConfig) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write config to {}", self.path.display()))
    }
}

//! Startup sequencing and lifecycle hooks around the persistence layer.

use serde::Serialize;

pub mod builder;
pub mod controller;

pub use builder::KeepsakeBuilder;
pub use controller::Keepsake;

use crate::models::Identity;
use crate::recovery::RecoveryNotice;
use crate::schema::MigrationOutcome;
use crate::storage::TierId;
use crate::sync::SyncMeta;

/// Host context transitions the layer reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Visible,
    Hidden,
    /// The context is about to close.
    Closing,
    /// Feature code flagged a change worth backing up right away.
    ImportantChange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupSource {
    Loaded { origin: TierId },
    Recovered(RecoveryNotice),
    Fresh,
}

#[derive(Debug, Clone)]
pub struct StartupReport {
    pub identity: Identity,
    pub migrations: Vec<(String, MigrationOutcome)>,
    pub source: StartupSource,
    pub visit_count: u64,
    pub restored_retries: usize,
}

impl StartupReport {
    /// Recovery confirmation to show the user, if recovery ran.
    pub fn notice(&self) -> Option<&RecoveryNotice> {
        match &self.source {
            StartupSource::Recovered(notice) => Some(notice),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub identity: Identity,
    pub visit_count: u64,
    pub discovery_ids: Vec<String>,
    pub total_active_ms: u64,
    pub origin: TierId,
    pub tiers: Vec<TierId>,
    pub degraded: bool,
    pub local_snapshots: usize,
    pub pending_retries: usize,
    pub cloud_enabled: bool,
    pub last_sync: Option<SyncMeta>,
}

use std::fs;
use std::sync::Arc;

use anyhow::Result;

use super::controller::{Keepsake, StartOptions};
use crate::clock::{Clock, SystemClock};
use crate::config::KeepsakeConfig;
use crate::identity::{Fingerprinter, IdentityProvider, SignalSource, SystemSignals};
use crate::recovery::EmergencySlot;
use crate::storage::{LocalTier, ObjectTier, SessionTier, TagTier, Tier};
use crate::sync::{CloudTransport, HttpTransport};

const ENABLE_LOGS: bool = true;

use crate::log_warn;

/// Assembles a `Keepsake` from configuration plus optional overrides for
/// every external collaborator.
pub struct KeepsakeBuilder {
    config: KeepsakeConfig,
    clock: Option<Arc<dyn Clock>>,
    signals: Option<Arc<dyn SignalSource>>,
    identity: Option<Arc<dyn IdentityProvider>>,
    transport: Option<Arc<dyn CloudTransport>>,
    tiers: Option<Vec<Arc<dyn Tier>>>,
    session: Option<Arc<SessionTier>>,
    emergency: Option<EmergencySlot>,
    start_timers: bool,
    count_visit: bool,
}

impl KeepsakeBuilder {
    pub fn new(config: KeepsakeConfig) -> Self {
        Self {
            config,
            clock: None,
            signals: None,
            identity: None,
            transport: None,
            tiers: None,
            session: None,
            emergency: None,
            start_timers: true,
            count_visit: true,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn signals(mut self, signals: Arc<dyn SignalSource>) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Replaces the fingerprint entirely, e.g. with an authenticated account.
    pub fn identity_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(provider);
        self
    }

    /// Takes precedence over `cloud_endpoint`.
    pub fn transport(mut self, transport: Arc<dyn CloudTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Uses exactly these tiers instead of the configured ones.
    pub fn tiers(mut self, tiers: Vec<Arc<dyn Tier>>) -> Self {
        self.tiers = Some(tiers);
        self
    }

    /// Session tier carried over from an earlier context in this process.
    pub fn session_tier(mut self, session: Arc<SessionTier>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn emergency_slot(mut self, slot: EmergencySlot) -> Self {
        self.emergency = Some(slot);
        self
    }

    /// One-shot callers (the CLI, tests) skip the backup and retry loops.
    pub fn start_timers(mut self, enabled: bool) -> Self {
        self.start_timers = enabled;
        self
    }

    /// Whether this start counts as a visit. Inspection-only callers turn
    /// it off.
    pub fn count_visit(mut self, enabled: bool) -> Self {
        self.count_visit = enabled;
        self
    }

    pub async fn start(self) -> Result<Keepsake> {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let identity = match self.identity {
            Some(provider) => provider,
            None => {
                let signals = self
                    .signals
                    .unwrap_or_else(|| Arc::new(SystemSignals::default()));
                Arc::new(Fingerprinter::new(signals, clock.clone()))
            }
        };
        let tiers = match self.tiers {
            Some(tiers) => tiers,
            None => default_tiers(&self.config, self.session, clock.clone()),
        };
        let transport = self.transport.or_else(|| http_transport(&self.config));

        Keepsake::start(
            self.config,
            clock,
            identity,
            tiers,
            transport,
            self.emergency.unwrap_or_default(),
            StartOptions {
                start_timers: self.start_timers,
                count_visit: self.count_visit,
            },
        )
        .await
    }
}

fn default_tiers(
    config: &KeepsakeConfig,
    session: Option<Arc<SessionTier>>,
    clock: Arc<dyn Clock>,
) -> Vec<Arc<dyn Tier>> {
    if let Err(err) = fs::create_dir_all(&config.data_dir) {
        log_warn!(
            "cannot create data dir {}: {err}; persistent tiers will be unavailable",
            config.data_dir.display()
        );
    }

    let session = session.unwrap_or_else(|| {
        Arc::new(match config.session_capacity {
            Some(capacity) => SessionTier::with_capacity(capacity),
            None => SessionTier::new(),
        })
    });
    let local = if config.private_mode {
        LocalTier::disabled()
    } else {
        LocalTier::open(config.local_path(), config.local_quota_bytes)
    };

    vec![
        session,
        Arc::new(local),
        Arc::new(ObjectTier::open(config.object_path())),
        Arc::new(TagTier::open(
            config.tag_path(),
            config.tag_entry_max_bytes,
            config.tag_max_age(),
            clock,
        )),
    ]
}

fn http_transport(config: &KeepsakeConfig) -> Option<Arc<dyn CloudTransport>> {
    let endpoint = config.cloud_endpoint.as_deref()?;
    match HttpTransport::new(endpoint, config.sync_settings().request_timeout) {
        Ok(transport) => Some(Arc::new(transport)),
        Err(err) => {
            log_warn!("cloud sync disabled: {err}");
            None
        }
    }
}

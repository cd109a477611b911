//! Fakes shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use keepsake_lib::identity::Fingerprinter;
use keepsake_lib::sync::{PushAck, PushRequest};
use keepsake_lib::{
    CloudError, CloudTransport, Identity, KeepsakeBuilder, KeepsakeConfig, ManualClock, Signal,
    StaticSignals, Tier, TierError, TierId,
};

/// 2026-01-01T00:00:00Z
pub const JAN_2026: i64 = 1_767_225_600_000;

pub fn signals() -> StaticSignals {
    StaticSignals::new()
        .with(Signal::Renderer, "ANGLE (Intel Iris)")
        .with(Signal::ScreenGeometry, "1920x1080")
        .with(Signal::ColorDepth, "24")
        .with(Signal::Viewport, "1440x900")
        .with(Signal::Locale, "fr-FR")
        .with(Signal::Timezone, "Europe/Paris")
        .with(Signal::Platform, "Linux x86_64")
        .with(Signal::HardwareConcurrency, "4")
}

/// The identity every context in these tests resolves to.
pub fn identity() -> Identity {
    Fingerprinter::new(Arc::new(signals()), Arc::new(ManualClock::new(JAN_2026))).compute_identity()
}

pub fn config(data_dir: &Path) -> KeepsakeConfig {
    KeepsakeConfig {
        data_dir: data_dir.to_path_buf(),
        ..KeepsakeConfig::default()
    }
}

/// One-shot context over the configured tiers in `data_dir`.
pub fn builder(data_dir: &Path) -> KeepsakeBuilder {
    KeepsakeBuilder::new(config(data_dir))
        .clock(Arc::new(ManualClock::new(JAN_2026)))
        .signals(Arc::new(signals()))
        .start_timers(false)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Wraps a real tier and fails every call while `down` is set.
pub struct FailingTier {
    inner: Arc<dyn Tier>,
    down: AtomicBool,
}

impl FailingTier {
    pub fn new(inner: Arc<dyn Tier>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            down: AtomicBool::new(false),
        })
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), TierError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(TierError::Unavailable(format!("{} is down", self.inner.id())));
        }
        Ok(())
    }
}

#[async_trait]
impl Tier for FailingTier {
    fn id(&self) -> TierId {
        self.inner.id()
    }

    fn accepts(&self, key: &str) -> bool {
        self.inner.accepts(key)
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), TierError> {
        self.check()?;
        self.inner.put(key, value).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, TierError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn remove(&self, key: &str) -> Result<(), TierError> {
        self.check()?;
        self.inner.remove(key).await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, TierError> {
        self.check()?;
        self.inner.keys(prefix).await
    }
}

/// In-memory cloud that only knows the ids it has been told about.
#[derive(Default)]
pub struct FakeCloud {
    known: Mutex<HashSet<String>>,
    stored: Mutex<HashMap<String, Value>>,
    offline: AtomicBool,
    pushes: Mutex<Vec<PushRequest>>,
    fetches: Mutex<Vec<String>>,
}

impl FakeCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn know(&self, id: &str) {
        lock(&self.known).insert(id.to_string());
    }

    /// Stores `snapshot` under `id` as if an earlier push had landed.
    pub fn seed(&self, id: &str, snapshot: Value) {
        self.know(id);
        lock(&self.stored).insert(id.to_string(), snapshot);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn push_count(&self) -> usize {
        lock(&self.pushes).len()
    }

    pub fn fetches(&self) -> Vec<String> {
        lock(&self.fetches).clone()
    }

    pub fn stored(&self, id: &str) -> Option<Value> {
        lock(&self.stored).get(id).cloned()
    }
}

#[async_trait]
impl CloudTransport for FakeCloud {
    async fn push(&self, request: &PushRequest) -> Result<PushAck, CloudError> {
        lock(&self.pushes).push(request.clone());
        if self.offline.load(Ordering::SeqCst) {
            return Err(CloudError::Network("connection refused".into()));
        }
        if !lock(&self.known).contains(&request.user_id) {
            return Err(CloudError::UnknownIdentity);
        }
        let body = serde_json::to_value(&request.progress)
            .map_err(|err| CloudError::Decode(err.to_string()))?;
        lock(&self.stored).insert(request.user_id.clone(), body);
        Ok(PushAck {
            server_timestamp: Some(JAN_2026),
        })
    }

    async fn fetch(&self, id: &str) -> Result<Option<Value>, CloudError> {
        lock(&self.fetches).push(id.to_string());
        if self.offline.load(Ordering::SeqCst) {
            return Err(CloudError::Timeout);
        }
        Ok(lock(&self.stored).get(id).cloned())
    }
}

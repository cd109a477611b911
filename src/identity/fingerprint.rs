use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use sha2::{Digest, Sha256};

use super::signals::{Signal, SignalSource};
use super::IdentityProvider;
use crate::clock::Clock;
use crate::models::identity::{BACKUP_PREFIX, PRIMARY_PREFIX};
use crate::models::Identity;

/// Bytes of the SHA-256 digest kept in each id.
const ID_BYTES: usize = 16;

/// Derives the identity pair from environment signals.
///
/// The primary id hashes every signal plus a monthly time bucket, so it
/// drifts naturally; the backup id hashes only `Signal::STABLE`.
pub struct Fingerprinter {
    source: Arc<dyn SignalSource>,
    clock: Arc<dyn Clock>,
}

impl Fingerprinter {
    pub fn new(source: Arc<dyn SignalSource>, clock: Arc<dyn Clock>) -> Self {
        Self { source, clock }
    }

    pub fn compute_identity(&self) -> Identity {
        let mut wide: Vec<(&str, String)> = Signal::ALL
            .iter()
            .map(|signal| (signal.name(), self.read_signal(*signal)))
            .collect();
        wide.push(("time_bucket", self.time_bucket()));

        let narrow: Vec<(&str, String)> = Signal::STABLE
            .iter()
            .map(|signal| (signal.name(), self.read_signal(*signal)))
            .collect();

        Identity {
            primary_id: format!("{PRIMARY_PREFIX}{}", digest(&wide)),
            backup_id: format!("{BACKUP_PREFIX}{}", digest(&narrow)),
            created_at_epoch_ms: self.clock.now_ms(),
        }
    }

    /// `YYYY-MM` in UTC.
    pub fn time_bucket(&self) -> String {
        self.clock.now_utc().format("%Y-%m").to_string()
    }

    /// A signal source that panics contributes an empty string like any
    /// other unavailable source.
    fn read_signal(&self, signal: Signal) -> String {
        catch_unwind(AssertUnwindSafe(|| self.source.read(signal)))
            .ok()
            .flatten()
            .unwrap_or_default()
    }
}

impl IdentityProvider for Fingerprinter {
    fn current(&self) -> Identity {
        self.compute_identity()
    }
}

fn digest(fields: &[(&str, String)]) -> String {
    let mut hasher = Sha256::new();
    for (name, value) in fields {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    let hash = hasher.finalize();
    hex::encode(&hash[..ID_BYTES])
}

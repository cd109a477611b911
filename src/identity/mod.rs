//! Anonymous identity: a fingerprint-derived key pair standing in for a login.

pub mod fingerprint;
pub mod signals;

pub use fingerprint::Fingerprinter;
pub use signals::{Signal, SignalSource, StaticSignals, SystemSignals};

use crate::models::Identity;
use crate::storage::{KeySpace, TieredStore};

const ENABLE_LOGS: bool = true;

use crate::log_info;

/// Source of the current identity. Storage and sync only see this trait, so
/// an authenticated account could replace the fingerprint without touching
/// them.
pub trait IdentityProvider: Send + Sync {
    fn current(&self) -> Identity;
}

/// Computes the identity and reconciles it with the stored pair.
///
/// A stored pair with the same keys keeps its original creation time. The
/// pair is then written back to every tier, the tag tier included.
pub async fn resolve_identity(
    provider: &dyn IdentityProvider,
    store: &TieredStore,
    keys: &KeySpace,
) -> Identity {
    let mut identity = provider.current();
    let key = keys.identity();

    match store.read::<Identity>(&key).await {
        Some(stored) if stored.same_keys(&identity) => {
            identity.created_at_epoch_ms = stored.created_at_epoch_ms;
            return identity;
        }
        Some(stored) if stored.backup_id == identity.backup_id => {
            log_info!(
                "Primary identity drifted ({} -> {}); backup id unchanged",
                stored.primary_id, identity.primary_id
            );
            identity.created_at_epoch_ms = stored.created_at_epoch_ms;
        }
        Some(stored) => {
            log_info!(
                "Environment changed beyond the stable signals; previous backup id {}",
                stored.backup_id
            );
        }
        None => log_info!("First observation of identity {}", identity.primary_id),
    }

    store.write(&key, &identity).await;
    identity
}

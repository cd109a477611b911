use std::path::PathBuf;

use async_trait::async_trait;

use super::tier::{Tier, TierError, TierId, TierResult};
use crate::db::Database;

const ENABLE_LOGS: bool = true;

use crate::log_warn;

/// T2: the SQLite object store. If the database cannot be opened the tier
/// still exists and answers `Unavailable`, the same as an unsupported
/// IndexedDB.
pub struct ObjectTier {
    db: Option<Database>,
    open_error: Option<String>,
}

impl ObjectTier {
    pub fn open(path: PathBuf) -> Self {
        match Database::open(path.clone()) {
            Ok(db) => Self {
                db: Some(db),
                open_error: None,
            },
            Err(err) => {
                log_warn!("object tier unavailable at {}: {err:#}", path.display());
                Self {
                    db: None,
                    open_error: Some(format!("{err:#}")),
                }
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.db.is_some()
    }

    fn db(&self) -> TierResult<&Database> {
        self.db.as_ref().ok_or_else(|| {
            TierError::Unavailable(
                self.open_error
                    .clone()
                    .unwrap_or_else(|| "object store not open".into()),
            )
        })
    }
}

fn backend(err: anyhow::Error) -> TierError {
    TierError::Backend(format!("{err:#}"))
}

#[async_trait]
impl Tier for ObjectTier {
    fn id(&self) -> TierId {
        TierId::Object
    }

    async fn put(&self, key: &str, value: &str) -> TierResult<()> {
        self.db()?.put_object(key, value).await.map_err(backend)
    }

    async fn get(&self, key: &str) -> TierResult<Option<String>> {
        self.db()?.get_object(key).await.map_err(backend)
    }

    async fn remove(&self, key: &str) -> TierResult<()> {
        self.db()?.delete_object(key).await.map_err(backend)
    }

    async fn keys(&self, prefix: &str) -> TierResult<Vec<String>> {
        self.db()?.object_keys(prefix).await.map_err(backend)
    }
}

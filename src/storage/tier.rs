use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One physical storage backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum TierId {
    /// T0: cleared when the running context ends.
    Session,
    /// T1: synchronous key-value file with a small byte quota.
    Local,
    /// T2: transactional object store, the most durable local tier.
    Object,
    /// T3: tiny expiring entries for the identity pair and progress summary.
    Tag,
}

impl TierId {
    /// Durability order used by every read: T2, T1, T3, T0.
    pub const READ_ORDER: [TierId; 4] = [TierId::Object, TierId::Local, TierId::Tag, TierId::Session];

    pub fn as_str(&self) -> &'static str {
        match self {
            TierId::Session => "session",
            TierId::Local => "local",
            TierId::Object => "object",
            TierId::Tag => "tag",
        }
    }

    pub fn read_rank(&self) -> usize {
        Self::READ_ORDER
            .iter()
            .position(|tier| tier == self)
            .unwrap_or(Self::READ_ORDER.len())
    }
}

impl std::fmt::Display for TierId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TierError {
    #[error("tier unavailable: {0}")]
    Unavailable(String),

    #[error("quota exceeded: {needed} bytes needed, quota is {quota}")]
    QuotaExceeded { needed: usize, quota: usize },

    #[error("entry of {size} bytes exceeds the {limit} byte entry limit")]
    EntryTooLarge { size: usize, limit: usize },

    #[error("key '{0}' is not accepted by this tier")]
    Rejected(String),

    #[error("backend error: {0}")]
    Backend(String),
}

pub type TierResult<T> = std::result::Result<T, TierError>;

/// Raw string storage. Parsing and validation happen in the adapter so every
/// tier fails the same way on a bad value.
#[async_trait]
pub trait Tier: Send + Sync {
    fn id(&self) -> TierId;

    /// Tiers with a narrow purpose skip keys outside it. A skipped key is
    /// not a failed write.
    fn accepts(&self, _key: &str) -> bool {
        true
    }

    async fn put(&self, key: &str, value: &str) -> TierResult<()>;

    async fn get(&self, key: &str) -> TierResult<Option<String>>;

    async fn remove(&self, key: &str) -> TierResult<()>;

    async fn keys(&self, prefix: &str) -> TierResult<Vec<String>>;
}

/// What one tier said about one key.
#[derive(Debug, Clone, PartialEq)]
pub enum TierRead<T> {
    Found(T),
    NotFound,
    Unavailable(String),
    ParseError(String),
}

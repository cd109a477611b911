//! Storage key layout: `{namespace}:{kind}:{owner}[:{suffix}]`.
//!
//! Snapshot suffixes are zero-padded capture timestamps so lexical order is
//! capture order on every tier.

const KIND_PROGRESS: &str = "progress";
const KIND_SUMMARY: &str = "summary";
const KIND_IDENTITY: &str = "identity";
const KIND_SNAPSHOT: &str = "snapshot";
const KIND_EMERGENCY: &str = "emergency";
const KIND_SYNC_QUEUE: &str = "sync-queue";
const KIND_SYNC_META: &str = "sync-meta";
const KIND_QUARANTINE: &str = "quarantine";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn root_prefix(&self) -> String {
        format!("{}:", self.namespace)
    }

    pub fn progress(&self, owner: &str) -> String {
        self.key(KIND_PROGRESS, owner)
    }

    pub fn summary(&self, owner: &str) -> String {
        self.key(KIND_SUMMARY, owner)
    }

    /// The identity pair is stored once, not per owner.
    pub fn identity(&self) -> String {
        self.key(KIND_IDENTITY, "current")
    }

    pub fn emergency(&self, owner: &str) -> String {
        self.key(KIND_EMERGENCY, owner)
    }

    pub fn sync_queue(&self, owner: &str) -> String {
        self.key(KIND_SYNC_QUEUE, owner)
    }

    pub fn sync_meta(&self, owner: &str) -> String {
        self.key(KIND_SYNC_META, owner)
    }

    /// Raw copy of a record written by a newer build.
    pub fn quarantine(&self, owner: &str) -> String {
        self.key(KIND_QUARANTINE, owner)
    }

    pub fn snapshot_prefix(&self, owner: &str) -> String {
        format!("{}:", self.key(KIND_SNAPSHOT, owner))
    }

    pub fn snapshot(&self, owner: &str, captured_at_ms: i64, seq: u64) -> String {
        format!(
            "{}{:013}-{:06}",
            self.snapshot_prefix(owner),
            captured_at_ms.max(0),
            seq % 1_000_000
        )
    }

    /// Capture timestamp encoded in a snapshot key.
    pub fn snapshot_time(key: &str) -> Option<i64> {
        let suffix = key.rsplit(':').next()?;
        suffix.split('-').next()?.parse().ok()
    }

    /// True when `key` lives in this namespace and belongs to `owner`.
    pub fn belongs_to(&self, key: &str, owner: &str) -> bool {
        let mut parts = key.splitn(4, ':');
        parts.next() == Some(self.namespace.as_str())
            && parts.next().is_some()
            && parts.next() == Some(owner)
    }

    fn key(&self, kind: &str, owner: &str) -> String {
        format!("{}:{kind}:{owner}", self.namespace)
    }
}

/// The tag tier only holds the identity pair and compact summaries.
pub fn is_tag_eligible(key: &str) -> bool {
    matches!(key.split(':').nth(1), Some(KIND_IDENTITY) | Some(KIND_SUMMARY))
}

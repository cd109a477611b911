use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use super::Validate;

pub const PRIMARY_PREFIX: &str = "p-";
pub const BACKUP_PREFIX: &str = "b-";

/// Pseudonymous identity derived from environment signals.
///
/// `primary_id` hashes the full signal set and drifts with the environment;
/// `backup_id` hashes only the stable subset and is the fallback key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub primary_id: String,
    pub backup_id: String,
    pub created_at_epoch_ms: i64,
}

impl Identity {
    pub fn same_keys(&self, other: &Identity) -> bool {
        self.primary_id == other.primary_id && self.backup_id == other.backup_id
    }

    /// Key ids in lookup order: primary first, backup second.
    pub fn key_ids(&self) -> [&str; 2] {
        [self.primary_id.as_str(), self.backup_id.as_str()]
    }
}

impl Validate for Identity {
    fn validate(&self) -> Result<()> {
        if !self.primary_id.starts_with(PRIMARY_PREFIX) || self.primary_id.len() <= 2 {
            bail!("malformed primary id '{}'", self.primary_id);
        }
        if !self.backup_id.starts_with(BACKUP_PREFIX) || self.backup_id.len() <= 2 {
            bail!("malformed backup id '{}'", self.backup_id);
        }
        Ok(())
    }
}

use std::collections::HashSet;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use super::Validate;

pub const CURRENT_SCHEMA_VERSION: &str = "3.0";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryEvent {
    pub id: String,
    pub label: String,
    pub message: String,
    pub at_epoch_ms: i64,
    pub visit_number_at_discovery: u64,
}

/// Discoveries in the order they were made, unique by `id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct DiscoverySet(Vec<DiscoveryEvent>);

impl DiscoverySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the event unless its id is already present.
    pub fn insert(&mut self, event: DiscoveryEvent) -> bool {
        if self.contains(&event.id) {
            return false;
        }
        self.0.push(event);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.iter().any(|event| event.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&DiscoveryEvent> {
        self.0.iter().find(|event| event.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiscoveryEvent> {
        self.0.iter()
    }

    pub fn ids(&self) -> Vec<String> {
        self.0.iter().map(|event| event.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn first_duplicate(&self) -> Option<&str> {
        let mut seen = HashSet::new();
        self.0
            .iter()
            .find(|event| !seen.insert(event.id.as_str()))
            .map(|event| event.id.as_str())
    }
}

/// The canonical mutable user state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub discoveries: DiscoverySet,
    pub visit_count: u64,
    pub first_visit_epoch_ms: i64,
    pub last_visit_epoch_ms: i64,
    pub total_active_ms: u64,
    pub schema_version: String,
}

impl ProgressRecord {
    /// A record for a visitor nobody has seen before. The visit itself is
    /// counted by `begin_visit`.
    pub fn new(now_ms: i64) -> Self {
        Self {
            discoveries: DiscoverySet::new(),
            visit_count: 0,
            first_visit_epoch_ms: now_ms,
            last_visit_epoch_ms: now_ms,
            total_active_ms: 0,
            schema_version: CURRENT_SCHEMA_VERSION.to_string(),
        }
    }

    pub fn begin_visit(&mut self, now_ms: i64) -> u64 {
        self.visit_count += 1;
        if self.visit_count == 1 {
            self.first_visit_epoch_ms = now_ms;
        }
        self.last_visit_epoch_ms = now_ms.max(self.first_visit_epoch_ms);
        self.visit_count
    }

    pub fn record_discovery(
        &mut self,
        id: &str,
        label: &str,
        message: &str,
        now_ms: i64,
    ) -> bool {
        self.discoveries.insert(DiscoveryEvent {
            id: id.to_string(),
            label: label.to_string(),
            message: message.to_string(),
            at_epoch_ms: now_ms,
            visit_number_at_discovery: self.visit_count,
        })
    }

    pub fn add_active_ms(&mut self, delta_ms: u64) {
        self.total_active_ms = self.total_active_ms.saturating_add(delta_ms);
    }

    pub fn summary(&self) -> ProgressSummary {
        ProgressSummary {
            discovery_ids: self.discoveries.ids(),
            visit_count: self.visit_count,
            first_visit_epoch_ms: self.first_visit_epoch_ms,
            last_visit_epoch_ms: self.last_visit_epoch_ms,
            schema_version: self.schema_version.clone(),
        }
    }
}

impl Validate for ProgressRecord {
    fn validate(&self) -> Result<()> {
        if self.schema_version != CURRENT_SCHEMA_VERSION {
            bail!(
                "schema version {} does not match current {}",
                self.schema_version,
                CURRENT_SCHEMA_VERSION
            );
        }
        if let Some(id) = self.discoveries.first_duplicate() {
            bail!("duplicate discovery id '{id}'");
        }
        if self.discoveries.iter().any(|event| event.id.is_empty()) {
            bail!("discovery with empty id");
        }
        if self.last_visit_epoch_ms < self.first_visit_epoch_ms {
            bail!(
                "last visit {} precedes first visit {}",
                self.last_visit_epoch_ms,
                self.first_visit_epoch_ms
            );
        }
        Ok(())
    }
}

/// Compact form kept in the tag tier, where entries are limited to a few KB.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSummary {
    pub discovery_ids: Vec<String>,
    pub visit_count: u64,
    pub first_visit_epoch_ms: i64,
    pub last_visit_epoch_ms: i64,
    pub schema_version: String,
}

impl ProgressSummary {
    /// Rebuilds a record from the summary. Labels fall back to the id and
    /// per-discovery detail the summary never carried is left empty.
    pub fn to_record(&self) -> ProgressRecord {
        let mut record = ProgressRecord::new(self.first_visit_epoch_ms);
        for id in &self.discovery_ids {
            record.discoveries.insert(DiscoveryEvent {
                id: id.clone(),
                label: id.clone(),
                message: String::new(),
                at_epoch_ms: self.last_visit_epoch_ms,
                visit_number_at_discovery: 0,
            });
        }
        record.visit_count = self.visit_count;
        record.last_visit_epoch_ms = self.last_visit_epoch_ms.max(self.first_visit_epoch_ms);
        record
    }
}

impl Validate for ProgressSummary {
    fn validate(&self) -> Result<()> {
        if self.schema_version != CURRENT_SCHEMA_VERSION {
            bail!("summary schema version {} is not current", self.schema_version);
        }
        Ok(())
    }
}

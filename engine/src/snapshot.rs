//! Snapshot types for persisting and restoring bucket state.
//!
//! A bucket's sync state is its ghosts, its checkpoint, the changes the
//! server has not acknowledged and the relationships waiting to resolve.
//! Records themselves live in storage and are not part of a snapshot.

use crate::change::Change;
use crate::ghost::{Ghost, GhostStore};
use crate::relationship::PendingRelationship;
use crate::schema::BucketSchema;
use crate::{error::Result, BucketName, ChangeVersion, Error, Key};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// An unacknowledged change with its retry count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedChange {
    pub change: Change,
    pub retry_count: u32,
}

impl From<Change> for SavedChange {
    fn from(change: Change) -> Self {
        Self {
            retry_count: change.retry_count,
            change,
        }
    }
}

impl From<SavedChange> for Change {
    fn from(saved: SavedChange) -> Self {
        let mut change = saved.change;
        change.retry_count = saved.retry_count;
        change
    }
}

/// A point-in-time snapshot of one bucket's sync state.
///
/// Uses BTreeMap instead of HashMap for deterministic serialization order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Bucket the snapshot belongs to
    pub bucket: BucketName,
    /// Checkpoint of the last completed reconciliation or change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<ChangeVersion>,
    /// Ghosts by key
    pub ghosts: BTreeMap<Key, Ghost>,
    /// Changes not acknowledged yet, ordered by key
    #[serde(default)]
    pub pending: Vec<SavedChange>,
    /// Relationships sourced in this bucket
    #[serde(default)]
    pub relationships: Vec<PendingRelationship>,
}

impl BucketSnapshot {
    /// Create a new empty snapshot.
    pub fn new(bucket: impl Into<BucketName>) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            bucket: bucket.into(),
            checkpoint: None,
            ghosts: BTreeMap::new(),
            pending: Vec::new(),
            relationships: Vec::new(),
        }
    }

    /// Add a ghost to the snapshot.
    pub fn add_ghost(&mut self, ghost: Ghost) {
        self.ghosts.insert(ghost.key.clone(), ghost);
    }

    /// Ghosts as a store.
    pub fn ghost_store(&self) -> GhostStore {
        self.ghosts.values().cloned().collect()
    }

    /// Validate the snapshot against a bucket schema.
    pub fn validate(&self, schema: &BucketSchema) -> Result<()> {
        if self.bucket != schema.name {
            return Err(Error::BucketMismatch {
                expected: schema.name.clone(),
                actual: self.bucket.clone(),
            });
        }
        for (key, ghost) in &self.ghosts {
            if key != &ghost.key {
                return Err(Error::InvalidSnapshot(format!(
                    "ghost stored under '{key}' belongs to '{}'",
                    ghost.key
                )));
            }
            schema.validate(&ghost.snapshot)?;
        }
        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

/// Metadata about a snapshot (without the full data).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub format_version: u32,
    pub bucket: BucketName,
    pub checkpoint: Option<ChangeVersion>,
    pub ghost_count: usize,
    pub pending_count: usize,
    pub relationship_count: usize,
}

impl From<&BucketSnapshot> for SnapshotMetadata {
    fn from(snapshot: &BucketSnapshot) -> Self {
        Self {
            format_version: snapshot.format_version,
            bucket: snapshot.bucket.clone(),
            checkpoint: snapshot.checkpoint.clone(),
            ghost_count: snapshot.ghosts.len(),
            pending_count: snapshot.pending.len(),
            relationship_count: snapshot.relationships.len(),
        }
    }
}

//! Ghost store: what the server has.
//!
//! A ghost is the last server-acknowledged version and attribute snapshot
//! of a record. It is never the record's in-memory state, which may carry
//! local edits the server has not seen yet.

use crate::value::Attributes;
use crate::{Key, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Last acknowledged state of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ghost {
    pub key: Key,
    pub version: Version,
    pub snapshot: Attributes,
}

impl Ghost {
    pub fn new(key: impl Into<Key>, version: Version, snapshot: Attributes) -> Self {
        Self {
            key: key.into(),
            version,
            snapshot,
        }
    }
}

/// Ghosts of one bucket, keyed by record key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GhostStore {
    ghosts: BTreeMap<Key, Ghost>,
}

impl GhostStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Ghost> {
        self.ghosts.get(key)
    }

    /// Version of a key's ghost, if any.
    pub fn version(&self, key: &str) -> Option<Version> {
        self.ghosts.get(key).map(|g| g.version)
    }

    pub fn put(&mut self, key: impl Into<Key>, version: Version, snapshot: Attributes) {
        let ghost = Ghost::new(key, version, snapshot);
        self.ghosts.insert(ghost.key.clone(), ghost);
    }

    pub fn remove(&mut self, key: &str) -> Option<Ghost> {
        self.ghosts.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.ghosts.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.ghosts.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ghost> {
        self.ghosts.values()
    }

    pub fn len(&self) -> usize {
        self.ghosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ghosts.is_empty()
    }

    pub fn clear(&mut self) {
        self.ghosts.clear();
    }
}

impl FromIterator<Ghost> for GhostStore {
    fn from_iter<I: IntoIterator<Item = Ghost>>(iter: I) -> Self {
        Self {
            ghosts: iter.into_iter().map(|g| (g.key.clone(), g)).collect(),
        }
    }
}

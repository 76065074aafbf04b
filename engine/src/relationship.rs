//! Deferred linking of entity references.
//!
//! A record may reference a record that is not local yet. The reference is
//! kept as a [`PendingRelationship`] and the attribute is written once both
//! ends exist. Resolution is attempted whenever either end becomes present.

use crate::schema::Schema;
use crate::storage::Storage;
use crate::value::Value;
use crate::{error::Result, BucketName, Error, Key};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// A reference waiting for its target (or source) to be local.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRelationship {
    pub source_key: Key,
    pub source_attribute: String,
    pub source_bucket: BucketName,
    pub target_key: Key,
    pub target_bucket: BucketName,
}

impl PendingRelationship {
    pub fn new(
        source_key: impl Into<Key>,
        source_attribute: impl Into<String>,
        source_bucket: impl Into<BucketName>,
        target_key: impl Into<Key>,
        target_bucket: impl Into<BucketName>,
    ) -> Self {
        Self {
            source_key: source_key.into(),
            source_attribute: source_attribute.into(),
            source_bucket: source_bucket.into(),
            target_key: target_key.into(),
            target_bucket: target_bucket.into(),
        }
    }

    fn target(&self) -> (BucketName, Key) {
        (self.target_bucket.clone(), self.target_key.clone())
    }

    fn is_source(&self, bucket: &str, key: &str) -> bool {
        self.source_bucket == bucket && self.source_key == key
    }
}

/// Entry of the legacy persisted form, keyed by target key.
#[derive(Debug, Deserialize)]
struct LegacyPath {
    #[serde(rename = "SPPathKey")]
    key: Key,
    #[serde(rename = "SPPathBucket")]
    bucket: BucketName,
    #[serde(rename = "SPPathAttribute")]
    attribute: String,
}

/// Pending relationships, indexed by target.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationshipResolver {
    by_target: BTreeMap<(BucketName, Key), Vec<PendingRelationship>>,
}

impl RelationshipResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a relationship. Duplicates are ignored.
    pub fn add_pending(&mut self, relationship: PendingRelationship) {
        let entries = self.by_target.entry(relationship.target()).or_default();
        if !entries.contains(&relationship) {
            debug!(
                source = %relationship.source_key,
                target = %relationship.target_key,
                "relationship pending"
            );
            entries.push(relationship);
        }
    }

    /// Resolve everything that involves `(bucket, key)`, on either end.
    ///
    /// An entry is applied only when both its source and its target are in
    /// storage; the rest stay queued. Returns the applied entries.
    pub fn resolve(
        &mut self,
        storage: &dyn Storage,
        bucket: &str,
        key: &str,
    ) -> Vec<PendingRelationship> {
        let _section = storage.critical_section();
        let mut candidates: Vec<(BucketName, Key)> = self
            .by_target
            .iter()
            .filter(|(_, entries)| entries.iter().any(|r| r.is_source(bucket, key)))
            .map(|(target, _)| target.clone())
            .collect();
        candidates.push((bucket.to_string(), key.to_string()));
        candidates.sort();
        candidates.dedup();

        let mut resolved = Vec::new();
        for target in candidates {
            let Some(entries) = self.by_target.remove(&target) else {
                continue;
            };
            if !storage.contains(&target.0, &target.1) {
                self.by_target.insert(target, entries);
                continue;
            }
            let mut remaining = Vec::new();
            for relationship in entries {
                if self.link(storage, &relationship) {
                    resolved.push(relationship);
                } else {
                    remaining.push(relationship);
                }
            }
            if !remaining.is_empty() {
                self.by_target.insert(target, remaining);
            }
        }
        resolved
    }

    fn link(&self, storage: &dyn Storage, relationship: &PendingRelationship) -> bool {
        let Some(mut attrs) =
            storage.fetch(&relationship.source_bucket, &relationship.source_key)
        else {
            return false;
        };
        attrs.insert(
            relationship.source_attribute.clone(),
            Value::entity(relationship.target_key.clone()),
        );
        storage.insert(&relationship.source_bucket, &relationship.source_key, attrs);
        debug!(
            source = %relationship.source_key,
            attribute = %relationship.source_attribute,
            target = %relationship.target_key,
            "relationship resolved"
        );
        true
    }

    /// Whether some record is waiting for `(bucket, key)` to arrive.
    pub fn is_awaited(&self, bucket: &str, key: &str) -> bool {
        self.by_target
            .contains_key(&(bucket.to_string(), key.to_string()))
    }

    /// Entries whose source is `(bucket, key)`.
    pub fn pending_for_source<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
    ) -> impl Iterator<Item = &'a PendingRelationship> + 'a {
        self.iter().filter(move |r| r.is_source(bucket, key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingRelationship> {
        self.by_target.values().flatten()
    }

    /// Total number of pending relationships.
    pub fn count(&self) -> usize {
        self.by_target.values().map(Vec::len).sum()
    }

    /// Number of pending relationships between two keys.
    pub fn count_between(&self, source_key: &str, target_key: &str) -> usize {
        self.iter()
            .filter(|r| r.source_key == source_key && r.target_key == target_key)
            .count()
    }

    /// Drop every relationship whose source lives in `bucket`.
    pub fn reset_bucket(&mut self, bucket: &str) {
        for entries in self.by_target.values_mut() {
            entries.retain(|r| r.source_bucket != bucket);
        }
        self.by_target.retain(|_, entries| !entries.is_empty());
    }

    pub fn reset(&mut self) {
        self.by_target.clear();
    }

    /// Serialize to an array of dictionaries.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.iter()
                .map(|r| {
                    serde_json::json!({
                        "sourceKey": r.source_key,
                        "sourceAttribute": r.source_attribute,
                        "sourceBucket": r.source_bucket,
                        "targetKey": r.target_key,
                        "targetBucket": r.target_bucket,
                    })
                })
                .collect(),
        )
    }

    /// Parse the array form produced by [`RelationshipResolver::to_json`].
    pub fn parse(json: serde_json::Value) -> Result<Vec<PendingRelationship>> {
        serde_json::from_value(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Parse the legacy form: target key to a list of source paths.
    ///
    /// The legacy form does not carry the target bucket; it is looked up from
    /// the source bucket's entity member. Entries whose member is unknown are
    /// skipped.
    pub fn parse_legacy(
        json: serde_json::Value,
        schema: &Schema,
    ) -> Result<Vec<PendingRelationship>> {
        let raw: BTreeMap<Key, Vec<LegacyPath>> =
            serde_json::from_value(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;
        let mut out = Vec::new();
        for (target_key, paths) in raw {
            for path in paths {
                let target_bucket = schema
                    .buckets
                    .get(&path.bucket)
                    .and_then(|b| b.member(&path.attribute))
                    .and_then(|m| m.target_bucket.clone());
                if let Some(target_bucket) = target_bucket {
                    out.push(PendingRelationship::new(
                        path.key,
                        path.attribute,
                        path.bucket,
                        target_key.clone(),
                        target_bucket,
                    ));
                }
            }
        }
        Ok(out)
    }
}

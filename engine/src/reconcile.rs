//! Index reconciliation.
//!
//! A reconciliation pass pulls the server's full catalog of `(key, version)`
//! pairs page by page, then compares it with local state:
//!
//! 1. Remote keys that are missing locally, or whose ghost has another
//!    version, are fetched in full (one `e:` request each).
//! 2. Local keys the server does not know, and that carry no unsent local
//!    work, are deleted.
//! 3. Keys whose version matches are left alone.
//!
//! Once every fetch has landed, the server's change version becomes the
//! bucket's checkpoint. A later start with a checkpoint resumes from it
//! instead of reindexing.

use crate::ghost::GhostStore;
use crate::processor::Mode;
use crate::value::Attributes;
use crate::{BucketName, ChangeVersion, Key, Version};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// One entry of an index page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: Key,
    pub v: Version,
    /// Full data, when the server inlines it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<Attributes>,
}

/// A page of the server's catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexPage {
    pub index: Vec<IndexEntry>,
    /// Change version of the newest change in the bucket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<ChangeVersion>,
    /// Cursor of the next page; absent on the last one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mark: Option<String>,
}

/// Request for one index page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRequest {
    pub mark: Option<String>,
    pub limit: usize,
}

/// Work to do once the whole catalog is known.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexPlan {
    /// Versions to fetch in full.
    pub fetch: Vec<(Key, Version)>,
    /// Full versions delivered inline with the index.
    pub apply: Vec<(Key, Version, Attributes)>,
    /// Local keys to delete.
    pub delete: Vec<Key>,
    /// Keys already up to date.
    pub unchanged: Vec<Key>,
    /// Checkpoint to persist now; `None` while fetches are outstanding.
    pub checkpoint: Option<ChangeVersion>,
}

/// Outcome of processing a page.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Request the next page.
    NextPage(IndexRequest),
    /// The catalog is complete.
    Complete(IndexPlan),
    /// No pass is running (it was aborted); the page is dropped.
    Ignored,
}

#[derive(Debug, Clone, Default)]
struct Pass {
    remote: BTreeMap<Key, (Version, Option<Attributes>)>,
    current: Option<ChangeVersion>,
    pages: usize,
}

/// Drives reconciliation passes for one bucket.
#[derive(Debug, Clone)]
pub struct IndexProcessor {
    bucket: BucketName,
    page_size: usize,
    pass: Option<Pass>,
    /// Fetches of the finished pass still outstanding.
    awaiting: BTreeSet<Key>,
    /// Checkpoint to commit once `awaiting` drains.
    pending_checkpoint: Option<ChangeVersion>,
    checkpoint: Option<ChangeVersion>,
    rebase_all: bool,
    rebase_keys: BTreeSet<Key>,
    reload_keys: BTreeSet<Key>,
}

impl IndexProcessor {
    pub fn new(bucket: impl Into<BucketName>, page_size: usize) -> Self {
        Self {
            bucket: bucket.into(),
            page_size,
            pass: None,
            awaiting: BTreeSet::new(),
            pending_checkpoint: None,
            checkpoint: None,
            rebase_all: true,
            rebase_keys: BTreeSet::new(),
            reload_keys: BTreeSet::new(),
        }
    }

    /// Start a pass. Any running pass is discarded.
    pub fn start(&mut self) -> IndexRequest {
        info!(bucket = %self.bucket, "index started");
        self.pass = Some(Pass::default());
        self.awaiting.clear();
        self.pending_checkpoint = None;
        IndexRequest {
            mark: None,
            limit: self.page_size,
        }
    }

    /// Whether a pass is collecting pages or waiting on fetches.
    pub fn is_indexing(&self) -> bool {
        self.pass.is_some() || !self.awaiting.is_empty()
    }

    /// Abort the running pass. Late pages and fetches are ignored.
    pub fn abort(&mut self) {
        if self.is_indexing() {
            debug!(bucket = %self.bucket, "index aborted");
        }
        self.pass = None;
        self.awaiting.clear();
        self.pending_checkpoint = None;
    }

    /// Process one page.
    ///
    /// `local_keys` are the keys present in storage; `has_local_changes`
    /// protects keys with unsent work from deletion.
    pub fn process_page(
        &mut self,
        page: IndexPage,
        ghosts: &GhostStore,
        local_keys: &BTreeSet<Key>,
        has_local_changes: &dyn Fn(&str) -> bool,
    ) -> Step {
        let Some(pass) = self.pass.as_mut() else {
            return Step::Ignored;
        };
        pass.pages += 1;
        if pass.current.is_none() {
            pass.current = page.current;
        }
        for entry in page.index {
            pass.remote.insert(entry.id, (entry.v, entry.d));
        }
        debug!(bucket = %self.bucket, page = pass.pages, keys = pass.remote.len(), "index page");

        if let Some(mark) = page.mark.filter(|m| !m.is_empty()) {
            return Step::NextPage(IndexRequest {
                mark: Some(mark),
                limit: self.page_size,
            });
        }

        let Some(pass) = self.pass.take() else {
            return Step::Ignored;
        };
        Step::Complete(self.plan(pass, ghosts, local_keys, has_local_changes))
    }

    fn plan(
        &mut self,
        pass: Pass,
        ghosts: &GhostStore,
        local_keys: &BTreeSet<Key>,
        has_local_changes: &dyn Fn(&str) -> bool,
    ) -> IndexPlan {
        let mut plan = IndexPlan::default();

        for (key, (version, data)) in &pass.remote {
            if ghosts.version(key) == Some(*version) && local_keys.contains(key) {
                plan.unchanged.push(key.clone());
                continue;
            }
            match data {
                Some(data) => plan.apply.push((key.clone(), *version, data.clone())),
                None => plan.fetch.push((key.clone(), *version)),
            }
        }

        let local: BTreeSet<&Key> = ghosts.keys().chain(local_keys.iter()).collect();
        plan.delete = local
            .into_iter()
            .filter(|key| !pass.remote.contains_key(*key) && !has_local_changes(key))
            .cloned()
            .collect();

        self.awaiting = plan.fetch.iter().map(|(key, _)| key.clone()).collect();
        if self.awaiting.is_empty() {
            plan.checkpoint = pass.current.clone();
            self.commit(pass.current);
        } else {
            self.pending_checkpoint = pass.current;
        }

        info!(
            bucket = %self.bucket,
            fetch = plan.fetch.len(),
            delete = plan.delete.len(),
            unchanged = plan.unchanged.len(),
            "index complete"
        );
        plan
    }

    /// Record that a fetched version landed.
    ///
    /// Returns true when it was the last outstanding fetch of the pass; the
    /// checkpoint is committed at that point.
    pub fn version_received(&mut self, key: &str) -> bool {
        if !self.awaiting.remove(key) || !self.awaiting.is_empty() {
            return false;
        }
        let checkpoint = self.pending_checkpoint.take();
        self.commit(checkpoint);
        true
    }

    /// Whether a fetch of `key` belongs to the running pass.
    pub fn is_awaiting(&self, key: &str) -> bool {
        self.awaiting.contains(key)
    }

    fn commit(&mut self, checkpoint: Option<ChangeVersion>) {
        if checkpoint.is_some() {
            self.checkpoint = checkpoint;
        }
        self.reload_keys.clear();
    }

    pub fn checkpoint(&self) -> Option<&ChangeVersion> {
        self.checkpoint.as_ref()
    }

    /// Advance the checkpoint, e.g. from the `cv` of a processed change.
    pub fn set_checkpoint(&mut self, checkpoint: Option<ChangeVersion>) {
        self.checkpoint = checkpoint;
    }

    /// How a fetched version treats local edits of `key`.
    pub fn mode(&self, key: &str) -> Mode {
        if self.reload_keys.contains(key) {
            Mode::Reload
        } else if self.rebase_all || self.rebase_keys.contains(key) {
            Mode::Rebase
        } else {
            Mode::Reload
        }
    }

    pub fn enable_rebase_for_all(&mut self) {
        self.rebase_all = true;
    }

    /// Rebase only keys enabled one by one.
    pub fn disable_rebase_for_all(&mut self) {
        self.rebase_all = false;
    }

    pub fn enable_rebase_for_key(&mut self, key: impl Into<Key>) {
        self.rebase_keys.insert(key.into());
    }

    pub fn disable_rebase_for_key(&mut self, key: &str) {
        self.rebase_keys.remove(key);
    }

    /// Let the server's data win for `key`, e.g. a record first discovered
    /// through a relationship.
    pub fn enable_reload_for_key(&mut self, key: impl Into<Key>) {
        self.reload_keys.insert(key.into());
    }

    pub fn disable_reload_for_all(&mut self) {
        self.reload_keys.clear();
    }

    /// Ghost version of every key known locally.
    pub fn export_index_status(&self, ghosts: &GhostStore) -> BTreeMap<Key, Version> {
        ghosts.iter().map(|g| (g.key.clone(), g.version)).collect()
    }

    pub fn reset(&mut self) {
        self.abort();
        self.checkpoint = None;
        self.rebase_keys.clear();
        self.reload_keys.clear();
        self.rebase_all = true;
    }
}

//! Per-bucket sync state machine.
//!
//! A [`Bucket`] drives the sync of one bucket over a [`Storage`]. It owns
//! the ghosts, the [`ChangeProcessor`] and the [`IndexProcessor`], and it
//! shares a [`RelationshipResolver`] with the other buckets of a client.
//!
//! The bucket does no IO. Every call returns [`Effects`]: the messages to
//! send on the bucket's channel and the retries to schedule. Calls are
//! expected to come from one worker at a time, so ghost updates are never
//! observed half-done.

use crate::change::{Change, Operation};
use crate::config::SyncConfig;
use crate::error::{Recovery, Result, SyncError};
use crate::ghost::GhostStore;
use crate::listener::{BucketListener, ChangeType, NoopListener};
use crate::processor::{Capture, ChangeProcessor, FollowUp, Mode, Remote};
use crate::protocol::{Inbound, Outbound};
use crate::reconcile::{IndexPage, IndexPlan, IndexProcessor, Step};
use crate::relationship::{PendingRelationship, RelationshipResolver};
use crate::schema::BucketSchema;
use crate::snapshot::{BucketSnapshot, SavedChange};
use crate::storage::Storage;
use crate::value::{Attributes, Value};
use crate::{BucketName, ChangeVersion, Error, Key, Version};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What a bucket call asks its driver to do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Effects {
    /// Messages for the bucket's channel, in order.
    pub outbound: Vec<Outbound>,
    /// Keys to pass to [`Bucket::retry`] once the delay has passed.
    pub retries: Vec<(Key, Duration)>,
    /// Sync errors handled during the call.
    pub errors: Vec<SyncError>,
    /// Local records the schema rejected.
    pub rejected: Vec<(Key, Error)>,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty()
            && self.retries.is_empty()
            && self.errors.is_empty()
            && self.rejected.is_empty()
    }

    /// Append another call's effects.
    pub fn merge(&mut self, other: Effects) {
        self.outbound.extend(other.outbound);
        self.retries.extend(other.retries);
        self.errors.extend(other.errors);
        self.rejected.extend(other.rejected);
    }
}

/// Counters describing a bucket's sync state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketStatus {
    pub bucket: BucketName,
    pub checkpoint: Option<ChangeVersion>,
    pub indexing: bool,
    pub pending: usize,
    pub queued: usize,
    pub deletions: usize,
    pub retries: usize,
    pub saturated: bool,
    pub relationships: usize,
    /// Ghost version of every known key
    pub versions: BTreeMap<Key, Version>,
}

/// Sync state machine of one bucket.
pub struct Bucket {
    schema: BucketSchema,
    storage: Arc<dyn Storage>,
    resolver: Arc<Mutex<RelationshipResolver>>,
    listener: Arc<dyn BucketListener>,
    ghosts: GhostStore,
    changes: ChangeProcessor,
    index: IndexProcessor,
    /// Versions requested through `request_versions`
    version_requests: BTreeSet<(Key, Version)>,
    /// Keys re-downloaded after an integrity failure
    refetching: BTreeSet<Key>,
}

impl Bucket {
    pub fn new(schema: BucketSchema, config: Arc<SyncConfig>, storage: Arc<dyn Storage>) -> Self {
        let policy = schema.policy();
        Self {
            changes: ChangeProcessor::new(schema.name.clone(), Arc::clone(&config), policy),
            index: IndexProcessor::new(schema.name.clone(), config.index_page_size),
            schema,
            storage,
            resolver: Arc::new(Mutex::new(RelationshipResolver::new())),
            listener: Arc::new(NoopListener),
            ghosts: GhostStore::new(),
            version_requests: BTreeSet::new(),
            refetching: BTreeSet::new(),
        }
    }

    /// Share a resolver with the other buckets of the client.
    pub fn with_resolver(mut self, resolver: Arc<Mutex<RelationshipResolver>>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn BucketListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn name(&self) -> &BucketName {
        &self.schema.name
    }

    pub fn schema(&self) -> &BucketSchema {
        &self.schema
    }

    pub fn ghosts(&self) -> &GhostStore {
        &self.ghosts
    }

    pub fn changes(&self) -> &ChangeProcessor {
        &self.changes
    }

    pub fn index(&self) -> &IndexProcessor {
        &self.index
    }

    /// Access to the rebase/reload switches.
    pub fn index_mut(&mut self) -> &mut IndexProcessor {
        &mut self.index
    }

    pub fn has_local_changes(&self, key: &str) -> bool {
        self.changes.has_local_changes(key)
    }

    pub fn discard_pending_changes(&mut self, key: &str) {
        self.changes.discard_pending_changes(key);
    }

    pub fn export_pending_changes(&self) -> Vec<Change> {
        self.changes.export_pending_changes()
    }

    /// Begin syncing on a fresh connection.
    ///
    /// Resumes from the checkpoint when there is one and reindexes
    /// otherwise. Changes left unacknowledged by a previous connection are
    /// rebuilt and sent again.
    pub fn start(&mut self) -> Effects {
        let mut fx = Effects::default();
        match self.index.checkpoint().cloned() {
            Some(cv) => fx.outbound.push(Outbound::ChangeVersion(cv)),
            None => self.start_index(&mut fx),
        }

        self.changes.requeue_pending();
        let keys: Vec<Key> = self.changes.retry_changes().map(|c| c.key.clone()).collect();
        for key in keys {
            self.resend(&key, false, &mut fx);
        }
        fx
    }

    /// Capture records the app inserted or updated.
    pub fn local_save(&mut self, keys: &[Key]) -> Effects {
        let mut fx = Effects::default();
        for key in keys {
            self.capture(key, &mut fx);
        }
        fx
    }

    /// Capture records the app deleted.
    pub fn local_delete(&mut self, keys: &[Key]) -> Effects {
        let mut fx = Effects::default();
        for key in keys {
            self.capture_deletion(key, &mut fx);
        }
        fx
    }

    /// Process a message received on the bucket's channel.
    pub fn handle(&mut self, inbound: Inbound) -> Effects {
        let mut fx = Effects::default();
        match inbound {
            Inbound::Index(page) => self.process_index_page(page, &mut fx),
            Inbound::Changes(changes) => self.process_changes(changes, &mut fx),
            Inbound::UnknownChangeVersion => {
                info!(bucket = %self.name(), "checkpoint unknown to the server, reindexing");
                self.start_index(&mut fx);
            }
            Inbound::ChangeVersion(cv) => {
                if !self.index.is_indexing() {
                    debug!(bucket = %self.name(), cv = %cv, "checkpoint marker");
                    self.index.set_checkpoint(Some(cv));
                }
            }
            Inbound::Entity { key, version, data } => {
                self.process_entity(key, version, data, &mut fx)
            }
        }
        self.flush_queued(&mut fx);
        fx
    }

    /// Resend the change waiting in `key`'s retry slot.
    ///
    /// Late timers (after a reset or an ack) find nothing to resend.
    pub fn retry(&mut self, key: &str) -> Effects {
        let mut fx = Effects::default();
        if self.changes.retry_changes().any(|c| c.key == key) {
            self.resend(key, false, &mut fx);
        }
        fx
    }

    /// Send `key` again with full data so the server overwrites its copy.
    pub fn retry_with_full_data(&mut self, key: &str) -> Effects {
        let mut fx = Effects::default();
        self.resend(key, true, &mut fx);
        fx
    }

    /// Start a reconciliation pass.
    pub fn reindex(&mut self) -> Effects {
        let mut fx = Effects::default();
        self.start_index(&mut fx);
        fx
    }

    /// Request the last `count` versions of `key`.
    ///
    /// Answers go to
    /// [`did_receive_object_version`](BucketListener::did_receive_object_version)
    /// and never touch storage.
    pub fn request_versions(&mut self, key: &str, count: u64) -> Effects {
        let mut fx = Effects::default();
        let Some(latest) = self.ghosts.version(key) else {
            debug!(bucket = %self.name(), key, "no versions known");
            return fx;
        };
        if count == 0 {
            return fx;
        }
        let first = latest.saturating_sub(count - 1).max(1);
        for version in first..=latest {
            self.version_requests.insert((key.to_string(), version));
            fx.outbound.push(Outbound::Entity {
                key: key.to_string(),
                version,
            });
        }
        fx
    }

    /// Drop all queued and in-flight work and abort indexing.
    ///
    /// Ghosts and the checkpoint survive; unsent edits are recaptured from
    /// the ghosts on the next save.
    pub fn reset(&mut self) {
        info!(bucket = %self.name(), "bucket reset");
        self.changes.reset();
        self.index.abort();
        self.version_requests.clear();
        self.refetching.clear();
        self.resolver.lock().reset_bucket(&self.schema.name);
    }

    pub fn snapshot(&self) -> BucketSnapshot {
        let mut snapshot = BucketSnapshot::new(self.name().clone());
        snapshot.checkpoint = self.index.checkpoint().cloned();
        for ghost in self.ghosts.iter() {
            snapshot.add_ghost(ghost.clone());
        }
        snapshot.pending = self
            .changes
            .export_pending_changes()
            .into_iter()
            .map(SavedChange::from)
            .collect();
        snapshot.relationships = self
            .resolver
            .lock()
            .iter()
            .filter(|r| &r.source_bucket == self.name())
            .cloned()
            .collect();
        snapshot
    }

    /// Replace the sync state with a snapshot. Restored changes are sent on
    /// the next [`start`](Self::start).
    pub fn restore(&mut self, snapshot: BucketSnapshot) -> Result<()> {
        snapshot.validate(&self.schema)?;
        self.reset();

        let ghosts: GhostStore = snapshot
            .ghosts
            .into_values()
            .map(|mut ghost| {
                ghost.snapshot = self.schema.decode(ghost.snapshot);
                ghost
            })
            .collect();
        self.ghosts = ghosts;
        self.index.set_checkpoint(snapshot.checkpoint);

        let pending: Vec<Change> = snapshot
            .pending
            .into_iter()
            .map(|saved| self.decode(saved.into()))
            .collect();
        self.changes.restore(pending);

        let mut resolver = self.resolver.lock();
        for relationship in snapshot.relationships {
            resolver.add_pending(relationship);
        }
        info!(bucket = %self.schema.name, ghosts = self.ghosts.len(), "bucket restored");
        Ok(())
    }

    pub fn export_status(&self) -> BucketStatus {
        BucketStatus {
            bucket: self.name().clone(),
            checkpoint: self.index.checkpoint().cloned(),
            indexing: self.index.is_indexing(),
            pending: self.changes.num_changes_pending(),
            queued: self.changes.num_keys_with_more_changes(),
            deletions: self.changes.num_keys_to_delete(),
            retries: self.changes.num_retries(),
            saturated: self.changes.reached_max_pendings(),
            relationships: self
                .resolver
                .lock()
                .iter()
                .filter(|r| &r.source_bucket == self.name())
                .count(),
            versions: self.index.export_index_status(&self.ghosts),
        }
    }

    // Local edits

    fn capture(&mut self, key: &str, fx: &mut Effects) {
        let Some(current) = self.current(key) else {
            return self.capture_deletion(key, fx);
        };
        if let Err(error) = self.schema.validate(&current) {
            warn!(bucket = %self.name(), key, %error, "record rejected");
            fx.rejected.push((key.to_string(), error));
            return;
        }
        let is_new = !self.ghosts.contains(key);
        match self.changes.capture_local_change(key, &current, &self.ghosts) {
            Capture::Send(change) => fx.outbound.push(Outbound::Change(change)),
            Capture::Saturated => self.listener.did_saturate(self.name()),
            Capture::Deferred | Capture::NoChanges => {}
        }
        if is_new {
            // may be the target of references received earlier
            self.resolve(key);
        }
    }

    fn capture_deletion(&mut self, key: &str, fx: &mut Effects) {
        if let Capture::Send(change) = self.changes.capture_local_deletion(key, &self.ghosts) {
            fx.outbound.push(Outbound::Change(change));
        }
    }

    fn resend(&mut self, key: &str, override_remote: bool, fx: &mut Effects) {
        let current = self.current(key);
        match self
            .changes
            .retry(key, current.as_ref(), &self.ghosts, override_remote)
        {
            Some(change) => fx.outbound.push(Outbound::Change(change)),
            None => self.follow_up(key, fx),
        }
    }

    fn follow_up(&mut self, key: &str, fx: &mut Effects) {
        match self.changes.take_follow_up(key) {
            FollowUp::Recapture => self.capture(key, fx),
            FollowUp::Delete => self.capture_deletion(key, fx),
            FollowUp::None => {}
        }
    }

    /// Capture queued keys while there is room in flight.
    fn flush_queued(&mut self, fx: &mut Effects) {
        if self.index.is_indexing() {
            return;
        }
        let keys: Vec<Key> = self
            .changes
            .queued_deletions()
            .chain(self.changes.queued_keys())
            .cloned()
            .collect();
        for key in keys {
            if self.changes.reached_max_pendings() {
                break;
            }
            self.follow_up(&key, fx);
        }
    }

    /// Synced attributes of `key`, with unresolved references filled in.
    fn current(&self, key: &str) -> Option<Attributes> {
        let overlay = self.overlay(key);
        self.read(key, &overlay)
    }

    fn overlay(&self, key: &str) -> Vec<PendingRelationship> {
        self.resolver
            .lock()
            .pending_for_source(&self.schema.name, key)
            .cloned()
            .collect()
    }

    fn read(&self, key: &str, overlay: &[PendingRelationship]) -> Option<Attributes> {
        let record = self.storage.fetch(self.name(), key)?;
        let mut current = self.schema.project(&record);
        for relationship in overlay {
            current
                .entry(relationship.source_attribute.clone())
                .or_insert_with(|| Value::entity(relationship.target_key.clone()));
        }
        Some(current)
    }

    // Server messages

    fn process_changes(&mut self, changes: Vec<Change>, fx: &mut Effects) {
        for change in changes {
            let change = self.decode(change);
            if let Some(code) = change.error {
                self.process_error(&change, code, fx);
                continue;
            }
            if self.changes.is_ack(&change) {
                self.process_ack(&change, fx);
            } else {
                self.apply_remote(&change, Mode::Rebase, fx);
            }
            if change.change_version.is_some() && !self.index.is_indexing() {
                self.index.set_checkpoint(change.change_version.clone());
            }
        }
    }

    fn process_ack(&mut self, ack: &Change, fx: &mut Effects) {
        match self.changes.process_ack(ack, &mut self.ghosts) {
            Ok(acked) => {
                if acked.operation == Operation::Remove {
                    self.listener.did_acknowledge_delete(self.name(), &acked.key);
                } else {
                    let members: Vec<String> = ack
                        .diff
                        .as_ref()
                        .map(|diff| diff.keys().cloned().collect())
                        .unwrap_or_default();
                    self.listener.did_change_object(
                        self.name(),
                        &acked.key,
                        ChangeType::Acknowledge,
                        &members,
                    );
                }
                match acked.follow_up {
                    FollowUp::Recapture => self.capture(&acked.key, fx),
                    FollowUp::Delete => self.capture_deletion(&acked.key, fx),
                    FollowUp::None => {}
                }
            }
            Err(error) => self.recover(error, ack.end_version, fx),
        }
    }

    fn process_error(&mut self, change: &Change, code: u16, fx: &mut Effects) {
        let Some(failure) = self.changes.process_error(change, code) else {
            return;
        };
        if let Some(delay) = failure.retry_after {
            fx.retries.push((failure.error.key().clone(), delay));
        }
        self.recover(failure.error, change.end_version, fx);
    }

    /// Apply a change from the server and write the result to storage.
    fn apply_remote(&mut self, change: &Change, mode: Mode, fx: &mut Effects) {
        let key = change.key.clone();
        let overlay = self.overlay(&key);
        let storage = Arc::clone(&self.storage);
        let section = storage.critical_section();

        let current = self.read(&key, &overlay);
        let outcome = match self.changes.process_remote_change_with(
            change,
            current.as_ref(),
            &mut self.ghosts,
            mode,
        ) {
            Ok(outcome) => outcome,
            Err(error) => {
                drop(section);
                return self.recover(error, change.end_version, fx);
            }
        };

        match outcome {
            Remote::Updated {
                value,
                inserted,
                members,
            } => {
                self.listener
                    .will_change_objects(self.name(), std::slice::from_ref(&key));
                let (record, unresolved) = self.to_record(&key, value);
                storage.insert(self.name(), &key, record);
                drop(section);

                if !unresolved.is_empty() {
                    let mut resolver = self.resolver.lock();
                    for relationship in unresolved {
                        resolver.add_pending(relationship);
                    }
                }
                self.resolve(&key);

                let change_type = if inserted {
                    ChangeType::Insert
                } else {
                    ChangeType::Update
                };
                self.listener
                    .did_change_object(self.name(), &key, change_type, &members);
            }
            Remote::Deleted => {
                self.listener
                    .will_change_objects(self.name(), std::slice::from_ref(&key));
                let existed = storage.delete(self.name(), &key);
                drop(section);
                if existed {
                    self.listener
                        .did_change_object(self.name(), &key, ChangeType::Delete, &[]);
                }
            }
            Remote::BaselineOnly | Remote::AlreadyApplied => {}
        }
    }

    /// Merge synced attributes into the stored record.
    ///
    /// References to records that are not in storage yet are left out and
    /// returned as pending relationships.
    fn to_record(&self, key: &str, value: Attributes) -> (Attributes, Vec<PendingRelationship>) {
        let mut record: Attributes = self
            .storage
            .fetch(self.name(), key)
            .unwrap_or_default()
            .into_iter()
            .filter(|(name, _)| !self.schema.tracks(name))
            .collect();

        let unresolved: Vec<PendingRelationship> = self
            .schema
            .references(&value)
            .filter(|(_, bucket, target)| !self.storage.contains(bucket, target))
            .map(|(member, bucket, target)| {
                PendingRelationship::new(key, member, self.name().clone(), target, bucket.clone())
            })
            .collect();

        record.extend(value);
        for relationship in &unresolved {
            record.remove(&relationship.source_attribute);
        }
        (record, unresolved)
    }

    fn resolve(&self, key: &str) {
        let resolved = self
            .resolver
            .lock()
            .resolve(self.storage.as_ref(), &self.schema.name, key);
        for relationship in resolved {
            self.listener.did_change_object(
                &relationship.source_bucket,
                &relationship.source_key,
                ChangeType::Update,
                std::slice::from_ref(&relationship.source_attribute),
            );
        }
    }

    fn process_index_page(&mut self, page: IndexPage, fx: &mut Effects) {
        let local_keys: BTreeSet<Key> = self
            .storage
            .enumerate(&self.schema.name, None)
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        let changes = &self.changes;
        let step = self.index.process_page(page, &self.ghosts, &local_keys, &|key: &str| {
            changes.has_local_changes(key)
        });
        match step {
            Step::NextPage(request) => fx.outbound.push(Outbound::Index(request)),
            Step::Complete(plan) => self.execute(plan, fx),
            Step::Ignored => debug!(bucket = %self.name(), "index page ignored"),
        }
    }

    fn execute(&mut self, plan: IndexPlan, fx: &mut Effects) {
        let storage = Arc::clone(&self.storage);
        for key in plan.delete {
            let section = storage.critical_section();
            self.ghosts.remove(&key);
            self.listener
                .will_change_objects(self.name(), std::slice::from_ref(&key));
            let existed = storage.delete(self.name(), &key);
            drop(section);
            if existed {
                self.listener
                    .did_change_object(self.name(), &key, ChangeType::Delete, &[]);
            }
        }

        for (key, version, data) in plan.apply {
            self.forget_orphaned_ghost(&key);
            let mode = self.index_mode(&key);
            let change = self.decode(Change::version(key, version, data));
            self.apply_remote(&change, mode, fx);
        }

        for (key, version) in plan.fetch.iter().cloned() {
            fx.outbound.push(Outbound::Entity { key, version });
        }
        if plan.fetch.is_empty() {
            self.listener.did_finish_indexing(self.name());
        }
    }

    /// A ghost without a record (and without local work) cannot be
    /// refreshed by a version it already has; drop it so the record is
    /// written again.
    fn forget_orphaned_ghost(&mut self, key: &str) {
        if !self.storage.contains(self.name(), key) && !self.changes.has_local_changes(key) {
            self.ghosts.remove(key);
        }
    }

    fn process_entity(
        &mut self,
        key: Key,
        version: Version,
        data: Option<Attributes>,
        fx: &mut Effects,
    ) {
        if self.version_requests.remove(&(key.clone(), version)) {
            match data {
                Some(data) => {
                    let data = self.schema.decode(data);
                    self.listener
                        .did_receive_object_version(self.name(), &key, version, &data);
                }
                None => warn!(bucket = %self.name(), key = %key, version, "version not found"),
            }
            return;
        }

        let refetch = self.refetching.remove(&key);
        let indexed = self.index.is_awaiting(&key);
        if !refetch && !indexed {
            debug!(bucket = %self.name(), key = %key, version, "unrequested version ignored");
            return;
        }

        match data {
            Some(data) => {
                let mode = if refetch {
                    self.ghosts.remove(&key);
                    Mode::Reload
                } else {
                    self.forget_orphaned_ghost(&key);
                    self.index_mode(&key)
                };
                let change = self.decode(Change::version(key.clone(), version, data));
                self.apply_remote(&change, mode, fx);
            }
            None => warn!(bucket = %self.name(), key = %key, version, "version not found"),
        }

        if indexed && self.index.version_received(&key) {
            info!(bucket = %self.name(), "index finished");
            self.listener.did_finish_indexing(self.name());
        }
    }

    /// Records first discovered through a reference, from this bucket or
    /// another, take the server's data as is.
    fn index_mode(&self, key: &str) -> Mode {
        if !self.ghosts.contains(key) && self.resolver.lock().is_awaited(self.name(), key) {
            return Mode::Reload;
        }
        self.index.mode(key)
    }

    fn start_index(&mut self, fx: &mut Effects) {
        self.listener.will_start_indexing(self.name());
        fx.outbound.push(Outbound::Index(self.index.start()));
    }

    /// Run the recovery of a sync error and report it.
    fn recover(&mut self, error: SyncError, version: Option<Version>, fx: &mut Effects) {
        let key = error.key().clone();
        warn!(bucket = %self.name(), key = %key, %error, "sync error");
        match error.recovery() {
            Recovery::Drop => self.follow_up(&key, fx),
            Recovery::SendFullData => self.resend(&key, true, fx),
            Recovery::Refetch => {
                self.changes.requeue(key.clone());
                match version.or_else(|| self.ghosts.version(&key)) {
                    Some(version) => {
                        self.refetching.insert(key.clone());
                        fx.outbound.push(Outbound::Entity { key, version });
                    }
                    None => self.start_index(fx),
                }
            }
            Recovery::Reindex => {
                self.changes.requeue(key);
                if !self.index.is_indexing() {
                    self.start_index(fx);
                }
            }
            // the delay was scheduled with the failure
            Recovery::Retry => {}
            Recovery::Surface => {}
        }
        self.listener.did_fail(&self.schema.name, &error);
        fx.errors.push(error);
    }

    /// Re-type references in a change received from the server.
    fn decode(&self, mut change: Change) -> Change {
        change.diff = change.diff.map(|diff| self.schema.decode_diff(diff));
        change.data = change.data.map(|data| self.schema.decode(data));
        change
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("name", &self.schema.name)
            .field("ghosts", &self.ghosts.len())
            .field("pending", &self.changes.num_changes_pending())
            .field("indexing", &self.index.is_indexing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::diff::diff_attributes;
    use crate::reconcile::{IndexEntry, IndexRequest};
    use crate::schema::{Member, MemberType};
    use crate::storage::MemoryStorage;
    use crate::value::attributes;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock())
        }

        fn push(&self, event: String) {
            self.events.lock().push(event);
        }
    }

    impl BucketListener for Recorder {
        fn did_change_object(
            &self,
            bucket: &str,
            key: &str,
            change: ChangeType,
            _members: &[String],
        ) {
            self.push(format!("{change:?} {bucket}/{key}"));
        }

        fn did_finish_indexing(&self, bucket: &str) {
            self.push(format!("indexed {bucket}"));
        }

        fn did_receive_object_version(
            &self,
            _bucket: &str,
            key: &str,
            version: Version,
            _data: &Attributes,
        ) {
            self.push(format!("version {key}.{version}"));
        }

        fn did_acknowledge_delete(&self, _bucket: &str, key: &str) {
            self.push(format!("deleted {key}"));
        }

        fn did_fail(&self, _bucket: &str, error: &SyncError) {
            self.push(format!("failed {}", error.key()));
        }
    }

    fn notes() -> BucketSchema {
        BucketSchema::new(
            "notes",
            vec![
                Member::new("content", MemberType::Text),
                Member::new("views", MemberType::Number),
                Member::entity("folder", "folders"),
            ],
        )
    }

    fn config() -> Arc<SyncConfig> {
        Arc::new(
            SyncConfig::new("me")
                .with_max_pending(2)
                .with_retry(RetryConfig::new(2)),
        )
    }

    fn bucket(storage: &Arc<MemoryStorage>, recorder: &Arc<Recorder>) -> Bucket {
        let storage: Arc<dyn Storage> = storage.clone();
        Bucket::new(notes(), config(), storage).with_listener(recorder.clone())
    }

    fn sent(fx: &Effects) -> Vec<Change> {
        fx.outbound
            .iter()
            .filter_map(|message| match message {
                Outbound::Change(change) => Some(change.clone()),
                _ => None,
            })
            .collect()
    }

    fn ack(change: &Change, version: Version, cv: &str) -> Inbound {
        let mut ack = change.clone();
        ack.ccids = vec![change.ccid.clone()];
        ack.end_version = Some(version);
        ack.change_version = Some(cv.to_string());
        Inbound::Changes(vec![ack])
    }

    /// Seed a record known to both sides at `version`.
    fn seed(bucket: &mut Bucket, storage: &MemoryStorage, key: &str, version: Version, data: serde_json::Value) {
        let attrs = bucket.schema.decode(attributes(data));
        storage.insert("notes", key, attrs.clone());
        bucket.ghosts.put(key, version, attrs);
    }

    #[test]
    fn start_resumes_or_indexes() {
        let storage = Arc::new(MemoryStorage::new());
        let recorder = Arc::new(Recorder::default());
        let mut bucket = bucket(&storage, &recorder);

        let fx = bucket.start();
        assert_eq!(
            fx.outbound,
            vec![Outbound::Index(IndexRequest {
                mark: None,
                limit: 500
            })]
        );

        bucket.index.abort();
        bucket.index.set_checkpoint(Some("cv-7".into()));
        let fx = bucket.start();
        assert_eq!(fx.outbound, vec![Outbound::ChangeVersion("cv-7".into())]);
    }

    #[test]
    fn local_insert_is_sent_and_acknowledged() {
        let storage = Arc::new(MemoryStorage::new());
        let recorder = Arc::new(Recorder::default());
        let mut bucket = bucket(&storage, &recorder);

        storage.insert("notes", "n1", attributes(json!({"content": "hi", "local": true})));
        let fx = bucket.local_save(&["n1".to_string()]);
        let changes = sent(&fx);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].operation, Operation::Add);
        assert!(!changes[0].diff.as_ref().unwrap().contains_key("local"));

        let fx = bucket.handle(ack(&changes[0], 1, "cv-1"));
        assert!(fx.is_empty());
        assert_eq!(bucket.ghosts.version("n1"), Some(1));
        assert_eq!(bucket.index.checkpoint().map(String::as_str), Some("cv-1"));
        assert_eq!(recorder.take(), vec!["Acknowledge notes/n1"]);
    }

    #[test]
    fn one_change_in_flight_per_key() {
        let storage = Arc::new(MemoryStorage::new());
        let recorder = Arc::new(Recorder::default());
        let mut bucket = bucket(&storage, &recorder);
        seed(&mut bucket, &storage, "n1", 1, json!({"views": 1}));

        storage.insert("notes", "n1", attributes(json!({"views": 2})));
        let first = sent(&bucket.local_save(&["n1".to_string()]));
        storage.insert("notes", "n1", attributes(json!({"views": 5})));
        assert!(sent(&bucket.local_save(&["n1".to_string()])).is_empty());
        assert_eq!(bucket.changes.num_keys_with_more_changes(), 1);

        let fx = bucket.handle(ack(&first[0], 2, "cv-2"));
        let second = sent(&fx);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].start_version, Some(2));
        assert_eq!(
            second[0].diff.as_ref().unwrap()["views"],
            crate::diff::DiffOp::Increment(crate::value::Number::Int(3))
        );
    }

    #[test]
    fn remote_change_is_rebased_onto_local_edit() {
        let storage = Arc::new(MemoryStorage::new());
        let recorder = Arc::new(Recorder::default());
        let mut bucket = bucket(&storage, &recorder);
        seed(&mut bucket, &storage, "n1", 1, json!({"content": "abc"}));

        storage.insert("notes", "n1", attributes(json!({"content": "abcX"})));
        let base = bucket.ghosts.get("n1").unwrap().snapshot.clone();
        let remote = attributes(json!({"content": "Yabc"}));
        let diff = diff_attributes(&base, &remote, &notes().policy());
        let change = Change::modify("n1", "other", 1, diff)
            .with_end_version(2)
            .with_change_version("cv-2");

        bucket.handle(Inbound::Changes(vec![change]));
        assert_eq!(
            storage.fetch("notes", "n1").unwrap()["content"],
            Value::from("YabcX")
        );
        assert_eq!(bucket.ghosts.get("n1").unwrap().snapshot, remote);
        assert_eq!(recorder.take(), vec!["Update notes/n1"]);

        // the local edit is still unsent and diffs against the new ghost
        let fx = bucket.local_save(&["n1".to_string()]);
        assert_eq!(sent(&fx)[0].start_version, Some(2));
    }

    #[test]
    fn relationship_resolves_when_target_arrives() {
        let storage = Arc::new(MemoryStorage::new());
        let recorder = Arc::new(Recorder::default());
        let resolver = Arc::new(Mutex::new(RelationshipResolver::new()));
        let shared: Arc<dyn Storage> = storage.clone();
        let mut notes_bucket = Bucket::new(notes(), config(), Arc::clone(&shared))
            .with_resolver(Arc::clone(&resolver))
            .with_listener(recorder.clone());
        let mut folders = Bucket::new(BucketSchema::dynamic("folders"), config(), shared)
            .with_resolver(Arc::clone(&resolver))
            .with_listener(recorder.clone());

        let note = Change::version("a1", 1, attributes(json!({"content": "x", "folder": "b1"})));
        notes_bucket.refetching.insert("a1".into());
        notes_bucket.handle(Inbound::Entity {
            key: note.key.clone(),
            version: 1,
            data: note.data.clone(),
        });
        assert!(!storage.fetch("notes", "a1").unwrap().contains_key("folder"));
        assert_eq!(resolver.lock().count_between("a1", "b1"), 1);

        // an unrelated save must not clear the reference on the server
        let fx = notes_bucket.local_save(&["a1".to_string()]);
        assert!(sent(&fx).is_empty());

        folders.refetching.insert("b1".into());
        folders.handle(Inbound::Entity {
            key: "b1".into(),
            version: 1,
            data: Some(attributes(json!({"name": "inbox"}))),
        });
        assert_eq!(
            storage.fetch("notes", "a1").unwrap()["folder"],
            Value::entity("b1")
        );
        assert_eq!(resolver.lock().count(), 0);
        assert!(sent(&notes_bucket.local_save(&["a1".to_string()])).is_empty());
    }

    #[test]
    fn index_reconciles_local_state() {
        let storage = Arc::new(MemoryStorage::new());
        let recorder = Arc::new(Recorder::default());
        let mut bucket = bucket(&storage, &recorder);
        for key in ["1", "2", "3"] {
            seed(&mut bucket, &storage, key, 1, json!({"views": 1}));
        }

        bucket.reindex();
        let page = IndexPage {
            index: vec![
                IndexEntry { id: "2".into(), v: 1, d: None },
                IndexEntry { id: "3".into(), v: 2, d: None },
                IndexEntry { id: "4".into(), v: 1, d: None },
            ],
            current: Some("cv-9".into()),
            mark: None,
        };
        let fx = bucket.handle(Inbound::Index(page));
        assert_eq!(
            fx.outbound,
            vec![
                Outbound::Entity { key: "3".into(), version: 2 },
                Outbound::Entity { key: "4".into(), version: 1 },
            ]
        );
        assert!(storage.fetch("notes", "1").is_none());
        assert!(bucket.index.is_indexing());

        bucket.handle(Inbound::Entity {
            key: "3".into(),
            version: 2,
            data: Some(attributes(json!({"views": 7}))),
        });
        bucket.handle(Inbound::Entity {
            key: "4".into(),
            version: 1,
            data: Some(attributes(json!({"views": 0}))),
        });

        assert!(!bucket.index.is_indexing());
        assert_eq!(bucket.index.checkpoint().map(String::as_str), Some("cv-9"));
        assert_eq!(
            storage.fetch("notes", "3").unwrap()["views"],
            Value::from(7)
        );
        assert_eq!(
            recorder.take(),
            vec![
                "Delete notes/1",
                "Update notes/3",
                "Insert notes/4",
                "indexed notes",
            ]
        );
    }

    #[test]
    fn server_errors_are_retried_with_the_same_ccid() {
        let storage = Arc::new(MemoryStorage::new());
        let recorder = Arc::new(Recorder::default());
        let mut bucket = bucket(&storage, &recorder);

        storage.insert("notes", "n1", attributes(json!({"views": 1})));
        let change = sent(&bucket.local_save(&["n1".to_string()])).remove(0);

        let rejected = change.clone().with_error(503);
        let fx = bucket.handle(Inbound::Changes(vec![rejected]));
        assert_eq!(fx.retries.len(), 1);
        assert_eq!(fx.retries[0].0, "n1");
        assert!(fx.errors[0].is_transient());

        let resent = sent(&bucket.retry("n1"));
        assert_eq!(resent[0].ccid, change.ccid);
        assert_eq!(resent[0].retry_count, 1);

        // a late timer finds nothing to resend
        assert!(bucket.retry("n1").is_empty());
    }

    #[test]
    fn invalid_diff_is_resent_with_full_data() {
        let storage = Arc::new(MemoryStorage::new());
        let recorder = Arc::new(Recorder::default());
        let mut bucket = bucket(&storage, &recorder);
        seed(&mut bucket, &storage, "n1", 1, json!({"views": 1}));

        storage.insert("notes", "n1", attributes(json!({"views": 2})));
        let change = sent(&bucket.local_save(&["n1".to_string()])).remove(0);
        let fx = bucket.handle(Inbound::Changes(vec![change.with_error(440)]));

        let resent = sent(&fx);
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].data.as_ref().unwrap()["views"], Value::from(2));
        assert_eq!(recorder.take(), vec!["failed n1"]);
    }

    #[test]
    fn unknown_checkpoint_triggers_reindex() {
        let storage = Arc::new(MemoryStorage::new());
        let recorder = Arc::new(Recorder::default());
        let mut bucket = bucket(&storage, &recorder);

        let fx = bucket.handle(Inbound::UnknownChangeVersion);
        assert!(matches!(fx.outbound[..], [Outbound::Index(_)]));
        assert!(bucket.index.is_indexing());
    }

    #[test]
    fn requested_versions_do_not_touch_storage() {
        let storage = Arc::new(MemoryStorage::new());
        let recorder = Arc::new(Recorder::default());
        let mut bucket = bucket(&storage, &recorder);
        seed(&mut bucket, &storage, "n1", 3, json!({"views": 3}));

        let fx = bucket.request_versions("n1", 2);
        assert_eq!(
            fx.outbound,
            vec![
                Outbound::Entity { key: "n1".into(), version: 2 },
                Outbound::Entity { key: "n1".into(), version: 3 },
            ]
        );

        bucket.handle(Inbound::Entity {
            key: "n1".into(),
            version: 2,
            data: Some(attributes(json!({"views": 2}))),
        });
        assert_eq!(recorder.take(), vec!["version n1.2"]);
        assert_eq!(storage.fetch("notes", "n1").unwrap()["views"], Value::from(3));
    }

    #[test]
    fn saturation_queues_and_drains() {
        let storage = Arc::new(MemoryStorage::new());
        let recorder = Arc::new(Recorder::default());
        let mut bucket = bucket(&storage, &recorder);

        let keys: Vec<Key> = ["a", "b", "c"].iter().map(|k| k.to_string()).collect();
        for key in &keys {
            storage.insert("notes", key, attributes(json!({"views": 1})));
        }
        let first = sent(&bucket.local_save(&keys));
        assert_eq!(first.len(), 2);
        assert!(bucket.export_status().saturated);

        let fx = bucket.handle(ack(&first[0], 1, "cv-1"));
        let drained = sent(&fx);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].key, "c");
    }

    #[test]
    fn remote_deletion_removes_record() {
        let storage = Arc::new(MemoryStorage::new());
        let recorder = Arc::new(Recorder::default());
        let mut bucket = bucket(&storage, &recorder);
        seed(&mut bucket, &storage, "n1", 1, json!({"views": 1}));

        let deletion = Change::remove("n1", "other", Some(1))
            .with_end_version(2)
            .with_change_version("cv-2");
        bucket.handle(Inbound::Changes(vec![deletion]));
        assert!(storage.fetch("notes", "n1").is_none());
        assert!(!bucket.ghosts.contains("n1"));
        assert_eq!(recorder.take(), vec!["Delete notes/n1"]);
    }

    #[test]
    fn local_deletion_is_acknowledged() {
        let storage = Arc::new(MemoryStorage::new());
        let recorder = Arc::new(Recorder::default());
        let mut bucket = bucket(&storage, &recorder);
        seed(&mut bucket, &storage, "n1", 1, json!({"views": 1}));

        storage.delete("notes", "n1");
        let change = sent(&bucket.local_delete(&["n1".to_string()])).remove(0);
        assert_eq!(change.operation, Operation::Remove);
        bucket.handle(ack(&change, 2, "cv-2"));
        assert!(!bucket.ghosts.contains("n1"));
        assert_eq!(recorder.take(), vec!["deleted n1"]);
    }

    #[test]
    fn snapshot_restores_pending_work() {
        let storage = Arc::new(MemoryStorage::new());
        let recorder = Arc::new(Recorder::default());
        let mut bucket = bucket(&storage, &recorder);
        seed(&mut bucket, &storage, "n1", 1, json!({"views": 1, "folder": "f1"}));
        bucket.index.set_checkpoint(Some("cv-1".into()));

        let edited = notes().decode(attributes(json!({"views": 4, "folder": "f1"})));
        storage.insert("notes", "n1", edited);
        let change = sent(&bucket.local_save(&["n1".to_string()])).remove(0);

        let json = bucket.snapshot().to_json().unwrap();
        let mut restored = self::bucket(&storage, &recorder);
        restored
            .restore(BucketSnapshot::from_json(&json).unwrap())
            .unwrap();
        assert_eq!(
            restored.ghosts.get("n1").unwrap().snapshot["folder"],
            Value::entity("f1")
        );

        let fx = restored.start();
        assert_eq!(fx.outbound[0], Outbound::ChangeVersion("cv-1".into()));
        let resent = sent(&fx);
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].ccid, change.ccid);
    }

    #[test]
    fn reset_drops_in_flight_work() {
        let storage = Arc::new(MemoryStorage::new());
        let recorder = Arc::new(Recorder::default());
        let mut bucket = bucket(&storage, &recorder);
        seed(&mut bucket, &storage, "n1", 1, json!({"views": 1}));

        storage.insert("notes", "n1", attributes(json!({"views": 2})));
        assert_eq!(sent(&bucket.local_save(&["n1".to_string()])).len(), 1);
        bucket.reindex();
        bucket.reset();

        let status = bucket.export_status();
        assert_eq!(status.pending, 0);
        assert!(!status.indexing);
        assert_eq!(status.versions.get("n1"), Some(&1));

        // the unsent edit is recaptured from the ghost
        let fx = bucket.local_save(&["n1".to_string()]);
        assert_eq!(sent(&fx)[0].start_version, Some(1));
    }

    #[test]
    fn refetched_record_takes_the_late_ack_of_its_dropped_change() {
        let storage = Arc::new(MemoryStorage::new());
        let recorder = Arc::new(Recorder::default());
        let mut bucket = bucket(&storage, &recorder);
        seed(&mut bucket, &storage, "k", 1, json!({"content": "hello"}));

        storage.insert("notes", "k", attributes(json!({"content": "hullo"})));
        let local = sent(&bucket.local_save(&["k".to_string()])).remove(0);

        // the remote delta does not fit the ghost
        let fx = bucket.handle(
            Inbound::decode(
                r#"c:[{"id":"k","clientid":"other","ccid":"x","o":"M","v":{"content":{"o":"d","v":"=9\t+!"}},"sv":1,"ev":2,"cv":"cv-2"}]"#,
            )
            .unwrap(),
        );
        assert_eq!(
            fx.outbound,
            vec![Outbound::Entity {
                key: "k".into(),
                version: 2
            }]
        );
        assert_eq!(recorder.take(), vec!["failed k"]);

        let fx = bucket.handle(Inbound::decode("e:k.2\n{\"content\":\"hello!\"}").unwrap());
        assert!(sent(&fx).is_empty());
        assert_eq!(
            storage.fetch("notes", "k").unwrap()["content"],
            Value::from("hello!")
        );
        assert!(!bucket.has_local_changes("k"));

        // the server applied the local edit on top of its own
        let mut late = local.clone();
        late.ccids = vec![local.ccid.clone()];
        late.start_version = Some(2);
        late.end_version = Some(3);
        late.change_version = Some("cv-3".into());
        late.diff = Some(diff_attributes(
            &attributes(json!({"content": "hello!"})),
            &attributes(json!({"content": "hullo!"})),
            &notes().policy(),
        ));
        bucket.handle(Inbound::Changes(vec![late]));

        assert_eq!(
            storage.fetch("notes", "k").unwrap()["content"],
            Value::from("hullo!")
        );
        let ghost = bucket.ghosts.get("k").unwrap();
        assert_eq!(ghost.version, 3);
        assert_eq!(ghost.snapshot["content"], Value::from("hullo!"));
        assert!(sent(&bucket.local_save(&["k".to_string()])).is_empty());
    }

    #[test]
    fn version_gap_reindexes_and_requeues() {
        let storage = Arc::new(MemoryStorage::new());
        let recorder = Arc::new(Recorder::default());
        let mut bucket = bucket(&storage, &recorder);
        seed(&mut bucket, &storage, "n1", 1, json!({"content": "abc"}));

        let fx = bucket.handle(
            Inbound::decode(
                r#"c:[{"id":"n1","clientid":"other","o":"M","v":{"views":{"o":"I","v":1}},"sv":3,"ev":4,"cv":"cv-4"}]"#,
            )
            .unwrap(),
        );
        assert_eq!(
            fx.outbound,
            vec![Outbound::Index(IndexRequest {
                mark: None,
                limit: 500
            })]
        );
        assert!(bucket.index.is_indexing());
        assert!(bucket.changes.queued_keys().any(|key| key == "n1"));
        assert_eq!(bucket.index.checkpoint(), None);
        assert_eq!(recorder.take(), vec!["failed n1"]);

        let fx = bucket.handle(
            Inbound::decode(
                r#"i:{"index":[{"id":"n1","v":4,"d":{"content":"abc","views":7}}],"current":"cv-4"}"#,
            )
            .unwrap(),
        );
        assert!(sent(&fx).is_empty());
        assert_eq!(bucket.ghosts.version("n1"), Some(4));
        assert_eq!(storage.fetch("notes", "n1").unwrap()["views"], Value::from(7));
        assert!(!bucket.has_local_changes("n1"));
        assert_eq!(bucket.index.checkpoint().map(String::as_str), Some("cv-4"));
    }

    #[test]
    fn exhausted_retries_are_surfaced() {
        let storage = Arc::new(MemoryStorage::new());
        let recorder = Arc::new(Recorder::default());
        let mut bucket = bucket(&storage, &recorder);

        storage.insert("notes", "n1", attributes(json!({"views": 1})));
        let mut change = sent(&bucket.local_save(&["n1".to_string()])).remove(0);
        for _ in 0..2 {
            let fx = bucket.handle(Inbound::Changes(vec![change.clone().with_error(503)]));
            assert_eq!(fx.retries.len(), 1);
            change = sent(&bucket.retry("n1")).remove(0);
        }

        let fx = bucket.handle(Inbound::Changes(vec![change.with_error(503)]));
        assert!(fx.retries.is_empty());
        assert!(matches!(
            fx.errors[..],
            [SyncError::RetryExhausted { attempts: 2, .. }]
        ));
        assert_eq!(fx.errors[0].recovery(), Recovery::Surface);
        assert!(!bucket.has_local_changes("n1"));
        assert_eq!(recorder.take(), vec!["failed n1"; 3]);
    }

    #[test]
    fn record_awaited_by_another_bucket_is_reloaded() {
        let storage = Arc::new(MemoryStorage::new());
        let recorder = Arc::new(Recorder::default());
        let resolver = Arc::new(Mutex::new(RelationshipResolver::new()));
        let shared: Arc<dyn Storage> = storage.clone();
        let mut folders = Bucket::new(BucketSchema::dynamic("folders"), config(), shared)
            .with_resolver(Arc::clone(&resolver))
            .with_listener(recorder.clone());

        storage.insert("notes", "a1", attributes(json!({"content": "x"})));
        resolver
            .lock()
            .add_pending(PendingRelationship::new("a1", "folder", "notes", "b1", "folders"));
        // written without a save, so never captured
        storage.insert("folders", "b1", attributes(json!({"name": "draft"})));

        folders.reindex();
        folders.handle(
            Inbound::decode(
                r#"i:{"index":[{"id":"b1","v":1,"d":{"name":"Inbox"}}],"current":"cv-1"}"#,
            )
            .unwrap(),
        );

        assert_eq!(
            storage.fetch("folders", "b1").unwrap()["name"],
            Value::from("Inbox")
        );
        assert_eq!(
            storage.fetch("notes", "a1").unwrap()["folder"],
            Value::entity("b1")
        );
        assert_eq!(resolver.lock().count(), 0);
    }

    #[test]
    fn checkpoint_marker_moves_the_checkpoint() {
        let storage = Arc::new(MemoryStorage::new());
        let recorder = Arc::new(Recorder::default());
        let mut bucket = bucket(&storage, &recorder);

        let fx = bucket.handle(Inbound::decode("cv:cv-9").unwrap());
        assert!(fx.is_empty());
        assert_eq!(bucket.index.checkpoint().map(String::as_str), Some("cv-9"));

        // a running pass owns the checkpoint
        bucket.reindex();
        bucket.handle(Inbound::decode("cv:cv-10").unwrap());
        assert_eq!(bucket.index.checkpoint().map(String::as_str), Some("cv-9"));
    }
}

//! Change processor: outbound and inbound changes of one bucket.
//!
//! # State
//!
//! - `pending`: changes sent and awaiting an ack, at most one per key
//! - `retry`: changes that failed transiently and wait for a resend
//! - `queued`: keys edited again while a change was in flight
//! - `deletions`: keys deleted while a change was in flight
//!
//! A key is *in flight* while it sits in `pending` or `retry`. Keys in flight
//! never get a second change: further edits only mark the key as queued, and
//! the queue is flushed once the in-flight change is acked or dropped. This
//! gives every record a total order of server-visible mutations.
//!
//! The processor is pure bookkeeping over the [`GhostStore`]. Reading and
//! writing records is left to the caller.

use crate::change::{Change, ErrorCode, Operation};
use crate::config::SyncConfig;
use crate::diff::{apply_attributes, diff_attributes, transform_attributes, DiffPolicy, Later};
use crate::error::SyncError;
use crate::ghost::GhostStore;
use crate::value::Attributes;
use crate::{BucketName, ChangeVersion, Key, Version};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of capturing a local change.
#[derive(Debug, Clone, PartialEq)]
pub enum Capture {
    /// Send this change.
    Send(Change),
    /// A change for the key is in flight; the edit is queued.
    Deferred,
    /// Too many changes in flight; the edit is queued.
    Saturated,
    /// Nothing differs from the ghost.
    NoChanges,
}

/// What to do for a key once its in-flight change is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    None,
    /// The record was edited again; capture it.
    Recapture,
    /// The record was deleted; send the deletion.
    Delete,
}

/// Result of processing an ack.
#[derive(Debug, Clone, PartialEq)]
pub struct Acked {
    pub key: Key,
    /// Ghost version after the ack, `None` once deleted.
    pub version: Option<Version>,
    pub operation: Operation,
    pub follow_up: FollowUp,
    pub change_version: Option<ChangeVersion>,
}

/// How a remote change treats local edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Keep local edits, rebased onto the new baseline.
    #[default]
    Rebase,
    /// The server's data replaces local edits.
    Reload,
}

/// Result of processing a remote change.
#[derive(Debug, Clone, PartialEq)]
pub enum Remote {
    /// The ghost already includes the change.
    AlreadyApplied,
    /// Write `value` to storage.
    Updated {
        value: Attributes,
        inserted: bool,
        /// Members whose server value changed
        members: Vec<String>,
    },
    /// The ghost moved but the record stays deleted locally.
    BaselineOnly,
    /// Delete the record.
    Deleted,
}

/// A rejected change and when to resend it.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub error: SyncError,
    /// Set for transient errors.
    pub retry_after: Option<Duration>,
}

/// Queue and state machine for one bucket's changes.
#[derive(Debug, Clone)]
pub struct ChangeProcessor {
    bucket: BucketName,
    config: Arc<SyncConfig>,
    policy: DiffPolicy,
    pending: BTreeMap<Key, Change>,
    retry: BTreeMap<Key, Change>,
    queued: BTreeSet<Key>,
    deletions: BTreeSet<Key>,
}

impl ChangeProcessor {
    pub fn new(bucket: impl Into<BucketName>, config: Arc<SyncConfig>, policy: DiffPolicy) -> Self {
        Self {
            bucket: bucket.into(),
            config,
            policy,
            pending: BTreeMap::new(),
            retry: BTreeMap::new(),
            queued: BTreeSet::new(),
            deletions: BTreeSet::new(),
        }
    }

    pub fn bucket(&self) -> &BucketName {
        &self.bucket
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    fn in_flight(&self, key: &str) -> bool {
        self.pending.contains_key(key) || self.retry.contains_key(key)
    }

    /// Capture a local edit of `key`.
    pub fn capture_local_change(
        &mut self,
        key: &str,
        current: &Attributes,
        ghosts: &GhostStore,
    ) -> Capture {
        if self.in_flight(key) {
            debug!(bucket = %self.bucket, key, "change in flight, queueing");
            self.queued.insert(key.to_string());
            return Capture::Deferred;
        }
        if self.reached_max_pendings() {
            warn!(bucket = %self.bucket, key, "too many changes in flight, queueing");
            self.queued.insert(key.to_string());
            return Capture::Saturated;
        }
        self.queued.remove(key);

        let ghost = ghosts.get(key);
        let base = ghost.map(|g| &g.snapshot);
        let diff = diff_attributes(base.unwrap_or(&Attributes::new()), current, &self.policy);
        if diff.is_empty() {
            return Capture::NoChanges;
        }

        let change = match ghost {
            Some(ghost) => Change::modify(key, self.client_id(), ghost.version, diff),
            None => Change::add(key, self.client_id(), diff),
        };
        debug!(bucket = %self.bucket, key, ccid = %change.ccid, "sending change");
        self.pending.insert(key.to_string(), change.clone());
        Capture::Send(change)
    }

    /// Capture a local deletion of `key`.
    pub fn capture_local_deletion(&mut self, key: &str, ghosts: &GhostStore) -> Capture {
        self.queued.remove(key);
        if self.in_flight(key) {
            debug!(bucket = %self.bucket, key, "change in flight, deferring deletion");
            self.deletions.insert(key.to_string());
            return Capture::Deferred;
        }
        self.deletions.remove(key);
        let Some(ghost) = ghosts.get(key) else {
            // never reached the server
            return Capture::NoChanges;
        };
        let change = Change::remove(key, self.client_id(), Some(ghost.version));
        self.pending.insert(key.to_string(), change.clone());
        Capture::Send(change)
    }

    /// Whether `change` acknowledges the key's pending change.
    pub fn is_ack(&self, change: &Change) -> bool {
        self.pending
            .get(&change.key)
            .is_some_and(|pending| change.acknowledges(&pending.ccid))
    }

    /// Settle the pending change acknowledged by `ack`.
    ///
    /// The ghost advances by the acknowledged diff, never by the record's
    /// current value, which may hold newer unsent edits.
    pub fn process_ack(&mut self, ack: &Change, ghosts: &mut GhostStore) -> Result<Acked, SyncError> {
        let key = ack.key.clone();
        let Some(pending) = self.pending.remove(&key) else {
            return Ok(self.acked(key, ghosts, Operation::Modify, ack));
        };

        if ack.end_version.is_some() && ghosts.version(&key) == ack.end_version {
            debug!(bucket = %self.bucket, key = %key, "ack already applied");
            return Ok(self.acked(key, ghosts, pending.operation, ack));
        }

        match pending.operation {
            Operation::Remove => {
                ghosts.remove(&key);
            }
            Operation::Add | Operation::Modify => {
                let Some(version) = ack.end_version else {
                    return Err(self.integrity(&key, "ack without end version"));
                };
                let snapshot = match (&pending.data, ack.diff.as_ref().or(pending.diff.as_ref())) {
                    (Some(data), _) => data.clone(),
                    (None, diff) => {
                        let base = ghosts.get(&key).map(|g| g.snapshot.clone()).unwrap_or_default();
                        match diff {
                            Some(diff) => apply_attributes(&base, diff)
                                .map_err(|e| self.integrity(&key, &e.to_string()))?,
                            None => base,
                        }
                    }
                };
                ghosts.put(key.clone(), version, snapshot);
            }
        }
        debug!(bucket = %self.bucket, key = %key, version = ?ack.end_version, "change acknowledged");
        Ok(self.acked(key, ghosts, pending.operation, ack))
    }

    fn acked(&mut self, key: Key, ghosts: &GhostStore, operation: Operation, ack: &Change) -> Acked {
        let follow_up = self.take_follow_up(&key);
        Acked {
            version: ghosts.version(&key),
            key,
            operation,
            follow_up,
            change_version: ack.change_version.clone(),
        }
    }

    /// Clear and return the key's queued work, unless it is still in flight.
    pub fn take_follow_up(&mut self, key: &str) -> FollowUp {
        if self.in_flight(key) {
            return FollowUp::None;
        }
        if self.deletions.remove(key) {
            self.queued.remove(key);
            FollowUp::Delete
        } else if self.queued.remove(key) {
            FollowUp::Recapture
        } else {
            FollowUp::None
        }
    }

    /// Apply a change made by another client (or fetched in full).
    pub fn process_remote_change(
        &mut self,
        change: &Change,
        current: Option<&Attributes>,
        ghosts: &mut GhostStore,
    ) -> Result<Remote, SyncError> {
        self.process_remote_change_with(change, current, ghosts, Mode::Rebase)
    }

    /// [`process_remote_change`](Self::process_remote_change) with an
    /// explicit treatment of local edits.
    pub fn process_remote_change_with(
        &mut self,
        change: &Change,
        current: Option<&Attributes>,
        ghosts: &mut GhostStore,
        mode: Mode,
    ) -> Result<Remote, SyncError> {
        let key = change.key.as_str();
        if change.operation == Operation::Remove {
            ghosts.remove(key);
            self.discard_pending_changes(key);
            debug!(bucket = %self.bucket, key, "remote deletion");
            return Ok(Remote::Deleted);
        }

        let Some(version) = change.end_version else {
            return Err(self.invalid_received(key, "missing end version"));
        };
        let ghost = ghosts.get(key);
        if ghost.is_some_and(|g| version <= g.version) {
            return Ok(Remote::AlreadyApplied);
        }
        let local_version = ghost.map(|g| g.version);
        let base = ghost.map(|g| g.snapshot.clone()).unwrap_or_default();

        let server = match (&change.data, &change.diff) {
            (Some(data), _) => data.clone(),
            (None, Some(diff)) => {
                if change.start_version != local_version {
                    return Err(match local_version {
                        None => SyncError::ReceivedUnknownChange {
                            bucket: self.bucket.clone(),
                            key: key.to_string(),
                        },
                        Some(_) => SyncError::ClientOutOfSync {
                            bucket: self.bucket.clone(),
                            key: key.to_string(),
                            local: local_version,
                            remote: change.start_version,
                        },
                    });
                }
                apply_attributes(&base, diff)
                    .map_err(|e| self.invalid_received(key, &e.to_string()))?
            }
            (None, None) => return Err(self.invalid_received(key, "neither diff nor data")),
        };

        let members: Vec<String> = diff_attributes(&base, &server, &self.policy)
            .into_keys()
            .collect();
        let outcome = match (current, mode) {
            (None, _) if local_version.is_some() && self.has_local_changes(key) => {
                Remote::BaselineOnly
            }
            (None, _) => Remote::Updated {
                value: server.clone(),
                inserted: true,
                members,
            },
            (Some(_), Mode::Reload) => {
                // a late ack for a dropped change arrives as a remote change
                // and reaches storage through the normal path
                self.discard_pending_changes(key);
                Remote::Updated {
                    value: server.clone(),
                    inserted: false,
                    members,
                }
            }
            (Some(current), Mode::Rebase) => {
                let value = self.rebase(key, &base, &server, current)?;
                Remote::Updated {
                    value,
                    inserted: false,
                    members,
                }
            }
        };

        ghosts.put(key, version, server);
        debug!(bucket = %self.bucket, key, version, "remote change applied");
        Ok(outcome)
    }

    /// Move local edits of `current` (made against `base`) onto `server`.
    fn rebase(
        &self,
        key: &str,
        base: &Attributes,
        server: &Attributes,
        current: &Attributes,
    ) -> Result<Attributes, SyncError> {
        let local = diff_attributes(base, current, &self.policy);
        if local.is_empty() {
            return Ok(server.clone());
        }
        let remote = diff_attributes(base, server, &self.policy);
        let rebased = transform_attributes(&remote, &local, base, Later::Onto)
            .map_err(|e| self.integrity(key, &e.to_string()))?;
        apply_attributes(current, &rebased).map_err(|e| self.integrity(key, &e.to_string()))
    }

    /// Map a server error on a sent change to the taxonomy.
    ///
    /// Returns `None` when no pending change matches.
    pub fn process_error(&mut self, change: &Change, code: u16) -> Option<Failure> {
        let key = change.key.clone();
        if !self.is_ack(change) {
            warn!(bucket = %self.bucket, key = %key, code, "error for unknown change");
            return None;
        }
        let mut pending = self.pending.remove(&key)?;
        let bucket = self.bucket.clone();

        let failure = match ErrorCode::from_code(code) {
            ErrorCode::Duplicate | ErrorCode::EmptyChange => Failure {
                error: SyncError::DuplicateChange { bucket, key },
                retry_after: None,
            },
            ErrorCode::InvalidDiff if pending.data.is_none() => {
                self.retry.insert(key.clone(), pending);
                Failure {
                    error: SyncError::InvalidSentChange { bucket, key },
                    retry_after: None,
                }
            }
            ErrorCode::BadVersion => Failure {
                error: SyncError::ClientOutOfSync {
                    bucket,
                    key,
                    local: pending.start_version,
                    remote: None,
                },
                retry_after: None,
            },
            ErrorCode::ExpectationFailed | ErrorCode::Server(_) => {
                pending.retry_count += 1;
                let attempt = pending.retry_count;
                if attempt > self.config.retry.max_attempts {
                    Failure {
                        error: SyncError::RetryExhausted {
                            bucket,
                            key,
                            attempts: attempt - 1,
                        },
                        retry_after: None,
                    }
                } else {
                    self.retry.insert(key.clone(), pending);
                    Failure {
                        error: SyncError::ServerError {
                            bucket,
                            key,
                            code,
                            attempt,
                        },
                        retry_after: Some(self.config.retry.delay_for_attempt(attempt)),
                    }
                }
            }
            _ => Failure {
                error: SyncError::ClientError { bucket, key, code },
                retry_after: None,
            },
        };
        warn!(error = %failure.error, "change rejected");
        Some(failure)
    }

    /// Rebuild and resend a change for `key`.
    ///
    /// The change is diffed again against the ghost so it carries the latest
    /// local edits. With `override_remote` it carries full data as well. A
    /// key that is still awaiting an ack is left alone.
    pub fn retry(
        &mut self,
        key: &str,
        current: Option<&Attributes>,
        ghosts: &GhostStore,
        override_remote: bool,
    ) -> Option<Change> {
        if self.pending.contains_key(key) {
            return None;
        }
        let previous = self.retry.remove(key);
        self.queued.remove(key);
        let ghost = ghosts.get(key);

        let mut change = match current {
            None => {
                self.deletions.remove(key);
                Change::remove(key, self.client_id(), Some(ghost?.version))
            }
            Some(current) => {
                let base = ghost.map(|g| &g.snapshot);
                let diff =
                    diff_attributes(base.unwrap_or(&Attributes::new()), current, &self.policy);
                let change = match ghost {
                    Some(ghost) => Change::modify(key, self.client_id(), ghost.version, diff),
                    None => Change::add(key, self.client_id(), diff),
                };
                if override_remote {
                    change.with_data(current.clone())
                } else if change.is_empty() {
                    return None;
                } else {
                    change
                }
            }
        };

        if let Some(previous) = previous {
            change.retry_count = previous.retry_count;
            if previous.operation == change.operation
                && previous.diff == change.diff
                && previous.data == change.data
            {
                change.ccid = previous.ccid;
            }
        }
        debug!(bucket = %self.bucket, key, attempt = change.retry_count, "resending change");
        self.pending.insert(key.to_string(), change.clone());
        Some(change)
    }

    /// Move every change awaiting an ack to `retry`, e.g. after reconnecting.
    pub fn requeue_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        self.retry.extend(pending);
    }

    /// Mark `key` for recapture once nothing is in flight for it.
    pub fn requeue(&mut self, key: impl Into<Key>) {
        self.queued.insert(key.into());
    }

    /// Forget everything queued or in flight for `key`.
    pub fn discard_pending_changes(&mut self, key: &str) {
        self.pending.remove(key);
        self.retry.remove(key);
        self.queued.remove(key);
        self.deletions.remove(key);
    }

    /// Whether `key` has local work the server has not acknowledged.
    pub fn has_local_changes(&self, key: &str) -> bool {
        self.in_flight(key) || self.queued.contains(key) || self.deletions.contains(key)
    }

    /// Number of changes awaiting an ack.
    pub fn num_changes_pending(&self) -> usize {
        self.pending.len()
    }

    /// Number of keys edited while in flight (or saturated).
    pub fn num_keys_with_more_changes(&self) -> usize {
        self.queued.len()
    }

    pub fn num_keys_to_delete(&self) -> usize {
        self.deletions.len()
    }

    pub fn num_retries(&self) -> usize {
        self.retry.len()
    }

    pub fn reached_max_pendings(&self) -> bool {
        self.pending.len() + self.retry.len() >= self.config.max_pending
    }

    pub fn pending_changes(&self) -> impl Iterator<Item = &Change> {
        self.pending.values()
    }

    pub fn retry_changes(&self) -> impl Iterator<Item = &Change> {
        self.retry.values()
    }

    pub fn queued_keys(&self) -> impl Iterator<Item = &Key> {
        self.queued.iter()
    }

    pub fn queued_deletions(&self) -> impl Iterator<Item = &Key> {
        self.deletions.iter()
    }

    /// Pending and retry changes, ordered by key.
    pub fn export_pending_changes(&self) -> Vec<Change> {
        let mut changes: Vec<Change> = self
            .pending
            .values()
            .chain(self.retry.values())
            .cloned()
            .collect();
        changes.sort_by(|a, b| a.key.cmp(&b.key));
        changes
    }

    /// Restore changes exported earlier. They go back to `retry` and are
    /// rebuilt and resent by the caller.
    pub fn restore(&mut self, changes: impl IntoIterator<Item = Change>) {
        for change in changes {
            self.retry.insert(change.key.clone(), change);
        }
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.retry.clear();
        self.queued.clear();
        self.deletions.clear();
    }

    fn integrity(&self, key: &str, reason: &str) -> SyncError {
        SyncError::EntityGhostIntegrity {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    fn invalid_received(&self, key: &str, reason: &str) -> SyncError {
        SyncError::InvalidReceivedChange {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

//! Bucket event callbacks.

use crate::error::SyncError;
use crate::value::Attributes;
use crate::{Key, Version};

/// What happened to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
    /// A local change reached the server.
    Acknowledge,
}

/// Receives bucket events on the bucket's worker. Every method defaults to
/// doing nothing.
pub trait BucketListener: Send + Sync {
    /// Remote data is about to be written for `keys`.
    fn will_change_objects(&self, _bucket: &str, _keys: &[Key]) {}

    fn did_change_object(
        &self,
        _bucket: &str,
        _key: &str,
        _change: ChangeType,
        _members: &[String],
    ) {
    }

    fn will_start_indexing(&self, _bucket: &str) {}

    fn did_finish_indexing(&self, _bucket: &str) {}

    /// A version requested with `request_versions` arrived.
    fn did_receive_object_version(
        &self,
        _bucket: &str,
        _key: &str,
        _version: Version,
        _data: &Attributes,
    ) {
    }

    fn did_acknowledge_delete(&self, _bucket: &str, _key: &str) {}

    /// A sync error was handled. Every error is reported, recovered or not.
    fn did_fail(&self, _bucket: &str, _error: &SyncError) {}

    /// Too many changes are in flight; local edits are being queued.
    fn did_saturate(&self, _bucket: &str) {}
}

/// Listener that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl BucketListener for NoopListener {}

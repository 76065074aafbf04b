//! Changes: the unit of mutation exchanged with the server.
//!
//! Field names follow the wire format (`id`, `clientid`, `ccid`, `o`, `v`,
//! `d`, `sv`, `ev`, `cv`, `error`), so a [`Change`] serializes directly into
//! a `c:` message.

use crate::diff::ObjectDiff;
use crate::value::Attributes;
use crate::{ChangeId, ChangeVersion, ClientId, Key, Version};
use serde::{Deserialize, Serialize};

/// Kind of mutation a change carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "M")]
    Modify,
    #[serde(rename = "-")]
    Remove,
}

/// Numeric error codes the server attaches to rejected changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidSchema,
    InvalidPermission,
    NotFound,
    /// The change's start version is not the server's current version.
    BadVersion,
    Duplicate,
    EmptyChange,
    TooLarge,
    /// Usually a referenced record the server has not seen yet.
    ExpectationFailed,
    InvalidDiff,
    Server(u16),
    Other(u16),
}

impl ErrorCode {
    pub fn from_code(code: u16) -> Self {
        match code {
            400 => ErrorCode::InvalidSchema,
            401 => ErrorCode::InvalidPermission,
            404 => ErrorCode::NotFound,
            405 => ErrorCode::BadVersion,
            409 => ErrorCode::Duplicate,
            412 => ErrorCode::EmptyChange,
            413 => ErrorCode::TooLarge,
            417 => ErrorCode::ExpectationFailed,
            440 => ErrorCode::InvalidDiff,
            500..=599 => ErrorCode::Server(code),
            other => ErrorCode::Other(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            ErrorCode::InvalidSchema => 400,
            ErrorCode::InvalidPermission => 401,
            ErrorCode::NotFound => 404,
            ErrorCode::BadVersion => 405,
            ErrorCode::Duplicate => 409,
            ErrorCode::EmptyChange => 412,
            ErrorCode::TooLarge => 413,
            ErrorCode::ExpectationFailed => 417,
            ErrorCode::InvalidDiff => 440,
            ErrorCode::Server(code) | ErrorCode::Other(code) => code,
        }
    }
}

/// A single change, outbound or inbound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Record key
    #[serde(rename = "id")]
    pub key: Key,
    /// Client that produced the change
    #[serde(rename = "clientid", default)]
    pub client_id: ClientId,
    /// Client change id
    #[serde(default)]
    pub ccid: ChangeId,
    /// Client change ids folded into this change by the server
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ccids: Vec<ChangeId>,
    #[serde(rename = "o")]
    pub operation: Operation,
    /// Diff against the start version
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<ObjectDiff>,
    /// Full data, sent instead of a diff when the server could not apply one
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Attributes>,
    #[serde(rename = "sv", default, skip_serializing_if = "Option::is_none")]
    pub start_version: Option<Version>,
    #[serde(rename = "ev", default, skip_serializing_if = "Option::is_none")]
    pub end_version: Option<Version>,
    /// Server change version (bucket-wide position in the change log)
    #[serde(rename = "cv", default, skip_serializing_if = "Option::is_none")]
    pub change_version: Option<ChangeVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<u16>,
    /// Local retry bookkeeping, never sent.
    #[serde(skip)]
    pub retry_count: u32,
}

impl Change {
    fn new(key: impl Into<Key>, client_id: impl Into<ClientId>, operation: Operation) -> Self {
        Self {
            key: key.into(),
            client_id: client_id.into(),
            ccid: new_change_id(),
            ccids: Vec::new(),
            operation,
            diff: None,
            data: None,
            start_version: None,
            end_version: None,
            change_version: None,
            error: None,
            retry_count: 0,
        }
    }

    /// A change creating a new record.
    pub fn add(key: impl Into<Key>, client_id: impl Into<ClientId>, diff: ObjectDiff) -> Self {
        Self::new(key, client_id, Operation::Add).with_diff(diff)
    }

    /// A change modifying a record at `start_version`.
    pub fn modify(
        key: impl Into<Key>,
        client_id: impl Into<ClientId>,
        start_version: Version,
        diff: ObjectDiff,
    ) -> Self {
        Self::new(key, client_id, Operation::Modify)
            .with_diff(diff)
            .with_start_version(start_version)
    }

    /// A change deleting a record.
    pub fn remove(
        key: impl Into<Key>,
        client_id: impl Into<ClientId>,
        start_version: Option<Version>,
    ) -> Self {
        let mut change = Self::new(key, client_id, Operation::Remove);
        change.start_version = start_version;
        change
    }

    /// A full version of a record, as fetched with `e:`.
    pub fn version(key: impl Into<Key>, version: Version, data: Attributes) -> Self {
        Self::new(key, ClientId::new(), Operation::Modify)
            .with_data(data)
            .with_end_version(version)
    }

    pub fn with_diff(mut self, diff: ObjectDiff) -> Self {
        self.diff = Some(diff);
        self
    }

    /// Attach full data. The diff is kept so the ghost can be advanced on ack.
    pub fn with_data(mut self, data: Attributes) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_start_version(mut self, version: Version) -> Self {
        self.start_version = Some(version);
        self
    }

    pub fn with_end_version(mut self, version: Version) -> Self {
        self.end_version = Some(version);
        self
    }

    pub fn with_change_version(mut self, cv: impl Into<ChangeVersion>) -> Self {
        self.change_version = Some(cv.into());
        self
    }

    pub fn with_ccid(mut self, ccid: impl Into<ChangeId>) -> Self {
        self.ccid = ccid.into();
        self
    }

    pub fn with_error(mut self, code: u16) -> Self {
        self.error = Some(code);
        self
    }

    /// The server error attached to this change, if any.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.map(ErrorCode::from_code)
    }

    /// Whether this change carries the given client change id.
    pub fn acknowledges(&self, ccid: &str) -> bool {
        self.ccid == ccid || self.ccids.iter().any(|c| c == ccid)
    }

    /// Whether the diff carries nothing.
    pub fn is_empty(&self) -> bool {
        self.operation != Operation::Remove
            && self.data.is_none()
            && self.diff.as_ref().map_or(true, |d| d.is_empty())
    }
}

/// Generate a fresh client change id.
pub fn new_change_id() -> ChangeId {
    uuid::Uuid::new_v4().simple().to_string()
}

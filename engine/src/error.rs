//! Error types for the Ghostline engine.
//!
//! Three families live here:
//!
//! - [`Error`]: schema, protocol and persistence failures (the caller did
//!   something the engine cannot accept).
//! - [`ApplyError`]: a diff could not be applied or rebased. This always means
//!   the base value diverged from what the diff was computed against.
//! - [`SyncError`]: the synchronization error taxonomy. Every variant maps to
//!   exactly one deterministic [`Recovery`] action.

use crate::{BucketName, Key, Version};
use thiserror::Error;

/// All possible errors from the Ghostline engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    // Schema errors
    #[error("bucket not found: {0}")]
    BucketNotFound(BucketName),

    #[error("type mismatch for member '{member}': expected {expected}, got {got}")]
    TypeMismatch {
        member: String,
        expected: String,
        got: String,
    },

    #[error("invalid attributes: {0}")]
    InvalidAttributes(String),

    // Protocol errors
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("invalid diff: {0}")]
    InvalidDiff(String),

    // Diff errors
    #[error(transparent)]
    Apply(#[from] ApplyError),

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("bucket mismatch: expected {expected}, got {actual}")]
    BucketMismatch {
        expected: BucketName,
        actual: BucketName,
    },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure to apply or transform a diff.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// The diff operation does not fit the type of the value it targets.
    #[error("incompatible type: {op} cannot apply to {found}")]
    IncompatibleType { op: &'static str, found: String },

    /// The base the diff was computed against no longer matches.
    #[error("patch context mismatch: {0}")]
    PatchContextMismatch(String),
}

impl ApplyError {
    pub(crate) fn mismatch(reason: impl Into<String>) -> Self {
        ApplyError::PatchContextMismatch(reason.into())
    }
}

/// The recovery action that follows a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Drop the pending change as if it had been acknowledged.
    Drop,
    /// Resend the change carrying full data instead of a diff.
    SendFullData,
    /// Fetch the full current version of the entity.
    Refetch,
    /// Reconcile the whole bucket against the remote index.
    Reindex,
    /// Resend after a backoff delay.
    Retry,
    /// Nothing else to do; the error is reported to the caller.
    Surface,
}

/// Synchronization error taxonomy.
///
/// Errors are never swallowed: the bucket performs [`SyncError::recovery`]
/// and reports the error to its listener.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    #[error("[{bucket}] duplicate change for {key}")]
    DuplicateChange { bucket: BucketName, key: Key },

    #[error("[{bucket}] server rejected diff for {key}")]
    InvalidSentChange { bucket: BucketName, key: Key },

    #[error("[{bucket}] received change for unknown entity {key}")]
    ReceivedUnknownChange { bucket: BucketName, key: Key },

    #[error("[{bucket}] could not apply received change for {key}: {reason}")]
    InvalidReceivedChange {
        bucket: BucketName,
        key: Key,
        reason: String,
    },

    #[error("[{bucket}] ghost integrity compromised for {key}: {reason}")]
    EntityGhostIntegrity {
        bucket: BucketName,
        key: Key,
        reason: String,
    },

    #[error("[{bucket}] out of sync on {key}: ghost at {local:?}, change starts at {remote:?}")]
    ClientOutOfSync {
        bucket: BucketName,
        key: Key,
        local: Option<Version>,
        remote: Option<Version>,
    },

    #[error("[{bucket}] change for {key} rejected with code {code}")]
    ClientError {
        bucket: BucketName,
        key: Key,
        code: u16,
    },

    #[error("[{bucket}] server error {code} for {key} (attempt {attempt})")]
    ServerError {
        bucket: BucketName,
        key: Key,
        code: u16,
        attempt: u32,
    },

    #[error("[{bucket}] gave up on {key} after {attempts} attempts")]
    RetryExhausted {
        bucket: BucketName,
        key: Key,
        attempts: u32,
    },
}

impl SyncError {
    /// The deterministic recovery action for this error.
    pub fn recovery(&self) -> Recovery {
        match self {
            SyncError::DuplicateChange { .. } => Recovery::Drop,
            SyncError::InvalidSentChange { .. } => Recovery::SendFullData,
            SyncError::ReceivedUnknownChange { .. }
            | SyncError::InvalidReceivedChange { .. }
            | SyncError::EntityGhostIntegrity { .. } => Recovery::Refetch,
            SyncError::ClientOutOfSync { .. } => Recovery::Reindex,
            SyncError::ServerError { .. } => Recovery::Retry,
            SyncError::ClientError { .. } | SyncError::RetryExhausted { .. } => Recovery::Surface,
        }
    }

    /// The entity key the error concerns.
    pub fn key(&self) -> &Key {
        match self {
            SyncError::DuplicateChange { key, .. }
            | SyncError::InvalidSentChange { key, .. }
            | SyncError::ReceivedUnknownChange { key, .. }
            | SyncError::InvalidReceivedChange { key, .. }
            | SyncError::EntityGhostIntegrity { key, .. }
            | SyncError::ClientOutOfSync { key, .. }
            | SyncError::ClientError { key, .. }
            | SyncError::ServerError { key, .. }
            | SyncError::RetryExhausted { key, .. } => key,
        }
    }

    /// Whether the error is transient and will be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self.recovery(), Recovery::Retry)
    }
}

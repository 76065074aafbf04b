//! # Ghostline Engine
//!
//! Client-side sync engine for bucketed JSON records.
//!
//! Each record is synced by exchanging diffs against a *ghost*: the last
//! version both the client and the server agree on. Local edits are diffed
//! against the ghost and sent as changes; remote changes are applied to the
//! ghost and rebased onto local edits with operational transformation.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches sockets or files; callers feed it
//!   messages and get back the messages to send
//! - **One change in flight per record**: later edits wait for the ack
//! - **Ghost is the baseline**: it only moves on acks and remote changes
//!
//! ## Core Concepts
//!
//! ### Values and diffs
//!
//! Records are [`Attributes`], maps of [`Value`]s. The [`diff`] module
//! computes, applies and transforms [`DiffOp`]s per member: text diffs for
//! strings, increments for numbers, edit lists for lists and recursive
//! diffs for objects.
//!
//! ### Buckets
//!
//! A [`Bucket`] syncs one named collection. It owns the [`GhostStore`], the
//! [`ChangeProcessor`] queue and the [`IndexProcessor`] that reconciles
//! against the server's catalog. Records live in a [`Storage`] owned by the
//! app.
//!
//! ### Relationships
//!
//! Entity references to records that are not local yet are parked in the
//! [`RelationshipResolver`] and written once both ends exist.
//!
//! ## Quick Start
//!
//! ```rust
//! use ghostline_engine::{
//!     Bucket, BucketSchema, Inbound, Member, MemberType, MemoryStorage, Outbound, Storage,
//!     SyncConfig,
//! };
//! use ghostline_engine::value::attributes;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! // 1. Define the bucket
//! let schema = BucketSchema::new("notes", vec![Member::new("content", MemberType::Text)]);
//!
//! // 2. Create the bucket over app storage
//! let storage = Arc::new(MemoryStorage::new());
//! let config = Arc::new(SyncConfig::new("client-1"));
//! let mut bucket = Bucket::new(schema, config, storage.clone());
//!
//! // 3. Connect: no checkpoint yet, so the bucket asks for the index
//! let effects = bucket.start();
//! assert_eq!(effects.outbound[0].encode().unwrap(), "i:1:::500");
//! bucket.handle(Inbound::decode(r#"i:{"index":[],"current":"cv1"}"#).unwrap());
//!
//! // 4. Save locally and send the change
//! storage.insert("notes", "n1", attributes(json!({"content": "hello"})));
//! let effects = bucket.local_save(&["n1".to_string()]);
//! assert!(matches!(effects.outbound[0], Outbound::Change(_)));
//! ```
//!
//! ## Persistence
//!
//! Use [`Bucket::snapshot`] and [`Bucket::restore`] with [`BucketSnapshot`]
//! to persist sync state. Snapshots serialize to JSON with deterministic
//! ordering.

pub mod bucket;
pub mod change;
pub mod config;
pub mod diff;
pub mod error;
pub mod ghost;
pub mod listener;
pub mod processor;
pub mod protocol;
pub mod reconcile;
pub mod relationship;
pub mod schema;
pub mod snapshot;
pub mod storage;
pub mod value;

// Re-export main types at crate root
pub use bucket::{Bucket, BucketStatus, Effects};
pub use change::{Change, ErrorCode, Operation};
pub use config::{RetryConfig, SyncConfig};
pub use diff::{DiffOp, DiffPolicy, ObjectDiff, Strategy};
pub use error::{ApplyError, Error, Recovery, SyncError};
pub use ghost::{Ghost, GhostStore};
pub use listener::{BucketListener, ChangeType, NoopListener};
pub use processor::{ChangeProcessor, Mode};
pub use protocol::{Inbound, Outbound};
pub use reconcile::{IndexPage, IndexProcessor};
pub use relationship::{PendingRelationship, RelationshipResolver};
pub use schema::{BucketSchema, Member, MemberType, Schema};
pub use snapshot::{BucketSnapshot, SnapshotMetadata, SNAPSHOT_FORMAT_VERSION};
pub use storage::{MemoryStorage, Storage, StorageObserver};
pub use value::{Attributes, Value};

/// Type aliases for clarity
pub type Key = String;
pub type BucketName = String;
pub type Version = u64;
/// Opaque server token ordering all changes of a bucket
pub type ChangeVersion = String;
pub type ClientId = String;
pub type ChangeId = String;

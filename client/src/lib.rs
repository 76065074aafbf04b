//! # Ghostline Client
//!
//! Async runtime for [`ghostline_engine`]. Each bucket runs in its own tokio
//! task that serializes every operation on that bucket; buckets share one
//! transport, multiplexed by channel number.
//!
//! ```rust,no_run
//! use ghostline_client::{ChannelTransport, SyncClient};
//! use ghostline_engine::{BucketSchema, MemoryStorage, SyncConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> ghostline_client::Result<()> {
//! let storage = Arc::new(MemoryStorage::new());
//! let (transport, mut outbound) = ChannelTransport::pair();
//! let client = SyncClient::new_shared(
//!     Arc::new(SyncConfig::new("client-1")),
//!     storage.clone(),
//!     Arc::new(transport),
//! );
//! storage.add_observer(client.observer());
//!
//! client.add_bucket(BucketSchema::dynamic("notes"), None)?;
//! client.start()?;
//!
//! // forward `outbound` to the server and feed replies back
//! while let Some(message) = outbound.recv().await {
//!     println!("-> {message}");
//! }
//! client.receive("0:cv:?")?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod transport;
mod worker;

pub use client::SyncClient;
pub use config::{Config, ConfigError};
pub use error::{ClientError, Result};
pub use transport::{ChannelTransport, Transport};

//! Sync client.
//!
//! Owns one worker per bucket and multiplexes them over a single
//! [`Transport`]. Buckets get channel numbers in registration order;
//! inbound messages are routed to a worker by their channel prefix.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use ghostline_engine::protocol::split_channel;
use ghostline_engine::{
    Bucket, BucketListener, BucketName, BucketSchema, BucketSnapshot, BucketStatus, Inbound, Key,
    RelationshipResolver, Storage, StorageObserver, SyncConfig,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{ClientError, Result};
use crate::transport::Transport;
use crate::worker::{Command, Worker, WorkerHandle};

/// Async sync client for a set of buckets.
///
/// Thread-safe and can be shared across tasks via `Arc`.
pub struct SyncClient {
    config: Arc<SyncConfig>,
    storage: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,
    resolver: Arc<Mutex<RelationshipResolver>>,
    /// Running workers, keyed by bucket name.
    workers: DashMap<BucketName, WorkerHandle>,
    /// Bucket names indexed by channel.
    channels: Mutex<Vec<BucketName>>,
}

impl SyncClient {
    pub fn new(
        config: Arc<SyncConfig>,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            storage,
            transport,
            resolver: Arc::new(Mutex::new(RelationshipResolver::new())),
            workers: DashMap::new(),
            channels: Mutex::new(Vec::new()),
        }
    }

    /// Create a new client wrapped in Arc for sharing.
    pub fn new_shared(
        config: Arc<SyncConfig>,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new(Self::new(config, storage, transport))
    }

    /// Storage observer that forwards application saves to the workers.
    ///
    /// Holds the client weakly so storage does not keep it alive.
    pub fn observer(self: &Arc<Self>) -> Arc<dyn StorageObserver> {
        Arc::new(ClientObserver {
            client: Arc::downgrade(self),
        })
    }

    /// Register a bucket and spawn its worker.
    ///
    /// Must be called from within a tokio runtime. Returns the bucket's
    /// channel.
    pub fn add_bucket(
        &self,
        schema: BucketSchema,
        listener: Option<Arc<dyn BucketListener>>,
    ) -> Result<u32> {
        let mut channels = self.channels.lock();
        if channels.contains(&schema.name) {
            return Err(ClientError::DuplicateBucket(schema.name));
        }

        let name = schema.name.clone();
        let channel = channels.len() as u32;
        let mut bucket = Bucket::new(schema, self.config.clone(), self.storage.clone())
            .with_resolver(self.resolver.clone());
        if let Some(listener) = listener {
            bucket = bucket.with_listener(listener);
        }

        let handle = Worker::spawn(bucket, channel, self.transport.clone());
        self.workers.insert(name.clone(), handle);
        channels.push(name.clone());

        tracing::info!(bucket = %name, channel, "bucket registered");
        Ok(channel)
    }

    /// Channel of a registered bucket.
    pub fn channel(&self, bucket: &str) -> Option<u32> {
        self.workers.get(bucket).map(|handle| handle.channel)
    }

    /// Number of registered buckets.
    pub fn bucket_count(&self) -> usize {
        self.workers.len()
    }

    /// Start syncing every bucket. Call again after reconnecting.
    pub fn start(&self) -> Result<()> {
        let names: Vec<BucketName> = self.channels.lock().clone();
        for name in names {
            self.send(&name, Command::Start)?;
        }
        Ok(())
    }

    /// Route a message received from the server.
    pub fn receive(&self, message: &str) -> Result<()> {
        let (channel, body) = split_channel(message)?;
        let name = self
            .channels
            .lock()
            .get(channel as usize)
            .cloned()
            .ok_or(ClientError::UnknownChannel(channel))?;
        let inbound = Inbound::decode(body)?;

        tracing::debug!(bucket = %name, channel, "message routed");
        self.send(&name, Command::Inbound(inbound))
    }

    /// Capture saved records without going through a storage observer.
    pub fn local_save(&self, bucket: &str, keys: Vec<Key>) -> Result<()> {
        self.send(bucket, Command::LocalSave(keys))
    }

    /// Capture deleted records without going through a storage observer.
    pub fn local_delete(&self, bucket: &str, keys: Vec<Key>) -> Result<()> {
        self.send(bucket, Command::LocalDelete(keys))
    }

    /// Drop the bucket's checkpoint and rebuild it from the server index.
    pub fn reindex(&self, bucket: &str) -> Result<()> {
        self.send(bucket, Command::Reindex)
    }

    /// Fetch up to `count` of the latest versions of a record. They are
    /// reported to the bucket's listener.
    pub fn request_versions(&self, bucket: &str, key: impl Into<Key>, count: u64) -> Result<()> {
        self.send(
            bucket,
            Command::RequestVersions {
                key: key.into(),
                count,
            },
        )
    }

    pub async fn status(&self, bucket: &str) -> Result<BucketStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(bucket, Command::Status(tx))?;
        rx.await
            .map_err(|_| ClientError::WorkerGone(bucket.to_string()))
    }

    pub async fn snapshot(&self, bucket: &str) -> Result<BucketSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(bucket, Command::Snapshot(tx))?;
        rx.await
            .map_err(|_| ClientError::WorkerGone(bucket.to_string()))
    }

    /// Restore persisted sync state. Call before [`start`](Self::start).
    pub async fn restore(&self, bucket: &str, snapshot: BucketSnapshot) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(bucket, Command::Restore(snapshot, tx))?;
        rx.await
            .map_err(|_| ClientError::WorkerGone(bucket.to_string()))??;
        Ok(())
    }

    /// Drop queued and in-flight work of a bucket.
    ///
    /// Returns once the worker has drained its queue; retry timers scheduled
    /// before the reset no longer fire.
    pub async fn reset(&self, bucket: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(bucket, Command::Reset(tx))?;
        rx.await
            .map_err(|_| ClientError::WorkerGone(bucket.to_string()))
    }

    /// Stop every worker and wait for them to exit.
    pub async fn shutdown(&self) {
        let names: Vec<BucketName> = std::mem::take(&mut *self.channels.lock());
        let mut tasks = Vec::with_capacity(names.len());
        for name in names {
            if let Some((_, handle)) = self.workers.remove(&name) {
                let _ = handle.sender.send(Command::Shutdown);
                tasks.push(handle.task);
            }
        }
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "worker panicked");
            }
        }
        tracing::info!("sync client stopped");
    }

    fn send(&self, bucket: &str, command: Command) -> Result<()> {
        let handle = self
            .workers
            .get(bucket)
            .ok_or_else(|| ClientError::UnknownBucket(bucket.to_string()))?;
        handle
            .sender
            .send(command)
            .map_err(|_| ClientError::WorkerGone(bucket.to_string()))
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("client_id", &self.config.client_id)
            .field("buckets", &*self.channels.lock())
            .finish()
    }
}

/// Forwards storage saves to the owning client's workers.
struct ClientObserver {
    client: Weak<SyncClient>,
}

impl ClientObserver {
    fn forward(&self, bucket: &str, command: Command) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        match client.send(bucket, command) {
            Ok(()) => {}
            // not every bucket in storage is synced
            Err(ClientError::UnknownBucket(_)) => {}
            Err(e) => tracing::warn!(bucket, error = %e, "dropping local change"),
        }
    }
}

impl StorageObserver for ClientObserver {
    fn will_save(&self, bucket: &str, deleted: &[Key]) {
        if !deleted.is_empty() {
            self.forward(bucket, Command::LocalDelete(deleted.to_vec()));
        }
    }

    fn did_save(&self, bucket: &str, inserted: &[Key], updated: &[Key]) {
        let keys: Vec<Key> = inserted.iter().chain(updated).cloned().collect();
        if !keys.is_empty() {
            self.forward(bucket, Command::LocalSave(keys));
        }
    }
}

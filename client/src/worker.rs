//! Per-bucket worker task.
//!
//! Every bucket is driven by one tokio task that owns its [`Bucket`] and
//! handles [`Command`]s strictly in arrival order. Effects produced by the
//! bucket are encoded, prefixed with the bucket's channel and pushed to the
//! transport; retries are scheduled as timers that post back into the queue.

use std::sync::Arc;
use std::time::Duration;

use ghostline_engine::protocol::with_channel;
use ghostline_engine::{Bucket, BucketSnapshot, BucketStatus, Effects, Inbound, Key, Recovery};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::transport::Transport;

/// Work item for a bucket worker.
#[derive(Debug)]
pub enum Command {
    /// Resume from the checkpoint or start indexing.
    Start,
    /// Application saved these records.
    LocalSave(Vec<Key>),
    /// Application is deleting these records.
    LocalDelete(Vec<Key>),
    /// Message received on the bucket's channel.
    Inbound(Inbound),
    /// Retry timer fired. Ignored when `generation` is stale.
    Retry { key: Key, generation: u64 },
    Reindex,
    RequestVersions { key: Key, count: u64 },
    Status(oneshot::Sender<BucketStatus>),
    Snapshot(oneshot::Sender<BucketSnapshot>),
    Restore(
        BucketSnapshot,
        oneshot::Sender<ghostline_engine::error::Result<()>>,
    ),
    /// Drop queued work and in-flight changes.
    Reset(oneshot::Sender<()>),
    Shutdown,
}

/// Handle to a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    pub channel: u32,
    pub sender: mpsc::UnboundedSender<Command>,
    pub task: JoinHandle<()>,
}

pub struct Worker {
    bucket: Bucket,
    channel: u32,
    transport: Arc<dyn Transport>,
    /// Weak so that pending timers do not keep the worker alive.
    inbox: mpsc::WeakUnboundedSender<Command>,
    generation: u64,
}

impl Worker {
    /// Spawn a worker on the current runtime.
    pub fn spawn(bucket: Bucket, channel: u32, transport: Arc<dyn Transport>) -> WorkerHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = Worker {
            bucket,
            channel,
            transport,
            inbox: sender.downgrade(),
            generation: 0,
        };
        let task = tokio::spawn(worker.run(receiver));
        WorkerHandle {
            channel,
            sender,
            task,
        }
    }

    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Command>) {
        debug!(bucket = %self.bucket.name(), channel = self.channel, "worker started");

        while let Some(command) = receiver.recv().await {
            match command {
                Command::Shutdown => break,
                Command::Reset(done) => {
                    let shutdown = self.reset(&mut receiver);
                    let _ = done.send(());
                    if shutdown {
                        break;
                    }
                }
                command => self.handle(command),
            }
        }

        debug!(bucket = %self.bucket.name(), "worker stopped");
    }

    fn handle(&mut self, command: Command) {
        let effects = match command {
            Command::Start => self.bucket.start(),
            Command::LocalSave(keys) => self.bucket.local_save(&keys),
            Command::LocalDelete(keys) => self.bucket.local_delete(&keys),
            Command::Inbound(inbound) => self.bucket.handle(inbound),
            Command::Retry { key, generation } => {
                if generation != self.generation {
                    debug!(bucket = %self.bucket.name(), key = %key, "stale retry");
                    return;
                }
                self.bucket.retry(&key)
            }
            Command::Reindex => self.bucket.reindex(),
            Command::RequestVersions { key, count } => self.bucket.request_versions(&key, count),
            Command::Status(reply) => {
                let _ = reply.send(self.bucket.export_status());
                return;
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.bucket.snapshot());
                return;
            }
            Command::Restore(snapshot, reply) => {
                let _ = reply.send(self.bucket.restore(snapshot));
                return;
            }
            Command::Reset(_) | Command::Shutdown => return,
        };
        self.dispatch(effects);
    }

    /// Drain the queue and reset the bucket. Queries waiting in the queue
    /// are still answered. Returns true if a shutdown was drained.
    fn reset(&mut self, receiver: &mut mpsc::UnboundedReceiver<Command>) -> bool {
        let mut shutdown = false;
        let mut queries = Vec::new();
        while let Ok(command) = receiver.try_recv() {
            match command {
                Command::Shutdown => shutdown = true,
                command @ (Command::Status(_) | Command::Snapshot(_)) => queries.push(command),
                Command::Reset(done) => {
                    let _ = done.send(());
                }
                _ => {}
            }
        }

        self.generation += 1;
        self.bucket.reset();
        debug!(bucket = %self.bucket.name(), generation = self.generation, "bucket reset");

        for query in queries {
            self.handle(query);
        }
        shutdown
    }

    fn dispatch(&self, effects: Effects) {
        for outbound in &effects.outbound {
            let message = match outbound.encode() {
                Ok(message) => with_channel(self.channel, &message),
                Err(e) => {
                    error!(bucket = %self.bucket.name(), error = %e, "failed to encode message");
                    continue;
                }
            };
            if let Err(e) = self.transport.send(message) {
                error!(bucket = %self.bucket.name(), error = %e, "failed to send message");
            }
        }

        for (key, delay) in effects.retries {
            self.schedule_retry(key, delay);
        }

        for e in &effects.errors {
            if e.recovery() == Recovery::Surface {
                error!(bucket = %self.bucket.name(), key = %e.key(), error = %e, "change given up");
            }
        }
    }

    fn schedule_retry(&self, key: Key, delay: Duration) {
        let inbox = self.inbox.clone();
        let generation = self.generation;
        debug!(bucket = %self.bucket.name(), key = %key, ?delay, "retry scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(sender) = inbox.upgrade() {
                let _ = sender.send(Command::Retry { key, generation });
            }
        });
    }
}

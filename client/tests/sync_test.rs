//! Integration tests for the async client.
//!
//! A scripted server reads what the client sends through a
//! [`ChannelTransport`] and answers with `SyncClient::receive`.

use std::sync::Arc;
use std::time::Duration;

use ghostline_client::{ChannelTransport, ClientError, SyncClient};
use ghostline_engine::value::attributes;
use ghostline_engine::{
    Attributes, BucketListener, BucketSchema, Change, Key, Member, MemberType, MemoryStorage,
    Operation, RetryConfig, Storage, SyncConfig, Value, Version,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;

const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    client: Arc<SyncClient>,
    storage: Arc<MemoryStorage>,
    outbound: UnboundedReceiver<String>,
}

impl Harness {
    fn new(config: SyncConfig) -> Self {
        let storage = Arc::new(MemoryStorage::new());
        let (transport, outbound) = ChannelTransport::pair();
        let client = SyncClient::new_shared(Arc::new(config), storage.clone(), Arc::new(transport));
        storage.add_observer(client.observer());
        Self {
            client,
            storage,
            outbound,
        }
    }

    fn with_notes(config: SyncConfig, listener: Option<Arc<dyn BucketListener>>) -> Self {
        let harness = Self::new(config);
        harness.client.add_bucket(notes(), listener).unwrap();
        harness
    }

    async fn next(&mut self) -> String {
        tokio::time::timeout(WAIT, self.outbound.recv())
            .await
            .expect("client sent nothing")
            .expect("transport closed")
    }

    async fn next_change(&mut self) -> Change {
        let message = self.next().await;
        let json = message
            .strip_prefix("0:c:")
            .unwrap_or_else(|| panic!("expected a change, got {message}"));
        serde_json::from_str(json).unwrap()
    }

    /// Start and finish an empty index so local changes flow.
    async fn connect(&mut self, cv: &str) {
        self.client.start().unwrap();
        assert_eq!(self.next().await, "0:i:1:::500");
        self.client
            .receive(&format!(r#"0:i:{{"index":[],"current":"{cv}"}}"#))
            .unwrap();
    }

    fn save(&self, key: &str, data: serde_json::Value) {
        self.storage.put_local("notes", key, attributes(data));
        self.storage.save();
    }

    /// Wait until the worker has handled everything sent so far.
    async fn settle(&self) -> ghostline_engine::BucketStatus {
        self.client.status("notes").await.unwrap()
    }
}

fn notes() -> BucketSchema {
    BucketSchema::new(
        "notes",
        vec![
            Member::new("title", MemberType::Text),
            Member::new("views", MemberType::Number),
        ],
    )
}

fn config() -> SyncConfig {
    SyncConfig::new("client-1")
}

fn ack(change: &Change, version: Version, cv: &str) -> String {
    let mut ack = change.clone();
    ack.ccids = vec![change.ccid.clone()];
    ack.end_version = Some(version);
    ack.change_version = Some(cv.to_string());
    format!("0:c:{}", serde_json::to_string(&vec![ack]).unwrap())
}

fn error(change: &Change, code: u16) -> String {
    format!(
        "0:c:{}",
        json!([{"id": change.key, "ccid": change.ccid, "o": "M", "error": code}])
    )
}

#[derive(Default)]
struct Versions(Mutex<Vec<(Key, Version, Attributes)>>);

impl BucketListener for Versions {
    fn did_receive_object_version(
        &self,
        _bucket: &str,
        key: &str,
        version: Version,
        data: &Attributes,
    ) {
        self.0.lock().push((key.to_string(), version, data.clone()));
    }
}

// =============================================================================
// Connecting
// =============================================================================

#[tokio::test]
async fn index_fetches_missing_records() {
    let mut harness = Harness::with_notes(config(), None);

    harness.client.start().unwrap();
    assert_eq!(harness.next().await, "0:i:1:::500");

    harness
        .client
        .receive(r#"0:i:{"index":[{"id":"n1","v":2}],"current":"cv5"}"#)
        .unwrap();
    assert_eq!(harness.next().await, "0:e:n1.2");

    harness
        .client
        .receive("0:e:n1.2\n{\"title\":\"hello\",\"views\":3}")
        .unwrap();
    let status = harness.settle().await;

    assert!(!status.indexing);
    assert_eq!(status.checkpoint.as_deref(), Some("cv5"));
    assert_eq!(status.versions.get("n1"), Some(&2));
    let record = harness.storage.fetch("notes", "n1").unwrap();
    assert_eq!(record["title"], Value::String("hello".into()));
}

#[tokio::test]
async fn restored_checkpoint_resumes() {
    let mut first = Harness::with_notes(config(), None);
    first.connect("cv7").await;
    let snapshot = first.client.snapshot("notes").await.unwrap();
    assert_eq!(snapshot.checkpoint.as_deref(), Some("cv7"));

    let mut second = Harness::with_notes(config(), None);
    second.client.restore("notes", snapshot).await.unwrap();
    second.client.start().unwrap();

    assert_eq!(second.next().await, "0:cv:cv7");

    second.client.receive("0:cv:?").unwrap();
    assert_eq!(second.next().await, "0:i:1:::500");
}

#[tokio::test]
async fn buckets_are_routed_by_channel() {
    let mut harness = Harness::new(config());
    harness.client.add_bucket(notes(), None).unwrap();
    harness
        .client
        .add_bucket(BucketSchema::dynamic("tags"), None)
        .unwrap();

    harness.client.start().unwrap();
    let mut sent = vec![harness.next().await, harness.next().await];
    sent.sort();
    assert_eq!(sent, vec!["0:i:1:::500", "1:i:1:::500"]);

    harness
        .client
        .receive(r#"1:i:{"index":[],"current":"t1"}"#)
        .unwrap();

    let tags = harness.client.status("tags").await.unwrap();
    let notes = harness.client.status("notes").await.unwrap();
    assert_eq!(tags.checkpoint.as_deref(), Some("t1"));
    assert!(!tags.indexing);
    assert!(notes.indexing);

    assert!(matches!(
        harness.client.receive("2:cv:?"),
        Err(ClientError::UnknownChannel(2))
    ));
}

// =============================================================================
// Local changes
// =============================================================================

#[tokio::test]
async fn saved_record_is_sent_and_acknowledged() {
    let mut harness = Harness::with_notes(config(), None);
    harness.connect("cv1").await;

    harness.save("n1", json!({"title": "draft", "views": 1}));
    let change = harness.next_change().await;

    assert_eq!(change.key, "n1");
    assert_eq!(change.operation, Operation::Add);
    assert_eq!(change.client_id, "client-1");
    assert_eq!(harness.settle().await.pending, 1);

    harness.client.receive(&ack(&change, 1, "cv2")).unwrap();
    let status = harness.settle().await;

    assert_eq!(status.pending, 0);
    assert_eq!(status.checkpoint.as_deref(), Some("cv2"));
    assert_eq!(status.versions.get("n1"), Some(&1));
}

#[tokio::test]
async fn edits_wait_for_the_ack() {
    let mut harness = Harness::with_notes(config(), None);
    harness.connect("cv1").await;

    harness.save("n1", json!({"title": "a"}));
    let first = harness.next_change().await;
    harness.save("n1", json!({"title": "ab"}));
    assert_eq!(harness.settle().await.queued, 1);

    harness.client.receive(&ack(&first, 1, "cv2")).unwrap();
    let second = harness.next_change().await;

    assert_eq!(second.operation, Operation::Modify);
    assert_eq!(second.start_version, Some(1));
    assert_ne!(second.ccid, first.ccid);
}

#[tokio::test]
async fn deleted_record_is_sent_as_remove() {
    let mut harness = Harness::with_notes(config(), None);
    harness.connect("cv1").await;

    harness.save("n1", json!({"title": "a"}));
    let add = harness.next_change().await;
    harness.client.receive(&ack(&add, 1, "cv2")).unwrap();
    harness.settle().await;

    harness.storage.remove_local("notes", "n1");
    harness.storage.save();
    let remove = harness.next_change().await;

    assert_eq!(remove.operation, Operation::Remove);
    assert_eq!(remove.start_version, Some(1));
}

// =============================================================================
// Errors and retries
// =============================================================================

#[tokio::test]
async fn server_error_is_retried_after_delay() {
    let config = config()
        .with_retry(RetryConfig::new(3).with_base_delay(Duration::from_millis(20)));
    let mut harness = Harness::with_notes(config, None);
    harness.connect("cv1").await;

    harness.save("n1", json!({"title": "a"}));
    let change = harness.next_change().await;
    harness.client.receive(&error(&change, 503)).unwrap();

    let retried = harness.next_change().await;
    assert_eq!(retried.ccid, change.ccid);
    assert_eq!(retried.key, "n1");
}

#[tokio::test]
async fn reset_cancels_scheduled_retries() {
    let config = config()
        .with_retry(RetryConfig::new(3).with_base_delay(Duration::from_millis(100)));
    let mut harness = Harness::with_notes(config, None);
    harness.connect("cv1").await;

    harness.save("n1", json!({"title": "a"}));
    let change = harness.next_change().await;
    harness.client.receive(&error(&change, 500)).unwrap();
    assert_eq!(harness.settle().await.retries, 1);

    harness.client.reset("notes").await.unwrap();

    let late = tokio::time::timeout(Duration::from_millis(400), harness.outbound.recv()).await;
    assert!(late.is_err(), "retry fired after reset: {late:?}");

    let status = harness.settle().await;
    assert_eq!(status.pending, 0);
    assert_eq!(status.retries, 0);
    assert_eq!(status.checkpoint.as_deref(), Some("cv1"));
}

// =============================================================================
// Version history
// =============================================================================

#[tokio::test]
async fn requested_versions_reach_the_listener() {
    let versions = Arc::new(Versions::default());
    let mut harness = Harness::with_notes(config(), Some(versions.clone() as Arc<dyn BucketListener>));

    harness.client.start().unwrap();
    harness.next().await;
    harness
        .client
        .receive(r#"0:i:{"index":[{"id":"n1","v":2,"d":{"title":"now"}}],"current":"cv2"}"#)
        .unwrap();
    harness.settle().await;

    harness.client.request_versions("notes", "n1", 2).unwrap();
    assert_eq!(harness.next().await, "0:e:n1.1");
    assert_eq!(harness.next().await, "0:e:n1.2");

    harness
        .client
        .receive("0:e:n1.1\n{\"title\":\"then\"}")
        .unwrap();
    harness.settle().await;

    let received = versions.0.lock().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, "n1");
    assert_eq!(received[0].1, 1);
    assert_eq!(received[0].2["title"], Value::String("then".into()));

    let record = harness.storage.fetch("notes", "n1").unwrap();
    assert_eq!(record["title"], Value::String("now".into()));
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn saves_for_unsynced_buckets_are_ignored() {
    let mut harness = Harness::with_notes(config(), None);
    harness.connect("cv1").await;

    harness.storage.put_local("drafts", "d1", attributes(json!({"title": "x"})));
    harness.storage.save();

    let status = harness.settle().await;
    assert_eq!(status.pending, 0);
    assert!(harness.outbound.try_recv().is_err());
}

#[tokio::test]
async fn shutdown_closes_the_client() {
    let harness = Harness::with_notes(config(), None);

    harness.client.shutdown().await;

    assert!(matches!(
        harness.client.status("notes").await,
        Err(ClientError::UnknownBucket(_))
    ));
}

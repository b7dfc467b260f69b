#[path = "common/mod.rs"]
mod common;

use std::sync::Arc;

use common::{link_nodes, test_config, wait_until, MemoryHub, TestNode};
use tokio::time::{sleep, Duration};
use webdht::{normalize_key, DhtConfig, MessageKind};

async fn timestamp_of(node: &TestNode, key: &str) -> u64 {
    let key = normalize_key(key).expect("valid key");
    node.node
        .storage()
        .lock()
        .await
        .peek(&key)
        .map(|record| record.timestamp)
        .expect("record present")
}

#[tokio::test]
async fn replicate_pushes_to_nodes_missing_a_copy() {
    let hub = Arc::new(MemoryHub::default());
    let a = TestNode::new(hub.clone(), 0x10, test_config(20, 3)).await;
    let b = TestNode::new(hub.clone(), 0x11, test_config(20, 3)).await;

    assert!(!a.node.put("offline", b"v1".to_vec()).await.expect("valid key"));
    link_nodes(&a, &b).await;

    assert_eq!(a.node.replicate().await, 1);
    assert!(b.holds("offline").await);

    // Both sides now know the other holds a copy.
    a.transport.clear_sent().await;
    assert_eq!(a.node.replicate().await, 0);
    assert_eq!(b.node.replicate().await, 0);
    assert_eq!(a.transport.sent_count(MessageKind::Store).await, 0);
}

#[tokio::test]
async fn republish_refreshes_only_own_records() {
    let hub = Arc::new(MemoryHub::default());
    let a = TestNode::new(hub.clone(), 0x20, test_config(20, 3)).await;
    let b = TestNode::new(hub.clone(), 0x21, test_config(20, 3)).await;
    link_nodes(&a, &b).await;

    assert!(a.node.put("mine", b"v".to_vec()).await.expect("valid key"));
    let published = timestamp_of(&a, "mine").await;
    assert_eq!(timestamp_of(&b, "mine").await, published);

    sleep(Duration::from_millis(10)).await;
    assert_eq!(a.node.republish().await, 1);
    let refreshed = timestamp_of(&a, "mine").await;
    assert!(refreshed > published);
    assert_eq!(timestamp_of(&b, "mine").await, refreshed);

    // `b` only holds a copy received over STORE.
    b.transport.clear_sent().await;
    assert_eq!(b.node.republish().await, 0);
    assert_eq!(b.transport.sent_count(MessageKind::Store).await, 0);
}

#[tokio::test]
async fn replication_timer_reaches_late_joiners() {
    let hub = Arc::new(MemoryHub::default());
    let config = DhtConfig {
        replicate_interval_ms: 50,
        ..test_config(20, 3)
    };
    let a = TestNode::new(hub.clone(), 0x30, config).await;
    let b = TestNode::new(hub.clone(), 0x31, test_config(20, 3)).await;

    assert!(!a.node.put("late", b"v".to_vec()).await.expect("valid key"));
    link_nodes(&a, &b).await;

    let b_ref = &b;
    assert!(
        wait_until(|| async move { b_ref.holds("late").await }).await,
        "replication timer never pushed the record"
    );
}

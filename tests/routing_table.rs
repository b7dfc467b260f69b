use std::collections::HashSet;

use anyhow::{anyhow, Result};
use tokio::sync::Mutex;
use tokio::time::Duration;

use webdht::{
    probe_stale_entry, Contact, DhtNetwork, InsertOutcome, Key, NodeId, PendingEviction,
    RoutingTable,
};

fn make_node_id(byte: u8) -> NodeId {
    let mut id = [0u8; 20];
    id[0] = byte;
    NodeId::from_bytes(id)
}

fn make_contact(byte: u8) -> Contact {
    Contact::new(make_node_id(byte), format!("node-{byte}"))
}

/// Answers pings from everyone except `dead`, logging each attempt.
#[derive(Default)]
struct PingNetwork {
    dead: HashSet<NodeId>,
    pings: Mutex<Vec<NodeId>>,
}

impl PingNetwork {
    fn with_dead(ids: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            dead: ids.into_iter().collect(),
            pings: Mutex::new(Vec::new()),
        }
    }

    async fn ping_calls(&self) -> Vec<NodeId> {
        self.pings.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl DhtNetwork for PingNetwork {
    async fn find_node(&self, _to: &Contact, _target: NodeId) -> Result<Vec<Contact>> {
        Ok(Vec::new())
    }

    async fn find_value(&self, _to: &Contact, _key: Key) -> Result<(Option<Vec<u8>>, Vec<Contact>)> {
        Ok((None, Vec::new()))
    }

    async fn store(&self, _to: &Contact, _key: Key, _value: Vec<u8>) -> Result<()> {
        Ok(())
    }

    async fn ping(&self, to: &Contact) -> Result<()> {
        self.pings.lock().await.push(to.id);
        if self.dead.contains(&to.id) {
            Err(anyhow!("peer not reachable"))
        } else {
            Ok(())
        }
    }
}

/// Fill the far half of a table owned by 0x00 with `k` contacts.
fn full_far_bucket(k: u8) -> RoutingTable {
    let mut table = RoutingTable::new(make_node_id(0x00), usize::from(k));
    for offset in 0..k {
        assert!(matches!(
            table.add_node(make_contact(0x80 + offset)),
            InsertOutcome::Inserted
        ));
    }
    table
}

#[test]
fn twenty_five_contacts_in_one_half_keep_k() {
    let mut table = RoutingTable::new(make_node_id(0x00), 20);
    let mut full = 0;
    for offset in 0..25u8 {
        if !matches!(
            table.add_node(make_contact(0x80 + offset)),
            InsertOutcome::Inserted
        ) {
            full += 1;
        }
    }
    assert_eq!(table.len(), 20);
    assert_eq!(full, 5);
    assert!(table.leaves().all(|b| b.len() <= 20));
}

#[tokio::test]
async fn unresponsive_oldest_is_replaced_after_all_attempts() {
    let routing = Mutex::new(full_far_bucket(2));
    let network = PingNetwork::with_dead([make_node_id(0x80)]);

    let outcome = routing.lock().await.add_node(make_contact(0xA0));
    let InsertOutcome::Full(pending) = outcome else {
        panic!("bucket should be full");
    };
    let survived =
        probe_stale_entry(&routing, &network, pending, 2, Duration::from_millis(50)).await;

    assert!(!survived);
    assert_eq!(
        network.ping_calls().await,
        vec![make_node_id(0x80), make_node_id(0x80)]
    );
    let table = routing.lock().await;
    assert!(!table.has_node(&make_node_id(0x80)));
    assert!(table.has_node(&make_node_id(0xA0)));
    assert_eq!(table.len(), 2);
}

#[tokio::test]
async fn responsive_oldest_survives_and_candidate_is_dropped() {
    let routing = Mutex::new(full_far_bucket(2));
    let network = PingNetwork::default();

    let InsertOutcome::Full(pending) = routing.lock().await.add_node(make_contact(0xA0)) else {
        panic!("bucket should be full");
    };
    assert!(probe_stale_entry(&routing, &network, pending, 2, Duration::from_millis(50)).await);

    assert_eq!(network.ping_calls().await, vec![make_node_id(0x80)]);
    let table = routing.lock().await;
    assert!(table.has_node(&make_node_id(0x80)));
    assert!(!table.has_node(&make_node_id(0xA0)));
}

#[tokio::test]
async fn probe_runs_only_when_a_candidate_waits_on_a_full_bucket() {
    let mut table = RoutingTable::new(make_node_id(0x00), 3);
    for byte in [0x80, 0x90] {
        assert!(matches!(
            table.add_node(make_contact(byte)),
            InsertOutcome::Inserted
        ));
    }
    // Room left: no eviction is ever proposed, even for stale entries.
    assert!(matches!(
        table.add_node(make_contact(0xA0)),
        InsertOutcome::Inserted
    ));
    assert!(matches!(
        table.add_node(make_contact(0x80)),
        InsertOutcome::Refreshed
    ));

    let InsertOutcome::Full(pending) = table.add_node(make_contact(0xB0)) else {
        panic!("bucket should be full");
    };
    // 0x80 was refreshed, so 0x90 is the least recently seen.
    assert_eq!(pending.oldest.id, make_node_id(0x90));
    // A second candidate while the probe is outstanding is dropped.
    assert!(matches!(
        table.add_node(make_contact(0xC0)),
        InsertOutcome::Dropped
    ));

    let routing = Mutex::new(table);
    let network = PingNetwork::with_dead([make_node_id(0x90)]);
    assert!(!probe_stale_entry(&routing, &network, pending, 3, Duration::from_millis(50)).await);
    assert_eq!(network.ping_calls().await.len(), 3);

    let table = routing.lock().await;
    assert!(table.has_node(&make_node_id(0xB0)));
    assert!(!table.has_node(&make_node_id(0xC0)));
}

#[tokio::test]
async fn slow_ping_counts_as_failure() {
    struct Hanging;

    #[async_trait::async_trait]
    impl DhtNetwork for Hanging {
        async fn find_node(&self, _to: &Contact, _target: NodeId) -> Result<Vec<Contact>> {
            Ok(Vec::new())
        }

        async fn find_value(&self, _to: &Contact, _key: Key) -> Result<(Option<Vec<u8>>, Vec<Contact>)> {
            Ok((None, Vec::new()))
        }

        async fn store(&self, _to: &Contact, _key: Key, _value: Vec<u8>) -> Result<()> {
            Ok(())
        }

        async fn ping(&self, _to: &Contact) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    let routing = Mutex::new(full_far_bucket(1));
    let pending = PendingEviction {
        oldest: make_contact(0x80),
        candidate: make_contact(0xF0),
    };
    routing.lock().await.add_node(pending.candidate.clone());
    assert!(!probe_stale_entry(&routing, &Hanging, pending, 2, Duration::from_millis(20)).await);
    assert!(routing.lock().await.has_node(&make_node_id(0xF0)));
}

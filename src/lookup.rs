//! Iterative Kademlia lookups.
//!
//! A [`Lookup`] owns the shortlist for one FIND_NODE or FIND_VALUE search.
//! Each round it queries up to `alpha` of the closest candidates it has not
//! asked yet, folds their answers back into the shortlist, and stops once no
//! unqueried candidate is closer than the best node that has answered. A
//! FIND_VALUE search ends as soon as any node returns the value.
//!
//! Failed or silent candidates are remembered so they are never asked twice
//! and never appear in results. The whole search runs under one deadline.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, trace};

use crate::config::DhtConfig;
use crate::core::{xor_distance, Contact, Distance, NodeId};
use crate::rpc::DhtNetwork;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupKind {
    FindNode,
    FindValue,
}

/// Lifecycle of a lookup. The last four states are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupState {
    Seeded,
    Querying,
    Converged,
    ValueFound,
    TimedOut,
    NoRoute,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LookupOutcome {
    /// FIND_NODE converged; the closest live contacts, nearest first.
    Nodes(Vec<Contact>),
    Value {
        value: Vec<u8>,
        from: Contact,
        closest: Vec<Contact>,
    },
    /// FIND_VALUE converged without finding the value.
    NotFound(Vec<Contact>),
    /// Nothing to seed the shortlist with; no request was sent.
    NoRoute,
    /// The deadline passed; carries the best contacts found so far.
    TimedOut(Vec<Contact>),
}

impl LookupOutcome {
    /// Contacts carried by the outcome, whatever the terminal state.
    pub fn into_contacts(self) -> Vec<Contact> {
        match self {
            LookupOutcome::Nodes(nodes)
            | LookupOutcome::NotFound(nodes)
            | LookupOutcome::TimedOut(nodes) => nodes,
            LookupOutcome::Value { closest, .. } => closest,
            LookupOutcome::NoRoute => Vec::new(),
        }
    }

    pub fn state(&self) -> LookupState {
        match self {
            LookupOutcome::Nodes(_) | LookupOutcome::NotFound(_) => LookupState::Converged,
            LookupOutcome::Value { .. } => LookupState::ValueFound,
            LookupOutcome::NoRoute => LookupState::NoRoute,
            LookupOutcome::TimedOut(_) => LookupState::TimedOut,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LookupParams {
    pub k: usize,
    pub alpha: usize,
    pub request_timeout: Duration,
    pub deadline: Duration,
}

impl LookupParams {
    pub fn from_config(config: &DhtConfig) -> Self {
        Self {
            k: config.k,
            alpha: config.alpha,
            request_timeout: config.request_timeout(),
            deadline: config.lookup_timeout(),
        }
    }
}

/// Receives every contact a lookup hears about, so the routing table fills
/// itself from lookup traffic.
#[async_trait]
pub trait ContactObserver: Send + Sync {
    async fn observe_contact(&self, contact: Contact);
}

/// Observer that discards contacts.
pub struct NoopObserver;

#[async_trait]
impl ContactObserver for NoopObserver {
    async fn observe_contact(&self, _contact: Contact) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CandidateStatus {
    Fresh,
    InFlight,
    Responded,
    Failed,
}

#[derive(Clone, Debug)]
struct Candidate {
    contact: Contact,
    distance: Distance,
    status: CandidateStatus,
}

type QueryReply = (Option<Vec<u8>>, Vec<Contact>);

/// A single iterative search. Consumed by [`run`](Lookup::run).
#[derive(Debug)]
pub struct Lookup {
    local_id: NodeId,
    target: NodeId,
    kind: LookupKind,
    params: LookupParams,
    /// Every candidate seen so far, nearest first.
    shortlist: Vec<Candidate>,
    state: LookupState,
    rounds: usize,
}

impl Lookup {
    pub fn new(
        local_id: NodeId,
        target: NodeId,
        kind: LookupKind,
        seeds: Vec<Contact>,
        params: LookupParams,
    ) -> Self {
        let mut lookup = Self {
            local_id,
            target,
            kind,
            params,
            shortlist: Vec::new(),
            state: LookupState::Seeded,
            rounds: 0,
        };
        for seed in seeds {
            lookup.insert(seed);
        }
        lookup
    }

    pub fn state(&self) -> LookupState {
        self.state
    }

    /// Add a contact unless it is the local node or already known.
    fn insert(&mut self, contact: Contact) -> bool {
        if contact.id == self.local_id || self.position(&contact.id).is_some() {
            return false;
        }
        let distance = xor_distance(&contact.id, &self.target);
        let at = self
            .shortlist
            .partition_point(|c| c.distance < distance);
        self.shortlist.insert(
            at,
            Candidate {
                contact,
                distance,
                status: CandidateStatus::Fresh,
            },
        );
        true
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.shortlist.iter().position(|c| c.contact.id == *id)
    }

    fn set_status(&mut self, id: &NodeId, status: CandidateStatus) {
        if let Some(idx) = self.position(id) {
            self.shortlist[idx].status = status;
        }
    }

    /// The `k` nearest candidates that have not failed.
    fn window(&self) -> impl Iterator<Item = &Candidate> {
        self.shortlist
            .iter()
            .filter(|c| c.status != CandidateStatus::Failed)
            .take(self.params.k)
    }

    fn closest_live(&self) -> Vec<Contact> {
        self.window().map(|c| c.contact.clone()).collect()
    }

    fn best_responded(&self) -> Option<Distance> {
        self.shortlist
            .iter()
            .find(|c| c.status == CandidateStatus::Responded)
            .map(|c| c.distance)
    }

    /// Next batch of candidates to query, or `None` once the search converged.
    fn next_batch(&self) -> Option<Vec<Contact>> {
        let best = self.best_responded();
        let batch: Vec<Contact> = self
            .window()
            .filter(|c| c.status == CandidateStatus::Fresh)
            .filter(|c| best.map_or(true, |best| c.distance < best))
            .take(self.params.alpha.max(1))
            .map(|c| c.contact.clone())
            .collect();
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }

    /// Drive the search to a terminal state.
    pub async fn run<N, O>(mut self, network: &N, observer: &O) -> LookupOutcome
    where
        N: DhtNetwork + ?Sized,
        O: ContactObserver + ?Sized,
    {
        if self.shortlist.is_empty() {
            self.state = LookupState::NoRoute;
            debug!(lookup_target = %self.target, kind = ?self.kind, "no routing information for lookup");
            return LookupOutcome::NoRoute;
        }

        self.state = LookupState::Querying;
        let deadline = Instant::now() + self.params.deadline;
        let result = time::timeout_at(deadline, self.iterate(network, observer)).await;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(lookup_target = %self.target, rounds = self.rounds, "lookup deadline exceeded");
                LookupOutcome::TimedOut(self.closest_live())
            }
        };
        self.state = outcome.state();
        debug!(
            lookup_target = %self.target,
            kind = ?self.kind,
            rounds = self.rounds,
            state = ?self.state,
            "lookup finished"
        );
        outcome
    }

    async fn iterate<N, O>(&mut self, network: &N, observer: &O) -> LookupOutcome
    where
        N: DhtNetwork + ?Sized,
        O: ContactObserver + ?Sized,
    {
        while let Some(batch) = self.next_batch() {
            self.rounds += 1;
            trace!(lookup_target = %self.target, round = self.rounds, queries = batch.len(), "lookup round");

            let mut in_flight = FuturesUnordered::new();
            for contact in batch {
                self.set_status(&contact.id, CandidateStatus::InFlight);
                in_flight.push(query(
                    network,
                    self.kind,
                    self.target,
                    contact,
                    self.params.request_timeout,
                ));
            }

            // Responses are folded in arrival order.
            while let Some((contact, reply)) = in_flight.next().await {
                let Some((value, nodes)) = reply else {
                    self.set_status(&contact.id, CandidateStatus::Failed);
                    continue;
                };
                self.set_status(&contact.id, CandidateStatus::Responded);
                observer.observe_contact(contact.clone()).await;

                for node in nodes {
                    if node.id == self.local_id {
                        continue;
                    }
                    observer.observe_contact(node.clone()).await;
                    self.insert(node);
                }

                if let Some(value) = value {
                    return LookupOutcome::Value {
                        value,
                        from: contact,
                        closest: self.closest_live(),
                    };
                }
            }
        }

        match self.kind {
            LookupKind::FindNode => LookupOutcome::Nodes(self.closest_live()),
            LookupKind::FindValue => LookupOutcome::NotFound(self.closest_live()),
        }
    }
}

/// Issue one request; a failure or timeout yields `None`.
async fn query<N>(
    network: &N,
    kind: LookupKind,
    target: NodeId,
    contact: Contact,
    timeout: Duration,
) -> (Contact, Option<QueryReply>)
where
    N: DhtNetwork + ?Sized,
{
    let result = match kind {
        LookupKind::FindNode => time::timeout(timeout, network.find_node(&contact, target))
            .await
            .map(|res| res.map(|nodes| (None, nodes))),
        LookupKind::FindValue => time::timeout(timeout, network.find_value(&contact, target)).await,
    };
    match result {
        Ok(Ok(reply)) => (contact, Some(reply)),
        Ok(Err(err)) => {
            debug!(peer = %contact.id, "lookup query failed: {err:?}");
            (contact, None)
        }
        Err(_) => {
            debug!(peer = %contact.id, "lookup query timed out");
            (contact, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Key, ID_LEN};
    use anyhow::{anyhow, Result};
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    fn make_node_id(byte: u8) -> NodeId {
        let mut id = [0u8; ID_LEN];
        id[0] = byte;
        NodeId::from_bytes(id)
    }

    fn make_contact(byte: u8) -> Contact {
        Contact::new(make_node_id(byte), format!("node-{byte}"))
    }

    /// Static topology: each node answers with a fixed neighbour list.
    #[derive(Default)]
    struct StaticNetwork {
        neighbours: HashMap<NodeId, Vec<Contact>>,
        values: HashMap<NodeId, Vec<u8>>,
        silent: HashSet<NodeId>,
        calls: Mutex<Vec<NodeId>>,
    }

    impl StaticNetwork {
        fn calls(&self) -> Vec<NodeId> {
            self.calls.lock().expect("lock").clone()
        }

        fn answer(&self, to: &Contact) -> Result<Vec<Contact>> {
            self.calls.lock().expect("lock").push(to.id);
            if self.silent.contains(&to.id) {
                return Err(anyhow!("unreachable"));
            }
            Ok(self.neighbours.get(&to.id).cloned().unwrap_or_default())
        }
    }

    #[async_trait]
    impl DhtNetwork for StaticNetwork {
        async fn find_node(&self, to: &Contact, _target: NodeId) -> Result<Vec<Contact>> {
            self.answer(to)
        }

        async fn find_value(&self, to: &Contact, _key: Key) -> Result<(Option<Vec<u8>>, Vec<Contact>)> {
            let nodes = self.answer(to)?;
            Ok((self.values.get(&to.id).cloned(), nodes))
        }

        async fn store(&self, _to: &Contact, _key: Key, _value: Vec<u8>) -> Result<()> {
            Ok(())
        }

        async fn ping(&self, _to: &Contact) -> Result<()> {
            Ok(())
        }
    }

    fn params(k: usize, alpha: usize) -> LookupParams {
        LookupParams {
            k,
            alpha,
            request_timeout: Duration::from_millis(100),
            deadline: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn empty_seed_list_reports_no_route() {
        let network = StaticNetwork::default();
        let lookup = Lookup::new(
            NodeId::ZERO,
            make_node_id(0x42),
            LookupKind::FindNode,
            Vec::new(),
            params(20, 3),
        );
        assert_eq!(lookup.state(), LookupState::Seeded);
        let outcome = lookup.run(&network, &NoopObserver).await;
        assert_eq!(outcome, LookupOutcome::NoRoute);
        assert!(network.calls().is_empty());
    }

    #[tokio::test]
    async fn find_node_walks_towards_the_target() {
        // 0x80 knows 0x40, which knows 0x11; the target is 0x10.
        let mut network = StaticNetwork::default();
        network
            .neighbours
            .insert(make_node_id(0x80), vec![make_contact(0x40)]);
        network
            .neighbours
            .insert(make_node_id(0x40), vec![make_contact(0x11), make_contact(0x00)]);

        let lookup = Lookup::new(
            make_node_id(0x00),
            make_node_id(0x10),
            LookupKind::FindNode,
            vec![make_contact(0x80)],
            params(20, 3),
        );
        let outcome = lookup.run(&network, &NoopObserver).await;
        let LookupOutcome::Nodes(nodes) = outcome else {
            panic!("expected nodes, got {outcome:?}");
        };
        let ids: Vec<u8> = nodes.iter().map(|c| c.id.as_bytes()[0]).collect();
        assert_eq!(ids, vec![0x11, 0x40, 0x80]);
        assert!(!nodes.iter().any(|c| c.id == make_node_id(0x00)));
    }

    #[tokio::test]
    async fn failed_candidates_are_excluded_and_not_retried() {
        let mut network = StaticNetwork::default();
        network.silent.insert(make_node_id(0x11));
        network
            .neighbours
            .insert(make_node_id(0x20), vec![make_contact(0x11), make_contact(0x12)]);

        let lookup = Lookup::new(
            make_node_id(0xff),
            make_node_id(0x10),
            LookupKind::FindNode,
            vec![make_contact(0x11), make_contact(0x20)],
            params(20, 1),
        );
        let nodes = lookup.run(&network, &NoopObserver).await.into_contacts();
        assert!(!nodes.iter().any(|c| c.id == make_node_id(0x11)));
        assert!(nodes.iter().any(|c| c.id == make_node_id(0x12)));

        let calls = network.calls();
        assert_eq!(
            calls.iter().filter(|id| **id == make_node_id(0x11)).count(),
            1
        );
    }

    #[tokio::test]
    async fn find_value_stops_at_first_holder() {
        let mut network = StaticNetwork::default();
        let far: Vec<Contact> = (0x30..0x40).map(make_contact).collect();
        network.neighbours.insert(make_node_id(0x21), far);
        network.values.insert(make_node_id(0x21), b"payload".to_vec());

        let lookup = Lookup::new(
            make_node_id(0xff),
            make_node_id(0x20),
            LookupKind::FindValue,
            vec![make_contact(0x21), make_contact(0x60), make_contact(0x70)],
            params(20, 1),
        );
        let outcome = lookup.run(&network, &NoopObserver).await;
        match outcome {
            LookupOutcome::Value { value, from, .. } => {
                assert_eq!(value, b"payload".to_vec());
                assert_eq!(from.id, make_node_id(0x21));
            }
            other => panic!("expected value, got {other:?}"),
        }
        assert_eq!(network.calls(), vec![make_node_id(0x21)]);
    }

    #[tokio::test]
    async fn find_value_without_holder_is_not_found() {
        let network = StaticNetwork::default();
        let lookup = Lookup::new(
            make_node_id(0xff),
            make_node_id(0x20),
            LookupKind::FindValue,
            vec![make_contact(0x21)],
            params(20, 3),
        );
        let outcome = lookup.run(&network, &NoopObserver).await;
        assert_eq!(outcome.state(), LookupState::Converged);
        assert!(matches!(outcome, LookupOutcome::NotFound(ref nodes) if nodes.len() == 1));
    }

    struct SlowNetwork;

    #[async_trait]
    impl DhtNetwork for SlowNetwork {
        async fn find_node(&self, to: &Contact, _target: NodeId) -> Result<Vec<Contact>> {
            time::sleep(Duration::from_millis(50)).await;
            // Always hand back one more, closer-looking node.
            let next = to.id.as_bytes()[0].saturating_sub(1);
            Ok(vec![make_contact(next)])
        }

        async fn find_value(&self, _to: &Contact, _key: Key) -> Result<(Option<Vec<u8>>, Vec<Contact>)> {
            Ok((None, Vec::new()))
        }

        async fn store(&self, _to: &Contact, _key: Key, _value: Vec<u8>) -> Result<()> {
            Ok(())
        }

        async fn ping(&self, _to: &Contact) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn overall_deadline_yields_timed_out() {
        let lookup = Lookup::new(
            make_node_id(0xff),
            make_node_id(0x00),
            LookupKind::FindNode,
            vec![make_contact(0xf0)],
            LookupParams {
                k: 20,
                alpha: 1,
                request_timeout: Duration::from_secs(1),
                deadline: Duration::from_millis(175),
            },
        );
        let outcome = lookup.run(&SlowNetwork, &NoopObserver).await;
        assert_eq!(outcome.state(), LookupState::TimedOut);
        assert!(!outcome.into_contacts().is_empty());
    }

    struct Collect(Mutex<Vec<NodeId>>);

    #[async_trait]
    impl ContactObserver for Collect {
        async fn observe_contact(&self, contact: Contact) {
            self.0.lock().expect("lock").push(contact.id);
        }
    }

    #[tokio::test]
    async fn observer_sees_responders_and_returned_nodes() {
        let mut network = StaticNetwork::default();
        network
            .neighbours
            .insert(make_node_id(0x80), vec![make_contact(0x40), make_contact(0x00)]);
        let observer = Collect(Mutex::new(Vec::new()));
        Lookup::new(
            make_node_id(0x00),
            make_node_id(0x10),
            LookupKind::FindNode,
            vec![make_contact(0x80)],
            params(20, 3),
        )
        .run(&network, &observer)
        .await;

        let seen = observer.0.lock().expect("lock").clone();
        assert!(seen.contains(&make_node_id(0x80)));
        assert!(seen.contains(&make_node_id(0x40)));
        assert!(!seen.contains(&make_node_id(0x00)));
    }
}

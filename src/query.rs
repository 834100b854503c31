//! The iterative lookup engine.
//!
//! Every user-facing operation is one parameterisation of the same bounded
//! parallel traversal: walk the keyspace toward a target, keeping at most
//! alpha requests in flight, absorbing each response's closer peers into an
//! ordered candidate set, until the closest known peers have all answered,
//! the operation's stop predicate fires, candidates run out, or the query's
//! time budget elapses. Per-peer failures only mark that peer failed; they
//! never abort the lookup.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;

use anyhow::anyhow;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace};

use crate::core::{key_to_id, xor_distance, NodeId, PeerInfo};
use crate::net::DhtNetwork;
use crate::node::DhtNode;
use crate::protocol::Record;

/// Which request a lookup sends at each hop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LookupKind {
    /// FIND_NODE: pure convergence; also used to locate a specific peer.
    FindNode,
    /// GET_VALUE: convergence plus record collection.
    GetValue,
    /// GET_PROVIDERS: convergence plus provider collection.
    GetProviders,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PeerState {
    NotAsked,
    Waiting,
    Succeeded,
    Failed,
}

/// What one peer answered, flattened across the three request kinds.
struct PeerReply {
    closer: Vec<crate::protocol::WirePeer>,
    record: Option<Record>,
    providers: Vec<crate::protocol::WirePeer>,
}

type InFlight = Pin<Box<dyn Future<Output = (PeerInfo, anyhow::Result<PeerReply>)> + Send>>;

/// Everything a finished lookup knows, for the executors to pick apart.
pub(crate) struct LookupOutcome {
    /// The K closest peers that answered, ascending by distance to the
    /// target.
    pub closest: Vec<PeerInfo>,
    /// The best validated record, when the lookup collected any.
    pub record: Option<Record>,
    /// Peers that answered a GET_VALUE without the record; read-repair
    /// targets.
    pub record_gaps: Vec<PeerInfo>,
    /// Deduplicated providers collected from GET_PROVIDERS responses.
    pub providers: Vec<PeerInfo>,
    /// The sought peer, when this was a find-peer lookup and it surfaced.
    pub target_peer: Option<PeerInfo>,
}

/// One iterative lookup. Construct with one of the kind-specific
/// constructors, then [`run`](Lookup::run) it over a seed set.
pub(crate) struct Lookup<'a, N: DhtNetwork> {
    node: &'a DhtNode<N>,
    kind: LookupKind,
    /// The raw wire key; its hash is the traversal target.
    key: Vec<u8>,
    target: NodeId,
    /// Set when the lookup is after one specific peer id.
    wanted_peer: Option<NodeId>,
    /// Stop once this many providers are known (0 = no cap).
    provider_limit: usize,

    states: HashMap<NodeId, PeerState>,
    /// NOT_ASKED peers, keyed by (distance to target, peer id) so iteration
    /// order is ascending distance with a deterministic tie-break.
    candidates: BTreeMap<([u8; 32], NodeId), PeerInfo>,
    /// Peers that answered, same ordering.
    succeeded: BTreeMap<([u8; 32], NodeId), PeerInfo>,

    records: Vec<Record>,
    record_gaps: Vec<PeerInfo>,
    providers: Vec<PeerInfo>,
    provider_ids: HashSet<NodeId>,
    target_peer: Option<PeerInfo>,
}

impl<'a, N: DhtNetwork> Lookup<'a, N> {
    fn new(node: &'a DhtNode<N>, kind: LookupKind, key: Vec<u8>) -> Self {
        let target = key_to_id(&key);
        Self {
            node,
            kind,
            key,
            target,
            wanted_peer: None,
            provider_limit: 0,
            states: HashMap::new(),
            candidates: BTreeMap::new(),
            succeeded: BTreeMap::new(),
            records: Vec::new(),
            record_gaps: Vec::new(),
            providers: Vec::new(),
            provider_ids: HashSet::new(),
            target_peer: None,
        }
    }

    /// Converge on a key without collecting anything extra.
    pub(crate) fn find_node(node: &'a DhtNode<N>, key: Vec<u8>) -> Self {
        Self::new(node, LookupKind::FindNode, key)
    }

    /// Locate one specific peer; stops as soon as it surfaces with an
    /// address.
    pub(crate) fn find_peer(node: &'a DhtNode<N>, peer_id: NodeId) -> Self {
        let mut lookup = Self::new(node, LookupKind::FindNode, peer_id.to_vec());
        lookup.wanted_peer = Some(peer_id);
        lookup
    }

    /// Fetch the record for a key; stops at the first validated record.
    pub(crate) fn get_value(node: &'a DhtNode<N>, key: Vec<u8>) -> Self {
        Self::new(node, LookupKind::GetValue, key)
    }

    /// Collect providers for a key, stopping at `limit` when it is non-zero.
    pub(crate) fn get_providers(node: &'a DhtNode<N>, key: Vec<u8>, limit: usize) -> Self {
        let mut lookup = Self::new(node, LookupKind::GetProviders, key);
        lookup.provider_limit = limit;
        lookup
    }

    /// Drive the lookup to one of its four terminations and build the
    /// outcome. In-flight requests are dropped on the way out.
    pub(crate) async fn run(mut self, seeds: Vec<PeerInfo>) -> LookupOutcome {
        let config = self.node.config();
        let alpha = config.closer_peer_count.max(1);
        let deadline = Instant::now() + config.query_timeout;

        for seed in seeds {
            self.add_candidate(seed);
        }

        let mut inflight: FuturesUnordered<InFlight> = FuturesUnordered::new();
        loop {
            if !self.stop_predicate() {
                while inflight.len() < alpha {
                    let Some(peer) = self.next_candidate() else {
                        break;
                    };
                    trace!(
                        peer = %hex::encode(&peer.id[..8]),
                        target = %hex::encode(&self.target[..8]),
                        "querying"
                    );
                    self.states.insert(peer.id, PeerState::Waiting);
                    inflight.push(self.request(peer));
                }
            }

            if self.stop_predicate() || inflight.is_empty() {
                break;
            }

            match timeout_at(deadline, inflight.next()).await {
                Ok(Some((peer, Ok(reply)))) => self.absorb(peer, reply).await,
                Ok(Some((peer, Err(e)))) => {
                    debug!(peer = %hex::encode(&peer.id[..8]), "peer failed: {e:#}");
                    self.states.insert(peer.id, PeerState::Failed);
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(target = %hex::encode(&self.target[..8]), "lookup timed out");
                    break;
                }
            }
        }
        drop(inflight);

        self.into_outcome()
    }

    /// Whether the operation already has what it came for.
    fn stop_predicate(&self) -> bool {
        match self.kind {
            LookupKind::FindNode => self.wanted_peer.is_some() && self.target_peer.is_some(),
            LookupKind::GetValue => !self.records.is_empty(),
            LookupKind::GetProviders => {
                self.provider_limit > 0 && self.providers.len() >= self.provider_limit
            }
        }
    }

    /// The closest NOT_ASKED candidate still worth querying: one strictly
    /// closer to the target than the farthest of the K closest peers that
    /// already answered. `None` once the traversal has converged.
    fn next_candidate(&mut self) -> Option<PeerInfo> {
        let k = self.node.config().bucket_size;
        {
            let ((dist, _), _) = self.candidates.first_key_value()?;
            if self.succeeded.len() >= k {
                let (kth_dist, _) = self.succeeded.keys().nth(k - 1).expect("k entries");
                if dist >= kth_dist {
                    return None;
                }
            }
        }
        self.candidates.pop_first().map(|(_, peer)| peer)
    }

    fn add_candidate(&mut self, info: PeerInfo) {
        if info.id == self.node.local_info().id || self.states.contains_key(&info.id) {
            return;
        }
        let dist = xor_distance(&key_to_id(&info.id), &self.target);
        self.states.insert(info.id, PeerState::NotAsked);
        self.candidates.insert((dist, info.id), info);
    }

    /// The per-peer request future. Owns clones of everything it needs so
    /// it can sit in the in-flight set independently of `self`.
    fn request(&self, peer: PeerInfo) -> InFlight {
        let network = self.node.network();
        let kind = self.kind;
        let key = self.key.clone();
        let per_peer = self.node.config().connection_timeout;
        Box::pin(async move {
            let attempt = timeout(per_peer, async {
                match kind {
                    LookupKind::FindNode => {
                        network.find_node(&peer, &key).await.map(|closer| PeerReply {
                            closer,
                            record: None,
                            providers: Vec::new(),
                        })
                    }
                    LookupKind::GetValue => {
                        network.get_value(&peer, &key).await.map(|reply| PeerReply {
                            closer: reply.closer,
                            record: reply.record,
                            providers: reply.providers,
                        })
                    }
                    LookupKind::GetProviders => {
                        network.get_providers(&peer, &key).await.map(|reply| PeerReply {
                            closer: reply.closer,
                            record: None,
                            providers: reply.providers,
                        })
                    }
                }
            })
            .await;
            let result = match attempt {
                Ok(inner) => inner,
                Err(_) => Err(anyhow!("request timed out")),
            };
            (peer, result)
        })
    }

    /// Fold one response into the lookup and the node's tables.
    async fn absorb(&mut self, peer: PeerInfo, reply: PeerReply) {
        self.states.insert(peer.id, PeerState::Succeeded);
        let dist = xor_distance(&key_to_id(&peer.id), &self.target);
        self.succeeded.insert((dist, peer.id), peer.clone());
        self.node.observe_peer(&peer).await;

        // An answering peer that IS the sought peer settles a find-peer
        // lookup immediately.
        if self.wanted_peer == Some(peer.id) && self.target_peer.is_none() {
            self.target_peer = Some(peer.clone());
        }

        for wire_peer in reply.closer {
            let info = wire_peer.info;
            self.node.observe_peer(&info).await;
            if self.wanted_peer == Some(info.id)
                && !info.addrs.is_empty()
                && self.target_peer.is_none()
            {
                self.target_peer = Some(info.clone());
            }
            self.add_candidate(info);
        }

        for wire_peer in reply.providers {
            let info = wire_peer.info;
            self.node.observe_peer(&info).await;
            if self.provider_ids.insert(info.id) {
                self.providers.push(info);
            }
        }

        match reply.record {
            Some(record) => {
                match self.node.validator().validate(&self.key, &record.value) {
                    Ok(()) => self.records.push(record),
                    Err(_) => {
                        debug!(
                            peer = %hex::encode(&peer.id[..8]),
                            "discarding record that failed validation"
                        );
                        self.record_gaps.push(peer);
                    }
                }
            }
            None if self.kind == LookupKind::GetValue => self.record_gaps.push(peer),
            None => {}
        }
    }

    fn into_outcome(self) -> LookupOutcome {
        let k = self.node.config().bucket_size;
        let record = if self.records.is_empty() {
            None
        } else {
            let values: Vec<Vec<u8>> = self.records.iter().map(|r| r.value.clone()).collect();
            let chosen = self
                .node
                .validator()
                .select(&self.key, &values)
                .min(self.records.len() - 1);
            Some(self.records[chosen].clone())
        };
        LookupOutcome {
            closest: self.succeeded.values().take(k).cloned().collect(),
            record,
            record_gaps: self.record_gaps,
            providers: self.providers,
            target_peer: self.target_peer,
        }
    }
}

//! The DHT coordinator.
//!
//! [`DhtNode`] owns the peer routing table, the record store, the provider
//! table, and the address book, services inbound protocol messages, and
//! drives iterative lookups on behalf of local callers. It is generic over
//! the transport so tests can run whole networks in memory.
//!
//! Locking discipline: each table sits behind its own async mutex, and no
//! lock is ever held across network I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::core::{
    key_to_id, AddressBook, ContentRoutingTable, DefaultValidator, DhtConfig, Key, NodeId,
    PeerInfo, PeerRoutingTable, RecordStore, UpdateOutcome, Validator,
};
use crate::error::{DhtError, Result};
use crate::net::DhtNetwork;
use crate::protocol::{Message, MessageType, Record, WirePeer};
use crate::query::Lookup;

/// A running DHT node.
///
/// Constructed directly into an `Arc`: long-lived background work
/// (replication, bucket eviction pings, the random walk) holds either
/// clones of individual tables or the node's own `Weak` self-reference, so
/// dropping the last `Arc` winds everything down instead of keeping the
/// node alive from inside its own tasks.
pub struct DhtNode<N: DhtNetwork> {
    config: DhtConfig,
    self_info: PeerInfo,
    network: Arc<N>,
    validator: Arc<dyn Validator>,
    routing: Arc<Mutex<PeerRoutingTable>>,
    records: Arc<Mutex<RecordStore>>,
    providers: Arc<Mutex<ContentRoutingTable>>,
    addresses: Arc<Mutex<AddressBook>>,
    started: AtomicBool,
    /// Non-owning handle to self, handed to spawned tasks.
    weak: Weak<Self>,
}

impl<N: DhtNetwork> DhtNode<N> {
    /// Create a node with the default accept-everything validator.
    pub fn new(network: N, config: DhtConfig) -> Arc<Self> {
        Self::with_validator(network, config, Arc::new(DefaultValidator))
    }

    pub fn with_validator(
        network: N,
        config: DhtConfig,
        validator: Arc<dyn Validator>,
    ) -> Arc<Self> {
        let self_info = network.local_peer();
        Arc::new_cyclic(|weak| Self {
            routing: Arc::new(Mutex::new(PeerRoutingTable::new(
                self_info.id,
                config.bucket_size,
            ))),
            records: Arc::new(Mutex::new(RecordStore::new(
                config.record_capacity,
                config.record_ttl,
            ))),
            providers: Arc::new(Mutex::new(ContentRoutingTable::new(config.provider_ttl))),
            addresses: Arc::new(Mutex::new(AddressBook::new())),
            network: Arc::new(network),
            validator,
            self_info,
            config,
            started: AtomicBool::new(false),
            weak: weak.clone(),
        })
    }

    /// This node's identity and public addresses.
    pub fn local_info(&self) -> &PeerInfo {
        &self.self_info
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub(crate) fn network(&self) -> Arc<N> {
        self.network.clone()
    }

    pub(crate) fn validator(&self) -> &dyn Validator {
        self.validator.as_ref()
    }

    /// Number of peers currently in the routing table.
    pub async fn known_peers(&self) -> usize {
        self.routing.lock().await.len()
    }

    // ─── lifecycle ──────────────────────────────────────────────────────────

    /// Start the node: register the local identity permanently in the
    /// address book and, when enabled, kick off the routing-table refresh
    /// task. Calling it a second time is an error.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DhtError::AlreadyStarted);
        }
        self.addresses.lock().await.insert_permanent(&self.self_info);
        if self.config.random_walk.enabled {
            self.spawn_random_walk();
        }
        Ok(())
    }

    /// Populate the routing table with one lookup for a random identifier.
    pub async fn bootstrap(&self) -> Result<()> {
        let target: NodeId = rand::random();
        self.find_closest_peers(&target).await?;
        Ok(())
    }

    // ─── user-facing operations ─────────────────────────────────────────────

    /// Store a record locally and replicate it, best effort and in the
    /// background, to the K peers closest to the key.
    pub async fn put_value(&self, key: Key, value: Vec<u8>) -> Result<()> {
        self.records.lock().await.put(key.clone(), value.clone());

        if let Some(node) = self.weak.upgrade() {
            tokio::spawn(async move {
                node.replicate(key, value).await;
            });
        }
        Ok(())
    }

    /// Fetch the value for a key: locally when fresh, otherwise via an
    /// iterative lookup with read-repair of peers that lacked the record.
    pub async fn get_value(&self, key: &[u8]) -> Result<Vec<u8>> {
        if let Some(record) = self.records.lock().await.get(key) {
            return Ok(record.value);
        }

        let seeds = self.seeds(&key_to_id(key)).await;
        if seeds.is_empty() {
            return Err(DhtError::NoPeers);
        }

        let outcome = Lookup::get_value(self, key.to_vec()).run(seeds).await;
        let Some(record) = outcome.record else {
            return Err(DhtError::NotFound);
        };

        if !outcome.record_gaps.is_empty() {
            let network = self.network.clone();
            let repair = record.clone();
            let gaps = outcome.record_gaps;
            tokio::spawn(async move {
                for peer in gaps {
                    if let Err(e) = network.put_value(&peer, repair.clone()).await {
                        debug!(peer = %hex::encode(&peer.id[..8]), "read-repair failed: {e:#}");
                    }
                }
            });
        }

        Ok(record.value)
    }

    /// Announce this node as a provider for `key`. With `notify`, the K
    /// closest peers to the key are told as well.
    pub async fn provide(&self, key: &[u8], notify: bool) -> Result<()> {
        let content = key_to_id(key);
        self.providers
            .lock()
            .await
            .add_provider(content, self.self_info.clone());
        if !notify {
            return Ok(());
        }

        let seeds = self.seeds(&content).await;
        if seeds.is_empty() {
            debug!(key = %hex::encode(&content[..8]), "no peers to notify of provider");
            return Ok(());
        }

        let outcome = Lookup::find_node(self, key.to_vec()).run(seeds).await;
        for peer in outcome.closest.iter().take(self.config.bucket_size) {
            if let Err(e) = self
                .network
                .add_provider(peer, key, self.self_info.clone())
                .await
            {
                debug!(peer = %hex::encode(&peer.id[..8]), "provider announce failed: {e:#}");
            }
        }
        Ok(())
    }

    /// Find peers providing `key`, up to `limit` when it is non-zero.
    pub async fn find_providers(&self, key: &[u8], limit: usize) -> Result<Vec<PeerInfo>> {
        let content = key_to_id(key);
        let local: Vec<PeerInfo> = {
            let mut providers = self.providers.lock().await;
            providers
                .providers(&content, None)
                .into_iter()
                .filter(|p| self.network.connectedness(p).is_connectable())
                .collect()
        };
        if limit > 0 && local.len() >= limit {
            let mut out = local;
            out.truncate(limit);
            return Ok(out);
        }

        let seeds = self.seeds(&content).await;
        if seeds.is_empty() {
            return if local.is_empty() {
                Err(DhtError::NoPeers)
            } else {
                Ok(local)
            };
        }

        let outcome = Lookup::get_providers(self, key.to_vec(), limit).run(seeds).await;
        let mut out = local;
        for info in outcome.providers {
            if !out.iter().any(|p| p.id == info.id) {
                out.push(info);
            }
        }
        if limit > 0 {
            out.truncate(limit);
        }
        if out.is_empty() {
            return Err(DhtError::NotFound);
        }
        Ok(out)
    }

    /// Locate a specific peer by id.
    pub async fn find_peer(&self, peer_id: NodeId) -> Result<PeerInfo> {
        let known = self.addresses.lock().await.addresses(&peer_id);
        if !known.is_empty() {
            return Ok(PeerInfo::new(peer_id, known));
        }

        let seeds = self.seeds(&key_to_id(&peer_id)).await;
        if seeds.is_empty() {
            return Err(DhtError::NoPeers);
        }

        let outcome = Lookup::find_peer(self, peer_id).run(seeds).await;
        match outcome.target_peer {
            Some(info) => {
                self.observe_peer(&info).await;
                Ok(info)
            }
            None => Err(DhtError::NotFound),
        }
    }

    /// Converge on the K closest peers to an identifier. This is the
    /// infrastructural lookup behind [`bootstrap`](Self::bootstrap) and the
    /// replication paths.
    pub async fn find_closest_peers(&self, target: &NodeId) -> Result<Vec<PeerInfo>> {
        let seeds = self.seeds(&key_to_id(target)).await;
        if seeds.is_empty() {
            return Err(DhtError::NoPeers);
        }
        let outcome = Lookup::find_node(self, target.to_vec()).run(seeds).await;
        Ok(outcome.closest)
    }

    // ─── table maintenance ──────────────────────────────────────────────────

    /// Record that a peer was seen: refresh its addresses and its routing
    /// bucket position. A full bucket triggers a background ping of the
    /// stalest entry, which is evicted only if it fails to answer.
    pub async fn observe_peer(&self, info: &PeerInfo) {
        if info.id == self.self_info.id {
            return;
        }
        self.addresses
            .lock()
            .await
            .upsert(info, self.config.address_ttl);

        let outcome = self.routing.lock().await.update(info.clone());
        if let UpdateOutcome::BucketFull(pending) = outcome {
            let routing = self.routing.clone();
            let network = self.network.clone();
            tokio::spawn(async move {
                let alive = match network.ping(&pending.stalest).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(
                            peer = %hex::encode(&pending.stalest.id[..8]),
                            "stalest bucket entry unresponsive: {e:#}"
                        );
                        false
                    }
                };
                routing.lock().await.resolve_eviction(pending, alive);
            });
        }
    }

    /// The alpha closest connectable peers to a keyspace target, addresses
    /// resolved through the address book. An empty result means a lookup
    /// cannot be seeded.
    async fn seeds(&self, target: &NodeId) -> Vec<PeerInfo> {
        let nearest = {
            let routing = self.routing.lock().await;
            routing.nearest(target, self.config.closer_peer_count)
        };
        let mut addresses = self.addresses.lock().await;
        nearest
            .into_iter()
            .map(|info| addresses.resolve(&info))
            .filter(|info| self.network.connectedness(info).is_connectable())
            .collect()
    }

    /// Background half of [`put_value`](Self::put_value): converge on the
    /// key and hand the record to the K closest peers.
    async fn replicate(&self, key: Key, value: Vec<u8>) {
        let content = key_to_id(&key);
        let seeds = self.seeds(&content).await;
        if seeds.is_empty() {
            debug!(key = %hex::encode(&content[..8]), "no peers to replicate to");
            return;
        }
        let record = Record::with_ttl(key.clone(), value, self.config.record_ttl);
        let outcome = Lookup::find_node(self, key).run(seeds).await;

        let mut accepted = 0usize;
        for peer in outcome.closest.iter().take(self.config.bucket_size) {
            match self.network.put_value(peer, record.clone()).await {
                Ok(()) => accepted += 1,
                Err(e) => {
                    debug!(peer = %hex::encode(&peer.id[..8]), "replication failed: {e:#}")
                }
            }
        }
        if accepted == 0 {
            warn!(key = %hex::encode(&content[..8]), "record not replicated to any peer");
        } else {
            trace!(
                key = %hex::encode(&content[..8]),
                accepted,
                "record replicated"
            );
        }
    }

    // ─── inbound dispatch ───────────────────────────────────────────────────

    /// Handle one inbound message and build the reply, if the type has one.
    ///
    /// The sender is inserted into the routing table before dispatch. The
    /// message may carry the sender's own dialable addresses; they are
    /// trusted only when they name the stream's remote peer, so an
    /// inbound-only peer still ends up reachable for later lookups. An
    /// `Err` means the session that delivered the message must be closed.
    pub async fn handle_message(&self, from: PeerInfo, msg: Message) -> Result<Option<Message>> {
        let mut from = from;
        if let Some(sender) = &msg.from {
            if sender.id == from.id {
                for addr in &sender.addrs {
                    if !from.addrs.contains(addr) {
                        from.addrs.push(addr.clone());
                    }
                }
            }
        }
        self.observe_peer(&from).await;
        trace!(
            from = %hex::encode(&from.id[..8]),
            kind = ?msg.kind,
            "inbound message"
        );

        match msg.kind {
            MessageType::Ping => Ok(Some(Message::ping())),
            MessageType::FindNode => {
                self.absorb_closer_peers(&msg).await;
                let mut reply = Message::request(MessageType::FindNode, msg.key.clone());
                reply.closer_peers = self.nearest_wire(&key_to_id(&msg.key)).await;
                Ok(Some(reply))
            }
            MessageType::GetValue => {
                self.absorb_closer_peers(&msg).await;
                let target = key_to_id(&msg.key);
                let mut reply = Message::request(MessageType::GetValue, msg.key.clone());
                if let Some(stored) = self.records.lock().await.get(&msg.key) {
                    let remaining = stored.expires_at.saturating_duration_since(Instant::now());
                    reply.record = Some(Record::with_ttl(stored.key, stored.value, remaining));
                }
                reply.provider_peers = self.providers_wire(&target).await;
                reply.closer_peers = self.nearest_wire(&target).await;
                Ok(Some(reply))
            }
            MessageType::PutValue => {
                let Some(record) = msg.record else {
                    return Err(DhtError::MessageDeserialize);
                };
                if let Err(e) = self.validator.validate(&record.key, &record.value) {
                    debug!(
                        from = %hex::encode(&from.id[..8]),
                        "dropping record that failed validation: {e}"
                    );
                    return Ok(None);
                }
                let expires_at = match record.expires_unix() {
                    Some(unix) => {
                        let now_unix = SystemTime::now()
                            .duration_since(UNIX_EPOCH)
                            .map(|d| d.as_secs())
                            .unwrap_or(0);
                        Instant::now() + Duration::from_secs(unix.saturating_sub(now_unix))
                    }
                    None => Instant::now() + self.config.record_ttl,
                };
                self.records
                    .lock()
                    .await
                    .put_with_expiry(record.key, record.value, expires_at);
                Ok(None)
            }
            MessageType::AddProvider => {
                let content = key_to_id(&msg.key);
                for wire_peer in msg.provider_peers {
                    let info = wire_peer.info;
                    // A peer may only announce itself.
                    if info.id != from.id {
                        debug!(
                            from = %hex::encode(&from.id[..8]),
                            claimed = %hex::encode(&info.id[..8]),
                            "dropping third-party provider announcement"
                        );
                        continue;
                    }
                    self.addresses
                        .lock()
                        .await
                        .upsert(&info, self.config.address_ttl);
                    self.providers.lock().await.add_provider(content, info);
                }
                Ok(None)
            }
            MessageType::GetProviders => {
                let target = key_to_id(&msg.key);
                let mut reply = Message::request(MessageType::GetProviders, msg.key.clone());
                reply.provider_peers = self.providers_wire(&target).await;
                reply.closer_peers = self.nearest_wire(&target).await;
                Ok(Some(reply))
            }
        }
    }

    /// Absorb peers a requester volunteered about the rest of the network.
    async fn absorb_closer_peers(&self, msg: &Message) {
        for wire_peer in &msg.closer_peers {
            self.observe_peer(&wire_peer.info).await;
        }
    }

    /// The K closest peers to a target, annotated with connectedness, for a
    /// response.
    async fn nearest_wire(&self, target: &NodeId) -> Vec<WirePeer> {
        let nearest = {
            let routing = self.routing.lock().await;
            routing.nearest(target, self.config.bucket_size)
        };
        let mut addresses = self.addresses.lock().await;
        nearest
            .into_iter()
            .map(|info| {
                let info = addresses.resolve(&info);
                WirePeer {
                    connectedness: self.network.connectedness(&info),
                    info,
                }
            })
            .collect()
    }

    /// Up to alpha connectable providers for a response.
    async fn providers_wire(&self, content: &NodeId) -> Vec<WirePeer> {
        let provider_infos = {
            let mut providers = self.providers.lock().await;
            providers.providers(content, Some(self.config.closer_peer_count))
        };
        let mut addresses = self.addresses.lock().await;
        provider_infos
            .into_iter()
            .map(|info| addresses.resolve(&info))
            .filter(|info| self.network.connectedness(info).is_connectable())
            .map(|info| WirePeer {
                connectedness: self.network.connectedness(&info),
                info,
            })
            .collect()
    }

    // ─── random walk ────────────────────────────────────────────────────────

    /// Periodic routing-table refresh: look up random identifiers so the
    /// responses repopulate distant buckets. The task holds only a weak
    /// reference and exits once the node is dropped.
    fn spawn_random_walk(&self) {
        let weak = self.weak.clone();
        let walk = self.config.random_walk.clone();
        tokio::spawn(async move {
            let mut iteration: u32 = 0;
            loop {
                {
                    let Some(node) = weak.upgrade() else { break };
                    let target: NodeId = rand::random();
                    match node.find_peer(target).await {
                        Ok(found) => {
                            debug!(peer = %hex::encode(&found.id[..8]), "random walk hit");
                            node.observe_peer(&found).await;
                        }
                        // Random targets almost never name a real peer; the
                        // value of the walk is in the peers the lookup
                        // touched along the way.
                        Err(_) => {}
                    }
                }
                // Spacing follows the 0-based index of the query just
                // issued: the period tail lands after every
                // queries_per_period-th query, the rest are one delay apart.
                let spacing = if walk.queries_per_period > 0
                    && iteration % walk.queries_per_period == 0
                {
                    walk.interval
                        .saturating_sub(walk.delay * walk.queries_per_period)
                } else {
                    walk.delay
                };
                iteration = iteration.wrapping_add(1);
                tokio::time::sleep(spacing).await;
            }
        });
    }
}

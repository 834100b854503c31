//! Transport-agnostic DHT state: identifiers, the XOR metric, and the tables
//! the protocol is built on.
//!
//! This module contains the pieces that do not touch the network:
//!
//! - **Identity & Hashing**: [`NodeId`], [`Key`], [`key_to_id`], [`derive_node_id`]
//! - **Distance**: [`xor_distance`] and bucket placement for Kademlia routing
//! - **Peers**: [`PeerInfo`], [`Connectedness`], the TTL'd [`AddressBook`]
//! - **Routing**: [`PeerRoutingTable`] with least-recently-seen k-buckets
//! - **Storage**: [`RecordStore`] (TTL + LRU bound) and the provider
//!   [`ContentRoutingTable`]
//! - **Validation**: the [`Validator`] capability for record acceptance
//! - **Configuration**: [`DhtConfig`]

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::{Duration, Instant};

use crate::error::DhtError;

// ============================================================================
// Type Aliases
// ============================================================================

/// A 256-bit identifier in the DHT keyspace.
///
/// Peer identities are 32-byte public-key hashes; content keys are mapped
/// into the same space by [`key_to_id`].
pub type NodeId = [u8; 32];

/// A DHT key: an arbitrary byte string. Its position in the keyspace is the
/// SHA-256 digest of its bytes.
pub type Key = Vec<u8>;

// ============================================================================
// Configuration Defaults
// ============================================================================

/// Default bucket size (K): capacity of each routing bucket and the width of
/// "closest peers" in responses.
pub const DEFAULT_BUCKET_SIZE: usize = 20;

/// Default closer-peer count (alpha): per-query parallelism and the soft cap
/// on peers per response.
pub const DEFAULT_CLOSER_PEER_COUNT: usize = 6;

/// Default total-duration cap for one iterative lookup.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Default round-trip cap for a single request to a single peer.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default lifetime of a stored record (36 hours).
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(36 * 3600);

/// Default lifetime of a provider announcement (24 hours).
pub const DEFAULT_PROVIDER_TTL: Duration = Duration::from_secs(24 * 3600);

/// Default lifetime of addresses absorbed from the network (24 hours).
pub const DEFAULT_ADDRESS_TTL: Duration = Duration::from_secs(24 * 3600);

/// Default bound on locally stored records; the store evicts least-recently
/// used entries past this.
pub const DEFAULT_RECORD_CAPACITY: usize = 65_536;

/// Periodic routing-table refresh.
#[derive(Clone, Debug)]
pub struct RandomWalkConfig {
    /// Whether the background refresh task runs at all.
    pub enabled: bool,
    /// Length of one refresh period.
    pub interval: Duration,
    /// Lookups issued within each period.
    pub queries_per_period: u32,
    /// Spacing between consecutive lookups inside a period.
    pub delay: Duration,
}

impl Default for RandomWalkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(600),
            queries_per_period: 1,
            delay: Duration::from_secs(10),
        }
    }
}

/// DHT node configuration.
#[derive(Clone, Debug)]
pub struct DhtConfig {
    /// Wire protocol identifier, used as the ALPN for DHT streams.
    pub protocol_id: String,
    /// Alpha: lookup parallelism and reply-size cap.
    pub closer_peer_count: usize,
    /// K: routing bucket capacity and replication width.
    pub bucket_size: usize,
    /// Total-duration cap per iterative lookup.
    pub query_timeout: Duration,
    /// Round-trip cap per peer request.
    pub connection_timeout: Duration,
    /// Lifetime of locally stored records.
    pub record_ttl: Duration,
    /// Lifetime of provider announcements.
    pub provider_ttl: Duration,
    /// Lifetime of addresses learned from the network.
    pub address_ttl: Duration,
    /// Bound on locally stored records.
    pub record_capacity: usize,
    /// Background routing-table refresh.
    pub random_walk: RandomWalkConfig,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            protocol_id: "/kad/1.0.0".to_string(),
            closer_peer_count: DEFAULT_CLOSER_PEER_COUNT,
            bucket_size: DEFAULT_BUCKET_SIZE,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            record_ttl: DEFAULT_RECORD_TTL,
            provider_ttl: DEFAULT_PROVIDER_TTL,
            address_ttl: DEFAULT_ADDRESS_TTL,
            record_capacity: DEFAULT_RECORD_CAPACITY,
            random_walk: RandomWalkConfig::default(),
        }
    }
}

// ============================================================================
// Hashing Functions
// ============================================================================

/// Map an arbitrary key (or a raw peer id) to its position in the keyspace.
///
/// Every key travels on the wire as raw bytes and every handler derives the
/// keyspace position the same way, so both ends of a lookup agree on
/// distances:
///
/// ```
/// use kad_dht::key_to_id;
///
/// let id = key_to_id(b"my-content-key");
/// assert_eq!(id, key_to_id(b"my-content-key"));
/// assert_ne!(id, key_to_id(b"other-key"));
/// ```
pub fn key_to_id(key: &[u8]) -> NodeId {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.finalize().into()
}

/// Derive a stable 32-byte peer identity by hashing arbitrary input with
/// BLAKE3. Typically fed the transport endpoint's public key.
pub fn derive_node_id(data: &[u8]) -> NodeId {
    let mut out = [0u8; 32];
    out.copy_from_slice(iroh_blake3::hash(data).as_bytes());
    out
}

// ============================================================================
// Distance Metric
// ============================================================================

/// XOR distance between two keyspace positions.
///
/// The result is an unsigned 256-bit integer in big-endian byte order, so the
/// derived lexicographic `Ord` on the array is exactly numeric order and can
/// be compared directly.
pub fn xor_distance(a: &NodeId, b: &NodeId) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// The bucket a peer belongs to relative to `self_key`: the index of the
/// first differing bit (0..=255). Identical inputs map to the last bucket,
/// which never happens for stored peers since self is never inserted.
pub(crate) fn bucket_index(self_key: &NodeId, other: &NodeId) -> usize {
    let dist = xor_distance(self_key, other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    255
}

// ============================================================================
// Peers
// ============================================================================

/// How reachable a peer currently is, as judged by the transport's
/// connection manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Connectedness {
    Connected,
    CanConnect,
    CanNotConnect,
    NotConnected,
}

impl Connectedness {
    /// Whether the peer is worth dialing for a lookup.
    pub fn is_connectable(self) -> bool {
        matches!(self, Connectedness::Connected | Connectedness::CanConnect)
    }
}

/// A peer identity together with the network addresses it is known under.
///
/// `addrs` may be empty: a peer can be known by id only, e.g. when it was
/// named as a provider without addresses attached.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: NodeId,
    pub addrs: Vec<String>,
}

impl PeerInfo {
    pub fn new(id: NodeId, addrs: Vec<String>) -> Self {
        Self { id, addrs }
    }

    /// A peer known by id only.
    pub fn from_id(id: NodeId) -> Self {
        Self { id, addrs: Vec::new() }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Address Book
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct AddressEntry {
    addrs: Vec<String>,
    /// `None` marks a permanent entry (the local peer).
    expires_at: Option<Instant>,
}

impl AddressEntry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Addresses learned for peers, each with a time-to-live.
///
/// Expired entries become invisible and are dropped lazily on access.
#[derive(Debug, Default)]
pub struct AddressBook {
    entries: HashMap<NodeId, AddressEntry>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge the peer's addresses and push its deadline `ttl` into the
    /// future. Permanent entries stay permanent.
    pub fn upsert(&mut self, info: &PeerInfo, ttl: Duration) {
        let now = Instant::now();
        let deadline = now + ttl;
        let entry = self.entries.entry(info.id).or_insert_with(|| AddressEntry {
            addrs: Vec::new(),
            expires_at: Some(deadline),
        });
        if entry.expired(now) {
            entry.addrs.clear();
            entry.expires_at = Some(deadline);
        }
        for addr in &info.addrs {
            if !entry.addrs.contains(addr) {
                entry.addrs.push(addr.clone());
            }
        }
        if let Some(expires_at) = entry.expires_at.as_mut() {
            *expires_at = (*expires_at).max(deadline);
        }
    }

    /// Register a peer that never expires. Used for the local identity.
    pub fn insert_permanent(&mut self, info: &PeerInfo) {
        self.entries.insert(
            info.id,
            AddressEntry {
                addrs: info.addrs.clone(),
                expires_at: None,
            },
        );
    }

    /// The unexpired addresses known for a peer, oldest first.
    pub fn addresses(&mut self, id: &NodeId) -> Vec<String> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(id) {
            if !entry.expired(now) {
                return entry.addrs.clone();
            }
            self.entries.remove(id);
        }
        Vec::new()
    }

    /// Resolve a peer id to a `PeerInfo` carrying every known address.
    pub fn resolve(&mut self, info: &PeerInfo) -> PeerInfo {
        let mut resolved = info.clone();
        for addr in self.addresses(&info.id) {
            if !resolved.addrs.contains(&addr) {
                resolved.addrs.push(addr);
            }
        }
        resolved
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Peer Routing Table
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of [`PeerRoutingTable::update`].
#[derive(Debug)]
pub enum UpdateOutcome {
    /// The peer was newly inserted.
    Inserted,
    /// The peer was already present and moved to most-recently-seen.
    Refreshed,
    /// The bucket is full; the peer was NOT added. The caller may ping the
    /// stalest entry and feed the result to
    /// [`PeerRoutingTable::resolve_eviction`].
    BucketFull(PendingEviction),
    /// The peer is the local node and is never stored.
    IsSelf,
}

/// A deferred eviction decision for a full bucket.
#[derive(Clone, Debug)]
pub struct PendingEviction {
    bucket: usize,
    pub stalest: PeerInfo,
    pub candidate: PeerInfo,
}

#[derive(Debug, Default)]
struct Bucket {
    /// Peers in least-recently-seen order: stalest first, freshest last.
    /// Each entry carries its precomputed keyspace position.
    peers: Vec<(NodeId, PeerInfo)>,
}

/// Kademlia routing table: 256 k-buckets indexed by the first differing bit
/// between a peer's keyspace position and our own.
///
/// Invariants: the local peer is never stored, and a peer appears in at most
/// one bucket (its bucket index is a pure function of its id).
#[derive(Debug)]
pub struct PeerRoutingTable {
    self_id: NodeId,
    self_key: NodeId,
    bucket_size: usize,
    buckets: Vec<Bucket>,
}

impl PeerRoutingTable {
    pub fn new(self_id: NodeId, bucket_size: usize) -> Self {
        let mut buckets = Vec::with_capacity(256);
        buckets.resize_with(256, Bucket::default);
        Self {
            self_id,
            self_key: key_to_id(&self_id),
            bucket_size,
            buckets,
        }
    }

    /// Record that a peer was seen.
    ///
    /// Present peers are refreshed (moved to most-recently-seen, addresses
    /// merged); absent peers are inserted when their bucket has room. A full
    /// bucket reports [`UpdateOutcome::BucketFull`] instead of evicting, so
    /// long-lived peers are preferred until the caller proves the stalest
    /// one dead.
    pub fn update(&mut self, info: PeerInfo) -> UpdateOutcome {
        if info.id == self.self_id {
            return UpdateOutcome::IsSelf;
        }
        let key = key_to_id(&info.id);
        let idx = bucket_index(&self.self_key, &key);
        let bucket = &mut self.buckets[idx];

        if let Some(pos) = bucket.peers.iter().position(|(_, p)| p.id == info.id) {
            let (key, mut existing) = bucket.peers.remove(pos);
            for addr in info.addrs {
                if !existing.addrs.contains(&addr) {
                    existing.addrs.push(addr);
                }
            }
            bucket.peers.push((key, existing));
            return UpdateOutcome::Refreshed;
        }

        if bucket.peers.len() < self.bucket_size {
            bucket.peers.push((key, info));
            UpdateOutcome::Inserted
        } else {
            let stalest = bucket.peers[0].1.clone();
            UpdateOutcome::BucketFull(PendingEviction {
                bucket: idx,
                stalest,
                candidate: info,
            })
        }
    }

    /// Apply the result of pinging the stalest entry of a full bucket: a
    /// live peer is refreshed and the candidate dropped, a dead one is
    /// replaced by the candidate.
    pub fn resolve_eviction(&mut self, pending: PendingEviction, stalest_alive: bool) {
        let bucket = &mut self.buckets[pending.bucket];
        let pos = bucket
            .peers
            .iter()
            .position(|(_, p)| p.id == pending.stalest.id);
        if stalest_alive {
            if let Some(pos) = pos {
                let entry = bucket.peers.remove(pos);
                bucket.peers.push(entry);
            }
            return;
        }
        if let Some(pos) = pos {
            bucket.peers.remove(pos);
        }
        let already_present = bucket.peers.iter().any(|(_, p)| p.id == pending.candidate.id);
        if !already_present && bucket.peers.len() < self.bucket_size {
            let key = key_to_id(&pending.candidate.id);
            bucket.peers.push((key, pending.candidate));
        }
    }

    /// Drop a peer, e.g. after its stream failed.
    pub fn remove(&mut self, id: &NodeId) -> bool {
        let key = key_to_id(id);
        let idx = bucket_index(&self.self_key, &key);
        let bucket = &mut self.buckets[idx];
        if let Some(pos) = bucket.peers.iter().position(|(_, p)| &p.id == id) {
            bucket.peers.remove(pos);
            true
        } else {
            false
        }
    }

    /// Up to `n` peers sorted by ascending XOR distance to `target`, ties
    /// broken by peer id. Never includes the local peer.
    pub fn nearest(&self, target: &NodeId, n: usize) -> Vec<PeerInfo> {
        let mut all: Vec<(NodeId, &PeerInfo)> = self
            .buckets
            .iter()
            .flat_map(|b| b.peers.iter().map(|(key, p)| (*key, p)))
            .collect();
        all.sort_by_key(|(key, p)| (xor_distance(key, target), p.id));
        all.into_iter().take(n).map(|(_, p)| p.clone()).collect()
    }

    /// Which bucket a peer currently sits in, if present.
    pub fn bucket_of(&self, id: &NodeId) -> Option<usize> {
        self.buckets
            .iter()
            .position(|b| b.peers.iter().any(|(_, p)| &p.id == id))
    }

    /// Total number of peers across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.peers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Record Store
// ─────────────────────────────────────────────────────────────────────────────

/// A record held by the local store.
#[derive(Clone, Debug)]
pub struct StoredRecord {
    pub key: Key,
    pub value: Vec<u8>,
    pub expires_at: Instant,
}

/// Local key/value storage with TTL expiry and an LRU capacity bound.
///
/// Entries are keyed by the keyspace position of their key. Expired records
/// are invisible and garbage-collected lazily on access.
#[derive(Debug)]
pub struct RecordStore {
    cache: LruCache<NodeId, StoredRecord>,
    ttl: Duration,
}

impl RecordStore {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity is non-zero");
        Self {
            cache: LruCache::new(cap),
            ttl,
        }
    }

    /// Store a record, overwriting any previous value for the key.
    pub fn put(&mut self, key: Key, value: Vec<u8>) {
        let expires_at = Instant::now() + self.ttl;
        self.put_with_expiry(key, value, expires_at);
    }

    /// Store a record with an explicit deadline, clamped to the configured
    /// TTL so a remote writer cannot pin an entry forever.
    pub fn put_with_expiry(&mut self, key: Key, value: Vec<u8>, expires_at: Instant) {
        let expires_at = expires_at.min(Instant::now() + self.ttl);
        let id = key_to_id(&key);
        self.cache.put(id, StoredRecord { key, value, expires_at });
    }

    /// The record for a key, if present and not expired.
    pub fn get(&mut self, key: &[u8]) -> Option<StoredRecord> {
        let id = key_to_id(key);
        let now = Instant::now();
        if let Some(record) = self.cache.get(&id) {
            if record.expires_at > now {
                return Some(record.clone());
            }
            self.cache.pop(&id);
        }
        None
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Content Routing Table
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct ProviderEntry {
    info: PeerInfo,
    expires_at: Instant,
}

/// Which peers claim to hold the content behind a key.
///
/// Each provider carries its own deadline; re-announcing refreshes it.
#[derive(Debug)]
pub struct ContentRoutingTable {
    providers: HashMap<NodeId, HashMap<NodeId, ProviderEntry>>,
    ttl: Duration,
}

impl ContentRoutingTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            providers: HashMap::new(),
            ttl,
        }
    }

    /// Record that `info` provides the content at keyspace position
    /// `content`. An existing announcement has its deadline refreshed and
    /// its addresses merged.
    pub fn add_provider(&mut self, content: NodeId, info: PeerInfo) {
        let expires_at = Instant::now() + self.ttl;
        let entries = self.providers.entry(content).or_default();
        let entry = entries.entry(info.id).or_insert_with(|| ProviderEntry {
            info: PeerInfo::from_id(info.id),
            expires_at,
        });
        for addr in info.addrs {
            if !entry.info.addrs.contains(&addr) {
                entry.info.addrs.push(addr);
            }
        }
        entry.expires_at = expires_at;
    }

    /// Up to `limit` unexpired providers for the content. Expired
    /// announcements are pruned on the way.
    pub fn providers(&mut self, content: &NodeId, limit: Option<usize>) -> Vec<PeerInfo> {
        let now = Instant::now();
        let Some(entries) = self.providers.get_mut(content) else {
            return Vec::new();
        };
        entries.retain(|_, entry| entry.expires_at > now);
        if entries.is_empty() {
            self.providers.remove(content);
            return Vec::new();
        }
        let mut out: Vec<PeerInfo> = entries.values().map(|e| e.info.clone()).collect();
        out.sort_by_key(|info| info.id);
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        out
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Validator
// ─────────────────────────────────────────────────────────────────────────────

/// Record acceptance policy.
///
/// Inbound PUT_VALUE payloads and records collected during a get-value
/// lookup pass through the validator; locally initiated writes do not.
pub trait Validator: Send + Sync + 'static {
    /// Accept or reject a record.
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), DhtError>;

    /// Choose the best among several valid but disagreeing records for the
    /// same key. Returns an index into `values`.
    fn select(&self, _key: &[u8], _values: &[Vec<u8>]) -> usize {
        0
    }
}

/// Accepts every record and prefers the first candidate.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultValidator;

impl Validator for DefaultValidator {
    fn validate(&self, _key: &[u8], _value: &[u8]) -> Result<(), DhtError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with_first_byte(byte: u8) -> NodeId {
        let mut id = [0u8; 32];
        id[0] = byte;
        id
    }

    #[test]
    fn key_to_id_is_deterministic() {
        assert_eq!(key_to_id(b"hello"), key_to_id(b"hello"));
        assert_ne!(key_to_id(b"hello"), key_to_id(b"world"));
    }

    #[test]
    fn xor_distance_is_symmetric_and_zero_on_self() {
        let a = id_with_first_byte(0xAA);
        let b = id_with_first_byte(0x55);
        assert_eq!(xor_distance(&a, &b), xor_distance(&b, &a));
        assert_eq!(xor_distance(&a, &a), [0u8; 32]);
        assert_eq!(xor_distance(&a, &b)[0], 0xFF);
    }

    #[test]
    fn distance_orders_numerically() {
        let target = [0u8; 32];
        let near = id_with_first_byte(0x01);
        let far = id_with_first_byte(0x80);
        assert!(xor_distance(&near, &target) < xor_distance(&far, &target));
    }

    #[test]
    fn bucket_index_finds_first_differing_bit() {
        let zero = [0u8; 32];
        assert_eq!(bucket_index(&zero, &id_with_first_byte(0b1000_0000)), 0);
        assert_eq!(bucket_index(&zero, &id_with_first_byte(0b0000_0001)), 7);

        let mut second_byte = [0u8; 32];
        second_byte[1] = 0b0001_0000;
        assert_eq!(bucket_index(&zero, &second_byte), 11);
        assert_eq!(bucket_index(&zero, &zero), 255);
    }

    #[test]
    fn routing_table_never_stores_self() {
        let self_id = id_with_first_byte(0x01);
        let mut table = PeerRoutingTable::new(self_id, 4);
        assert!(matches!(
            table.update(PeerInfo::from_id(self_id)),
            UpdateOutcome::IsSelf
        ));
        assert!(table.is_empty());
        assert!(table.nearest(&key_to_id(&self_id), 10).is_empty());
    }

    #[test]
    fn peer_sits_in_the_bucket_of_its_prefix() {
        let self_id = id_with_first_byte(0x01);
        let mut table = PeerRoutingTable::new(self_id, 4);
        for byte in [0x10u8, 0x42, 0x99, 0xF0] {
            let peer = PeerInfo::from_id(id_with_first_byte(byte));
            table.update(peer.clone());
            let expected = bucket_index(&key_to_id(&self_id), &key_to_id(&peer.id));
            assert_eq!(table.bucket_of(&peer.id), Some(expected));
        }
    }

    #[test]
    fn full_bucket_reports_stalest_instead_of_evicting() {
        let self_id = [0u8; 32];
        let mut table = PeerRoutingTable::new(self_id, 64);

        // Fill the table well past one bucket's worth of peers and find a
        // bucket that overflowed.
        let mut pending = None;
        for i in 0..=u8::MAX {
            if let UpdateOutcome::BucketFull(p) = table.update(PeerInfo::from_id(id_with_first_byte(i)))
            {
                pending = Some(p);
            }
        }
        // 256 hashed ids over a handful of occupied buckets with capacity 64
        // must overflow at least one of them.
        let pending = pending.expect("some bucket overflows");
        assert!(table.bucket_of(&pending.candidate.id).is_none());

        // Stalest proven dead: candidate takes its slot.
        table.resolve_eviction(pending.clone(), false);
        assert!(table.bucket_of(&pending.stalest.id).is_none());
        assert!(table.bucket_of(&pending.candidate.id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn record_store_hides_expired_entries() {
        let mut store = RecordStore::new(16, Duration::from_secs(60));
        store.put(b"key".to_vec(), b"value".to_vec());
        assert_eq!(store.get(b"key").map(|r| r.value), Some(b"value".to_vec()));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.get(b"key").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn provider_announcements_expire_and_refresh() {
        let mut table = ContentRoutingTable::new(Duration::from_secs(100));
        let content = key_to_id(b"content");
        let peer = PeerInfo::from_id(id_with_first_byte(0x05));

        table.add_provider(content, peer.clone());
        tokio::time::advance(Duration::from_secs(60)).await;
        // Re-announcing pushes the deadline out.
        table.add_provider(content, peer.clone());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(table.providers(&content, None).len(), 1);

        tokio::time::advance(Duration::from_secs(41)).await;
        assert!(table.providers(&content, None).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn address_book_forgets_expired_addresses() {
        let mut book = AddressBook::new();
        let peer = PeerInfo::new(id_with_first_byte(0x09), vec!["addr-a".into()]);
        book.upsert(&peer, Duration::from_secs(30));
        assert_eq!(book.addresses(&peer.id), vec!["addr-a".to_string()]);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(book.addresses(&peer.id).is_empty());
    }
}

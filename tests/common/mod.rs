use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration};

use kad_dht::{
    Connectedness, DhtConfig, DhtNetwork, DhtNode, GetProvidersReply, GetValueReply, Message,
    MessageType, NodeId, PeerInfo, RandomWalkConfig, Record, Validator, WirePeer,
};

/// In-memory transport: every RPC is encoded as a real protocol [`Message`]
/// and delivered straight into the destination node's dispatch, so tests
/// exercise the same inbound path as the wire.
#[derive(Clone)]
pub struct TestNetwork {
    registry: Arc<NetworkRegistry>,
    self_info: PeerInfo,
    latencies: Arc<Mutex<HashMap<NodeId, Duration>>>,
    failures: Arc<Mutex<HashSet<NodeId>>>,
    put_calls: Arc<Mutex<Vec<(NodeId, Vec<u8>)>>>,
    find_node_calls: Arc<Mutex<Vec<NodeId>>>,
    pings: Arc<Mutex<Vec<NodeId>>>,
    connectedness: Arc<std::sync::Mutex<HashMap<NodeId, Connectedness>>>,
}

impl TestNetwork {
    pub fn new(registry: Arc<NetworkRegistry>, self_info: PeerInfo) -> Self {
        Self {
            registry,
            self_info,
            latencies: Arc::new(Mutex::new(HashMap::new())),
            failures: Arc::new(Mutex::new(HashSet::new())),
            put_calls: Arc::new(Mutex::new(Vec::new())),
            find_node_calls: Arc::new(Mutex::new(Vec::new())),
            pings: Arc::new(Mutex::new(Vec::new())),
            connectedness: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    pub async fn set_latency(&self, node: NodeId, latency: Duration) {
        self.latencies.lock().await.insert(node, latency);
    }

    pub async fn set_failure(&self, node: NodeId, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(node);
        } else {
            failures.remove(&node);
        }
    }

    pub fn set_connectedness(&self, node: NodeId, state: Connectedness) {
        self.connectedness.lock().unwrap().insert(node, state);
    }

    /// `(destination, key)` of every PUT_VALUE sent through this network.
    pub async fn put_calls(&self) -> Vec<(NodeId, Vec<u8>)> {
        self.put_calls.lock().await.clone()
    }

    /// Destination of every FIND_NODE sent through this network.
    pub async fn find_node_calls(&self) -> Vec<NodeId> {
        self.find_node_calls.lock().await.clone()
    }

    pub async fn ping_calls(&self) -> Vec<NodeId> {
        self.pings.lock().await.clone()
    }

    async fn should_fail(&self, node: &NodeId) -> bool {
        self.failures.lock().await.contains(node)
    }

    async fn maybe_sleep(&self, node: &NodeId) {
        let latency = self.latencies.lock().await.get(node).copied();
        if let Some(delay) = latency {
            sleep(delay).await;
        }
    }

    /// Deliver one message into the destination's dispatch, returning its
    /// reply if the type has one.
    ///
    /// Mirrors the wire path: the stream identity carries only the remote
    /// id, and the sender's dialable addresses ride in-band on the message.
    async fn deliver(&self, to: &PeerInfo, mut msg: Message) -> Result<Option<Message>> {
        if self.should_fail(&to.id).await {
            return Err(anyhow!("injected network failure"));
        }
        self.maybe_sleep(&to.id).await;
        let Some(peer) = self.registry.get(&to.id).await else {
            return Err(anyhow!("peer not reachable"));
        };
        msg.from = Some(self.self_info.clone());
        peer.handle_message(PeerInfo::from_id(self.self_info.id), msg)
            .await
            .map_err(|e| anyhow!("dispatch failed: {e}"))
    }

    async fn exchange(&self, to: &PeerInfo, msg: Message) -> Result<Message> {
        self.deliver(to, msg)
            .await?
            .ok_or_else(|| anyhow!("expected a reply"))
    }
}

#[derive(Default)]
pub struct NetworkRegistry {
    peers: RwLock<HashMap<NodeId, Arc<DhtNode<TestNetwork>>>>,
}

impl NetworkRegistry {
    pub async fn register(&self, node: &Arc<DhtNode<TestNetwork>>) {
        let mut peers = self.peers.write().await;
        peers.insert(node.local_info().id, node.clone());
    }

    pub async fn get(&self, id: &NodeId) -> Option<Arc<DhtNode<TestNetwork>>> {
        self.peers.read().await.get(id).cloned()
    }
}

#[async_trait]
impl DhtNetwork for TestNetwork {
    async fn find_node(&self, to: &PeerInfo, key: &[u8]) -> Result<Vec<WirePeer>> {
        self.find_node_calls.lock().await.push(to.id);
        let reply = self
            .exchange(to, Message::request(MessageType::FindNode, key.to_vec()))
            .await?;
        Ok(reply.closer_peers)
    }

    async fn get_value(&self, to: &PeerInfo, key: &[u8]) -> Result<GetValueReply> {
        let reply = self
            .exchange(to, Message::request(MessageType::GetValue, key.to_vec()))
            .await?;
        Ok(reply.into())
    }

    async fn put_value(&self, to: &PeerInfo, record: Record) -> Result<()> {
        self.put_calls
            .lock()
            .await
            .push((to.id, record.key.clone()));
        let mut msg = Message::request(MessageType::PutValue, record.key.clone());
        msg.record = Some(record);
        self.deliver(to, msg).await?;
        Ok(())
    }

    async fn add_provider(&self, to: &PeerInfo, key: &[u8], provider: PeerInfo) -> Result<()> {
        let mut msg = Message::request(MessageType::AddProvider, key.to_vec());
        msg.provider_peers = vec![WirePeer {
            connectedness: Connectedness::Connected,
            info: provider,
        }];
        self.deliver(to, msg).await?;
        Ok(())
    }

    async fn get_providers(&self, to: &PeerInfo, key: &[u8]) -> Result<GetProvidersReply> {
        let reply = self
            .exchange(to, Message::request(MessageType::GetProviders, key.to_vec()))
            .await?;
        Ok(reply.into())
    }

    async fn ping(&self, to: &PeerInfo) -> Result<()> {
        self.pings.lock().await.push(to.id);
        self.exchange(to, Message::ping()).await?;
        Ok(())
    }

    fn connectedness(&self, peer: &PeerInfo) -> Connectedness {
        self.connectedness
            .lock()
            .unwrap()
            .get(&peer.id)
            .copied()
            .unwrap_or(Connectedness::CanConnect)
    }

    fn local_peer(&self) -> PeerInfo {
        self.self_info.clone()
    }
}

pub struct TestNode {
    pub node: Arc<DhtNode<TestNetwork>>,
    pub network: TestNetwork,
}

impl TestNode {
    pub async fn new(registry: Arc<NetworkRegistry>, index: u32, config: DhtConfig) -> Self {
        Self::build(registry, index, config, None).await
    }

    pub async fn with_validator(
        registry: Arc<NetworkRegistry>,
        index: u32,
        config: DhtConfig,
        validator: Arc<dyn Validator>,
    ) -> Self {
        Self::build(registry, index, config, Some(validator)).await
    }

    async fn build(
        registry: Arc<NetworkRegistry>,
        index: u32,
        config: DhtConfig,
        validator: Option<Arc<dyn Validator>>,
    ) -> Self {
        let info = make_peer_info(index);
        let network = TestNetwork::new(registry.clone(), info);
        let node = match validator {
            Some(validator) => DhtNode::with_validator(network.clone(), config, validator),
            None => DhtNode::new(network.clone(), config),
        };
        registry.register(&node).await;
        Self { node, network }
    }

    pub fn info(&self) -> PeerInfo {
        self.node.local_info().clone()
    }

    pub fn id(&self) -> NodeId {
        self.node.local_info().id
    }
}

/// A config sized for tests: small lookups, short timeouts, no background
/// refresh unless a test turns it on.
pub fn test_config(bucket_size: usize, alpha: usize) -> DhtConfig {
    DhtConfig {
        bucket_size,
        closer_peer_count: alpha,
        query_timeout: Duration::from_secs(5),
        connection_timeout: Duration::from_secs(1),
        random_walk: RandomWalkConfig {
            enabled: false,
            ..RandomWalkConfig::default()
        },
        ..DhtConfig::default()
    }
}

pub fn make_node_id(index: u32) -> NodeId {
    let mut id = [0u8; 32];
    id[..4].copy_from_slice(&index.to_be_bytes());
    id
}

pub fn make_peer_info(index: u32) -> PeerInfo {
    PeerInfo::new(make_node_id(index), vec![format!("node-{index}")])
}

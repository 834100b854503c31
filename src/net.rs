//! Transport abstraction and the iroh QUIC implementation.
//!
//! The DHT core talks to the network exclusively through [`DhtNetwork`], one
//! async method per protocol message, so tests can swap in an in-memory
//! implementation. [`IrohNetwork`] is the production implementation: every
//! request opens a fresh bidirectional stream on a QUIC connection and runs
//! one [`Session`] over it.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::{Endpoint, NodeAddr};
use tracing::trace;

use crate::core::{Connectedness, PeerInfo};
use crate::framing;
use crate::protocol::{
    GetProvidersReply, GetValueReply, Message, MessageType, Record, WirePeer,
};

/// Network operations the DHT needs from its host, one per message type.
///
/// Per-peer failures are plain `anyhow` errors: a lookup marks the peer
/// failed and moves on, so the transport does not need a structured error
/// surface.
#[async_trait]
pub trait DhtNetwork: Send + Sync + 'static {
    /// FIND_NODE: ask `to` for the peers it knows closest to `key`.
    async fn find_node(&self, to: &PeerInfo, key: &[u8]) -> Result<Vec<WirePeer>>;

    /// GET_VALUE: ask `to` for the record at `key`, plus providers and
    /// closer peers it knows.
    async fn get_value(&self, to: &PeerInfo, key: &[u8]) -> Result<GetValueReply>;

    /// PUT_VALUE: hand `to` a record to store. No reply.
    async fn put_value(&self, to: &PeerInfo, record: Record) -> Result<()>;

    /// ADD_PROVIDER: announce to `to` that `provider` holds the content at
    /// `key`. No reply.
    async fn add_provider(&self, to: &PeerInfo, key: &[u8], provider: PeerInfo) -> Result<()>;

    /// GET_PROVIDERS: ask `to` for providers of `key` and closer peers.
    async fn get_providers(&self, to: &PeerInfo, key: &[u8]) -> Result<GetProvidersReply>;

    /// PING: check that `to` responds at all.
    async fn ping(&self, to: &PeerInfo) -> Result<()>;

    /// How reachable the connection manager currently judges `peer` to be.
    fn connectedness(&self, peer: &PeerInfo) -> Connectedness {
        if peer.addrs.is_empty() {
            Connectedness::NotConnected
        } else {
            Connectedness::CanConnect
        }
    }

    /// The local peer's identity and public addresses.
    fn local_peer(&self) -> PeerInfo;
}

/// One message exchange context over a bidirectional stream.
///
/// A session moves through open → reading → writing and ends when the
/// stream is finished or an error tears it down; messages on one session are
/// strictly ordered.
pub struct Session {
    send: SendStream,
    recv: RecvStream,
}

impl Session {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        Self { send, recv }
    }

    /// Read the next message, `None` on a clean end-of-stream.
    pub async fn read_message(&mut self) -> Result<Option<Message>> {
        framing::read_message(&mut self.recv).await
    }

    /// Write one message to the stream.
    pub async fn write_message(&mut self, msg: &Message) -> Result<()> {
        framing::write_message(&mut self.send, msg).await
    }

    /// Signal that no further messages will be written.
    pub fn finish(&mut self) -> Result<()> {
        self.send.finish().map_err(|e| anyhow!("finish stream: {e}"))
    }

    /// Wait for the peer to acknowledge the finished stream.
    pub async fn flushed(&mut self) {
        let _ = self.send.stopped().await;
    }
}

/// [`DhtNetwork`] over iroh QUIC connections.
///
/// Peer addresses are JSON-serialized [`NodeAddr`]s, one string per
/// address, as produced by [`endpoint_addr_string`].
pub struct IrohNetwork {
    endpoint: Endpoint,
    self_info: PeerInfo,
    alpn: Vec<u8>,
}

/// Serialize an endpoint address into the string form carried in
/// [`PeerInfo::addrs`].
pub fn endpoint_addr_string(addr: &NodeAddr) -> Result<String> {
    serde_json::to_string(addr).context("serialize endpoint address")
}

impl IrohNetwork {
    pub fn new(endpoint: Endpoint, self_info: PeerInfo, protocol_id: &str) -> Self {
        Self {
            endpoint,
            self_info,
            alpn: protocol_id.as_bytes().to_vec(),
        }
    }

    async fn connect(&self, to: &PeerInfo) -> Result<Connection> {
        for addr in &to.addrs {
            let Ok(parsed) = serde_json::from_str::<NodeAddr>(addr) else {
                continue;
            };
            match self.endpoint.connect(parsed, &self.alpn).await {
                Ok(conn) => return Ok(conn),
                Err(e) => trace!(peer = %hex::encode(&to.id[..8]), "dial failed: {e}"),
            }
        }
        Err(anyhow!("no dialable address for {}", hex::encode(&to.id[..8])))
    }

    async fn open_session(&self, to: &PeerInfo) -> Result<Session> {
        let conn = self.connect(to).await?;
        let (send, recv) = conn.open_bi().await?;
        Ok(Session::new(send, recv))
    }

    /// Send a request and wait for the single reply, which must echo the
    /// request's type. The local identity rides along so the remote can
    /// dial us back even though it only ever accepted our connection.
    async fn exchange(&self, to: &PeerInfo, mut msg: Message) -> Result<Message> {
        msg.from = Some(self.self_info.clone());
        let expect = msg.kind;
        let mut session = self.open_session(to).await?;
        session.write_message(&msg).await?;
        session.finish()?;
        let reply = session
            .read_message()
            .await?
            .ok_or_else(|| anyhow!("stream closed before reply"))?;
        if reply.kind != expect {
            return Err(anyhow!(
                "reply type {:?} does not match request {:?}",
                reply.kind,
                expect
            ));
        }
        Ok(reply)
    }

    /// Send a message that has no reply and flush it out.
    async fn notify(&self, to: &PeerInfo, mut msg: Message) -> Result<()> {
        msg.from = Some(self.self_info.clone());
        let mut session = self.open_session(to).await?;
        session.write_message(&msg).await?;
        session.finish()?;
        session.flushed().await;
        Ok(())
    }
}

#[async_trait]
impl DhtNetwork for IrohNetwork {
    async fn find_node(&self, to: &PeerInfo, key: &[u8]) -> Result<Vec<WirePeer>> {
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
        let mut msg = Message::request(MessageType::PutValue, record.key.clone());
        msg.record = Some(record);
        self.notify(to, msg).await
    }

    async fn add_provider(&self, to: &PeerInfo, key: &[u8], provider: PeerInfo) -> Result<()> {
        let mut msg = Message::request(MessageType::AddProvider, key.to_vec());
        msg.provider_peers = vec![WirePeer {
            connectedness: Connectedness::Connected,
            info: provider,
        }];
        self.notify(to, msg).await
    }

    async fn get_providers(&self, to: &PeerInfo, key: &[u8]) -> Result<GetProvidersReply> {
        let reply = self
            .exchange(to, Message::request(MessageType::GetProviders, key.to_vec()))
            .await?;
        Ok(reply.into())
    }

    async fn ping(&self, to: &PeerInfo) -> Result<()> {
        self.exchange(to, Message::ping()).await?;
        Ok(())
    }

    fn local_peer(&self) -> PeerInfo {
        self.self_info.clone()
    }
}

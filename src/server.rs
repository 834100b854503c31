//! Inbound protocol handling.
//!
//! [`DhtProtocolHandler`] plugs into iroh's router for the DHT ALPN. Every
//! accepted bidirectional stream becomes one [`Session`]: messages on it are
//! served strictly in arrival order, while separate streams of the same
//! connection are served concurrently. A session is torn down when its
//! stream ends or when dispatch reports an error (malformed frame, unknown
//! message type, unencodable reply).

use std::fmt;
use std::sync::Arc;

use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, ProtocolHandler};
use tracing::{debug, trace};

use crate::core::{derive_node_id, PeerInfo};
use crate::net::{DhtNetwork, Session};
use crate::node::DhtNode;

/// Protocol handler for incoming DHT connections.
pub struct DhtProtocolHandler<N: DhtNetwork> {
    node: Arc<DhtNode<N>>,
}

impl<N: DhtNetwork> DhtProtocolHandler<N> {
    pub fn new(node: Arc<DhtNode<N>>) -> Self {
        Self { node }
    }
}

impl<N: DhtNetwork> Clone for DhtProtocolHandler<N> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<N: DhtNetwork> fmt::Debug for DhtProtocolHandler<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhtProtocolHandler").finish()
    }
}

impl<N: DhtNetwork> ProtocolHandler for DhtProtocolHandler<N> {
    async fn accept(&self, conn: Connection) -> Result<(), AcceptError> {
        let endpoint_id = *conn.remote_node_id()?.as_bytes();
        // The connection only proves the remote's identity; its dialable
        // addresses arrive in-band on each request (`Message::from`) and
        // are merged during dispatch.
        let from = PeerInfo::from_id(derive_node_id(&endpoint_id));
        trace!(from = %hex::encode(&from.id[..8]), "DHT connection accepted");

        // One session per stream; streams of one connection run
        // concurrently, messages within a stream in order.
        while let Ok((send, recv)) = conn.accept_bi().await {
            let node = self.node.clone();
            let from = from.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_session(node, from.clone(), Session::new(send, recv)).await
                {
                    debug!(from = %hex::encode(&from.id[..8]), "session closed: {e:#}");
                }
            });
        }
        Ok(())
    }
}

/// Serve one session until end-of-stream or a fatal dispatch error.
async fn serve_session<N: DhtNetwork>(
    node: Arc<DhtNode<N>>,
    from: PeerInfo,
    mut session: Session,
) -> anyhow::Result<()> {
    while let Some(msg) = session.read_message().await? {
        match node.handle_message(from.clone(), msg).await {
            Ok(Some(reply)) => session.write_message(&reply).await?,
            Ok(None) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

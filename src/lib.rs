//! # kad-dht
//!
//! A Kademlia distributed hash table built on top of the
//! [`iroh`](https://crates.io/crates/iroh) transport stack. The crate
//! provides the four user-facing DHT operations (store a record, fetch a
//! record, announce content, discover content providers) plus peer lookup
//! by identifier, all as bounded iterative traversals of a 256-bit XOR
//! keyspace that converge despite churn.
//!
//! The crate is split into a handful of modules that can be reused
//! independently:
//!
//! - [`core`]: transport-agnostic state, including the k-bucket
//!   [`PeerRoutingTable`], the TTL'd [`RecordStore`] and provider table,
//!   and the [`Validator`] capability.
//! - [`node`]: the [`DhtNode`] coordinator that services inbound messages
//!   and drives lookups for local callers.
//! - [`net`]: the [`DhtNetwork`] transport abstraction and its iroh-based
//!   [`IrohNetwork`] implementation.
//! - [`protocol`]: the six wire message types.
//! - [`framing`]: length-prefixed frames so messages can be carried over a
//!   QUIC stream.
//! - [`server`]: the protocol handler that serves inbound sessions.
//!
//! ## Getting started
//!
//! Bind an endpoint, wrap it in an [`IrohNetwork`], and hand it to a
//! [`DhtNode`]:
//!
//! ```no_run
//! use anyhow::Result;
//! use iroh::protocol::Router;
//! use iroh::{Endpoint, Watcher};
//! use kad_dht::{
//!     derive_node_id, endpoint_addr_string, DhtConfig, DhtNode, DhtProtocolHandler,
//!     IrohNetwork, PeerInfo,
//! };
//!
//! # async fn launch() -> Result<()> {
//! let config = DhtConfig::default();
//! let endpoint = Endpoint::builder()
//!     .alpns(vec![config.protocol_id.as_bytes().to_vec()])
//!     .bind()
//!     .await?;
//!
//! let self_info = PeerInfo::new(
//!     derive_node_id(endpoint.node_id().as_bytes()),
//!     vec![endpoint_addr_string(&endpoint.node_addr().initialized().await)?],
//! );
//! let network = IrohNetwork::new(endpoint.clone(), self_info, &config.protocol_id);
//! let node = DhtNode::new(network, config.clone());
//! node.start().await?;
//!
//! let _router = Router::builder(endpoint)
//!     .accept(config.protocol_id.as_bytes(), DhtProtocolHandler::new(node.clone()))
//!     .spawn();
//!
//! // The node can now answer the network and serve local calls.
//! node.bootstrap().await.ok();
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod error;
pub mod framing;
pub mod net;
pub mod node;
pub mod protocol;
mod query;
pub mod server;

pub use crate::core::{
    derive_node_id, key_to_id, xor_distance, AddressBook, Connectedness, ContentRoutingTable,
    DefaultValidator, DhtConfig, Key, NodeId, PeerInfo, PeerRoutingTable, RandomWalkConfig,
    RecordStore, StoredRecord, UpdateOutcome, Validator,
};
pub use crate::error::{DhtError, Result};
pub use crate::net::{endpoint_addr_string, DhtNetwork, IrohNetwork, Session};
pub use crate::node::DhtNode;
pub use crate::protocol::{
    GetProvidersReply, GetValueReply, Message, MessageType, Record, WirePeer,
};
pub use crate::server::DhtProtocolHandler;

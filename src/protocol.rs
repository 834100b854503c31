//! Wire messages exchanged between DHT peers.
//!
//! The protocol is a single request/response record with optional fields, in
//! the shape used by Kademlia DHTs: every message carries a type tag and a
//! key, and responses piggyback whatever the sender knows (a record, provider
//! peers, closer peers). Messages travel as length-prefixed postcard frames,
//! see [`crate::framing`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::core::{Connectedness, PeerInfo};
use crate::error::DhtError;

/// The six message types of the protocol.
///
/// The discriminant is carried on the wire as a `u8`; anything outside the
/// known range fails decoding with
/// [`UnexpectedMessageType`](DhtError::UnexpectedMessageType).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageType {
    PutValue,
    GetValue,
    AddProvider,
    GetProviders,
    FindNode,
    Ping,
}

impl From<MessageType> for u8 {
    fn from(kind: MessageType) -> u8 {
        match kind {
            MessageType::PutValue => 0,
            MessageType::GetValue => 1,
            MessageType::AddProvider => 2,
            MessageType::GetProviders => 3,
            MessageType::FindNode => 4,
            MessageType::Ping => 5,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = DhtError;

    fn try_from(value: u8) -> Result<Self, DhtError> {
        match value {
            0 => Ok(MessageType::PutValue),
            1 => Ok(MessageType::GetValue),
            2 => Ok(MessageType::AddProvider),
            3 => Ok(MessageType::GetProviders),
            4 => Ok(MessageType::FindNode),
            5 => Ok(MessageType::Ping),
            other => Err(DhtError::UnexpectedMessageType(other)),
        }
    }
}

/// A stored key/value record.
///
/// The expiry travels as a stringified absolute unix timestamp in seconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub expires: Option<String>,
}

impl Record {
    /// Build a record expiring `ttl` from now.
    pub fn with_ttl(key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> Self {
        let expires = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|now| (now + ttl).as_secs().to_string());
        Self { key, value, expires }
    }

    /// The expiry as seconds since the unix epoch, if present and parseable.
    pub fn expires_unix(&self) -> Option<u64> {
        self.expires.as_deref().and_then(|s| s.parse().ok())
    }
}

/// A peer reference in a message, annotated with how reachable the sender
/// believes it to be.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePeer {
    pub info: PeerInfo,
    pub connectedness: Connectedness,
}

/// One protocol message. All fields except `kind` are optional in the sense
/// that requests and responses each populate only the subset they need.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageType,
    /// The sender's own identity and dialable addresses, attached to every
    /// request so an accepting node can route back to a peer it only ever
    /// heard from inbound. Receivers trust the addresses solely for the
    /// stream's own remote peer.
    pub from: Option<PeerInfo>,
    pub key: Vec<u8>,
    pub record: Option<Record>,
    pub closer_peers: Vec<WirePeer>,
    pub provider_peers: Vec<WirePeer>,
}

impl Message {
    /// A request of the given kind carrying only a key. The transport fills
    /// in `from` when it sends the message.
    pub fn request(kind: MessageType, key: Vec<u8>) -> Self {
        Self {
            kind,
            from: None,
            key,
            record: None,
            closer_peers: Vec::new(),
            provider_peers: Vec::new(),
        }
    }

    /// A ping. The reply to a ping is a ping with the body cleared.
    pub fn ping() -> Self {
        Self::request(MessageType::Ping, Vec::new())
    }

    pub fn encode(&self) -> Result<Vec<u8>, DhtError> {
        postcard::to_allocvec(self).map_err(|_| DhtError::MessageSerialize)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DhtError> {
        // The type tag is the first byte of the frame; checking it up front
        // distinguishes an unknown message type from a malformed body.
        if let Some(&tag) = bytes.first() {
            MessageType::try_from(tag)?;
        }
        postcard::from_bytes(bytes).map_err(|_| DhtError::MessageDeserialize)
    }
}

/// Typed view of a GET_VALUE response.
#[derive(Clone, Debug, Default)]
pub struct GetValueReply {
    pub record: Option<Record>,
    pub providers: Vec<WirePeer>,
    pub closer: Vec<WirePeer>,
}

impl From<Message> for GetValueReply {
    fn from(msg: Message) -> Self {
        Self {
            record: msg.record,
            providers: msg.provider_peers,
            closer: msg.closer_peers,
        }
    }
}

/// Typed view of a GET_PROVIDERS response.
#[derive(Clone, Debug, Default)]
pub struct GetProvidersReply {
    pub providers: Vec<WirePeer>,
    pub closer: Vec<WirePeer>,
}

impl From<Message> for GetProvidersReply {
    fn from(msg: Message) -> Self {
        Self {
            providers: msg.provider_peers,
            closer: msg.closer_peers,
        }
    }
}

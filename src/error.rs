//! Error taxonomy for DHT operations.

/// Convenience alias for fallible DHT operations.
pub type Result<T> = std::result::Result<T, DhtError>;

/// Errors surfaced by the DHT node and its wire codec.
///
/// Per-peer network failures during an iterative lookup are deliberately NOT
/// represented here: they only mark the affected peer as failed and the
/// lookup continues. Everything that reaches a caller or closes a session is
/// one of these kinds.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DhtError {
    /// The routing table holds no connectable peer near the target, so a
    /// lookup cannot even be seeded.
    #[error("no connectable peers near the target")]
    NoPeers,

    /// `start` was called on a node that is already running.
    #[error("node already started")]
    AlreadyStarted,

    /// An inbound message carried a type discriminant outside the protocol.
    /// The session it arrived on is closed.
    #[error("unexpected message type {0}")]
    UnexpectedMessageType(u8),

    /// An outbound message could not be encoded. Closes the session; an
    /// unencodable response is a programming error, not a network condition.
    #[error("failed to serialize outbound message")]
    MessageSerialize,

    /// An inbound frame could not be decoded. Closes the session.
    #[error("failed to deserialize inbound message")]
    MessageDeserialize,

    /// A record was rejected by the configured [`Validator`](crate::Validator).
    #[error("record rejected by validator")]
    ValidationFailed,

    /// A lookup or per-peer request exceeded its time budget.
    #[error("operation timed out")]
    Timeout,

    /// An iterative lookup converged without finding the target.
    #[error("lookup converged without finding the target")]
    NotFound,
}

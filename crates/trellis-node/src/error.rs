//! Node-level error taxonomy.

use trellis_protocol::{NodeId, ObjectId, ProtocolError, Version};
use trellis_stream::StreamError;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// A blocking operation ran past its deadline.
    #[error("operation timed out")]
    Timeout,
    /// The local node closed while the operation was blocked.
    #[error("local node closed")]
    Closed,
    #[error("node {0} is not connected")]
    NotConnected(NodeId),
    #[error("node {0} is unknown")]
    UnknownNode(NodeId),
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    /// Simultaneous connect: retries exhausted without convergence.
    #[error("handshake collision retries exhausted")]
    CollisionRetriesExhausted,
    #[error("cannot open listener: {0}")]
    ListenFailed(String),
    #[error("object {0} is not mapped")]
    NotMapped(ObjectId),
    #[error("object {id} already attached")]
    AlreadyAttached { id: ObjectId },
    #[error("version {requested} of object {id} is no longer mappable (oldest kept: {oldest})")]
    VersionUnmappable {
        id: ObjectId,
        requested: Version,
        oldest: Version,
    },
    #[error("send token acquire timed out")]
    TokenTimeout,
    /// Child removal reached an object that does not implement it.
    #[error("child removal is not supported by this object")]
    UnsupportedChildRemoval,
    #[error("send failed: {0}")]
    Send(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

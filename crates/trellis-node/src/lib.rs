//! Trellis Node -- the local node runtime for a cluster of cooperating
//! peers exchanging typed packets and replicating versioned objects.
//!
//! The [`LocalNode`] owns the peer registry, the connection set, the
//! request rendezvous table and the object store. Packets arrive at a
//! [`connection::Connection`], are assembled into pooled buffers, wrapped
//! as [`command::Command`]s and dispatched to registered handlers either
//! inline on the receiver task or through per-queue workers.

pub mod buffer;
pub mod command;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod local_node;
pub mod node;
pub mod objects;
pub mod request;

pub use buffer::{Buffer, BufferCache, SharedBuffer};
pub use command::{Command, CommandCache};
pub use config::{parse_core_args, Globals, NodeConfig};
pub use connection::{Connection, ConnectionSet, Listener, SetEvent};
pub use dispatch::{CommandQueue, Dispatcher, Handler};
pub use error::NodeError;
pub use local_node::{LocalNode, PushHandler, SendToken};
pub use node::{NodeState, Peer};
pub use objects::{
    read_children, reconcile_children, write_children, InstanceCache, MapAttempt, Object,
    ObjectRef, ObjectStore, SharedObject, DIRTY_ALL, DIRTY_REMOVED,
};
pub use request::{Reply, RequestHandler};

pub use trellis_protocol::{ConnectionDesc, ConnectionKind, NodeId, ObjectId, Version};

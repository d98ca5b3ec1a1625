//! Peer nodes -- the view a local node keeps of a remote node.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use trellis_protocol::{ConnectionDesc, NodeId, ProtocolError};

use crate::connection::Connection;
use crate::error::NodeError;

/// Default node type advertised in handshakes.
pub const NODETYPE_DEFAULT: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Closed,
    Connected,
    Listening,
    Closing,
}

struct PeerInner {
    id: Mutex<NodeId>,
    node_type: AtomicU32,
    state: Mutex<NodeState>,
    /// Endian swap for this peer's streams, negotiated at handshake.
    swap: AtomicBool,
    descs: Mutex<Vec<ConnectionDesc>>,
    /// The primary outgoing connection; exactly one while connected.
    outgoing: Mutex<Option<Connection>>,
    /// The multicast connection used to send to this peer, if any.
    out_multicast: Mutex<Option<Connection>>,
    /// Candidate multicast connections not yet in use.
    multicasts: Mutex<Vec<Connection>>,
    /// Millis timestamp of the last packet received from this peer.
    last_receive: AtomicU64,
}

/// Cloneable handle to a peer entry in the registry.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    pub fn new(id: NodeId) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                id: Mutex::new(id),
                node_type: AtomicU32::new(NODETYPE_DEFAULT),
                state: Mutex::new(NodeState::Closed),
                swap: AtomicBool::new(false),
                descs: Mutex::new(Vec::new()),
                outgoing: Mutex::new(None),
                out_multicast: Mutex::new(None),
                multicasts: Mutex::new(Vec::new()),
                last_receive: AtomicU64::new(0),
            }),
        }
    }

    /// A node learned of before its id is known (pending connect).
    pub fn unknown() -> Self {
        Self::new(NodeId::ZERO)
    }

    pub fn id(&self) -> NodeId {
        *self.inner.id.lock().unwrap()
    }

    /// The id never changes once set by the handshake.
    pub fn set_id(&self, id: NodeId) {
        let mut slot = self.inner.id.lock().unwrap();
        debug_assert!(slot.is_zero() || *slot == id, "node id changed after handshake");
        *slot = id;
    }

    pub fn node_type(&self) -> u32 {
        self.inner.node_type.load(Ordering::Relaxed)
    }

    pub fn set_node_type(&self, t: u32) {
        self.inner.node_type.store(t, Ordering::Relaxed);
    }

    pub fn state(&self) -> NodeState {
        *self.inner.state.lock().unwrap()
    }

    pub fn set_state(&self, state: NodeState) {
        *self.inner.state.lock().unwrap() = state;
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), NodeState::Connected | NodeState::Listening)
    }

    pub fn swap(&self) -> bool {
        self.inner.swap.load(Ordering::Relaxed)
    }

    pub fn set_swap(&self, swap: bool) {
        self.inner.swap.store(swap, Ordering::Relaxed);
    }

    pub fn descs(&self) -> Vec<ConnectionDesc> {
        self.inner.descs.lock().unwrap().clone()
    }

    pub fn set_descs(&self, descs: Vec<ConnectionDesc>) {
        *self.inner.descs.lock().unwrap() = descs;
    }

    pub fn add_desc(&self, desc: ConnectionDesc) {
        self.inner.descs.lock().unwrap().push(desc);
    }

    pub fn remove_desc(&self, desc: &ConnectionDesc) -> bool {
        let mut descs = self.inner.descs.lock().unwrap();
        let before = descs.len();
        descs.retain(|d| d != desc);
        descs.len() != before
    }

    /// Parse a space-separated desc string from a handshake packet.
    pub fn deserialize_descs(&self, data: &str) -> Result<(), ProtocolError> {
        self.set_descs(ConnectionDesc::split(data)?);
        Ok(())
    }

    pub fn serialize_descs(&self) -> String {
        ConnectionDesc::join(&self.descs())
    }

    pub fn connection(&self) -> Option<Connection> {
        self.inner.outgoing.lock().unwrap().clone()
    }

    pub fn set_connection(&self, conn: Option<Connection>) {
        *self.inner.outgoing.lock().unwrap() = conn;
    }

    pub fn multicast(&self) -> Option<Connection> {
        self.inner.out_multicast.lock().unwrap().clone()
    }

    pub fn set_multicast(&self, conn: Option<Connection>) {
        *self.inner.out_multicast.lock().unwrap() = conn;
    }

    pub fn add_multicast_candidate(&self, conn: Connection) {
        self.inner.multicasts.lock().unwrap().push(conn);
    }

    pub fn remove_multicast(&self, conn: &Connection) {
        let mut list = self.inner.multicasts.lock().unwrap();
        list.retain(|c| c.id() != conn.id());
        let mut out = self.inner.out_multicast.lock().unwrap();
        if out.as_ref().map(|c| c.id()) == Some(conn.id()) {
            *out = None;
        }
    }

    pub fn clear_multicasts(&self) {
        self.inner.multicasts.lock().unwrap().clear();
        *self.inner.out_multicast.lock().unwrap() = None;
    }

    pub fn last_receive(&self) -> u64 {
        self.inner.last_receive.load(Ordering::Relaxed)
    }

    pub fn touch(&self, now_ms: u64) {
        self.inner.last_receive.store(now_ms, Ordering::Relaxed);
    }

    /// Send one packet over the primary connection.
    pub async fn send(&self, packet: Bytes) -> Result<(), NodeError> {
        let conn = self
            .connection()
            .ok_or_else(|| NodeError::NotConnected(self.id()))?;
        conn.send(packet)
            .await
            .map_err(|e| NodeError::Send(format!("to {}: {e}", self.id())))
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_states() {
        let peer = Peer::new(NodeId::random());
        assert_eq!(peer.state(), NodeState::Closed);
        assert!(!peer.is_connected());
        peer.set_state(NodeState::Connected);
        assert!(peer.is_connected());
    }

    #[test]
    fn test_desc_serialization() {
        let peer = Peer::new(NodeId::random());
        peer.deserialize_descs("tcpip:127.0.0.1:4242 mcast:0.0.0.0:4243:wall")
            .unwrap();
        assert_eq!(peer.descs().len(), 2);
        assert_eq!(
            peer.serialize_descs(),
            "tcpip:127.0.0.1:4242 mcast:0.0.0.0:4243:wall"
        );
    }

    #[test]
    fn test_send_without_connection_fails() {
        let peer = Peer::new(NodeId::random());
        let err = futures_block_on(peer.send(Bytes::new())).unwrap_err();
        assert!(matches!(err, NodeError::NotConnected(_)));
    }

    fn futures_block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(f)
    }
}

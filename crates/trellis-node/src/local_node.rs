//! The local node: listeners, handshake, peer registry, dispatch loop,
//! send-token arbitration, multicast discovery and shutdown.
//!
//! Two long-lived tasks per node. The receiver task owns the connection
//! set and the connection→node map, assembles inbound packets into
//! commands and dispatches them; anything needing user-level handling is
//! enqueued, never run inline. The command task drains the default
//! command queue and forwards its idle hook to the object store.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;

use trellis_protocol::packet::{
    encode_node_packet, AddListener as AddListenerPayload, Affinity, Connect, ConnectReply,
    GetNodeData, GetNodeDataReply, IdAnnounce, NodeOp, RemoveListener as RemoveListenerPayload,
    RequestRef,
};
use trellis_protocol::{
    ConnectionDesc, NodeId, ObjectId, PacketType, CONNECT_RETRIES, HANDSHAKE_TIMEOUT_MS,
    NODETYPE_INVALID, PROTOCOL_MAGIC,
};
use trellis_stream::DataIStream;

use crate::buffer::BufferCache;
use crate::command::{Command, CommandCache};
use crate::config::{parse_core_args, Globals};
use crate::connection::{Connection, ConnectionSet, Listener, SetEvent, SetEvents};
use crate::dispatch::{run_worker, CommandQueue, CommandQueueRx, Dispatcher};
use crate::error::NodeError;
use crate::node::{NodeState, Peer, NODETYPE_DEFAULT};
use crate::objects::{ObjectRef, ObjectStore, SharedObject};
use crate::request::{Reply, RequestCtx, RequestHandler};

/// Soft bound on the pending re-dispatch list.
const PENDING_SOFT_LIMIT: usize = 200;

/// Consecutive connection errors tolerated before forcing a disconnect.
const MAX_CONN_ERRORS: u32 = 100;

/// Consecutive select errors tolerated before aborting the receive loop.
const MAX_SELECT_ERRORS: u32 = 10;

/// Handler for pushed object data, keyed by group.
pub type PushHandler = Arc<dyn Fn(u128, u128, ObjectId, &mut DataIStream) + Send + Sync>;

struct McData {
    conn: Connection,
    announced: bool,
}

struct TokenState {
    free: bool,
    /// Millis of the last grant; lost-token detection measures from here.
    last_grant: u64,
    granted_to: Option<NodeId>,
    queue: VecDeque<(Peer, u32)>,
}

struct Inner {
    id: NodeId,
    node_type: u32,
    globals: Globals,
    state: Mutex<NodeState>,
    /// Our advertised listener descriptions.
    descs: Mutex<Vec<ConnectionDesc>>,
    /// Registry entry for ourselves; its connection is the loopback.
    self_peer: Peer,
    /// Peer registry. Read by all tasks, written by the receiver task.
    nodes: RwLock<HashMap<NodeId, Peer>>,
    /// Connection → node map. Receiver-task convention; the lock is
    /// uncontended.
    conn_nodes: Mutex<HashMap<u64, Peer>>,
    set: ConnectionSet,
    events: Mutex<Option<SetEvents>>,
    dispatcher: Dispatcher,
    cmd_queue: CommandQueue,
    cmd_rx: Mutex<Option<CommandQueueRx>>,
    requests: RequestHandler,
    commands: CommandCache,
    objects: ObjectStore,
    token: Mutex<TokenState>,
    /// Our joined multicast connections with announce state.
    mcasts: Mutex<Vec<McData>>,
    push_handlers: Mutex<HashMap<u128, PushHandler>>,
    listeners: Mutex<Vec<Listener>>,
    /// Serialises connect-by-id so a node is never instantiated twice.
    connect_lock: tokio::sync::Mutex<()>,
    epoch: Instant,
    receiver: Mutex<Option<tokio::task::JoinHandle<()>>>,
    command_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct LocalNode {
    inner: Arc<Inner>,
}

#[derive(Clone)]
pub(crate) struct WeakLocalNode(Weak<Inner>);

impl WeakLocalNode {
    pub(crate) fn upgrade(&self) -> Option<LocalNode> {
        self.0.upgrade().map(|inner| LocalNode { inner })
    }
}

/// Exclusive right to perform a large broadcast towards one peer.
/// Release it explicitly; the server also expires lost tokens.
#[derive(Debug)]
pub struct SendToken {
    peer: Peer,
}

impl LocalNode {
    pub fn new(globals: Globals) -> LocalNode {
        let id = NodeId::random();
        let buffers = BufferCache::new();
        let (set, events) = ConnectionSet::new(buffers.clone());
        let (cmd_queue, cmd_rx) = CommandQueue::channel();
        let objects = ObjectStore::new(globals.clone());

        let node = LocalNode {
            inner: Arc::new(Inner {
                id,
                node_type: NODETYPE_DEFAULT,
                globals,
                state: Mutex::new(NodeState::Closed),
                descs: Mutex::new(Vec::new()),
                self_peer: Peer::new(id),
                nodes: RwLock::new(HashMap::new()),
                conn_nodes: Mutex::new(HashMap::new()),
                set,
                events: Mutex::new(Some(events)),
                dispatcher: Dispatcher::new(),
                cmd_queue,
                cmd_rx: Mutex::new(Some(cmd_rx)),
                requests: RequestHandler::new(),
                commands: CommandCache::new(buffers),
                objects,
                token: Mutex::new(TokenState {
                    free: true,
                    last_grant: 0,
                    granted_to: None,
                    queue: VecDeque::new(),
                }),
                mcasts: Mutex::new(Vec::new()),
                push_handlers: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                connect_lock: tokio::sync::Mutex::new(()),
                epoch: Instant::now(),
                receiver: Mutex::new(None),
                command_task: Mutex::new(None),
            }),
        };
        node.inner.objects.bind(node.downgrade());
        node.register_commands();
        node
    }

    /// Parse `--co-listen`/`--co-globals` and start listening.
    pub async fn init_local(args: &[String]) -> Result<LocalNode, NodeError> {
        let (descs, globals) = parse_core_args(args)?;
        let node = LocalNode::new(globals);
        *node.inner.descs.lock().unwrap() = descs;
        node.listen().await?;
        Ok(node)
    }

    pub(crate) fn downgrade(&self) -> WeakLocalNode {
        WeakLocalNode(Arc::downgrade(&self.inner))
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn state(&self) -> NodeState {
        *self.inner.state.lock().unwrap()
    }

    fn set_state(&self, state: NodeState) {
        *self.inner.state.lock().unwrap() = state;
    }

    pub fn is_listening(&self) -> bool {
        self.state() == NodeState::Listening
    }

    pub fn is_closed(&self) -> bool {
        self.state() == NodeState::Closed
    }

    pub fn globals(&self) -> &Globals {
        &self.inner.globals
    }

    pub(crate) fn requests(&self) -> &RequestHandler {
        &self.inner.requests
    }

    pub(crate) fn command_queue(&self) -> CommandQueue {
        self.inner.cmd_queue.clone()
    }

    pub fn objects(&self) -> &ObjectStore {
        &self.inner.objects
    }

    /// Milliseconds since this node came up.
    pub fn time_ms(&self) -> u64 {
        self.inner.epoch.elapsed().as_millis() as u64
    }

    pub fn add_connection_description(&self, desc: ConnectionDesc) {
        self.inner.descs.lock().unwrap().push(desc);
    }

    pub fn connection_descriptions(&self) -> Vec<ConnectionDesc> {
        self.inner.descs.lock().unwrap().clone()
    }

    fn serialize_descs(&self) -> String {
        ConnectionDesc::join(&self.connection_descriptions())
    }

    /// Connected peers, excluding ourselves.
    pub fn nodes(&self) -> Vec<Peer> {
        self.inner
            .nodes
            .read()
            .unwrap()
            .values()
            .filter(|p| p.is_connected() && p.id() != self.inner.id)
            .cloned()
            .collect()
    }

    pub fn get_node(&self, id: NodeId) -> Option<Peer> {
        self.inner.nodes.read().unwrap().get(&id).cloned()
    }

    /// Find a connected peer advertising any of the given descriptions.
    /// Resolves collision races where the target's id is not known yet.
    fn find_connected_by_descs(&self, descs: &[ConnectionDesc]) -> Option<Peer> {
        self.nodes()
            .into_iter()
            .find(|p| p.descs().iter().any(|d| descs.contains(d)))
    }

    /// Wake the receiver to retry deferred commands.
    pub fn flush_commands(&self) {
        self.inner.set.interrupt();
    }

    pub(crate) async fn send_to_self(&self, packet: Bytes) -> Result<(), NodeError> {
        self.inner.self_peer.send(packet).await
    }

    /// Forcibly drop a peer's primary connection, running the normal
    /// disconnect teardown. Used for fatal stream errors.
    pub(crate) fn kill_connection(&self, peer: &Peer) {
        if let Some(conn) = peer.connection() {
            tracing::warn!(peer = %peer.id(), "dropping connection after fatal stream error");
            self.inner.set.fail_connection(&conn);
        }
    }

    pub(crate) fn multicast_connections(&self) -> Vec<Connection> {
        self.inner
            .mcasts
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.conn.clone())
            .collect()
    }

    // ==================================================================
    // Startup / shutdown
    // ==================================================================

    /// Open the self-loopback and the configured listeners, then start
    /// the receiver and command tasks. Any listener failure fails startup.
    pub async fn listen(&self) -> Result<(), NodeError> {
        if !self.is_closed() {
            return Err(NodeError::ListenFailed("node is not closed".into()));
        }

        self.connect_self();

        let descs = self.connection_descriptions();
        let mut bound = Vec::with_capacity(descs.len());
        for desc in descs {
            if desc.is_multicast() {
                let conn = Connection::multicast(&desc);
                self.inner.set.add_multicast(conn.clone());
                self.inner
                    .mcasts
                    .lock()
                    .unwrap()
                    .push(McData { conn, announced: false });
                bound.push(desc);
            } else {
                let listener = Listener::bind(&desc)
                    .await
                    .map_err(|e| NodeError::ListenFailed(format!("{desc}: {e}")))?;
                bound.push(listener.desc().clone());
                self.inner.set.add_listener(listener.clone());
                self.inner.listeners.lock().unwrap().push(listener);
            }
        }
        *self.inner.descs.lock().unwrap() = bound;
        self.inner.self_peer.set_descs(self.connection_descriptions());

        self.set_state(NodeState::Listening);
        self.inner.self_peer.set_state(NodeState::Listening);

        // Command task
        let rx = self.inner.cmd_rx.lock().unwrap().take().expect("cmd queue taken");
        let idle_node = self.clone();
        let stop_node = self.clone();
        let worker = tokio::spawn(run_worker(
            rx,
            move || {
                let node = idle_node.clone();
                async move { node.inner.objects.notify_idle() }
            },
            move || stop_node.is_closed(),
        ));
        *self.inner.command_task.lock().unwrap() = Some(worker);

        // Receiver task
        let events = self.inner.events.lock().unwrap().take().expect("receiver started twice");
        let node = self.clone();
        let receiver = tokio::spawn(async move { node.run_receiver(events).await });
        *self.inner.receiver.lock().unwrap() = Some(receiver);

        tracing::info!(node = %self.inner.id, descs = %self.serialize_descs(), "listening");
        Ok(())
    }

    fn connect_self(&self) {
        let (ours, theirs) = Connection::pipe_pair();
        self.inner.self_peer.set_connection(Some(ours));
        self.inner
            .conn_nodes
            .lock()
            .unwrap()
            .insert(theirs.id(), self.inner.self_peer.clone());
        self.inner
            .nodes
            .write()
            .unwrap()
            .insert(self.inner.id, self.inner.self_peer.clone());
        self.inner.set.add_connection(theirs);
    }

    /// Stop both tasks via the self-addressed STOP_RCV / STOP_CMD pair,
    /// drain pending work and clear the registries.
    pub async fn close(&self) -> Result<(), NodeError> {
        if !self.is_listening() {
            return Err(NodeError::Closed);
        }
        let pkt = encode_node_packet(NodeOp::StopRcv, |_| {});
        self.send_to_self(pkt).await?;

        let receiver = self.inner.receiver.lock().unwrap().take();
        if let Some(handle) = receiver {
            handle.await.ok();
        }
        self.inner.requests.fail_all();
        tracing::info!(node = %self.inner.id, open = self.inner.set.size(), "closed");
        Ok(())
    }

    fn cleanup(&self) {
        let conns: Vec<Peer> = {
            let mut nodes = self.inner.nodes.write().unwrap();
            nodes.drain().map(|(_, p)| p).collect()
        };
        for peer in conns {
            if let Some(conn) = peer.connection() {
                self.inner.set.remove_connection(&conn);
            }
            peer.set_state(NodeState::Closed);
            peer.set_connection(None);
            peer.clear_multicasts();
        }
        self.inner.conn_nodes.lock().unwrap().clear();
        for listener in self.inner.listeners.lock().unwrap().drain(..) {
            listener.close();
        }
        for mc in self.inner.mcasts.lock().unwrap().drain(..) {
            self.inner.set.remove_connection(&mc.conn);
        }
        self.inner.objects.clear();
        self.inner.commands.flush();
    }

    // ==================================================================
    // Receiver loop
    // ==================================================================

    async fn run_receiver(self, mut events: SetEvents) {
        let mut pending: Vec<Command> = Vec::new();
        let mut n_errors: u32 = 0;

        while self.is_listening() {
            let event = events.select(self.inner.globals.timeout()).await;
            let was_error = matches!(event, SetEvent::ConnError { .. } | SetEvent::SelectError);
            match event {
                SetEvent::Connect { conn } => {
                    tracing::debug!(conn = conn.id(), "accepted connection");
                    self.inner.set.add_connection(conn);
                }
                SetEvent::Data { conn, buffer } => {
                    self.handle_data(conn, buffer, &mut pending).await;
                }
                SetEvent::Disconnect { conn } => {
                    self.handle_disconnect(conn).await;
                }
                SetEvent::ConnError { conn } => {
                    n_errors += 1;
                    tracing::warn!(conn = conn.id(), "connection error during select");
                    if n_errors > MAX_CONN_ERRORS {
                        tracing::warn!("too many errors in a row, capping connection");
                        self.handle_disconnect(conn).await;
                    }
                }
                SetEvent::SelectError => {
                    n_errors += 1;
                    tracing::warn!("error during select");
                    if n_errors > MAX_SELECT_ERRORS {
                        tracing::error!("too many select errors in a row, aborting receiver");
                        break;
                    }
                }
                SetEvent::Interrupt => {
                    self.redispatch(&mut pending).await;
                }
                SetEvent::Timeout => {
                    tracing::trace!("select timeout");
                }
            }
            if !was_error {
                n_errors = 0;
            }
        }

        if !pending.is_empty() {
            tracing::warn!(
                count = pending.len(),
                "commands pending while leaving receiver task"
            );
            pending.clear();
        }

        let worker = self.inner.command_task.lock().unwrap().take();
        if let Some(handle) = worker {
            handle.await.ok();
        }
        self.cleanup();
        tracing::debug!(node = %self.inner.id, "receiver task done");
    }

    async fn handle_data(
        &self,
        conn: Connection,
        buffer: crate::buffer::SharedBuffer,
        pending: &mut Vec<Command>,
    ) {
        let node = self.inner.conn_nodes.lock().unwrap().get(&conn.id()).cloned();
        if let Some(node) = &node {
            node.touch(self.time_ms());
        }

        let command = match self.inner.commands.wrap(buffer, node, Some(conn.clone())) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(conn = conn.id(), error = %e, "malformed packet, disconnecting");
                self.handle_disconnect(conn).await;
                return;
            }
        };
        self.dispatch_with_pending(command, pending).await;
    }

    async fn dispatch_with_pending(&self, command: Command, pending: &mut Vec<Command>) {
        if self.dispatch_command(command.clone()).await {
            self.redispatch(pending).await;
        } else {
            self.redispatch(pending).await;
            pending.push(command);
            if pending.len() >= PENDING_SOFT_LIMIT {
                tracing::warn!(count = pending.len(), "pending command list keeps growing");
            }
        }
    }

    /// Route one command. False means "cannot be handled yet".
    async fn dispatch_command(&self, command: Command) -> bool {
        match command.ptype() {
            PacketType::Node => self.inner.dispatcher.dispatch(command).await,
            PacketType::Object => self.inner.objects.route(command),
        }
    }

    /// Fixed-point iteration over the deferred list: retry until a full
    /// pass makes no progress.
    async fn redispatch(&self, pending: &mut Vec<Command>) {
        let mut changed = true;
        while changed && !pending.is_empty() {
            changed = false;
            for i in 0..pending.len() {
                if self.dispatch_command(pending[i].clone()).await {
                    pending.remove(i);
                    changed = true;
                    break;
                }
            }
        }
    }

    async fn handle_disconnect(&self, conn: Connection) {
        let node = self.inner.conn_nodes.lock().unwrap().remove(&conn.id());
        if let Some(node) = node {
            let is_primary = node.connection().map(|c| c.id()) == Some(conn.id());
            if is_primary {
                self.inner.objects.remove_node(&node);
                node.set_state(NodeState::Closed);
                node.set_connection(None);
                node.clear_multicasts();
                self.inner.nodes.write().unwrap().remove(&node.id());
                tracing::info!(peer = %node.id(), "disconnected");
            } else {
                // A multicast reader for that peer went away.
                node.remove_multicast(&conn);
            }
        }
        self.inner.set.remove_connection(&conn);
    }

    // ==================================================================
    // Connecting peers
    // ==================================================================

    /// Connect a peer known by its descriptions: transport connect plus
    /// the three-packet handshake, with jittered exponential back-off on
    /// simultaneous-connect collisions.
    pub async fn connect_peer(&self, node: &Peer) -> Result<Peer, NodeError> {
        if !self.is_listening() {
            return Err(NodeError::Closed);
        }
        if node.is_connected() {
            return Ok(node.clone());
        }

        let target_descs = node.descs();
        for attempt in 0..CONNECT_RETRIES {
            match self.try_connect(node).await? {
                ConnectOutcome::Ok => return Ok(node.clone()),
                ConnectOutcome::Collision => {
                    let backoff = collision_backoff(attempt);
                    tracing::debug!(
                        peer = %node.id(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "simultaneous connect, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
                ConnectOutcome::Unreachable => {
                    // Maybe the peer talks to us; give it a moment.
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }

            // The peer's own connect may have won the race meanwhile.
            if node.is_connected() {
                return Ok(node.clone());
            }
            if !node.id().is_zero() {
                if let Some(existing) = self.get_node(node.id()) {
                    if existing.is_connected() {
                        return Ok(existing);
                    }
                }
            }
            if let Some(existing) = self.find_connected_by_descs(&target_descs) {
                return Ok(existing);
            }
        }
        Err(NodeError::CollisionRetriesExhausted)
    }

    async fn try_connect(&self, node: &Peer) -> Result<ConnectOutcome, NodeError> {
        for desc in node.descs() {
            if desc.is_multicast() {
                continue; // never use multicast for the primary connection
            }
            let conn = match Connection::dial(&desc).await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::debug!(%desc, error = %e, "dial failed");
                    continue;
                }
            };
            self.inner.set.add_connection(conn.clone());

            let pending = self.inner.requests.register_ctx(RequestCtx::Peer(node.clone()));
            let connect = Connect {
                magic: PROTOCOL_MAGIC,
                node_id: self.inner.id,
                node_type: self.inner.node_type,
                request_id: pending.id,
                descs: self.serialize_descs(),
            };
            conn.send(encode_node_packet(NodeOp::Connect, |b| connect.encode(b)))
                .await?;

            return match self
                .inner
                .requests
                .wait(pending, Duration::from_millis(HANDSHAKE_TIMEOUT_MS))
                .await
            {
                Ok(Reply::Flag(true)) => Ok(ConnectOutcome::Ok),
                Ok(Reply::Flag(false)) => Ok(ConnectOutcome::Collision),
                Ok(_) => Err(NodeError::ConnectFailed("unexpected reply".into())),
                Err(NodeError::Timeout) => {
                    self.inner.set.remove_connection(&conn);
                    tracing::warn!(peer = %node.id(), "handshake timeout");
                    Err(NodeError::Timeout)
                }
                Err(e) => Err(e),
            };
        }
        Ok(ConnectOutcome::Unreachable)
    }

    /// Connect a peer known only by NodeId: ask connected peers for its
    /// descriptions, then connect normally. One lookup at a time.
    pub async fn connect_id(&self, node_id: NodeId) -> Result<Peer, NodeError> {
        if node_id.is_zero() || node_id == self.inner.id {
            return Err(NodeError::UnknownNode(node_id));
        }
        let _guard = self.inner.connect_lock.lock().await;

        if let Some(peer) = self.get_node(node_id) {
            if peer.is_connected() {
                return Ok(peer);
            }
        }

        tracing::info!(target = %node_id, "connecting node by id");
        for via in self.nodes() {
            let Some(found) = self.query_node(node_id, &via).await else {
                continue;
            };
            if found.is_connected() {
                return Ok(found);
            }
            match self.connect_peer(&found).await {
                Ok(peer) => return Ok(peer),
                Err(e) => {
                    tracing::debug!(target = %node_id, via = %via.id(), error = %e, "connect failed");
                }
            }
        }

        // The target may have connected to us by itself in the meantime.
        if let Some(peer) = self.get_node(node_id) {
            if peer.is_connected() {
                return Ok(peer);
            }
        }
        Err(NodeError::UnknownNode(node_id))
    }

    async fn query_node(&self, node_id: NodeId, via: &Peer) -> Option<Peer> {
        let pending = self.inner.requests.register();
        let query = GetNodeData { node_id, request_id: pending.id };
        via.send(encode_node_packet(NodeOp::GetNodeData, |b| query.encode(b)))
            .await
            .ok()?;
        match self
            .inner
            .requests
            .wait(pending, self.inner.globals.timeout())
            .await
        {
            Ok(Reply::MaybePeer(found)) => found,
            _ => None,
        }
    }

    /// Gracefully disconnect a connected peer.
    pub async fn disconnect(&self, node: &Peer) -> Result<(), NodeError> {
        if !self.is_listening() {
            return Err(NodeError::Closed);
        }
        if !node.is_connected() {
            return Ok(());
        }
        let pending = self.inner.requests.register_ctx(RequestCtx::Peer(node.clone()));
        let pkt = encode_node_packet(NodeOp::Disconnect, |b| {
            RequestRef { request_id: pending.id }.encode(b)
        });
        self.send_to_self(pkt).await?;
        self.inner
            .requests
            .wait(pending, self.inner.globals.timeout())
            .await?;
        self.inner.objects.remove_node(node);
        Ok(())
    }

    // ==================================================================
    // Multicast discovery
    // ==================================================================

    /// After connect-ack, pair our multicast groups with the peer's and
    /// share existing connections.
    fn connect_multicast(&self, node: &Peer) {
        if node.multicast().is_some() {
            return; // already wired by an earlier ID packet
        }
        let peer_descs = node.descs();
        let mcasts = self.inner.mcasts.lock().unwrap();
        for local in self.connection_descriptions() {
            if !local.is_multicast() {
                continue;
            }
            for remote in &peer_descs {
                if !local.same_multicast_group(remote) {
                    continue;
                }
                if let Some(mc) = mcasts.iter().find(|m| m.conn.desc().group == local.group) {
                    if node.multicast().is_none() {
                        node.set_multicast(Some(mc.conn.clone()));
                        tracing::info!(
                            peer = %node.id(),
                            group = %local.group,
                            "sharing multicast group"
                        );
                    } else {
                        node.add_multicast_candidate(mc.conn.clone());
                    }
                }
                // No local connection yet: the group is recorded in our
                // descriptions for a lazy join.
            }
        }
    }

    /// Announce ourselves on a multicast connection before first use.
    pub(crate) async fn announce_on_multicast(&self, conn: &Connection) -> Result<(), NodeError> {
        let needs = {
            let mut mcasts = self.inner.mcasts.lock().unwrap();
            match mcasts.iter_mut().find(|m| m.conn.id() == conn.id()) {
                Some(mc) if !mc.announced => {
                    mc.announced = true;
                    true
                }
                _ => false,
            }
        };
        if needs {
            let announce = IdAnnounce {
                node_id: self.inner.id,
                node_type: self.inner.node_type,
                descs: self.serialize_descs(),
            };
            conn.send(encode_node_packet(NodeOp::Id, |b| announce.encode(b)))
                .await?;
        }
        Ok(())
    }

    // ==================================================================
    // Send token
    // ==================================================================

    /// Acquire the send token held by `peer`. Blocks until granted or the
    /// global timeout expires.
    pub async fn acquire_send_token(&self, peer: &Peer) -> Result<SendToken, NodeError> {
        let pending = self.inner.requests.register();
        let pkt = encode_node_packet(NodeOp::AcquireSendToken, |b| {
            RequestRef { request_id: pending.id }.encode(b)
        });
        peer.send(pkt).await?;
        match self
            .inner
            .requests
            .wait(pending, self.inner.globals.timeout())
            .await
        {
            Ok(_) => Ok(SendToken { peer: peer.clone() }),
            Err(NodeError::Timeout) => Err(NodeError::TokenTimeout),
            Err(e) => Err(e),
        }
    }

    /// Return the token. Idempotent towards lost or expired tokens.
    pub async fn release_send_token(&self, token: SendToken) {
        let pkt = encode_node_packet(NodeOp::ReleaseSendToken, |_| {});
        if let Err(e) = token.peer.send(pkt).await {
            tracing::debug!(peer = %token.peer.id(), error = %e, "token release failed");
        }
    }

    // ==================================================================
    // Keepalive
    // ==================================================================

    pub async fn ping(&self, node: &Peer) -> Result<(), NodeError> {
        node.send(encode_node_packet(NodeOp::Ping, |_| {})).await
    }

    /// Ping peers that have been silent past the keepalive timeout.
    /// Returns true if anything was pinged.
    pub async fn ping_idle_nodes(&self) -> bool {
        let now = self.time_ms();
        let keepalive = self.inner.globals.keepalive_ms;
        let mut pinged = false;
        for node in self.nodes() {
            if now.saturating_sub(node.last_receive()) > keepalive {
                tracing::info!(peer = %node.id(), last_seen = node.last_receive(), "pinging idle node");
                if self.ping(&node).await.is_ok() {
                    pinged = true;
                }
            }
        }
        pinged
    }

    // ==================================================================
    // Dynamic listeners
    // ==================================================================

    /// Open an additional listener at runtime and advertise it.
    pub async fn add_listener(&self, desc: ConnectionDesc) -> Result<ConnectionDesc, NodeError> {
        if !self.is_listening() {
            return Err(NodeError::Closed);
        }
        let bound = if desc.is_multicast() {
            let conn = Connection::multicast(&desc);
            self.inner.set.add_multicast(conn.clone());
            self.inner
                .mcasts
                .lock()
                .unwrap()
                .push(McData { conn, announced: false });
            desc
        } else {
            let listener = Listener::bind(&desc)
                .await
                .map_err(|e| NodeError::ListenFailed(format!("{desc}: {e}")))?;
            let bound = listener.desc().clone();
            self.inner.set.add_listener(listener.clone());
            self.inner.listeners.lock().unwrap().push(listener);
            bound
        };
        self.inner.descs.lock().unwrap().push(bound.clone());
        self.inner.self_peer.add_desc(bound.clone());

        let payload = AddListenerPayload { desc: bound.to_string() };
        let pkt = encode_node_packet(NodeOp::AddListener, |b| payload.encode(b));
        for node in self.nodes() {
            node.send(pkt.clone()).await.ok();
        }
        Ok(bound)
    }

    /// Close listeners and withdraw their descriptions everywhere.
    pub async fn remove_listeners(&self, descs: &[ConnectionDesc]) -> Result<(), NodeError> {
        for desc in descs {
            let pending = self.inner.requests.register();
            let payload = RemoveListenerPayload {
                request_id: pending.id,
                desc: desc.to_string(),
            };
            let pkt = encode_node_packet(NodeOp::RemoveListener, |b| payload.encode(b));
            for node in self.nodes() {
                node.send(pkt.clone()).await.ok();
            }
            self.send_to_self(pkt).await?;
            self.inner
                .requests
                .wait(pending, self.inner.globals.timeout())
                .await?;
        }
        Ok(())
    }

    /// Scheduling hint for both tasks; tokio tasks are not pinnable, so
    /// the hint is recorded in the logs only.
    pub async fn set_affinity(&self, core: i32) -> Result<(), NodeError> {
        let rcv = encode_node_packet(NodeOp::SetAffinityRcv, |b| Affinity { core }.encode(b));
        self.send_to_self(rcv).await?;
        let cmd = encode_node_packet(NodeOp::SetAffinityCmd, |b| Affinity { core }.encode(b));
        self.send_to_self(cmd).await
    }

    // ==================================================================
    // Object facade
    // ==================================================================

    pub async fn register_object(&self, obj: SharedObject) -> Result<ObjectRef, NodeError> {
        self.inner.objects.register(obj).await
    }

    pub async fn deregister_object(&self, r: &ObjectRef) -> Result<(), NodeError> {
        self.inner.objects.deregister(r).await
    }

    pub async fn map_object(
        &self,
        obj: SharedObject,
        id: ObjectId,
        version: trellis_protocol::Version,
    ) -> Result<ObjectRef, NodeError> {
        self.inner.objects.map(obj, id, version).await
    }

    pub async fn unmap_object(&self, r: &ObjectRef) -> Result<(), NodeError> {
        self.inner.objects.unmap(r).await
    }

    pub fn disable_instance_cache(&self) {
        self.inner.objects.disable_instance_cache();
    }

    pub fn expire_instance_data(&self, age_ms: u64) {
        self.inner.objects.expire_instance_data(age_ms);
    }

    pub fn register_push_handler(&self, group: u128, handler: PushHandler) {
        self.inner.push_handlers.lock().unwrap().insert(group, handler);
    }

    pub(crate) fn object_push(
        &self,
        group: u128,
        object_type: u128,
        object_id: ObjectId,
        mut istream: DataIStream,
    ) {
        let handler = self.inner.push_handlers.lock().unwrap().get(&group).cloned();
        match handler {
            Some(handler) => {
                handler(group, object_type, object_id, &mut istream);
                if istream.has_data() {
                    tracing::warn!(
                        group = format_args!("{group:x}"),
                        object = %object_id,
                        "incomplete object push read"
                    );
                }
            }
            None => {
                tracing::debug!(group = format_args!("{group:x}"), "no push handler registered");
            }
        }
    }

    // ==================================================================
    // Command handlers
    // ==================================================================

    fn reg<F, Fut>(&self, op: NodeOp, queued: bool, f: F)
    where
        F: Fn(LocalNode, Command) -> Fut + Copy + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let weak = self.downgrade();
        let queue = queued.then(|| self.inner.cmd_queue.clone());
        self.inner.dispatcher.register(
            op as u32,
            Arc::new(move |cmd| {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(node) => f(node, cmd).await,
                        None => true,
                    }
                })
            }),
            queue,
        );
    }

    fn register_commands(&self) {
        self.reg(NodeOp::AckRequest, false, |n, c| async move { n.cmd_ack_request(c) });
        self.reg(NodeOp::StopRcv, false, |n, c| async move { n.cmd_stop_rcv(c).await });
        self.reg(NodeOp::StopCmd, true, |n, c| async move { n.cmd_stop_cmd(c) });
        self.reg(NodeOp::SetAffinityRcv, false, |n, c| async move { n.cmd_set_affinity(c) });
        self.reg(NodeOp::SetAffinityCmd, true, |n, c| async move { n.cmd_set_affinity(c) });
        self.reg(NodeOp::Connect, false, |n, c| async move { n.cmd_connect(c).await });
        self.reg(NodeOp::ConnectReply, false, |n, c| async move { n.cmd_connect_reply(c).await });
        self.reg(NodeOp::ConnectAck, false, |n, c| async move { n.cmd_connect_ack(c) });
        self.reg(NodeOp::Id, false, |n, c| async move { n.cmd_id(c) });
        self.reg(NodeOp::Disconnect, false, |n, c| async move { n.cmd_disconnect(c) });
        self.reg(NodeOp::GetNodeData, true, |n, c| async move { n.cmd_get_node_data(c).await });
        self.reg(NodeOp::GetNodeDataReply, false, |n, c| async move {
            n.cmd_get_node_data_reply(c)
        });
        self.reg(NodeOp::AcquireSendToken, true, |n, c| async move {
            n.cmd_acquire_send_token(c).await
        });
        self.reg(NodeOp::AcquireSendTokenReply, false, |n, c| async move {
            n.cmd_ack_request(c)
        });
        self.reg(NodeOp::ReleaseSendToken, true, |n, c| async move {
            n.cmd_release_send_token(c).await
        });
        self.reg(NodeOp::AddListener, false, |n, c| async move { n.cmd_add_listener(c) });
        self.reg(NodeOp::RemoveListener, false, |n, c| async move { n.cmd_remove_listener(c) });
        self.reg(NodeOp::Ping, true, |n, c| async move { n.cmd_ping(c).await });
        self.reg(NodeOp::PingReply, false, |_n, _c| async move { true });
    }

    fn cmd_ack_request(&self, cmd: Command) -> bool {
        if let Ok(req) = cmd.decode(|b| RequestRef::decode(b)) {
            self.inner.requests.serve(req.request_id, Reply::Unit);
        }
        true
    }

    async fn cmd_stop_rcv(&self, mut cmd: Command) -> bool {
        tracing::debug!(node = %self.inner.id, "stop receiver");
        self.set_state(NodeState::Closing);
        cmd.retag(NodeOp::StopCmd as u32);
        self.dispatch_command(cmd).await;
        true
    }

    fn cmd_stop_cmd(&self, _cmd: Command) -> bool {
        tracing::debug!(node = %self.inner.id, "stop command task");
        self.set_state(NodeState::Closed);
        true
    }

    fn cmd_set_affinity(&self, cmd: Command) -> bool {
        if let Ok(affinity) = cmd.decode(|b| Affinity::decode(b)) {
            tracing::debug!(core = affinity.core, "affinity hint recorded");
        }
        true
    }

    async fn cmd_connect(&self, cmd: Command) -> bool {
        let Some(conn) = cmd.connection().cloned() else {
            return true;
        };
        let payload = match cmd.decode(|b| Connect::decode(b)) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "malformed CONNECT");
                self.inner.set.remove_connection(&conn);
                return true;
            }
        };

        let swap = match check_magic(payload.magic) {
            Some(swap) => swap,
            None => {
                tracing::warn!(magic = format_args!("{:#010x}", payload.magic), "bad magic, refusing");
                self.inner.set.remove_connection(&conn);
                return true;
            }
        };
        let node_id = payload.node_id;
        if node_id == self.inner.id || node_id.is_zero() {
            self.inner.set.remove_connection(&conn);
            return true;
        }

        let existing = self.get_node(node_id);
        if let Some(peer) = &existing {
            if peer.is_connected() {
                // Simultaneous connect from the peer: refuse. The reply
                // must be flushed before the connection goes away.
                tracing::info!(peer = %node_id, "already connected, refusing connect");
                let reply = ConnectReply {
                    magic: PROTOCOL_MAGIC,
                    node_id: NodeId::ZERO,
                    node_type: self.inner.node_type,
                    request_id: payload.request_id,
                    descs: String::new(),
                };
                conn.send(encode_node_packet(NodeOp::ConnectReply, |b| reply.encode(b)))
                    .await
                    .ok();
                self.inner.set.remove_connection(&conn);
                return true;
            }
        }

        let peer = existing.unwrap_or_else(|| Peer::new(node_id));
        peer.set_id(node_id);
        peer.set_node_type(payload.node_type);
        peer.set_swap(swap);
        if let Err(e) = peer.deserialize_descs(&payload.descs) {
            tracing::warn!(peer = %node_id, error = %e, "bad descriptions in CONNECT");
        }
        peer.set_connection(Some(conn.clone()));
        peer.set_state(NodeState::Connected);
        self.inner.conn_nodes.lock().unwrap().insert(conn.id(), peer.clone());
        self.inner.nodes.write().unwrap().insert(node_id, peer);
        tracing::info!(peer = %node_id, swap, "inbound handshake accepted");

        let reply = ConnectReply {
            magic: PROTOCOL_MAGIC,
            node_id: self.inner.id,
            node_type: self.inner.node_type,
            request_id: payload.request_id,
            descs: self.serialize_descs(),
        };
        conn.send(encode_node_packet(NodeOp::ConnectReply, |b| reply.encode(b)))
            .await
            .ok();
        true
    }

    async fn cmd_connect_reply(&self, cmd: Command) -> bool {
        let Some(conn) = cmd.connection().cloned() else {
            return true;
        };
        let Ok(payload) = cmd.decode(|b| ConnectReply::decode(b)) else {
            self.inner.set.remove_connection(&conn);
            return true;
        };

        // Refused: the peer already holds a connection to us.
        if payload.node_id.is_zero() {
            tracing::info!("connect refused, node already connected by peer");
            self.inner.set.remove_connection(&conn);
            self.inner.requests.serve(payload.request_id, Reply::Flag(false));
            return true;
        }

        let node_id = payload.node_id;
        if let Some(peer) = self.get_node(node_id) {
            if peer.is_connected() {
                // Simultaneous connect resolved the other way: drop both
                // our new transport and the half-set-up registry entry.
                tracing::info!(peer = %node_id, "closing simultaneous connection");
                self.inner.set.remove_connection(&conn);
                if let Some(peer_conn) = peer.connection() {
                    self.inner.conn_nodes.lock().unwrap().remove(&peer_conn.id());
                    self.inner.set.remove_connection(&peer_conn);
                }
                peer.set_state(NodeState::Closed);
                peer.set_connection(None);
                self.inner.nodes.write().unwrap().remove(&node_id);
                self.inner.requests.serve(payload.request_id, Reply::Flag(false));
                return true;
            }
        }

        let peer = match self.inner.requests.context(payload.request_id) {
            Some(RequestCtx::Peer(peer)) => peer,
            None => Peer::new(node_id),
        };
        peer.set_id(node_id);
        peer.set_node_type(payload.node_type);
        if let Some(swap) = check_magic(payload.magic) {
            peer.set_swap(swap);
        }
        if let Err(e) = peer.deserialize_descs(&payload.descs) {
            tracing::warn!(peer = %node_id, error = %e, "bad descriptions in CONNECT_REPLY");
        }
        peer.set_connection(Some(conn.clone()));
        peer.set_state(NodeState::Connected);
        self.inner.conn_nodes.lock().unwrap().insert(conn.id(), peer.clone());
        self.inner.nodes.write().unwrap().insert(node_id, peer.clone());

        self.inner.requests.serve(payload.request_id, Reply::Flag(true));
        tracing::info!(peer = %node_id, "outbound handshake complete");

        peer.send(encode_node_packet(NodeOp::ConnectAck, |_| {}))
            .await
            .ok();
        self.connect_multicast(&peer);
        true
    }

    fn cmd_connect_ack(&self, cmd: Command) -> bool {
        if let Some(node) = cmd.node() {
            self.connect_multicast(node);
        }
        true
    }

    /// ID packet on a multicast reader: associate the connection with the
    /// announcing peer.
    fn cmd_id(&self, cmd: Command) -> bool {
        if cmd.node().is_some() {
            return true; // association already known
        }
        let Some(conn) = cmd.connection().cloned() else {
            return true;
        };
        let Ok(announce) = cmd.decode(|b| IdAnnounce::decode(b)) else {
            return true;
        };

        let node = if announce.node_id == self.inner.id {
            self.inner.self_peer.clone()
        } else {
            match self.get_node(announce.node_id) {
                Some(node) => node,
                None => {
                    // A node known only via multicast: registered but
                    // unconnected until someone dials it.
                    let node = Peer::new(announce.node_id);
                    node.set_node_type(announce.node_type);
                    if let Err(e) = node.deserialize_descs(&announce.descs) {
                        tracing::warn!(peer = %announce.node_id, error = %e, "bad descs in ID");
                    }
                    self.inner
                        .nodes
                        .write()
                        .unwrap()
                        .insert(announce.node_id, node.clone());
                    node
                }
            }
        };

        // Wire our joined group connection as the send side for the peer.
        if node.multicast().is_none() {
            let group = &conn.desc().group;
            let mcasts = self.inner.mcasts.lock().unwrap();
            if let Some(mc) = mcasts.iter().find(|m| &m.conn.desc().group == group) {
                node.set_multicast(Some(mc.conn.clone()));
            }
        }

        self.inner.conn_nodes.lock().unwrap().insert(conn.id(), node);
        tracing::info!(peer = %announce.node_id, conn = conn.id(), "multicast connection associated");
        true
    }

    fn cmd_disconnect(&self, cmd: Command) -> bool {
        let Ok(req) = cmd.decode(|b| RequestRef::decode(b)) else {
            return true;
        };
        let Some(RequestCtx::Peer(node)) = self.inner.requests.context(req.request_id) else {
            return true;
        };

        if let Some(conn) = node.connection() {
            node.set_state(NodeState::Closed);
            node.set_connection(None);
            node.clear_multicasts();
            self.inner.objects.remove_instance_data(node.id());
            self.inner.conn_nodes.lock().unwrap().remove(&conn.id());
            self.inner.nodes.write().unwrap().remove(&node.id());
            self.inner.set.remove_connection(&conn);
            tracing::info!(peer = %node.id(), "disconnected on request");
        }
        self.inner.requests.serve(req.request_id, Reply::Unit);
        true
    }

    async fn cmd_get_node_data(&self, cmd: Command) -> bool {
        let Ok(query) = cmd.decode(|b| GetNodeData::decode(b)) else {
            return true;
        };
        let Some(to) = cmd.node().cloned() else {
            return true;
        };

        let found = self.get_node(query.node_id).filter(|n| n.is_connected());
        let reply = match &found {
            Some(node) => GetNodeDataReply {
                node_id: query.node_id,
                node_type: node.node_type(),
                request_id: query.request_id,
                descs: node.serialize_descs(),
            },
            None => GetNodeDataReply {
                node_id: query.node_id,
                node_type: NODETYPE_INVALID,
                request_id: query.request_id,
                descs: String::new(),
            },
        };
        tracing::debug!(target = %query.node_id, found = found.is_some(), to = %to.id(), "node data query");
        to.send(encode_node_packet(NodeOp::GetNodeDataReply, |b| reply.encode(b)))
            .await
            .ok();
        true
    }

    fn cmd_get_node_data_reply(&self, cmd: Command) -> bool {
        let Ok(reply) = cmd.decode(|b| GetNodeDataReply::decode(b)) else {
            return true;
        };

        // The node may have connected to us in the meantime.
        if let Some(existing) = self.get_node(reply.node_id) {
            self.inner
                .requests
                .serve(reply.request_id, Reply::MaybePeer(Some(existing)));
            return true;
        }
        if reply.node_type == NODETYPE_INVALID {
            self.inner.requests.serve(reply.request_id, Reply::MaybePeer(None));
            return true;
        }

        let node = Peer::new(reply.node_id);
        node.set_node_type(reply.node_type);
        if let Err(e) = node.deserialize_descs(&reply.descs) {
            tracing::warn!(peer = %reply.node_id, error = %e, "bad descs in node data reply");
        }
        self.inner
            .requests
            .serve(reply.request_id, Reply::MaybePeer(Some(node)));
        true
    }

    async fn cmd_acquire_send_token(&self, cmd: Command) -> bool {
        let Ok(req) = cmd.decode(|b| RequestRef::decode(b)) else {
            return true;
        };
        let Some(node) = cmd.node().cloned() else {
            return true;
        };

        let now = self.time_ms();
        {
            let mut token = self.inner.token.lock().unwrap();
            if !token.free {
                if now.saturating_sub(token.last_grant) <= self.inner.globals.timeout_ms {
                    token.queue.push_back((node, req.request_id));
                    return true;
                }
                // The holder never released: declare the token lost,
                // drop the stale queue and regenerate.
                tracing::warn!(holder = ?token.granted_to, "send token lost, regenerating");
                token.queue.clear();
            }
            token.free = false;
            token.granted_to = Some(node.id());
            token.last_grant = now;
        }

        let reply = encode_node_packet(NodeOp::AcquireSendTokenReply, |b| {
            RequestRef { request_id: req.request_id }.encode(b)
        });
        node.send(reply).await.ok();
        true
    }

    async fn cmd_release_send_token(&self, cmd: Command) -> bool {
        let next = {
            let mut token = self.inner.token.lock().unwrap();
            if token.free {
                return true; // double release after a timeout
            }
            // A release from a node that is not the current holder is a
            // stale release of an already-expired grant.
            if let (Some(holder), Some(node)) = (token.granted_to, cmd.node()) {
                if node.id() != holder {
                    tracing::debug!(from = %node.id(), "stale token release ignored");
                    return true;
                }
            }
            match token.queue.pop_front() {
                Some((next, request_id)) => {
                    token.granted_to = Some(next.id());
                    token.last_grant = self.time_ms();
                    Some((next, request_id))
                }
                None => {
                    token.free = true;
                    token.granted_to = None;
                    None
                }
            }
        };

        if let Some((next, request_id)) = next {
            let reply = encode_node_packet(NodeOp::AcquireSendTokenReply, |b| {
                RequestRef { request_id }.encode(b)
            });
            next.send(reply).await.ok();
        }
        true
    }

    fn cmd_add_listener(&self, cmd: Command) -> bool {
        let Ok(payload) = cmd.decode(|b| AddListenerPayload::decode(b)) else {
            return true;
        };
        let Some(node) = cmd.node() else {
            return true;
        };
        if node.id() == self.inner.id {
            return true; // added locally before the broadcast
        }
        match payload.desc.parse() {
            Ok(desc) => node.add_desc(desc),
            Err(e) => tracing::warn!(peer = %node.id(), error = %e, "bad listener description"),
        }
        true
    }

    fn cmd_remove_listener(&self, cmd: Command) -> bool {
        let Ok(payload) = cmd.decode(|b| RemoveListenerPayload::decode(b)) else {
            return true;
        };
        let Some(node) = cmd.node() else {
            return true;
        };
        let Ok(desc) = payload.desc.parse::<ConnectionDesc>() else {
            return true;
        };

        node.remove_desc(&desc);
        if node.id() == self.inner.id {
            self.inner.descs.lock().unwrap().retain(|d| d != &desc);
            let mut listeners = self.inner.listeners.lock().unwrap();
            listeners.retain(|l| {
                if l.desc() == &desc {
                    l.close();
                    false
                } else {
                    true
                }
            });
            drop(listeners);
            self.inner
                .mcasts
                .lock()
                .unwrap()
                .retain(|m| {
                    if m.conn.desc() == &desc {
                        self.inner.set.remove_connection(&m.conn);
                        false
                    } else {
                        true
                    }
                });
            self.inner.requests.serve(payload.request_id, Reply::Unit);
        }
        true
    }

    async fn cmd_ping(&self, cmd: Command) -> bool {
        if let Some(node) = cmd.node() {
            node.send(encode_node_packet(NodeOp::PingReply, |_| {}))
                .await
                .ok();
        }
        true
    }
}

enum ConnectOutcome {
    Ok,
    Collision,
    Unreachable,
}

/// Compare a received magic against ours: same endianness, swapped, or
/// not a trellis node at all.
fn check_magic(magic: u32) -> Option<bool> {
    if magic == PROTOCOL_MAGIC {
        Some(false)
    } else if magic == PROTOCOL_MAGIC.swap_bytes() {
        Some(true)
    } else {
        None
    }
}

/// Jittered exponential back-off for simultaneous-connect retries.
fn collision_backoff(attempt: u32) -> Duration {
    let base = 2u64.saturating_pow(attempt).min(128);
    let jitter = rand::thread_rng().gen_range(1..=base.max(2));
    Duration::from_millis(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_magic() {
        assert_eq!(check_magic(PROTOCOL_MAGIC), Some(false));
        assert_eq!(check_magic(PROTOCOL_MAGIC.swap_bytes()), Some(true));
        assert_eq!(check_magic(0xdeadbeef), None);
    }

    #[test]
    fn test_collision_backoff_bounded() {
        for attempt in 0..CONNECT_RETRIES {
            let d = collision_backoff(attempt);
            assert!(d >= Duration::from_millis(2));
            assert!(d <= Duration::from_millis(256));
        }
    }

    #[tokio::test]
    async fn test_listen_close_lifecycle() {
        let node = LocalNode::new(Globals::default());
        assert!(node.is_closed());
        node.listen().await.unwrap();
        assert!(node.is_listening());
        node.close().await.unwrap();
        assert!(node.is_closed());
        assert!(node.nodes().is_empty());
    }

    #[tokio::test]
    async fn test_init_local_parses_flags() {
        let args: Vec<String> = [
            "--co-listen",
            "tcpip:127.0.0.1:0",
            "--co-globals",
            "timeout_ms=1234",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let node = LocalNode::init_local(&args).await.unwrap();
        assert!(node.is_listening());
        assert_eq!(node.globals().timeout_ms, 1234);
        let descs = node.connection_descriptions();
        assert_eq!(descs.len(), 1);
        assert_ne!(descs[0].port, 0, "bound port advertised");
        node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_listen_fails() {
        let node = LocalNode::new(Globals::default());
        node.listen().await.unwrap();
        assert!(node.listen().await.is_err());
        node.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_list_drains_after_attach() {
        use trellis_protocol::packet::{encode_object_packet, ObjectData, ObjectOp};
        use trellis_protocol::Version;

        struct Noop;
        impl crate::objects::Object for Noop {
            fn serialize(&mut self, _os: &mut trellis_stream::DataOStream, _dirty: u64) {}
            fn deserialize(
                &mut self,
                is: &mut DataIStream,
                _dirty: u64,
            ) -> Result<(), trellis_stream::StreamError> {
                while is.has_data() {
                    is.read::<u8>()?;
                }
                Ok(())
            }
        }

        let node = LocalNode::new(Globals::default());
        let object_id = ObjectId::random();
        node.inner.objects.test_mark_pending(object_id);

        // A delta for an object whose map is still in flight defers.
        let mut body = Vec::new();
        body.extend_from_slice(&8u64.to_le_bytes());
        body.extend_from_slice(&crate::objects::DIRTY_ALL.to_le_bytes());
        let pkt = encode_object_packet(ObjectOp::Delta, |b| {
            ObjectData {
                object_id,
                version: Version(1),
                sequence: 0,
                last: true,
                compressor: 0,
                n_chunks: 0,
                data_size: 8,
                body: body.into(),
            }
            .encode(b)
        });
        let command = node.inner.commands.from_bytes(&pkt, None).unwrap();

        let mut pending = Vec::new();
        node.dispatch_with_pending(command, &mut pending).await;
        assert_eq!(pending.len(), 1);

        // Re-dispatch without the attach makes no progress.
        node.redispatch(&mut pending).await;
        assert_eq!(pending.len(), 1);

        // Attach resolves the dependency; the list drains in one pass.
        node.inner
            .objects
            .test_attach_slave(object_id, Arc::new(Mutex::new(Noop)));
        node.redispatch(&mut pending).await;
        assert!(pending.is_empty());
    }
}

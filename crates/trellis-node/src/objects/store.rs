//! The object store: attach bookkeeping, commit/sync machinery, and the
//! routing of object-level commands onto the command queue.
//!
//! Masters keep a bounded history of committed instance and delta bursts
//! so late mappers can join at a recent version and catch up in order.
//! Slaves assemble inbound bursts per version (sequence-checked, ready on
//! the `last` flag) and apply them in `sync`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::watch;

use trellis_protocol::packet::{
    encode_object_packet, MapResult, ObjectData, ObjectMap, ObjectOp, ObjectPush, ObjectUnmap,
};
use trellis_protocol::{NodeId, ObjectCommit, ObjectId, Version};
use trellis_stream::{
    ChunkOut, DataIStream, DataOStream, QueuedChunks, RawChunk, StreamError, VecSink,
    ZstdCompressor,
};

use crate::command::Command;
use crate::config::Globals;
use crate::dispatch::Handler;
use crate::error::NodeError;
use crate::local_node::{LocalNode, WeakLocalNode};
use crate::node::Peer;
use crate::objects::cache::InstanceCache;
use crate::objects::{Object, ObjectRef, Role, DIRTY_ALL, DIRTY_REMOVED};
use crate::request::{PendingRequest, Reply};

pub type SharedObject = Arc<Mutex<dyn Object>>;

// ============================================================================
// Entries
// ============================================================================

struct Partial {
    version: Version,
    op: ObjectOp,
    next_seq: u32,
    swap: bool,
    chunks: Vec<RawChunk>,
}

struct Ready {
    version: Version,
    op: ObjectOp,
    swap: bool,
    chunks: Vec<RawChunk>,
}

#[derive(Default)]
struct Assembly {
    current: Option<Partial>,
    ready: VecDeque<Ready>,
}

struct HistoryEntry {
    version: Version,
    instance: Vec<RawChunk>,
    delta: Vec<RawChunk>,
}

struct EntryInner {
    id: ObjectId,
    role: Role,
    obj: SharedObject,
    version: Mutex<Version>,
    /// Slave: the master's node id once the map reply names it.
    master: Mutex<NodeId>,
    /// Master: node ids of mapped slaves.
    slaves: Mutex<Vec<NodeId>>,
    /// Master: recent commits for late mappers.
    history: Mutex<VecDeque<HistoryEntry>>,
    assembly: Mutex<Assembly>,
    /// Epoch bumped whenever a burst completes or the entry fails.
    ready_tx: watch::Sender<u64>,
    removed: AtomicBool,
    /// Master went away mid-stream; pending syncs fail with ShortRead.
    failed: AtomicBool,
    /// Slave-side commit counter tagging SLAVE_DELTA bursts.
    slave_commits: AtomicU64,
}

#[derive(Clone)]
struct Entry {
    inner: Arc<EntryInner>,
}

impl Entry {
    fn new(id: ObjectId, role: Role, obj: SharedObject) -> Self {
        let (ready_tx, _) = watch::channel(0);
        Entry {
            inner: Arc::new(EntryInner {
                id,
                role,
                obj,
                version: Mutex::new(Version::NONE),
                master: Mutex::new(NodeId::ZERO),
                slaves: Mutex::new(Vec::new()),
                history: Mutex::new(VecDeque::new()),
                assembly: Mutex::new(Assembly::default()),
                ready_tx,
                removed: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                slave_commits: AtomicU64::new(0),
            }),
        }
    }

    fn version(&self) -> Version {
        *self.inner.version.lock().unwrap()
    }

    fn bump_ready(&self) {
        self.inner.ready_tx.send_modify(|epoch| *epoch += 1);
    }
}

// ============================================================================
// Store
// ============================================================================

pub(crate) struct StoreInner {
    local: OnceLock<WeakLocalNode>,
    globals: Globals,
    entries: Mutex<HashMap<ObjectId, Entry>>,
    /// Maps submitted but not yet granted; data for these defers.
    pending_maps: Mutex<HashSet<ObjectId>>,
    cache: Mutex<InstanceCache>,
    cache_enabled: AtomicBool,
    send_on_register: AtomicBool,
}

#[derive(Clone)]
pub struct ObjectStore {
    inner: Arc<StoreInner>,
}

/// A non-blocking map submission awaiting `map_sync`.
pub struct MapAttempt {
    id: ObjectId,
    requested: Version,
    cached: Version,
    candidates: Vec<Peer>,
    next: usize,
    pending: PendingRequest,
}

impl ObjectStore {
    pub fn new(globals: Globals) -> Self {
        let cache = InstanceCache::new(globals.instance_cache_entries);
        Self {
            inner: Arc::new(StoreInner {
                local: OnceLock::new(),
                globals,
                entries: Mutex::new(HashMap::new()),
                pending_maps: Mutex::new(HashSet::new()),
                cache: Mutex::new(cache),
                cache_enabled: AtomicBool::new(true),
                send_on_register: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn bind(&self, local: WeakLocalNode) {
        let _ = self.inner.local.set(local);
    }

    fn local(&self) -> Result<LocalNode, NodeError> {
        self.inner
            .local
            .get()
            .and_then(WeakLocalNode::upgrade)
            .ok_or(NodeError::Closed)
    }

    fn entry(&self, id: ObjectId) -> Option<Entry> {
        self.inner.entries.lock().unwrap().get(&id).cloned()
    }

    fn make_ref(&self, id: ObjectId) -> ObjectRef {
        ObjectRef { id, store: Arc::downgrade(&self.inner) }
    }

    // ------------------------------------------------------------------
    // Registration and mapping
    // ------------------------------------------------------------------

    /// Register a master instance. Assigns a fresh ObjectId at version 0;
    /// no data moves until someone maps.
    pub async fn register(&self, obj: SharedObject) -> Result<ObjectRef, NodeError> {
        let id = ObjectId::random();
        let entry = Entry::new(id, Role::Master, obj);
        self.inner.entries.lock().unwrap().insert(id, entry.clone());
        tracing::debug!(object = %id, "registered master");

        if self.inner.send_on_register.load(Ordering::Relaxed) {
            // Prime caches of multicast listeners with the initial instance.
            let local = self.local()?;
            let conns = local.multicast_connections();
            if !conns.is_empty() {
                let chunks = self.serialize_entry(&entry, Version::NONE, DIRTY_ALL)?;
                for conn in conns {
                    local.announce_on_multicast(&conn).await?;
                    send_burst_conn(&conn, ObjectOp::Instance, id, Version::NONE, &chunks).await?;
                }
            }
        }
        Ok(self.make_ref(id))
    }

    /// Deregister a master. Still-mapped slaves get a silent REMOVED
    /// notification they observe on their next sync.
    pub async fn deregister(&self, r: &ObjectRef) -> Result<(), NodeError> {
        let entry = self.entry(r.id).ok_or(NodeError::NotMapped(r.id))?;
        if entry.inner.role != Role::Master {
            return Err(NodeError::NotMapped(r.id));
        }
        self.inner.entries.lock().unwrap().remove(&r.id);

        let slaves = entry.inner.slaves.lock().unwrap().clone();
        if !slaves.is_empty() {
            tracing::warn!(
                object = %r.id,
                slaves = slaves.len(),
                "deregistering master with mapped slaves"
            );
            let version = entry.version().next();
            let chunks = mask_only_burst(version, DIRTY_REMOVED)?;
            let local = self.local()?;
            for node_id in slaves {
                if let Some(peer) = local.get_node(node_id) {
                    send_burst(&peer, ObjectOp::Delta, r.id, version, &chunks).await.ok();
                }
            }
        }
        Ok(())
    }

    /// Map a slave instance: non-blocking submit plus blocking wait.
    pub async fn map(
        &self,
        obj: SharedObject,
        id: ObjectId,
        version: Version,
    ) -> Result<ObjectRef, NodeError> {
        let attempt = self.map_nb(obj, id, version, None).await?;
        self.map_sync(attempt).await
    }

    /// Submit a map request. With no explicit master the connected peers
    /// are queried in turn (the first that owns the master grants it).
    pub async fn map_nb(
        &self,
        obj: SharedObject,
        id: ObjectId,
        version: Version,
        master: Option<Peer>,
    ) -> Result<MapAttempt, NodeError> {
        let local = self.local()?;
        {
            let entries = self.inner.entries.lock().unwrap();
            if entries.contains_key(&id) {
                return Err(NodeError::AlreadyAttached { id });
            }
        }

        let entry = Entry::new(id, Role::Slave, obj);

        // Cache hit: replay the cached instance and tell the master what
        // we already hold, short-circuiting the instance transfer.
        let mut cached = Version::NONE;
        if self.inner.cache_enabled.load(Ordering::Relaxed) {
            let hit = self.inner.cache.lock().unwrap().get(id);
            if let Some(hit) = hit {
                if version.is_head() || version.is_none() || hit.version == version {
                    cached = hit.version;
                    let mut assembly = entry.inner.assembly.lock().unwrap();
                    assembly.ready.push_back(Ready {
                        version: hit.version,
                        op: ObjectOp::Instance,
                        swap: hit.swap,
                        chunks: hit.chunks,
                    });
                    drop(assembly);
                    entry.bump_ready();
                    tracing::debug!(object = %id, version = %hit.version, "instance cache hit");
                }
            }
        }

        self.inner.entries.lock().unwrap().insert(id, entry);
        self.inner.pending_maps.lock().unwrap().insert(id);
        // Data that raced ahead of the attach can dispatch now.
        local.flush_commands();

        let candidates = match master {
            Some(peer) => vec![peer],
            None => local.nodes(),
        };
        if candidates.is_empty() {
            self.unmap_cleanup(id);
            return Err(NodeError::NotMapped(id));
        }

        let pending = local.requests().register();
        send_map_request(&candidates[0], id, version, cached, pending.id).await?;

        Ok(MapAttempt {
            id,
            requested: version,
            cached,
            candidates,
            next: 0,
            pending,
        })
    }

    /// Wait for a map submission: first the master's grant, then the
    /// instance burst itself.
    pub async fn map_sync(&self, mut attempt: MapAttempt) -> Result<ObjectRef, NodeError> {
        let local = self.local()?;
        let timeout = self.inner.globals.timeout();

        loop {
            let reply = match local.requests().wait(attempt.pending, timeout).await {
                Ok(reply) => reply,
                Err(e) => {
                    self.unmap_cleanup(attempt.id);
                    return Err(e);
                }
            };
            let Reply::Map { result, version: granted } = reply else {
                self.unmap_cleanup(attempt.id);
                return Err(NodeError::Closed);
            };

            match MapResult::from_u32(result) {
                Some(MapResult::Ok) => {
                    let entry = match self.entry(attempt.id) {
                        Some(e) => e,
                        None => return Err(NodeError::NotMapped(attempt.id)),
                    };
                    *entry.inner.master.lock().unwrap() =
                        attempt.candidates[attempt.next].id();
                    self.inner.pending_maps.lock().unwrap().remove(&attempt.id);

                    // Wait for and apply the granted instance (and any
                    // queued catch-up versions).
                    let target = if granted.is_none() { Version::HEAD } else { granted };
                    if let Err(e) = self.sync_entry(&entry, target, timeout).await {
                        self.unmap_cleanup(attempt.id);
                        return Err(e);
                    }
                    tracing::debug!(object = %attempt.id, version = %entry.version(), "mapped");
                    return Ok(self.make_ref(attempt.id));
                }
                Some(MapResult::Unknown) => {
                    attempt.next += 1;
                    if attempt.next >= attempt.candidates.len() {
                        self.unmap_cleanup(attempt.id);
                        return Err(NodeError::NotMapped(attempt.id));
                    }
                    attempt.pending = local.requests().register();
                    send_map_request(
                        &attempt.candidates[attempt.next],
                        attempt.id,
                        attempt.requested,
                        attempt.cached,
                        attempt.pending.id,
                    )
                    .await?;
                }
                Some(MapResult::VersionUnmappable) => {
                    self.unmap_cleanup(attempt.id);
                    return Err(NodeError::VersionUnmappable {
                        id: attempt.id,
                        requested: attempt.requested,
                        oldest: granted,
                    });
                }
                None => {
                    self.unmap_cleanup(attempt.id);
                    return Err(NodeError::ConnectFailed(format!(
                        "bad map result {result}"
                    )));
                }
            }
        }
    }

    /// Unmap a slave, informing the master.
    pub async fn unmap(&self, r: &ObjectRef) -> Result<(), NodeError> {
        let entry = self.entry(r.id).ok_or(NodeError::NotMapped(r.id))?;
        if entry.inner.role != Role::Slave {
            return Err(NodeError::NotMapped(r.id));
        }
        self.unmap_cleanup(r.id);

        let master_id = *entry.inner.master.lock().unwrap();
        if let Ok(local) = self.local() {
            if let Some(master) = local.get_node(master_id) {
                let pkt = encode_object_packet(ObjectOp::Unmap, |b| {
                    ObjectUnmap { object_id: r.id }.encode(b)
                });
                master.send(pkt).await.ok();
            }
        }
        Ok(())
    }

    fn unmap_cleanup(&self, id: ObjectId) {
        self.inner.entries.lock().unwrap().remove(&id);
        self.inner.pending_maps.lock().unwrap().remove(&id);
    }

    // ------------------------------------------------------------------
    // Commit / sync
    // ------------------------------------------------------------------

    /// Commit the object. On a master this serialises the dirty state at
    /// the next version and bursts it to mapped slaves; on a slave it
    /// sends a SLAVE_DELTA burst up to the master.
    pub async fn commit(&self, r: &ObjectRef) -> Result<Version, NodeError> {
        let entry = self.entry(r.id).ok_or(NodeError::NotMapped(r.id))?;
        let local = self.local()?;
        match entry.inner.role {
            Role::Master => {
                // Route through the loopback so the commit is ordered
                // with inbound commands on the object's queue.
                let pending = local.requests().register();
                let pkt = encode_object_packet(ObjectOp::Commit, |b| {
                    ObjectCommit { object_id: r.id, request_id: pending.id }.encode(b)
                });
                local.send_to_self(pkt).await?;
                match local.requests().wait(pending, self.inner.globals.timeout()).await? {
                    Reply::Version(v) if !v.is_none() => Ok(v),
                    Reply::Version(_) => Err(NodeError::NotMapped(r.id)),
                    _ => Err(NodeError::Closed),
                }
            }
            Role::Slave => self.slave_commit(&entry).await,
        }
    }

    async fn slave_commit(&self, entry: &Entry) -> Result<Version, NodeError> {
        let local = self.local()?;
        let master_id = *entry.inner.master.lock().unwrap();
        let master = local
            .get_node(master_id)
            .ok_or(NodeError::NotConnected(master_id))?;

        let dirty = entry.inner.obj.lock().unwrap().dirty_bits();
        let seq = entry.inner.slave_commits.fetch_add(1, Ordering::Relaxed) + 1;
        let tag = Version(seq as u128);
        let chunks = self.serialize_entry(entry, tag, dirty)?;
        entry.inner.obj.lock().unwrap().clear_dirty();

        send_burst(&master, ObjectOp::SlaveDelta, entry.inner.id, tag, &chunks).await?;
        Ok(entry.version())
    }

    /// Block until the object has reached `version`, applying pending
    /// bursts in order. HEAD waits for at least one newer version.
    pub async fn sync(&self, r: &ObjectRef, version: Version) -> Result<Version, NodeError> {
        let entry = self.entry(r.id).ok_or(NodeError::NotMapped(r.id))?;
        self.sync_entry(&entry, version, self.inner.globals.timeout())
            .await
    }

    async fn sync_entry(
        &self,
        entry: &Entry,
        target: Version,
        timeout: std::time::Duration,
    ) -> Result<Version, NodeError> {
        let mut ready_rx = entry.inner.ready_tx.subscribe();
        let mut applied_any = false;

        loop {
            loop {
                // Apply in arrival order, but never run past a numeric
                // target: later versions stay queued for the next sync.
                let burst = {
                    let mut assembly = entry.inner.assembly.lock().unwrap();
                    let past_target = assembly.ready.front().is_some_and(|front| {
                        !target.is_head()
                            && !target.is_none()
                            && front.op != ObjectOp::SlaveDelta
                            && front.version > target
                    });
                    if past_target {
                        None
                    } else {
                        assembly.ready.pop_front()
                    }
                };
                match burst {
                    Some(burst) => {
                        if let Err(e) = apply_burst(entry, burst) {
                            // Corrupt lengths and unknown codecs take the
                            // offending connection down, not the node.
                            if matches!(&e, NodeError::Stream(se) if se.is_fatal()) {
                                self.disconnect_master(entry);
                            }
                            return Err(e);
                        }
                        applied_any = true;
                    }
                    None => break,
                }
            }

            if entry.inner.removed.load(Ordering::Relaxed) {
                // Master deregistered under us: silently detach.
                self.unmap_cleanup(entry.inner.id);
                return Ok(entry.version());
            }
            if entry.inner.failed.load(Ordering::Relaxed) {
                return Err(StreamError::ShortRead.into());
            }

            let current = entry.version();
            let done = if target.is_head() {
                applied_any
            } else if target.is_none() {
                true
            } else {
                current >= target
            };
            if done {
                return Ok(current);
            }

            match tokio::time::timeout(timeout, ready_rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(NodeError::Closed),
                Err(_) => return Err(NodeError::Timeout),
            }
        }
    }

    fn disconnect_master(&self, entry: &Entry) {
        let master_id = *entry.inner.master.lock().unwrap();
        if let Ok(local) = self.local() {
            if let Some(master) = local.get_node(master_id) {
                local.kill_connection(&master);
            }
        }
    }

    // ------------------------------------------------------------------
    // Push
    // ------------------------------------------------------------------

    /// Push typed instance data to a set of peers, routed on arrival to
    /// the handler registered for `group`.
    pub async fn push(
        &self,
        r: &ObjectRef,
        group: u128,
        object_type: u128,
        peers: &[Peer],
    ) -> Result<(), NodeError> {
        let entry = self.entry(r.id).ok_or(NodeError::NotMapped(r.id))?;
        let body = serialize_plain(&entry.inner.obj)?;
        let pkt = encode_object_packet(ObjectOp::Push, |b| {
            ObjectPush {
                group,
                object_type,
                object_id: r.id,
                body: body.clone(),
            }
            .encode(b)
        });
        for peer in peers {
            peer.send(pkt.clone()).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Instance cache controls
    // ------------------------------------------------------------------

    pub fn disable_instance_cache(&self) {
        self.inner.cache_enabled.store(false, Ordering::Relaxed);
    }

    pub fn expire_instance_data(&self, age_ms: u64) {
        self.inner
            .cache
            .lock()
            .unwrap()
            .expire(std::time::Duration::from_millis(age_ms));
    }

    pub fn enable_send_on_register(&self) {
        self.inner.send_on_register.store(true, Ordering::Relaxed);
    }

    pub fn disable_send_on_register(&self) {
        self.inner.send_on_register.store(false, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Node lifecycle hooks
    // ------------------------------------------------------------------

    /// A peer disconnected: fail in-flight slave streams mastered by it,
    /// detach it from master slave-lists, purge its cached instances.
    pub fn remove_node(&self, peer: &Peer) {
        let peer_id = peer.id();
        let entries = self.inner.entries.lock().unwrap();
        for entry in entries.values() {
            match entry.inner.role {
                Role::Slave => {
                    if *entry.inner.master.lock().unwrap() == peer_id {
                        entry.inner.failed.store(true, Ordering::Relaxed);
                        entry.inner.assembly.lock().unwrap().current = None;
                        entry.bump_ready();
                    }
                }
                Role::Master => {
                    entry.inner.slaves.lock().unwrap().retain(|s| *s != peer_id);
                }
            }
        }
        drop(entries);
        self.remove_instance_data(peer_id);
    }

    /// Purge cached instance data learned from a node.
    pub fn remove_instance_data(&self, node: NodeId) {
        self.inner.cache.lock().unwrap().remove_from(node);
    }

    /// Command-thread idle hook: expire stale cache entries. Returns
    /// false: no deferred work is kept here.
    pub fn notify_idle(&self) -> bool {
        self.expire_instance_data(self.inner.globals.instance_cache_age_ms);
        false
    }

    /// Drop all attachments (shutdown).
    pub fn clear(&self) {
        let entries: Vec<Entry> = {
            let mut map = self.inner.entries.lock().unwrap();
            map.drain().map(|(_, e)| e).collect()
        };
        for entry in entries {
            entry.inner.failed.store(true, Ordering::Relaxed);
            entry.bump_ready();
        }
        self.inner.pending_maps.lock().unwrap().clear();
        self.inner.cache.lock().unwrap().clear();
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Route an object command. Returns false to defer (target object has
    /// a map in flight but is not attached yet).
    pub(crate) fn route(&self, cmd: Command) -> bool {
        let Some(op) = ObjectOp::from_u32(cmd.command()) else {
            tracing::warn!(?cmd, "unknown object command, dropping");
            return true;
        };
        let Ok(local) = self.local() else {
            return true; // shutting down, drop
        };

        if op.carries_data() {
            let Ok(object_id) = cmd.decode(|b| trellis_protocol::packet::get_id(b, "object id"))
            else {
                tracing::warn!(?cmd, "truncated object data, dropping");
                return true;
            };
            let object_id = ObjectId(object_id);
            let attached = self.inner.entries.lock().unwrap().contains_key(&object_id);
            if !attached && self.inner.pending_maps.lock().unwrap().contains(&object_id) {
                return false; // retry once the map attaches
            }
        }

        if op == ObjectOp::Map {
            // Replies rendezvous on the receiver task; requests queue.
            if let Ok(map) = cmd.decode(|b| ObjectMap::decode(b)) {
                if map.reply {
                    local.requests().serve(
                        map.request_id,
                        Reply::Map { result: map.result, version: map.version },
                    );
                    return true;
                }
            }
        }

        let store = self.clone();
        let handler: Handler = Arc::new(move |cmd| {
            let store = store.clone();
            Box::pin(async move {
                store.handle(cmd).await;
                true
            })
        });
        local.command_queue().push(handler, cmd);
        true
    }

    async fn handle(&self, cmd: Command) {
        let Some(op) = ObjectOp::from_u32(cmd.command()) else {
            return;
        };
        let result = match op {
            ObjectOp::Instance | ObjectOp::Delta | ObjectOp::SlaveDelta => {
                self.handle_data(op, &cmd)
            }
            ObjectOp::Map => self.handle_map_request(&cmd).await,
            ObjectOp::Unmap => self.handle_unmap(&cmd),
            ObjectOp::Commit => self.handle_commit(&cmd).await,
            ObjectOp::Push => self.handle_push(&cmd),
        };
        if let Err(e) = result {
            tracing::warn!(?cmd, error = %e, "object command failed");
        }
    }

    fn handle_data(&self, op: ObjectOp, cmd: &Command) -> Result<(), NodeError> {
        let data = cmd.decode(|b| ObjectData::decode(b))?;

        // Every observed instance burst feeds the cache, attached or not;
        // a later map replays it instead of re-fetching.
        if op == ObjectOp::Instance && self.inner.cache_enabled.load(Ordering::Relaxed) {
            let from = cmd.node().map(|n| n.id()).unwrap_or(NodeId::ZERO);
            self.inner
                .cache
                .lock()
                .unwrap()
                .feed(&data, from, cmd.swap());
        }

        let Some(entry) = self.entry(data.object_id) else {
            if op != ObjectOp::Instance {
                tracing::debug!(object = %data.object_id, "delta for unattached object dropped");
            }
            return Ok(());
        };

        let chunk = RawChunk {
            compressor: data.compressor,
            n_chunks: data.n_chunks,
            data_size: data.data_size,
            body: data.body.clone(),
        };

        let mut assembly = entry.inner.assembly.lock().unwrap();
        match assembly.current.as_mut() {
            None => {
                if data.sequence != 0 {
                    tracing::warn!(
                        object = %data.object_id,
                        version = %data.version,
                        sequence = data.sequence,
                        "burst does not start at sequence 0, dropping"
                    );
                    return Ok(());
                }
                assembly.current = Some(Partial {
                    version: data.version,
                    op,
                    next_seq: 0,
                    swap: cmd.swap(),
                    chunks: Vec::new(),
                });
            }
            Some(partial) => {
                if partial.version != data.version || partial.next_seq != data.sequence {
                    tracing::warn!(
                        object = %data.object_id,
                        expected = partial.next_seq,
                        got = data.sequence,
                        "burst sequence violation, dropping partial"
                    );
                    assembly.current = None;
                    return Ok(());
                }
            }
        }

        let partial = assembly.current.as_mut().unwrap();
        partial.chunks.push(chunk);
        partial.next_seq += 1;

        if data.last {
            let done = assembly.current.take().unwrap();
            assembly.ready.push_back(Ready {
                version: done.version,
                op: done.op,
                swap: done.swap,
                chunks: done.chunks,
            });
            drop(assembly);
            entry.bump_ready();
        }
        Ok(())
    }

    async fn handle_map_request(&self, cmd: &Command) -> Result<(), NodeError> {
        let map = cmd.decode(|b| ObjectMap::decode(b))?;
        let Some(peer) = cmd.node().cloned() else {
            return Ok(());
        };

        let reply = |result: MapResult, version: Version| {
            encode_object_packet(ObjectOp::Map, |b| {
                ObjectMap {
                    object_id: map.object_id,
                    version,
                    cached: Version::NONE,
                    request_id: map.request_id,
                    reply: true,
                    result: result as u32,
                }
                .encode(b)
            })
        };

        let entry = self
            .entry(map.object_id)
            .filter(|e| e.inner.role == Role::Master);
        let Some(entry) = entry else {
            peer.send(reply(MapResult::Unknown, Version::NONE)).await?;
            return Ok(());
        };

        let current = entry.version();
        let requested = map.version;
        let granted = if requested.is_head() || requested.is_none() || requested > current {
            current
        } else {
            requested
        };

        // Resolve the instance source before granting.
        let instance = if granted == current {
            None // serialized fresh below
        } else {
            let found = {
                let history = entry.inner.history.lock().unwrap();
                match history.iter().find(|h| h.version == granted) {
                    Some(h) => Ok(Some(h.instance.clone())),
                    None => Err(history
                        .front()
                        .map(|h| h.version)
                        .unwrap_or(current)),
                }
            };
            match found {
                Ok(instance) => instance,
                Err(oldest) => {
                    peer.send(reply(MapResult::VersionUnmappable, oldest)).await?;
                    return Ok(());
                }
            }
        };

        {
            let mut slaves = entry.inner.slaves.lock().unwrap();
            if !slaves.contains(&peer.id()) {
                slaves.push(peer.id());
            }
        }

        peer.send(reply(MapResult::Ok, granted)).await?;

        // Instance burst, skipped when the slave's cache already holds
        // it. NONE is the no-cache marker, never a skippable version.
        if map.cached.is_none() || map.cached != granted {
            let chunks = match instance {
                Some(chunks) => chunks,
                None => self.serialize_entry(&entry, granted, DIRTY_ALL)?,
            };
            send_burst(&peer, ObjectOp::Instance, map.object_id, granted, &chunks).await?;
        }

        // Catch-up deltas up to head, in version order.
        if granted < current {
            let mut deltas: Vec<(Version, Vec<RawChunk>)> = {
                let history = entry.inner.history.lock().unwrap();
                history
                    .iter()
                    .filter(|h| h.version > granted)
                    .map(|h| (h.version, h.delta.clone()))
                    .collect()
            };
            deltas.sort_by_key(|(v, _)| *v);
            for (version, chunks) in deltas {
                send_burst(&peer, ObjectOp::Delta, map.object_id, version, &chunks).await?;
            }
        }

        tracing::debug!(
            object = %map.object_id,
            peer = %peer.id(),
            granted = %granted,
            "slave mapped"
        );
        Ok(())
    }

    fn handle_unmap(&self, cmd: &Command) -> Result<(), NodeError> {
        let unmap = cmd.decode(|b| ObjectUnmap::decode(b))?;
        let Some(peer) = cmd.node() else {
            return Ok(());
        };
        if let Some(entry) = self.entry(unmap.object_id) {
            entry
                .inner
                .slaves
                .lock()
                .unwrap()
                .retain(|s| *s != peer.id());
            tracing::debug!(object = %unmap.object_id, peer = %peer.id(), "slave unmapped");
        }
        Ok(())
    }

    async fn handle_commit(&self, cmd: &Command) -> Result<(), NodeError> {
        let commit = cmd.decode(|b| ObjectCommit::decode(b))?;
        let local = self.local()?;
        let entry = self
            .entry(commit.object_id)
            .filter(|e| e.inner.role == Role::Master);
        let Some(entry) = entry else {
            local
                .requests()
                .serve(commit.request_id, Reply::Version(Version::NONE));
            return Ok(());
        };

        // Apply any slave deltas queued ahead of this commit first.
        loop {
            let burst = entry.inner.assembly.lock().unwrap().ready.pop_front();
            match burst {
                Some(burst) => {
                    if let Err(e) = apply_burst(&entry, burst) {
                        // Fail the waiting commit instead of leaving it
                        // to time out.
                        local
                            .requests()
                            .serve(commit.request_id, Reply::Version(Version::NONE));
                        return Err(e);
                    }
                }
                None => break,
            }
        }

        let new_version = entry.version().next();
        let dirty = entry.inner.obj.lock().unwrap().dirty_bits();
        let delta = self.serialize_entry(&entry, new_version, dirty)?;
        let instance = self.serialize_entry(&entry, new_version, DIRTY_ALL)?;
        entry.inner.obj.lock().unwrap().clear_dirty();

        {
            let mut history = entry.inner.history.lock().unwrap();
            history.push_back(HistoryEntry {
                version: new_version,
                instance,
                delta: delta.clone(),
            });
            while history.len() > self.inner.globals.commit_history {
                history.pop_front();
            }
        }
        *entry.inner.version.lock().unwrap() = new_version;

        let slaves = entry.inner.slaves.lock().unwrap().clone();
        for node_id in &slaves {
            match local.get_node(*node_id) {
                Some(peer) => {
                    if let Err(e) =
                        send_burst(&peer, ObjectOp::Delta, commit.object_id, new_version, &delta)
                            .await
                    {
                        tracing::warn!(peer = %node_id, error = %e, "delta burst failed");
                    }
                }
                None => {
                    // Slave's node went away; drop it from the list.
                    entry.inner.slaves.lock().unwrap().retain(|s| s != node_id);
                }
            }
        }

        tracing::debug!(
            object = %commit.object_id,
            version = %new_version,
            slaves = slaves.len(),
            "committed"
        );
        local
            .requests()
            .serve(commit.request_id, Reply::Version(new_version));
        Ok(())
    }

    fn handle_push(&self, cmd: &Command) -> Result<(), NodeError> {
        let push = cmd.decode(|b| ObjectPush::decode(b))?;
        let local = self.local()?;

        let mut body = BytesMut::with_capacity(8 + push.body.len());
        body.put_u64_le(push.body.len() as u64);
        body.put_slice(&push.body);
        let mut queue = QueuedChunks::new(Version::NONE);
        queue.push(RawChunk {
            compressor: trellis_protocol::packet::COMPRESSOR_NONE,
            n_chunks: 0,
            data_size: push.body.len() as u64,
            body: body.freeze(),
        });
        let istream = DataIStream::with_swap(Box::new(queue), cmd.swap());

        local.object_push(push.group, push.object_type, push.object_id, istream);
        Ok(())
    }

    // ------------------------------------------------------------------

    /// Serialize an entry's state into a burst of packed chunks.
    fn serialize_entry(
        &self,
        entry: &Entry,
        version: Version,
        dirty: u64,
    ) -> Result<Vec<RawChunk>, NodeError> {
        let (sink, chunks) = VecSink::new();
        let mut os = DataOStream::new();
        os.set_chunk_size(self.inner.globals.chunk_size);
        os.set_compressor(Some(Arc::new(ZstdCompressor::new())));
        let mut obj = entry.inner.obj.lock().unwrap();
        os.enable(Box::new(sink), version, obj.instance_size_hint());
        os.write(dirty);
        obj.serialize(&mut os, dirty);
        os.disable()?;
        drop(obj);
        let result = chunks.lock().unwrap().drain(..).map(RawChunk::from).collect();
        Ok(result)
    }
}

// ============================================================================
// Burst helpers
// ============================================================================

fn chunk_packet(
    op: ObjectOp,
    object_id: ObjectId,
    version: Version,
    sequence: u32,
    last: bool,
    chunk: &RawChunk,
) -> Bytes {
    encode_object_packet(op, |b| {
        ObjectData {
            object_id,
            version,
            sequence,
            last,
            compressor: chunk.compressor,
            n_chunks: chunk.n_chunks,
            data_size: chunk.data_size,
            body: chunk.body.clone(),
        }
        .encode(b)
    })
}

async fn send_burst(
    peer: &Peer,
    op: ObjectOp,
    object_id: ObjectId,
    version: Version,
    chunks: &[RawChunk],
) -> Result<(), NodeError> {
    for (i, chunk) in chunks.iter().enumerate() {
        let last = i + 1 == chunks.len();
        peer.send(chunk_packet(op, object_id, version, i as u32, last, chunk))
            .await?;
    }
    Ok(())
}

async fn send_burst_conn(
    conn: &crate::connection::Connection,
    op: ObjectOp,
    object_id: ObjectId,
    version: Version,
    chunks: &[RawChunk],
) -> Result<(), NodeError> {
    for (i, chunk) in chunks.iter().enumerate() {
        let last = i + 1 == chunks.len();
        conn.send(chunk_packet(op, object_id, version, i as u32, last, chunk))
            .await?;
    }
    Ok(())
}

async fn send_map_request(
    peer: &Peer,
    object_id: ObjectId,
    version: Version,
    cached: Version,
    request_id: u32,
) -> Result<(), NodeError> {
    let pkt = encode_object_packet(ObjectOp::Map, |b| {
        ObjectMap {
            object_id,
            version,
            cached,
            request_id,
            reply: false,
            result: MapResult::Ok as u32,
        }
        .encode(b)
    });
    peer.send(pkt).await
}

/// A burst carrying only a dirty mask (the REMOVED signal).
fn mask_only_burst(version: Version, mask: u64) -> Result<Vec<RawChunk>, NodeError> {
    let (sink, chunks) = VecSink::new();
    let mut os = DataOStream::new();
    os.enable(Box::new(sink), version, 64);
    os.write(mask);
    os.disable()?;
    let result = chunks.lock().unwrap().drain(..).map(RawChunk::from).collect();
    Ok(result)
}

/// Serialize without chunk framing: one contiguous blob (push payloads).
fn serialize_plain(obj: &SharedObject) -> Result<Bytes, NodeError> {
    let (sink, chunks) = VecSink::new();
    let mut os = DataOStream::new();
    os.set_chunk_size(usize::MAX / 2);
    let mut guard = obj.lock().unwrap();
    os.enable(Box::new(sink), Version::NONE, usize::MAX / 2);
    guard.serialize(&mut os, DIRTY_ALL);
    os.disable()?;
    drop(guard);

    let chunks = chunks.lock().unwrap();
    debug_assert_eq!(chunks.len(), 1);
    let chunk: &ChunkOut = &chunks[0];
    Ok(chunk.body.slice(8..))
}

fn apply_burst(entry: &Entry, burst: Ready) -> Result<(), NodeError> {
    let mut queue = QueuedChunks::new(burst.version);
    for chunk in burst.chunks {
        queue.push(chunk);
    }
    let mut is = DataIStream::with_swap(Box::new(queue), burst.swap);

    let dirty: u64 = is.read()?;
    if dirty & DIRTY_REMOVED != 0 {
        entry.inner.removed.store(true, Ordering::Relaxed);
        entry.bump_ready();
        return Ok(());
    }

    entry.inner.obj.lock().unwrap().deserialize(&mut is, dirty)?;
    match burst.op {
        ObjectOp::Instance | ObjectOp::Delta => {
            *entry.inner.version.lock().unwrap() = burst.version;
        }
        _ => {} // slave deltas do not advance the master version
    }
    Ok(())
}

#[cfg(test)]
impl ObjectStore {
    /// Test hook: pretend a map for `id` is in flight.
    pub(crate) fn test_mark_pending(&self, id: ObjectId) {
        self.inner.pending_maps.lock().unwrap().insert(id);
    }

    /// Test hook: attach a slave entry directly, resolving the pending map.
    pub(crate) fn test_attach_slave(&self, id: ObjectId, obj: SharedObject) {
        let entry = Entry::new(id, Role::Slave, obj);
        self.inner.entries.lock().unwrap().insert(id, entry);
        self.inner.pending_maps.lock().unwrap().remove(&id);
    }
}

// ============================================================================
// ObjectRef support
// ============================================================================

pub(crate) fn entry_version(store: &Arc<StoreInner>, id: ObjectId) -> Option<Version> {
    store.entries.lock().unwrap().get(&id).map(Entry::version)
}

pub(crate) fn entry_role(store: &Arc<StoreInner>, id: ObjectId) -> Option<Role> {
    store
        .entries
        .lock()
        .unwrap()
        .get(&id)
        .map(|e| e.inner.role)
}

pub(crate) fn entry_exists(store: &Arc<StoreInner>, id: ObjectId) -> bool {
    store.entries.lock().unwrap().contains_key(&id)
}

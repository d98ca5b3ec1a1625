//! Connections and the readiness-multiplexing connection set.
//!
//! A [`Connection`] is a point-to-point (or multicast) packet transport.
//! Sends are atomic: one `send` call is one contiguous logical write on
//! the receiver side. The [`ConnectionSet`] multiplexes any number of
//! connections and listeners into a single event stream consumed by the
//! local node's receiver task; each connection is pumped by a small task
//! that assembles size-prefixed packets into pooled buffers.
//!
//! Three transports: `tcpip` (stream socket), `pipe` (in-process duplex,
//! used for the self-loopback), `mcast` (in-process group bus standing in
//! for wire multicast, which stays behind this seam).

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Notify};

use trellis_protocol::{ConnectionDesc, ConnectionKind, PacketHeader, MAX_PACKET_BYTES};

use crate::buffer::{BufferCache, SharedBuffer};

pub type ConnId = u64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> ConnId {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

// ============================================================================
// In-process multicast bus
// ============================================================================

/// Per-group capacity of the multicast bus.
const BUS_CAPACITY: usize = 1024;

fn buses() -> &'static Mutex<HashMap<String, broadcast::Sender<(ConnId, Bytes)>>> {
    static BUSES: OnceLock<Mutex<HashMap<String, broadcast::Sender<(ConnId, Bytes)>>>> =
        OnceLock::new();
    BUSES.get_or_init(|| Mutex::new(HashMap::new()))
}

fn join_bus(group: &str) -> (broadcast::Sender<(ConnId, Bytes)>, broadcast::Receiver<(ConnId, Bytes)>) {
    let mut buses = buses().lock().unwrap();
    let tx = buses
        .entry(group.to_string())
        .or_insert_with(|| broadcast::channel(BUS_CAPACITY).0)
        .clone();
    let rx = tx.subscribe();
    (tx, rx)
}

// ============================================================================
// Connection
// ============================================================================

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

enum ConnIo {
    Stream {
        reader: Mutex<Option<BoxedReader>>,
        writer: tokio::sync::Mutex<BoxedWriter>,
    },
    Mcast {
        tx: broadcast::Sender<(ConnId, Bytes)>,
        rx: Mutex<Option<broadcast::Receiver<(ConnId, Bytes)>>>,
    },
    /// Receive-only demultiplexed view of one remote writer on a group.
    McastChild {
        rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    },
}

struct ConnInner {
    id: ConnId,
    desc: ConnectionDesc,
    connected: AtomicBool,
    closed: Notify,
}

/// A cloneable handle to one transport edge.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
    io: Arc<ConnIo>,
}

impl Connection {
    fn new(desc: ConnectionDesc, io: ConnIo) -> Self {
        Self {
            inner: Arc::new(ConnInner {
                id: next_id(),
                desc,
                connected: AtomicBool::new(true),
                closed: Notify::new(),
            }),
            io: Arc::new(io),
        }
    }

    fn from_stream<R, W>(desc: ConnectionDesc, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(
            desc,
            ConnIo::Stream {
                reader: Mutex::new(Some(Box::new(reader))),
                writer: tokio::sync::Mutex::new(Box::new(writer)),
            },
        )
    }

    /// Dial a point-to-point description. Multicast is joined, not dialled.
    pub async fn dial(desc: &ConnectionDesc) -> io::Result<Connection> {
        match desc.kind {
            ConnectionKind::Tcp => {
                let stream = TcpStream::connect(desc.socket_addr()).await?;
                stream.set_nodelay(true).ok();
                let (r, w) = stream.into_split();
                Ok(Connection::from_stream(desc.clone(), r, w))
            }
            ConnectionKind::Multicast => Ok(Connection::multicast(desc)),
            ConnectionKind::Pipe => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "pipe connections are created in pairs",
            )),
        }
    }

    /// Join a multicast group.
    pub fn multicast(desc: &ConnectionDesc) -> Connection {
        let (tx, rx) = join_bus(&desc.group);
        Connection::new(
            desc.clone(),
            ConnIo::Mcast { tx, rx: Mutex::new(Some(rx)) },
        )
    }

    fn mcast_child(desc: ConnectionDesc, rx: mpsc::UnboundedReceiver<Bytes>) -> Connection {
        Connection::new(desc, ConnIo::McastChild { rx: Mutex::new(Some(rx)) })
    }

    fn take_mcast_rx(&self) -> Option<broadcast::Receiver<(ConnId, Bytes)>> {
        match &*self.io {
            ConnIo::Mcast { rx, .. } => rx.lock().unwrap().take(),
            _ => None,
        }
    }

    /// Create a connected in-process pipe pair (the self-loopback).
    pub fn pipe_pair() -> (Connection, Connection) {
        let (a, b) = tokio::io::duplex(MAX_PACKET_BYTES.min(1 << 20));
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            Connection::from_stream(ConnectionDesc::pipe(), ar, aw),
            Connection::from_stream(ConnectionDesc::pipe(), br, bw),
        )
    }

    pub fn id(&self) -> ConnId {
        self.inner.id
    }

    pub fn desc(&self) -> &ConnectionDesc {
        &self.inner.desc
    }

    pub fn is_multicast(&self) -> bool {
        self.inner.desc.is_multicast()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Send one packet. Atomic per call: the write mutex serialises whole
    /// packets, so a logical write never interleaves on the wire.
    pub async fn send(&self, packet: Bytes) -> io::Result<()> {
        if !self.is_connected() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        }
        match &*self.io {
            ConnIo::Stream { writer, .. } => {
                let mut writer = writer.lock().await;
                writer.write_all(&packet).await?;
                writer.flush().await
            }
            ConnIo::Mcast { tx, .. } => {
                // No receivers on the group yet is not an error.
                let _ = tx.send((self.id(), packet));
                Ok(())
            }
            ConnIo::McastChild { .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "multicast reader connections cannot send",
            )),
        }
    }

    /// Close locally: the pump exits without raising a disconnect event.
    pub fn close(&self) {
        self.inner.connected.store(false, Ordering::Release);
        // notify_one stores a permit, so a close racing the pump's first
        // poll is not lost.
        self.inner.closed.notify_one();
    }

    async fn closed(&self) {
        self.inner.closed.notified().await
    }

    /// Receive the next complete packet into a pooled buffer.
    /// `Ok(None)` means the peer closed cleanly.
    async fn recv_packet(&self, cache: &BufferCache) -> Result<Option<SharedBuffer>, RecvError> {
        match &*self.io {
            ConnIo::Stream { reader, .. } => {
                // The pump is the only reader; take it once and hold it.
                let mut guard = reader.lock().unwrap().take();
                let result = match guard.as_mut() {
                    Some(r) => read_framed(r, cache).await,
                    None => Err(RecvError::Fatal(io::Error::new(
                        io::ErrorKind::Other,
                        "reader already taken",
                    ))),
                };
                if let Some(r) = guard {
                    *reader.lock().unwrap() = Some(r);
                }
                result
            }
            ConnIo::Mcast { rx, .. } => {
                let mut guard = rx.lock().unwrap().take();
                let result = match guard.as_mut() {
                    Some(rx) => self.recv_mcast(rx, cache).await,
                    None => Err(RecvError::Fatal(io::Error::new(
                        io::ErrorKind::Other,
                        "receiver already taken",
                    ))),
                };
                if let Some(r) = guard {
                    *rx.lock().unwrap() = Some(r);
                }
                result
            }
            ConnIo::McastChild { rx } => {
                let mut guard = rx.lock().unwrap().take();
                let result = match guard.as_mut() {
                    Some(rx) => match rx.recv().await {
                        Some(bytes) => {
                            let mut buf = cache.alloc(bytes.len());
                            buf.as_mut_slice().copy_from_slice(&bytes);
                            Ok(Some(Arc::new(buf)))
                        }
                        None => Ok(None),
                    },
                    None => Err(RecvError::Fatal(io::Error::new(
                        io::ErrorKind::Other,
                        "receiver already taken",
                    ))),
                };
                if let Some(r) = guard {
                    *rx.lock().unwrap() = Some(r);
                }
                result
            }
        }
    }

    async fn recv_mcast(
        &self,
        rx: &mut broadcast::Receiver<(ConnId, Bytes)>,
        cache: &BufferCache,
    ) -> Result<Option<SharedBuffer>, RecvError> {
        loop {
            match rx.recv().await {
                Ok((src, bytes)) => {
                    if src == self.id() {
                        continue; // no loopback of our own datagrams
                    }
                    let mut buf = cache.alloc(bytes.len());
                    buf.as_mut_slice().copy_from_slice(&bytes);
                    return Ok(Some(Arc::new(buf)));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Err(RecvError::Transient(format!("multicast lagged by {n}")));
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

enum RecvError {
    /// Transient fault; the connection stays up.
    Transient(String),
    /// The connection is unusable.
    Fatal(io::Error),
}

async fn read_framed(
    reader: &mut BoxedReader,
    cache: &BufferCache,
) -> Result<Option<SharedBuffer>, RecvError> {
    let mut head = [0u8; 8];
    match reader.read_exact(&mut head).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(RecvError::Fatal(e)),
    }

    let size = LittleEndian::read_u64(&head);
    if size < PacketHeader::LEN as u64 || size > MAX_PACKET_BYTES as u64 {
        return Err(RecvError::Fatal(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad packet size {size}"),
        )));
    }

    let mut buf = cache.alloc(size as usize);
    buf.as_mut_slice()[..8].copy_from_slice(&head);
    reader
        .read_exact(&mut buf.as_mut_slice()[8..])
        .await
        .map_err(RecvError::Fatal)?;
    Ok(Some(Arc::new(buf)))
}

// ============================================================================
// Listener
// ============================================================================

struct ListenerInner {
    desc: ConnectionDesc,
    tcp: Mutex<Option<TcpListener>>,
    closed: Notify,
    active: AtomicBool,
}

/// A listening connection producing accepted connections.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    /// Bind a listener; the returned description carries the actual port
    /// (relevant when binding port 0).
    pub async fn bind(desc: &ConnectionDesc) -> io::Result<Listener> {
        match desc.kind {
            ConnectionKind::Tcp => {
                let tcp = TcpListener::bind(desc.socket_addr()).await?;
                let mut bound = desc.clone();
                bound.port = tcp.local_addr()?.port();
                Ok(Listener {
                    inner: Arc::new(ListenerInner {
                        desc: bound,
                        tcp: Mutex::new(Some(tcp)),
                        closed: Notify::new(),
                        active: AtomicBool::new(true),
                    }),
                })
            }
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "only tcpip descriptions bind listeners",
            )),
        }
    }

    pub fn desc(&self) -> &ConnectionDesc {
        &self.inner.desc
    }

    pub fn close(&self) {
        self.inner.active.store(false, Ordering::Release);
        self.inner.closed.notify_one();
    }
}

// ============================================================================
// ConnectionSet
// ============================================================================

/// One readiness event out of `select`.
pub enum SetEvent {
    /// A listener accepted a new connection.
    Connect { conn: Connection },
    /// A complete packet arrived.
    Data { conn: Connection, buffer: SharedBuffer },
    /// The peer closed or the connection failed hard.
    Disconnect { conn: Connection },
    /// Transient connection fault.
    ConnError { conn: Connection },
    /// The event channel itself failed.
    SelectError,
    /// `interrupt()` was called; delivered once.
    Interrupt,
    Timeout,
}

struct SetShared {
    tx: mpsc::UnboundedSender<SetEvent>,
    interrupt: AtomicBool,
    interrupt_notify: Notify,
    cache: BufferCache,
    count: AtomicUsize,
}

/// Thread-safe handle for mutating the set (add/remove/interrupt).
#[derive(Clone)]
pub struct ConnectionSet {
    shared: Arc<SetShared>,
}

/// Receiver-owned end yielding multiplexed events.
pub struct SetEvents {
    rx: mpsc::UnboundedReceiver<SetEvent>,
    shared: Arc<SetShared>,
}

impl ConnectionSet {
    pub fn new(cache: BufferCache) -> (ConnectionSet, SetEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SetShared {
            tx,
            interrupt: AtomicBool::new(false),
            interrupt_notify: Notify::new(),
            cache,
            count: AtomicUsize::new(0),
        });
        (
            ConnectionSet { shared: shared.clone() },
            SetEvents { rx, shared },
        )
    }

    /// Add a connection and start its pump task.
    pub fn add_connection(&self, conn: Connection) {
        let shared = self.shared.clone();
        shared.count.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            loop {
                if !conn.is_connected() {
                    break; // closed before or between polls
                }
                tokio::select! {
                    biased;
                    _ = conn.closed() => break, // removed locally: silent
                    result = conn.recv_packet(&shared.cache) => match result {
                        Ok(Some(buffer)) => {
                            if shared.tx.send(SetEvent::Data { conn: conn.clone(), buffer }).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            let _ = shared.tx.send(SetEvent::Disconnect { conn: conn.clone() });
                            break;
                        }
                        Err(RecvError::Transient(reason)) => {
                            tracing::debug!(conn = conn.id(), reason, "transient connection fault");
                            let _ = shared.tx.send(SetEvent::ConnError { conn: conn.clone() });
                        }
                        Err(RecvError::Fatal(e)) => {
                            tracing::debug!(conn = conn.id(), error = %e, "connection failed");
                            let _ = shared.tx.send(SetEvent::ConnError { conn: conn.clone() });
                            let _ = shared.tx.send(SetEvent::Disconnect { conn: conn.clone() });
                            break;
                        }
                    }
                }
            }
            shared.count.fetch_sub(1, Ordering::Relaxed);
        });
    }

    /// Close and remove a connection without raising a disconnect event.
    pub fn remove_connection(&self, conn: &Connection) {
        conn.close();
    }

    /// Force a disconnect: close the connection and raise the Disconnect
    /// event so the receiver runs the full teardown. Used when a peer
    /// sends data the stream layer rejects as fatal.
    pub fn fail_connection(&self, conn: &Connection) {
        let _ = self.shared.tx.send(SetEvent::Disconnect { conn: conn.clone() });
        conn.close();
    }

    /// Add a joined multicast connection. Remote writers on the group are
    /// demultiplexed into per-sender reader connections delivered as
    /// Connect events, mirroring accept semantics; the first packet a
    /// writer sends on a fresh group is its ID announcement.
    pub fn add_multicast(&self, conn: Connection) {
        let shared = self.shared.clone();
        shared.count.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let mut rx = match conn.take_mcast_rx() {
                Some(rx) => rx,
                None => {
                    shared.count.fetch_sub(1, Ordering::Relaxed);
                    return;
                }
            };
            let mut children: HashMap<ConnId, mpsc::UnboundedSender<Bytes>> = HashMap::new();
            loop {
                if !conn.is_connected() {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = conn.closed() => break,
                    msg = rx.recv() => match msg {
                        Ok((src, bytes)) => {
                            if src == conn.id() {
                                continue; // no loopback of our own datagrams
                            }
                            let tx = children.entry(src).or_insert_with(|| {
                                let (tx, child_rx) = mpsc::unbounded_channel();
                                let child = Connection::mcast_child(conn.desc().clone(), child_rx);
                                tracing::debug!(
                                    group = %conn.desc().group,
                                    child = child.id(),
                                    "new multicast writer"
                                );
                                let _ = shared.tx.send(SetEvent::Connect { conn: child });
                                tx
                            });
                            if tx.send(bytes).is_err() {
                                children.remove(&src);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(group = %conn.desc().group, lag = n, "multicast lagged");
                            let _ = shared.tx.send(SetEvent::ConnError { conn: conn.clone() });
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            shared.count.fetch_sub(1, Ordering::Relaxed);
        });
    }

    /// Add a listener and start its accept pump.
    pub fn add_listener(&self, listener: Listener) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let tcp = match listener.inner.tcp.lock().unwrap().take() {
                Some(tcp) => tcp,
                None => return,
            };
            loop {
                if !listener.inner.active.load(Ordering::Acquire) {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = listener.inner.closed.notified() => break,
                    accepted = tcp.accept() => match accepted {
                        Ok((stream, peer)) => {
                            stream.set_nodelay(true).ok();
                            let (r, w) = stream.into_split();
                            let desc = ConnectionDesc::tcp(peer.ip().to_string(), peer.port());
                            let conn = Connection::from_stream(desc, r, w);
                            if shared.tx.send(SetEvent::Connect { conn }).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            let _ = shared.tx.send(SetEvent::SelectError);
                        }
                    }
                }
            }
        });
    }

    /// Unblock a pending `select`, delivering one Interrupt event.
    pub fn interrupt(&self) {
        self.shared.interrupt.store(true, Ordering::Release);
        self.shared.interrupt_notify.notify_waiters();
    }

    /// Connections currently pumped.
    pub fn size(&self) -> usize {
        self.shared.count.load(Ordering::Relaxed)
    }
}

impl SetEvents {
    /// Wait for the next event, at most `timeout`.
    pub async fn select(&mut self, timeout: Duration) -> SetEvent {
        if self.shared.interrupt.swap(false, Ordering::AcqRel) {
            return SetEvent::Interrupt;
        }
        tokio::select! {
            biased;
            _ = self.shared.interrupt_notify.notified() => {
                self.shared.interrupt.store(false, Ordering::Release);
                SetEvent::Interrupt
            }
            event = self.rx.recv() => event.unwrap_or(SetEvent::SelectError),
            _ = tokio::time::sleep(timeout) => SetEvent::Timeout,
        }
    }
}

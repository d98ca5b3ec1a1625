//! Packet type and opcode tables plus payload encode/decode.
//!
//! Payload integers are written little-endian. Object data bodies carry a
//! mirrored 8-byte uncompressed-size prefix for integrity checking.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{NodeId, ObjectId, ProtocolError, Version};

/// Top-level packet type.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Node = 1,
    Object = 2,
}

impl PacketType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(PacketType::Node),
            2 => Some(PacketType::Object),
            _ => None,
        }
    }
}

/// Node-level opcodes (low range).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeOp {
    AckRequest = 0,
    StopRcv = 1,
    StopCmd = 2,
    SetAffinityRcv = 3,
    SetAffinityCmd = 4,
    Connect = 5,
    ConnectReply = 6,
    ConnectAck = 7,
    Id = 8,
    Disconnect = 9,
    GetNodeData = 10,
    GetNodeDataReply = 11,
    AcquireSendToken = 12,
    AcquireSendTokenReply = 13,
    ReleaseSendToken = 14,
    AddListener = 15,
    RemoveListener = 16,
    Ping = 17,
    PingReply = 18,
}

impl NodeOp {
    pub fn from_u32(v: u32) -> Option<Self> {
        use NodeOp::*;
        match v {
            0 => Some(AckRequest),
            1 => Some(StopRcv),
            2 => Some(StopCmd),
            3 => Some(SetAffinityRcv),
            4 => Some(SetAffinityCmd),
            5 => Some(Connect),
            6 => Some(ConnectReply),
            7 => Some(ConnectAck),
            8 => Some(Id),
            9 => Some(Disconnect),
            10 => Some(GetNodeData),
            11 => Some(GetNodeDataReply),
            12 => Some(AcquireSendToken),
            13 => Some(AcquireSendTokenReply),
            14 => Some(ReleaseSendToken),
            15 => Some(AddListener),
            16 => Some(RemoveListener),
            17 => Some(Ping),
            18 => Some(PingReply),
            _ => None,
        }
    }
}

/// Object-level opcodes.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectOp {
    Instance = 0,
    Delta = 1,
    SlaveDelta = 2,
    Commit = 3,
    Map = 4,
    Unmap = 5,
    Push = 6,
}

impl ObjectOp {
    pub fn from_u32(v: u32) -> Option<Self> {
        use ObjectOp::*;
        match v {
            0 => Some(Instance),
            1 => Some(Delta),
            2 => Some(SlaveDelta),
            3 => Some(Commit),
            4 => Some(Map),
            5 => Some(Unmap),
            6 => Some(Push),
            _ => None,
        }
    }

    /// Opcodes whose payload is an [`ObjectData`] chunk.
    pub fn carries_data(&self) -> bool {
        matches!(self, ObjectOp::Instance | ObjectOp::Delta | ObjectOp::SlaveDelta)
    }
}

/// Fixed packet prefix: total size (including these 16 bytes), type, command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub size: u64,
    pub ptype: u32,
    pub command: u32,
}

impl PacketHeader {
    pub const LEN: usize = 16;

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        if buf.remaining() < Self::LEN {
            return Err(ProtocolError::Truncated("packet header"));
        }
        Ok(PacketHeader {
            size: buf.get_u64_le(),
            ptype: buf.get_u32_le(),
            command: buf.get_u32_le(),
        })
    }
}

/// Build a complete framed packet; the closure writes the payload.
pub fn encode_packet(
    ptype: PacketType,
    command: u32,
    payload: impl FnOnce(&mut BytesMut),
) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u64_le(0); // size backfilled below
    buf.put_u32_le(ptype as u32);
    buf.put_u32_le(command);
    payload(&mut buf);
    let size = buf.len() as u64;
    buf[0..8].copy_from_slice(&size.to_le_bytes());
    buf.freeze()
}

pub fn encode_node_packet(op: NodeOp, payload: impl FnOnce(&mut BytesMut)) -> Bytes {
    encode_packet(PacketType::Node, op as u32, payload)
}

pub fn encode_object_packet(op: ObjectOp, payload: impl FnOnce(&mut BytesMut)) -> Bytes {
    encode_packet(PacketType::Object, op as u32, payload)
}

// ============================================================================
// Field helpers
// ============================================================================

pub fn put_id(buf: &mut BytesMut, id: u128) {
    buf.put_u64_le((id >> 64) as u64);
    buf.put_u64_le(id as u64);
}

pub fn get_id(buf: &mut impl Buf, what: &'static str) -> Result<u128, ProtocolError> {
    if buf.remaining() < 16 {
        return Err(ProtocolError::Truncated(what));
    }
    let hi = buf.get_u64_le();
    let lo = buf.get_u64_le();
    Ok(((hi as u128) << 64) | lo as u128)
}

pub fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

pub fn get_str(buf: &mut impl Buf, what: &'static str) -> Result<String, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Truncated(what));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated(what));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| ProtocolError::Truncated(what))
}

fn get_u32(buf: &mut impl Buf, what: &'static str) -> Result<u32, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Truncated(what));
    }
    Ok(buf.get_u32_le())
}

fn get_u64(buf: &mut impl Buf, what: &'static str) -> Result<u64, ProtocolError> {
    if buf.remaining() < 8 {
        return Err(ProtocolError::Truncated(what));
    }
    Ok(buf.get_u64_le())
}

// ============================================================================
// Node command payloads
// ============================================================================

/// CONNECT -- first packet of the three-way handshake. The magic is written
/// native-endian on purpose; a byte-swapped magic tells the receiver to
/// enable endian swap for this peer's streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub magic: u32,
    pub node_id: NodeId,
    pub node_type: u32,
    pub request_id: u32,
    pub descs: String,
}

impl Connect {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_ne(self.magic); // native order on purpose: swap detector
        put_id(buf, self.node_id.0);
        buf.put_u32_le(self.node_type);
        buf.put_u32_le(self.request_id);
        put_str(buf, &self.descs);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        if buf.remaining() < 4 {
            return Err(ProtocolError::Truncated("connect"));
        }
        let magic = buf.get_u32_ne();
        Ok(Connect {
            magic,
            node_id: NodeId(get_id(buf, "connect")?),
            node_type: get_u32(buf, "connect")?,
            request_id: get_u32(buf, "connect")?,
            descs: get_str(buf, "connect")?,
        })
    }
}

/// CONNECT_REPLY -- node_id zero means "refused" (simultaneous connect).
/// Carries the native-order magic like CONNECT so the initiator learns
/// the acceptor's endianness symmetrically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReply {
    pub magic: u32,
    pub node_id: NodeId,
    pub node_type: u32,
    pub request_id: u32,
    pub descs: String,
}

impl ConnectReply {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_ne(self.magic);
        put_id(buf, self.node_id.0);
        buf.put_u32_le(self.node_type);
        buf.put_u32_le(self.request_id);
        put_str(buf, &self.descs);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        if buf.remaining() < 4 {
            return Err(ProtocolError::Truncated("connect_reply"));
        }
        let magic = buf.get_u32_ne();
        Ok(ConnectReply {
            magic,
            node_id: NodeId(get_id(buf, "connect_reply")?),
            node_type: get_u32(buf, "connect_reply")?,
            request_id: get_u32(buf, "connect_reply")?,
            descs: get_str(buf, "connect_reply")?,
        })
    }
}

/// ID -- announces the sender on a multicast connection on first use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdAnnounce {
    pub node_id: NodeId,
    pub node_type: u32,
    pub descs: String,
}

impl IdAnnounce {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_id(buf, self.node_id.0);
        buf.put_u32_le(self.node_type);
        put_str(buf, &self.descs);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        Ok(IdAnnounce {
            node_id: NodeId(get_id(buf, "id")?),
            node_type: get_u32(buf, "id")?,
            descs: get_str(buf, "id")?,
        })
    }
}

/// Payload of ACK_REQUEST, DISCONNECT, ACQUIRE_SEND_TOKEN and its reply:
/// a bare request id rendezvousing with the one-shot request table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRef {
    pub request_id: u32,
}

impl RequestRef {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.request_id);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        Ok(RequestRef { request_id: get_u32(buf, "request_ref")? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetNodeData {
    pub node_id: NodeId,
    pub request_id: u32,
}

impl GetNodeData {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_id(buf, self.node_id.0);
        buf.put_u32_le(self.request_id);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        Ok(GetNodeData {
            node_id: NodeId(get_id(buf, "get_node_data")?),
            request_id: get_u32(buf, "get_node_data")?,
        })
    }
}

/// Reply to GET_NODE_DATA. `node_type == NODETYPE_INVALID` means the peer
/// does not know the requested node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetNodeDataReply {
    pub node_id: NodeId,
    pub node_type: u32,
    pub request_id: u32,
    pub descs: String,
}

impl GetNodeDataReply {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_id(buf, self.node_id.0);
        buf.put_u32_le(self.node_type);
        buf.put_u32_le(self.request_id);
        put_str(buf, &self.descs);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        Ok(GetNodeDataReply {
            node_id: NodeId(get_id(buf, "get_node_data_reply")?),
            node_type: get_u32(buf, "get_node_data_reply")?,
            request_id: get_u32(buf, "get_node_data_reply")?,
            descs: get_str(buf, "get_node_data_reply")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddListener {
    pub desc: String,
}

impl AddListener {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, &self.desc);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        Ok(AddListener { desc: get_str(buf, "add_listener")? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveListener {
    pub request_id: u32,
    pub desc: String,
}

impl RemoveListener {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.request_id);
        put_str(buf, &self.desc);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        Ok(RemoveListener {
            request_id: get_u32(buf, "remove_listener")?,
            desc: get_str(buf, "remove_listener")?,
        })
    }
}

/// SET_AFFINITY_RCV / SET_AFFINITY_CMD payload. Scheduling hint only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Affinity {
    pub core: i32,
}

impl Affinity {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.core);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        if buf.remaining() < 4 {
            return Err(ProtocolError::Truncated("affinity"));
        }
        Ok(Affinity { core: buf.get_i32_le() })
    }
}

// ============================================================================
// Object command payloads
// ============================================================================

/// Compressor id for "uncompressed".
pub const COMPRESSOR_NONE: u32 = 0;

/// One chunk of an object instance/delta burst.
///
/// `body` is the chunk body as it appears on the wire: an 8-byte mirror of
/// the uncompressed size followed by `data_size` raw bytes (compressor
/// NONE) or `n_chunks` compressed sub-chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectData {
    pub object_id: ObjectId,
    pub version: Version,
    pub sequence: u32,
    pub last: bool,
    pub compressor: u32,
    pub n_chunks: u32,
    pub data_size: u64,
    pub body: Bytes,
}

impl ObjectData {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_id(buf, self.object_id.0);
        put_id(buf, self.version.0);
        buf.put_u32_le(self.sequence);
        buf.put_u32_le(self.last as u32);
        buf.put_u32_le(self.compressor);
        buf.put_u32_le(self.n_chunks);
        buf.put_u64_le(self.data_size);
        buf.put_slice(&self.body);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        let object_id = ObjectId(get_id(buf, "object_data")?);
        let version = Version(get_id(buf, "object_data")?);
        let sequence = get_u32(buf, "object_data")?;
        let last = get_u32(buf, "object_data")? != 0;
        let compressor = get_u32(buf, "object_data")?;
        let n_chunks = get_u32(buf, "object_data")?;
        let data_size = get_u64(buf, "object_data")?;
        let body = buf.copy_to_bytes(buf.remaining());
        Ok(ObjectData {
            object_id,
            version,
            sequence,
            last,
            compressor,
            n_chunks,
            data_size,
            body,
        })
    }
}

/// Outcome of a map request, carried in the OBJECT_MAP reply.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapResult {
    Ok = 0,
    /// The receiving node is not the master of this object.
    Unknown = 1,
    /// Requested version older than the oldest retained instance.
    VersionUnmappable = 2,
}

impl MapResult {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(MapResult::Ok),
            1 => Some(MapResult::Unknown),
            2 => Some(MapResult::VersionUnmappable),
            _ => None,
        }
    }
}

/// OBJECT_MAP -- request (slave → master) and reply (master → slave) share
/// one payload; `reply` distinguishes direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMap {
    pub object_id: ObjectId,
    /// Requested version on the way out, granted version on the way back.
    pub version: Version,
    /// Newest version the slave already holds from the instance cache;
    /// NONE when mapping cold.
    pub cached: Version,
    pub request_id: u32,
    pub reply: bool,
    pub result: u32,
}

impl ObjectMap {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_id(buf, self.object_id.0);
        put_id(buf, self.version.0);
        put_id(buf, self.cached.0);
        buf.put_u32_le(self.request_id);
        buf.put_u32_le(self.reply as u32);
        buf.put_u32_le(self.result);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        Ok(ObjectMap {
            object_id: ObjectId(get_id(buf, "object_map")?),
            version: Version(get_id(buf, "object_map")?),
            cached: Version(get_id(buf, "object_map")?),
            request_id: get_u32(buf, "object_map")?,
            reply: get_u32(buf, "object_map")? != 0,
            result: get_u32(buf, "object_map")?,
        })
    }
}

/// OBJECT_UNMAP -- slave detaches from its master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectUnmap {
    pub object_id: ObjectId,
}

impl ObjectUnmap {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_id(buf, self.object_id.0);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        Ok(ObjectUnmap { object_id: ObjectId(get_id(buf, "object_unmap")?) })
    }
}

/// OBJECT_COMMIT -- local self-command serializing a commit onto the
/// object's queue, keeping it ordered with inbound deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectCommit {
    pub object_id: ObjectId,
    pub request_id: u32,
}

impl ObjectCommit {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_id(buf, self.object_id.0);
        buf.put_u32_le(self.request_id);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        Ok(ObjectCommit {
            object_id: ObjectId(get_id(buf, "object_commit")?),
            request_id: get_u32(buf, "object_commit")?,
        })
    }
}

/// OBJECT_PUSH -- unsolicited typed instance data routed to a registered
/// push handler by (group, type).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPush {
    pub group: u128,
    pub object_type: u128,
    pub object_id: ObjectId,
    pub body: Bytes,
}

impl ObjectPush {
    pub fn encode(&self, buf: &mut BytesMut) {
        put_id(buf, self.group);
        put_id(buf, self.object_type);
        put_id(buf, self.object_id.0);
        buf.put_u64_le(self.body.len() as u64);
        buf.put_slice(&self.body);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        let group = get_id(buf, "object_push")?;
        let object_type = get_id(buf, "object_push")?;
        let object_id = ObjectId(get_id(buf, "object_push")?);
        let len = get_u64(buf, "object_push")? as usize;
        if buf.remaining() < len {
            return Err(ProtocolError::Truncated("object_push"));
        }
        let body = buf.copy_to_bytes(len);
        Ok(ObjectPush { group, object_type, object_id, body })
    }
}

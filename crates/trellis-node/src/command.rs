//! Commands -- typed views over received packet buffers.
//!
//! A [`Command`] borrows a shared pooled buffer plus dispatch context (the
//! sending peer and the connection it arrived on). Cloning a command bumps
//! the buffer refcount without copying bytes.

use std::sync::Arc;

use trellis_protocol::{ObjectData, PacketHeader, PacketType, ProtocolError};
use trellis_stream::{DataIStream, QueuedChunks, RawChunk};

use crate::buffer::{is_free, BufferCache, SharedBuffer};
use crate::connection::Connection;
use crate::node::Peer;

#[derive(Clone)]
pub struct Command {
    buffer: SharedBuffer,
    header: PacketHeader,
    /// Dispatch override, set when a handler re-tags a command for a
    /// second dispatch (STOP_RCV forwards itself as STOP_CMD).
    command_override: Option<u32>,
    node: Option<Peer>,
    conn: Option<Connection>,
}

impl Command {
    pub fn new(
        buffer: SharedBuffer,
        node: Option<Peer>,
        conn: Option<Connection>,
    ) -> Result<Self, ProtocolError> {
        let mut slice = &buffer[..];
        let header = PacketHeader::decode(&mut slice)?;
        if header.size != buffer.len() as u64 {
            return Err(ProtocolError::PacketTooShort { size: header.size });
        }
        PacketType::from_u32(header.ptype).ok_or(ProtocolError::UnknownType(header.ptype))?;
        Ok(Command { buffer, header, command_override: None, node, conn })
    }

    pub fn ptype(&self) -> PacketType {
        // Validated in new()
        PacketType::from_u32(self.header.ptype).unwrap()
    }

    pub fn command(&self) -> u32 {
        self.command_override.unwrap_or(self.header.command)
    }

    pub fn size(&self) -> u64 {
        self.header.size
    }

    /// Re-tag for a second dispatch round.
    pub fn retag(&mut self, command: u32) {
        self.command_override = Some(command);
    }

    /// The sending peer; absent for pre-handshake packets.
    pub fn node(&self) -> Option<&Peer> {
        self.node.as_ref()
    }

    /// The connection the packet arrived on.
    pub fn connection(&self) -> Option<&Connection> {
        self.conn.as_ref()
    }

    /// Endian swap negotiated with the sending peer.
    pub fn swap(&self) -> bool {
        self.node.as_ref().map(|n| n.swap()).unwrap_or(false)
    }

    /// Payload bytes after the fixed header.
    pub fn payload(&self) -> &[u8] {
        &self.buffer[PacketHeader::LEN..]
    }

    /// Decode the payload with one of the packet-struct decoders.
    pub fn decode<T, F>(&self, decode: F) -> Result<T, ProtocolError>
    where
        F: for<'a> FnOnce(&mut &'a [u8]) -> Result<T, ProtocolError>,
    {
        let mut slice = self.payload();
        decode(&mut slice)
    }

    /// View an object-data payload as a one-chunk input stream.
    pub fn data_istream(&self) -> Result<DataIStream, ProtocolError> {
        let data = self.decode(|b| ObjectData::decode(b))?;
        let mut queue = QueuedChunks::new(data.version);
        queue.push(RawChunk {
            compressor: data.compressor,
            n_chunks: data.n_chunks,
            data_size: data.data_size,
            body: data.body,
        });
        Ok(DataIStream::with_swap(Box::new(queue), self.swap()))
    }

    /// Refcount-1 debugging invariant: no other logical use outstanding.
    pub fn is_free(&self) -> bool {
        is_free(&self.buffer)
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("type", &self.header.ptype)
            .field("command", &self.command())
            .field("size", &self.header.size)
            .field("node", &self.node.as_ref().map(|n| n.id()))
            .finish()
    }
}

/// Command allocator over the pooled buffer cache.
#[derive(Clone)]
pub struct CommandCache {
    buffers: BufferCache,
}

impl CommandCache {
    pub fn new(buffers: BufferCache) -> Self {
        Self { buffers }
    }

    /// Wrap a received packet buffer.
    pub fn wrap(
        &self,
        buffer: SharedBuffer,
        node: Option<Peer>,
        conn: Option<Connection>,
    ) -> Result<Command, ProtocolError> {
        Command::new(buffer, node, conn)
    }

    /// Build a command from raw packet bytes (self-addressed commands).
    pub fn from_bytes(&self, packet: &[u8], node: Option<Peer>) -> Result<Command, ProtocolError> {
        let mut buffer = self.buffers.alloc(packet.len());
        buffer.as_mut_slice().copy_from_slice(packet);
        Command::new(Arc::new(buffer), node, None)
    }

    /// Return pooled storage to the allocator's cache.
    pub fn flush(&self) {
        self.buffers.flush();
    }
}

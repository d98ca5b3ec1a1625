//! DataOStream -- buffered, chunked binary encoder.
//!
//! State machine: *disabled* (writes illegal) → *buffered* (writes append,
//! first flush once the instance-size hint is reached) → *streaming* (each
//! flush emits a numbered chunk; the buffer restarts empty). `disable`
//! emits a final chunk with the `last` flag set, even when empty.
//!
//! One logical write is never split across chunks: the flush check runs
//! between writes, so a symmetric read on the receiver always finds a
//! write's bytes contiguous within one chunk.

use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use trellis_protocol::Version;

use crate::compress::{Compressor, COMPRESSOR_NONE};
use crate::istream::{Streamable, Wire};
use crate::StreamError;

/// One framed chunk leaving the stream.
#[derive(Debug, Clone)]
pub struct ChunkOut {
    pub version: Version,
    pub sequence: u32,
    pub last: bool,
    pub compressor: u32,
    pub n_chunks: u32,
    /// Uncompressed payload size.
    pub data_size: u64,
    /// Wire body: 8-byte size mirror + raw or compressed payload.
    pub body: Bytes,
}

/// Receives emitted chunks; implemented over connections by the node layer.
pub trait ChunkSink: Send {
    fn emit(&mut self, chunk: ChunkOut) -> Result<(), StreamError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disabled,
    Buffered,
    Streaming,
}

pub struct DataOStream {
    state: State,
    buffer: BytesMut,
    version: Version,
    sequence: u32,
    first_threshold: usize,
    chunk_threshold: usize,
    compressor: Option<Arc<dyn Compressor>>,
    sink: Option<Box<dyn ChunkSink>>,
}

/// Default streaming chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 65_536;

impl DataOStream {
    pub fn new() -> Self {
        Self {
            state: State::Disabled,
            buffer: BytesMut::new(),
            version: Version::NONE,
            sequence: 0,
            first_threshold: DEFAULT_CHUNK_SIZE,
            chunk_threshold: DEFAULT_CHUNK_SIZE,
            compressor: None,
            sink: None,
        }
    }

    pub fn set_compressor(&mut self, compressor: Option<Arc<dyn Compressor>>) {
        self.compressor = compressor;
    }

    pub fn set_chunk_size(&mut self, size: usize) {
        self.chunk_threshold = size.max(1);
    }

    /// Enable the stream for one burst. `instance_size` is the hint for the
    /// first flush threshold.
    pub fn enable(&mut self, sink: Box<dyn ChunkSink>, version: Version, instance_size: usize) {
        assert_eq!(self.state, State::Disabled, "stream already enabled");
        self.state = State::Buffered;
        self.sink = Some(sink);
        self.version = version;
        self.sequence = 0;
        self.first_threshold = instance_size.max(1);
        self.buffer.clear();
    }

    pub fn is_enabled(&self) -> bool {
        self.state != State::Disabled
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Bytes currently buffered and not yet flushed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    // ------------------------------------------------------------------
    // Typed writes. Primitives go out native-endian; the receiver swaps
    // if the handshake negotiated it.
    // ------------------------------------------------------------------

    pub fn write<T: Wire>(&mut self, value: T) {
        self.push_primitive(value);
        self.maybe_flush();
    }

    /// Write N contiguous elements without a length prefix.
    pub fn write_array<T: Wire>(&mut self, values: &[T]) {
        self.push_array(values);
        self.maybe_flush();
    }

    /// Write a length-prefixed flat vector of trivially copyable elements.
    pub fn write_vec<T: Wire>(&mut self, values: &[T]) {
        self.push_primitive(values.len() as u64);
        self.push_array(values);
        self.maybe_flush();
    }

    /// Write a length-prefixed string. The bytes are raw, never swapped.
    pub fn write_string(&mut self, s: &str) {
        self.push_primitive(s.len() as u64);
        self.reserve(s.len());
        self.buffer.put_slice(s.as_bytes());
        self.maybe_flush();
    }

    /// Write a length-prefixed vector of serializable items, element-wise.
    pub fn write_items<T: Streamable>(&mut self, items: &[T]) {
        self.push_primitive(items.len() as u64);
        for item in items {
            item.write_to(self);
        }
        self.maybe_flush();
    }

    /// Append raw bytes as-is.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.reserve(data.len());
        self.buffer.put_slice(data);
        self.maybe_flush();
    }

    /// Emit the final chunk (last flag set, possibly empty) and disable.
    pub fn disable(&mut self) -> Result<(), StreamError> {
        assert_ne!(self.state, State::Disabled, "stream not enabled");
        let result = self.flush(true);
        self.state = State::Disabled;
        self.sink = None;
        result
    }

    // ------------------------------------------------------------------

    fn push_primitive<T: Wire>(&mut self, value: T) {
        assert!(self.is_enabled(), "write on disabled stream");
        self.reserve(T::SIZE);
        let mut scratch = [0u8; 16];
        value.put_ne(&mut scratch[..T::SIZE]);
        self.buffer.put_slice(&scratch[..T::SIZE]);
    }

    fn push_array<T: Wire>(&mut self, values: &[T]) {
        assert!(self.is_enabled(), "write on disabled stream");
        self.reserve(values.len() * T::SIZE);
        let mut scratch = [0u8; 16];
        for value in values {
            value.put_ne(&mut scratch[..T::SIZE]);
            self.buffer.put_slice(&scratch[..T::SIZE]);
        }
    }

    fn reserve(&mut self, additional: usize) {
        self.buffer.reserve(additional);
    }

    fn threshold(&self) -> usize {
        match self.state {
            State::Buffered => self.first_threshold,
            _ => self.chunk_threshold,
        }
    }

    fn maybe_flush(&mut self) {
        if self.buffer.len() >= self.threshold() {
            // Mid-burst flush failures surface on disable(); the stream
            // stays usable so the writer side keeps its simple API.
            if let Err(e) = self.flush(false) {
                tracing::warn!("chunk flush failed: {e}");
            }
        }
    }

    fn flush(&mut self, last: bool) -> Result<(), StreamError> {
        let raw = std::mem::take(&mut self.buffer);
        let data_size = raw.len() as u64;

        let (compressor_id, n_chunks, body) = self.pack_body(&raw);

        let chunk = ChunkOut {
            version: self.version,
            sequence: self.sequence,
            last,
            compressor: compressor_id,
            n_chunks,
            data_size,
            body,
        };
        self.sequence += 1;
        if self.state == State::Buffered {
            self.state = State::Streaming;
        }

        match self.sink.as_mut() {
            Some(sink) => sink.emit(chunk),
            None => Err(StreamError::Sink("no sink attached".into())),
        }
    }

    /// Build the wire body: size mirror plus raw or compressed payload.
    /// Falls back to NONE when compression does not shrink the chunk.
    fn pack_body(&self, raw: &[u8]) -> (u32, u32, Bytes) {
        if let Some(codec) = &self.compressor {
            if raw.len() >= codec.min_size() {
                if let Ok(sub) = codec.compress(raw) {
                    let total: usize = sub.iter().map(|c| c.len() + 8).sum();
                    if total < raw.len() {
                        let mut body = BytesMut::with_capacity(8 + total);
                        body.put_u64_le(raw.len() as u64);
                        for chunk in &sub {
                            body.put_u64_le(chunk.len() as u64);
                            body.put_slice(chunk);
                        }
                        return (codec.id(), sub.len() as u32, body.freeze());
                    }
                }
            }
        }

        let mut body = BytesMut::with_capacity(8 + raw.len());
        body.put_u64_le(raw.len() as u64);
        body.put_slice(raw);
        (COMPRESSOR_NONE, 0, body.freeze())
    }
}

impl Default for DataOStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Sink collecting chunks in memory; used by tests and the instance cache.
pub struct VecSink {
    chunks: Arc<Mutex<Vec<ChunkOut>>>,
}

impl VecSink {
    pub fn new() -> (Self, Arc<Mutex<Vec<ChunkOut>>>) {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        (Self { chunks: chunks.clone() }, chunks)
    }
}

impl ChunkSink for VecSink {
    fn emit(&mut self, chunk: ChunkOut) -> Result<(), StreamError> {
        self.chunks.lock().unwrap().push(chunk);
        Ok(())
    }
}

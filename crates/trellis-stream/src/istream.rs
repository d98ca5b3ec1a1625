//! DataIStream -- logical read cursor over received chunks.
//!
//! Typed reads may span chunk boundaries; the stream pulls the next chunk
//! transparently. `remaining_buffer` is intra-chunk by contract and never
//! crosses a boundary. Primitives are byte-swapped when the stream's swap
//! flag is set (negotiated once per peer from the handshake magic).

use std::collections::VecDeque;

use bytes::Bytes;
use trellis_protocol::Version;

use crate::compress::{self, COMPRESSOR_NONE};
use crate::ostream::ChunkOut;
use crate::{StreamError, MAX_STREAM_LEN};

/// A wire-trivial primitive: fixed size, endian-swappable.
pub trait Wire: Copy {
    const SIZE: usize;
    fn put_ne(&self, out: &mut [u8]);
    fn from_ne(bytes: &[u8]) -> Self;
    fn byte_swapped(self) -> Self;
}

macro_rules! wire_int {
    ($($t:ty),*) => {$(
        impl Wire for $t {
            const SIZE: usize = std::mem::size_of::<$t>();
            fn put_ne(&self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_ne_bytes());
            }
            fn from_ne(bytes: &[u8]) -> Self {
                <$t>::from_ne_bytes(bytes.try_into().unwrap())
            }
            fn byte_swapped(self) -> Self {
                self.swap_bytes()
            }
        }
    )*};
}

wire_int!(u8, i8, u16, i16, u32, i32, u64, i64, u128, i128);

impl Wire for f32 {
    const SIZE: usize = 4;
    fn put_ne(&self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_bits().to_ne_bytes());
    }
    fn from_ne(bytes: &[u8]) -> Self {
        f32::from_bits(u32::from_ne_bytes(bytes.try_into().unwrap()))
    }
    fn byte_swapped(self) -> Self {
        f32::from_bits(self.to_bits().swap_bytes())
    }
}

impl Wire for f64 {
    const SIZE: usize = 8;
    fn put_ne(&self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_bits().to_ne_bytes());
    }
    fn from_ne(bytes: &[u8]) -> Self {
        f64::from_bits(u64::from_ne_bytes(bytes.try_into().unwrap()))
    }
    fn byte_swapped(self) -> Self {
        f64::from_bits(self.to_bits().swap_bytes())
    }
}

/// A serializable item: writes itself to an ostream, reads itself back.
pub trait Streamable: Sized {
    fn write_to(&self, os: &mut crate::DataOStream);
    fn read_from(is: &mut DataIStream) -> Result<Self, StreamError>;
}

macro_rules! streamable_wire {
    ($($t:ty),*) => {$(
        impl Streamable for $t {
            fn write_to(&self, os: &mut crate::DataOStream) {
                os.write(*self);
            }
            fn read_from(is: &mut DataIStream) -> Result<Self, StreamError> {
                is.read()
            }
        }
    )*};
}

streamable_wire!(u8, i8, u16, i16, u32, i32, u64, i64, u128, i128, f32, f64);

impl Streamable for String {
    fn write_to(&self, os: &mut crate::DataOStream) {
        os.write_string(self);
    }
    fn read_from(is: &mut DataIStream) -> Result<Self, StreamError> {
        is.read_string()
    }
}

/// One received chunk, still packed (mirror prefix, maybe compressed).
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub compressor: u32,
    pub n_chunks: u32,
    pub data_size: u64,
    pub body: Bytes,
}

impl From<ChunkOut> for RawChunk {
    fn from(c: ChunkOut) -> Self {
        RawChunk {
            compressor: c.compressor,
            n_chunks: c.n_chunks,
            data_size: c.data_size,
            body: c.body,
        }
    }
}

/// Supplies chunks to a [`DataIStream`] in arrival order.
pub trait ChunkProvider: Send {
    fn next_chunk(&mut self) -> Result<Option<RawChunk>, StreamError>;

    /// Version this stream carries; NONE for plain command payloads.
    fn version(&self) -> Version {
        Version::NONE
    }
}

/// In-memory chunk FIFO; the common provider for assembled bursts.
pub struct QueuedChunks {
    version: Version,
    chunks: VecDeque<RawChunk>,
}

impl QueuedChunks {
    pub fn new(version: Version) -> Self {
        Self { version, chunks: VecDeque::new() }
    }

    pub fn push(&mut self, chunk: RawChunk) {
        self.chunks.push_back(chunk);
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl ChunkProvider for QueuedChunks {
    fn next_chunk(&mut self) -> Result<Option<RawChunk>, StreamError> {
        Ok(self.chunks.pop_front())
    }

    fn version(&self) -> Version {
        self.version
    }
}

pub struct DataIStream {
    provider: Box<dyn ChunkProvider>,
    swap: bool,
    current: Bytes,
    pos: usize,
}

impl DataIStream {
    pub fn new(provider: Box<dyn ChunkProvider>) -> Self {
        Self {
            provider,
            swap: false,
            current: Bytes::new(),
            pos: 0,
        }
    }

    pub fn with_swap(provider: Box<dyn ChunkProvider>, swap: bool) -> Self {
        let mut is = Self::new(provider);
        is.swap = swap;
        is
    }

    pub fn set_swapping(&mut self, swap: bool) {
        self.swap = swap;
    }

    pub fn is_swapping(&self) -> bool {
        self.swap
    }

    pub fn version(&self) -> Version {
        self.provider.version()
    }

    /// True if unread data remains in the logical stream.
    pub fn has_data(&mut self) -> bool {
        self.check_buffer().unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Typed reads
    // ------------------------------------------------------------------

    /// Read one primitive, swapping if negotiated. May cross chunks.
    pub fn read<T: Wire>(&mut self) -> Result<T, StreamError> {
        let mut scratch = [0u8; 16];
        self.read_bytes(&mut scratch[..T::SIZE])?;
        let value = T::from_ne(&scratch[..T::SIZE]);
        Ok(if self.swap { value.byte_swapped() } else { value })
    }

    /// Read N contiguous elements into `out`, swapping elementwise.
    pub fn read_array<T: Wire>(&mut self, out: &mut [T]) -> Result<(), StreamError> {
        let mut scratch = [0u8; 16];
        for slot in out.iter_mut() {
            self.read_bytes(&mut scratch[..T::SIZE])?;
            let value = T::from_ne(&scratch[..T::SIZE]);
            *slot = if self.swap { value.byte_swapped() } else { value };
        }
        Ok(())
    }

    /// Read a length-prefixed flat vector of trivially copyable elements.
    pub fn read_vec<T: Wire + Default>(&mut self) -> Result<Vec<T>, StreamError> {
        let n: u64 = self.read()?;
        if n >= MAX_STREAM_LEN {
            return Err(StreamError::CorruptLength(n));
        }
        let mut out = vec![T::default(); n as usize];
        self.read_array(&mut out)?;
        Ok(out)
    }

    /// Read a length-prefixed vector of serializable items, element-wise.
    pub fn read_items<T: Streamable>(&mut self) -> Result<Vec<T>, StreamError> {
        let n: u64 = self.read()?;
        if n >= MAX_STREAM_LEN {
            return Err(StreamError::CorruptLength(n));
        }
        let mut out = Vec::with_capacity(n.min(4096) as usize);
        for _ in 0..n {
            out.push(T::read_from(self)?);
        }
        Ok(out)
    }

    /// Read a length-prefixed string. The bytes come raw from the current
    /// chunk; senders never split one write across chunks.
    pub fn read_string(&mut self) -> Result<String, StreamError> {
        let n: u64 = self.read()?;
        if n >= MAX_STREAM_LEN {
            return Err(StreamError::CorruptLength(n));
        }
        if n == 0 {
            return Ok(String::new());
        }
        let bytes = self
            .remaining_buffer(n as usize)?
            .ok_or(StreamError::ShortRead)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| StreamError::ShortRead)
    }

    /// Zero-copy view of `n` bytes in the current chunk, advancing past
    /// them. Returns `None` if fewer than `n` bytes remain in the chunk;
    /// never crosses a chunk boundary. No swap is applied.
    pub fn remaining_buffer(&mut self, n: usize) -> Result<Option<&[u8]>, StreamError> {
        if !self.check_buffer()? && n > 0 {
            return Ok(None);
        }
        if self.current.len() - self.pos < n {
            return Ok(None);
        }
        let slice = &self.current[self.pos..self.pos + n];
        self.pos += n;
        Ok(Some(slice))
    }

    /// Bytes left in the current chunk (pulling the next one if exhausted).
    pub fn remaining_buffer_size(&mut self) -> Result<usize, StreamError> {
        if !self.check_buffer()? {
            return Ok(0);
        }
        Ok(self.current.len() - self.pos)
    }

    // ------------------------------------------------------------------

    /// Copy bytes from the logical stream, crossing chunks as needed.
    fn read_bytes(&mut self, out: &mut [u8]) -> Result<(), StreamError> {
        let mut done = 0;
        while done < out.len() {
            if !self.check_buffer()? {
                return Err(StreamError::ShortRead);
            }
            let avail = self.current.len() - self.pos;
            let take = avail.min(out.len() - done);
            out[done..done + take].copy_from_slice(&self.current[self.pos..self.pos + take]);
            self.pos += take;
            done += take;
        }
        Ok(())
    }

    /// Ensure the current chunk has unread data, unpacking the next chunk
    /// when exhausted. Returns false at end of stream.
    fn check_buffer(&mut self) -> Result<bool, StreamError> {
        while self.pos >= self.current.len() {
            match self.provider.next_chunk()? {
                None => return Ok(false),
                Some(chunk) => {
                    self.current = unpack_chunk(chunk)?;
                    self.pos = 0;
                }
            }
        }
        Ok(true)
    }
}

/// Validate a chunk's mirror prefix and decompress its payload.
fn unpack_chunk(chunk: RawChunk) -> Result<Bytes, StreamError> {
    let body = chunk.body;
    if body.len() < 8 {
        return Err(StreamError::CorruptLength(body.len() as u64));
    }
    let mirror = u64::from_le_bytes(body[0..8].try_into().unwrap());
    // A big-endian sender writes the mirror in its native order.
    if mirror != chunk.data_size && mirror.swap_bytes() != chunk.data_size {
        return Err(StreamError::CorruptLength(mirror));
    }

    if chunk.compressor == COMPRESSOR_NONE {
        if (body.len() - 8) as u64 != chunk.data_size {
            return Err(StreamError::CorruptLength((body.len() - 8) as u64));
        }
        return Ok(body.slice(8..));
    }

    let codec =
        compress::find(chunk.compressor).ok_or(StreamError::UnknownCodec(chunk.compressor))?;

    // Parse n_chunks length-prefixed sub-chunks.
    let mut sub = Vec::with_capacity(chunk.n_chunks as usize);
    let mut at = 8usize;
    for _ in 0..chunk.n_chunks {
        if body.len() - at < 8 {
            return Err(StreamError::CorruptLength((body.len() - at) as u64));
        }
        let len = u64::from_le_bytes(body[at..at + 8].try_into().unwrap()) as usize;
        at += 8;
        if body.len() - at < len {
            return Err(StreamError::CorruptLength(len as u64));
        }
        sub.push(&body[at..at + len]);
        at += len;
    }

    let out = codec.decompress(&sub, chunk.data_size as usize)?;
    Ok(Bytes::from(out))
}

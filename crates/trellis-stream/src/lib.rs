//! Trellis Stream -- the chunked binary pipe between nodes.
//!
//! A [`DataOStream`] buffers typed writes and emits framed chunks to a
//! [`ChunkSink`]; a [`DataIStream`] presents a logical read cursor over the
//! concatenation of received chunks, byte-swapping primitives when sender
//! and receiver endianness disagree. Chunk bodies are optionally
//! compressed; compressor id `NONE` must always be handled.

pub mod compress;
pub mod istream;
pub mod ostream;

pub use compress::{Compressor, ZstdCompressor, COMPRESSOR_NONE, COMPRESSOR_ZSTD};
pub use istream::{ChunkProvider, DataIStream, QueuedChunks, RawChunk, Streamable, Wire};
pub use ostream::{ChunkOut, ChunkSink, DataOStream, VecSink};

/// Length fields at or above 2^48 are treated as stream corruption.
pub const MAX_STREAM_LEN: u64 = 1 << 48;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Read past the end of the logical stream.
    #[error("short read: stream exhausted")]
    ShortRead,
    /// A length field failed the 48-bit sanity bound, or a chunk's mirrored
    /// size prefix disagrees with its header. Fatal for the connection.
    #[error("corrupt length field: {0}")]
    CorruptLength(u64),
    /// Compressor id not known to this receiver. Fatal for the connection.
    #[error("unknown compressor id {0}")]
    UnknownCodec(u32),
    #[error("decompression failed: {0}")]
    Decompress(String),
    #[error("chunk sink failed: {0}")]
    Sink(String),
}

impl StreamError {
    /// Errors that must disconnect the offending peer rather than just
    /// failing the consuming operation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StreamError::CorruptLength(_) | StreamError::UnknownCodec(_)
        )
    }
}

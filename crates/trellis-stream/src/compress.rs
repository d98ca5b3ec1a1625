//! Pluggable chunk compression.
//!
//! Compression is advisory: the sender compresses a chunk body only when it
//! exceeds the codec's minimum size and the result actually shrinks it.
//! Receivers resolve codecs by wire id and must always accept `NONE`.

use std::sync::Arc;

use crate::StreamError;

pub use trellis_protocol::packet::COMPRESSOR_NONE;

/// Wire id of the zstd codec.
pub const COMPRESSOR_ZSTD: u32 = 1;

pub trait Compressor: Send + Sync {
    /// Wire id stored in the chunk header.
    fn id(&self) -> u32;

    /// Chunks smaller than this are sent uncompressed.
    fn min_size(&self) -> usize;

    /// Compress a chunk body into one or more sub-chunks.
    fn compress(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, StreamError>;

    /// Decompress sub-chunks back into a contiguous body.
    fn decompress(&self, chunks: &[&[u8]], expected: usize) -> Result<Vec<u8>, StreamError>;
}

pub struct ZstdCompressor {
    level: i32,
    min_size: usize,
}

impl ZstdCompressor {
    pub fn new() -> Self {
        Self { level: 1, min_size: 512 }
    }

    pub fn with_level(level: i32) -> Self {
        Self { level, min_size: 512 }
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for ZstdCompressor {
    fn id(&self) -> u32 {
        COMPRESSOR_ZSTD
    }

    fn min_size(&self) -> usize {
        self.min_size
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, StreamError> {
        let out = zstd::encode_all(data, self.level)
            .map_err(|e| StreamError::Decompress(e.to_string()))?;
        Ok(vec![out])
    }

    fn decompress(&self, chunks: &[&[u8]], expected: usize) -> Result<Vec<u8>, StreamError> {
        let mut out = Vec::with_capacity(expected);
        for chunk in chunks {
            let part =
                zstd::decode_all(*chunk).map_err(|e| StreamError::Decompress(e.to_string()))?;
            out.extend_from_slice(&part);
        }
        if out.len() != expected {
            return Err(StreamError::CorruptLength(out.len() as u64));
        }
        Ok(out)
    }
}

/// Resolve a compressor by wire id. `NONE` is not a codec; callers handle
/// it before resolving.
pub fn find(id: u32) -> Option<Arc<dyn Compressor>> {
    match id {
        COMPRESSOR_ZSTD => Some(Arc::new(ZstdCompressor::new())),
        _ => None,
    }
}

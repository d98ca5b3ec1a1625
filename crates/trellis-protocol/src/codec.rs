//! Packet framing codec for byte-stream transports.
//!
//! Wire format: `u64` little-endian total size (including the size field)
//! followed by the rest of the packet. The decoder yields whole packets,
//! header included, so the receiver can hand the buffer to the command
//! layer without reassembly.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{ProtocolError, MAX_PACKET_BYTES};

/// Size prefix length in bytes.
const SIZE_PREFIX: usize = 8;

pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < SIZE_PREFIX {
            return Ok(None);
        }

        // Peek at the total size without consuming
        let size = u64::from_le_bytes(src[0..8].try_into().unwrap());

        if size > MAX_PACKET_BYTES as u64 {
            return Err(ProtocolError::PacketTooLarge {
                size,
                max: MAX_PACKET_BYTES,
            });
        }
        if (size as usize) < crate::PacketHeader::LEN {
            return Err(ProtocolError::PacketTooShort { size });
        }

        let total = size as usize;
        if src.len() < total {
            // Reserve space for the rest
            src.reserve(total - src.len());
            return Ok(None);
        }

        Ok(Some(src.split_to(total).freeze()))
    }
}

impl Encoder<Bytes> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // Packets are framed at build time; the encoder only validates.
        debug_assert!(item.len() >= crate::PacketHeader::LEN);
        let size = u64::from_le_bytes(item[0..8].try_into().unwrap());
        debug_assert_eq!(size as usize, item.len());
        if item.len() > MAX_PACKET_BYTES {
            return Err(ProtocolError::PacketTooLarge {
                size: item.len() as u64,
                max: MAX_PACKET_BYTES,
            });
        }
        dst.extend_from_slice(&item);
        Ok(())
    }
}

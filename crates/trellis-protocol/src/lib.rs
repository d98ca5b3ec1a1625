//! Trellis Protocol -- identifier types, packet tables, framing codec.
//!
//! Every packet on the wire starts with a `u64` total size (including the
//! size field itself), a `u32` packet type and a `u32` command. Header
//! integers are little-endian; stream payload endianness is negotiated per
//! connection via the handshake magic.

pub mod codec;
pub mod desc;
pub mod packet;

pub use codec::PacketCodec;
pub use desc::{ConnectionDesc, ConnectionKind};
pub use packet::*;

use std::fmt;

/// Protocol magic, written native-endian in the CONNECT prefix. A receiver
/// seeing the byte-swapped value enables endian swap for that peer.
pub const PROTOCOL_MAGIC: u32 = 0x54524C53; // "TRLS"

/// Maximum accepted packet size: 16 MB.
pub const MAX_PACKET_BYTES: usize = 16 * 1024 * 1024;

/// Handshake round-trip timeout in milliseconds.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Maximum simultaneous-connect retries before giving up.
pub const CONNECT_RETRIES: u32 = 10;

/// Default listener port when a description omits one.
pub const DEFAULT_PORT: u16 = 4242;

/// Sentinel node type for "node unknown" in GET_NODE_DATA_REPLY.
pub const NODETYPE_INVALID: u32 = u32::MAX;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub u128);

        impl $name {
            pub const ZERO: $name = $name(0);

            /// Generate a fresh random identifier (never zero).
            pub fn random() -> Self {
                loop {
                    let v: u128 = rand::random();
                    if v != 0 {
                        return $name(v);
                    }
                }
            }

            pub fn is_zero(&self) -> bool {
                self.0 == 0
            }

            pub fn hi(&self) -> u64 {
                (self.0 >> 64) as u64
            }

            pub fn lo(&self) -> u64 {
                self.0 as u64
            }

            pub fn from_parts(hi: u64, lo: u64) -> Self {
                $name(((hi as u128) << 64) | lo as u128)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // Short hex form, enough to tell nodes apart in logs.
                write!(f, "{:08x}", (self.0 >> 96) as u32)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:032x})"), self.0)
            }
        }
    };
}

id_type! {
    /// Opaque 128-bit node identifier, unique per process lifetime.
    /// Zero is reserved ("no node").
    NodeId
}

id_type! {
    /// Opaque 128-bit distributed-object identifier.
    ObjectId
}

/// Monotone per-object version. Zero means "none"; `HEAD` is a request
/// marker resolving to the current master version, never stored.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Version(pub u128);

impl Version {
    pub const NONE: Version = Version(0);
    pub const HEAD: Version = Version(u128::MAX);
    pub const FIRST: Version = Version(1);

    pub fn next(&self) -> Version {
        Version(self.0 + 1)
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub fn is_head(&self) -> bool {
        self.0 == u128::MAX
    }

    pub fn hi(&self) -> u64 {
        (self.0 >> 64) as u64
    }

    pub fn lo(&self) -> u64 {
        self.0 as u64
    }

    pub fn from_parts(hi: u64, lo: u64) -> Self {
        Version(((hi as u128) << 64) | lo as u128)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_head() {
            f.write_str("HEAD")
        } else {
            write!(f, "v{}", self.0)
        }
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid magic: expected {expected:#010x} (or swapped), got {got:#010x}")]
    InvalidMagic { expected: u32, got: u32 },
    #[error("packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: u64, max: usize },
    #[error("packet too short: {size} bytes")]
    PacketTooShort { size: u64 },
    #[error("unknown packet type {0}")]
    UnknownType(u32),
    #[error("unknown command {command} for packet type {ptype}")]
    UnknownCommand { ptype: u32, command: u32 },
    #[error("truncated payload decoding {0}")]
    Truncated(&'static str),
    #[error("malformed connection description: {0}")]
    BadDescription(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

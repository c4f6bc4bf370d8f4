//! Parsing and crafting for the raw IP frames carried by a TUN-style link.
//!
//! Parsers borrow the original byte slice and expose field accessors without
//! allocating; builders produce finished frames as `Vec<u8>` with checksums
//! already filled in.

pub mod checksum;
pub mod icmp;
pub mod ipv4;
pub mod ipv6;
pub mod tcp;
pub mod udp;

use core::fmt;

/// Errors returned by packet parsers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketError {
    /// The input buffer ended before the header/payload could be read.
    Truncated {
        /// Minimum number of bytes required to proceed.
        needed: usize,
        /// Actual available bytes.
        actual: usize,
    },
    /// A field was structurally invalid (e.g. IP version != 4/6).
    Malformed(&'static str),
    /// A checksum did not verify.
    BadChecksum(&'static str),
    /// A valid but unhandled format (e.g. an IPv6 extension header).
    Unsupported(&'static str),
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketError::Truncated { needed, actual } => {
                write!(f, "packet truncated (needed {needed}, got {actual})")
            }
            PacketError::Malformed(msg) => write!(f, "malformed packet: {msg}"),
            PacketError::BadChecksum(msg) => write!(f, "bad checksum: {msg}"),
            PacketError::Unsupported(msg) => write!(f, "unsupported packet: {msg}"),
        }
    }
}

impl std::error::Error for PacketError {}

pub(crate) fn ensure_len(data: &[u8], needed: usize) -> Result<(), PacketError> {
    if data.len() < needed {
        return Err(PacketError::Truncated {
            needed,
            actual: data.len(),
        });
    }
    Ok(())
}

/// IP protocol numbers the stack cares about.
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

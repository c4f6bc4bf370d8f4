//! TUN device plumbing shared by the cage client and server: device
//! creation, non-blocking read/write halves, and link configuration over
//! rtnetlink.

mod netcfg;
mod tun;

pub use netcfg::{configure_link, parse_cidr, LinkConfig};
pub use tun::{TunDevice, TunReader, TunWriter};

/// Errors from device creation and link configuration.
#[derive(Debug, thiserror::Error)]
pub enum NetdevError {
    #[error("invalid CIDR {0:?}")]
    InvalidCidr(String),
    #[error("interface name {0:?} too long (max 15 bytes)")]
    NameTooLong(String),
    #[error("link {0:?} not found")]
    LinkNotFound(String),
    #[error("failed to {action}: {source}")]
    Io {
        action: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("netlink: failed to {action}: {source}")]
    Netlink {
        action: &'static str,
        #[source]
        source: rtnetlink::Error,
    },
}

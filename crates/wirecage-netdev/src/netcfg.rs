use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use futures::stream::TryStreamExt;
use netlink_packet_route::link::LinkAttribute;

use crate::NetdevError;

/// Splits `addr/prefix` notation into its parts.
pub fn parse_cidr(cidr: &str) -> Result<(IpAddr, u8), NetdevError> {
    let invalid = || NetdevError::InvalidCidr(cidr.to_string());
    let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    let max = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    if prefix > max {
        return Err(invalid());
    }
    Ok((addr, prefix))
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Interface to configure.
    pub device: String,
    /// Address to assign, as `(addr, prefix_len)`.
    pub address: (IpAddr, u8),
    /// Point `0.0.0.0/0` at the device.
    pub ipv4_default_route: bool,
    /// Point `::/0` at the device, best-effort: failure is logged and
    /// ignored because hosts without IPv6 reject the route.
    pub ipv6_default_route: bool,
    /// Bring `lo` up as well.
    pub loopback_up: bool,
}

/// Brings the link up, assigns its address and routes, and returns the
/// device MTU read from the kernel link attributes.
///
/// Runs against the network namespace of the calling thread; on the client
/// this must be the pinned stage-2 thread after `unshare(CLONE_NEWNET)`.
pub async fn configure_link(cfg: &LinkConfig) -> Result<u32, NetdevError> {
    let (connection, handle, _) =
        rtnetlink::new_connection().map_err(|source| NetdevError::Io {
            action: "open rtnetlink socket",
            source,
        })?;
    tokio::spawn(connection);

    let link = handle
        .link()
        .get()
        .match_name(cfg.device.clone())
        .execute()
        .try_next()
        .await
        .map_err(|source| NetdevError::Netlink {
            action: "query link",
            source,
        })?
        .ok_or_else(|| NetdevError::LinkNotFound(cfg.device.clone()))?;
    let index = link.header.index;

    let mtu = link
        .attributes
        .iter()
        .find_map(|attr| match attr {
            LinkAttribute::Mtu(mtu) => Some(*mtu),
            _ => None,
        })
        .unwrap_or(1500);
    tracing::debug!(device = %cfg.device, index, mtu, "configuring link");

    handle
        .link()
        .set(index)
        .up()
        .execute()
        .await
        .map_err(|source| NetdevError::Netlink {
            action: "bring link up",
            source,
        })?;

    let (addr, prefix) = cfg.address;
    handle
        .address()
        .add(index, addr, prefix)
        .execute()
        .await
        .map_err(|source| NetdevError::Netlink {
            action: "assign address",
            source,
        })?;

    if cfg.ipv4_default_route {
        handle
            .route()
            .add()
            .v4()
            .destination_prefix(Ipv4Addr::UNSPECIFIED, 0)
            .output_interface(index)
            .execute()
            .await
            .map_err(|source| NetdevError::Netlink {
                action: "add default IPv4 route",
                source,
            })?;
    }

    if cfg.ipv6_default_route {
        if let Err(err) = handle
            .route()
            .add()
            .v6()
            .destination_prefix(Ipv6Addr::UNSPECIFIED, 0)
            .output_interface(index)
            .execute()
            .await
        {
            tracing::debug!("failed to add default IPv6 route, continuing: {err}");
        }
    }

    if cfg.loopback_up {
        let lo = handle
            .link()
            .get()
            .match_name("lo".to_string())
            .execute()
            .try_next()
            .await
            .map_err(|source| NetdevError::Netlink {
                action: "query loopback",
                source,
            })?;
        if let Some(lo) = lo {
            handle
                .link()
                .set(lo.header.index)
                .up()
                .execute()
                .await
                .map_err(|source| NetdevError::Netlink {
                    action: "bring loopback up",
                    source,
                })?;
        }
    }

    Ok(mtu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_cidr_accepts_v4_and_v6() {
        assert_eq!(
            parse_cidr("10.1.2.100/24").unwrap(),
            (IpAddr::V4(Ipv4Addr::new(10, 1, 2, 100)), 24)
        );
        assert_eq!(
            parse_cidr("fd00::1/64").unwrap(),
            ("fd00::1".parse::<IpAddr>().unwrap(), 64)
        );
    }

    #[test]
    fn parse_cidr_rejects_garbage() {
        for bad in ["10.1.2.100", "10.1.2.100/33", "banana/24", "10.1.2.100/x"] {
            assert!(parse_cidr(bad).is_err(), "{bad} should be rejected");
        }
    }
}

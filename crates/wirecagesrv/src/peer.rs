use std::net::{IpAddr, SocketAddr};

use boringtun::noise::Tunn;

/// One allowed-IPs entry with proper prefix matching. An address without a
/// prefix is a host route (`/32` or `/128`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowedIp {
    addr: IpAddr,
    prefix: u8,
}

impl AllowedIp {
    pub fn parse(s: &str) -> Result<Self, String> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.parse().map_err(|_| format!("invalid address {addr:?}"))?;
                let prefix: u8 = prefix.parse().map_err(|_| format!("invalid prefix {prefix:?}"))?;
                (addr, prefix)
            }
            None => {
                let addr: IpAddr = s.parse().map_err(|_| format!("invalid address {s:?}"))?;
                let prefix = if addr.is_ipv4() { 32 } else { 128 };
                (addr, prefix)
            }
        };
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(format!("prefix /{prefix} too long for {addr}"));
        }
        Ok(Self { addr, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix)
                };
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix)
                };
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

/// One configured peer: its Noise state, cryptokey routing entry, and the
/// last endpoint it was seen from (peers roam; the endpoint follows the
/// most recent authenticated datagram).
pub struct Peer {
    pub tunn: Tunn,
    pub public_key: [u8; 32],
    pub allowed_ip: AllowedIp,
    pub endpoint: Option<SocketAddr>,
}

impl Peer {
    pub fn new(tunn: Tunn, public_key: [u8; 32], allowed_ip: AllowedIp) -> Self {
        Self {
            tunn,
            public_key,
            allowed_ip,
            endpoint: None,
        }
    }
}

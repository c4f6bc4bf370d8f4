use core::net::IpAddr;

use super::checksum::{
    pseudo_header_sum_v4, pseudo_header_sum_v6, transport_checksum, transport_checksum_valid,
};
use super::{ensure_len, PacketError, IPPROTO_UDP};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub checksum: u16,
    pub payload: &'a [u8],
}

impl<'a> UdpDatagram<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(buf, 8)?;
        let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        if length < 8 {
            return Err(PacketError::Malformed("UDP length below header"));
        }
        ensure_len(buf, length)?;
        Ok(Self {
            src_port: u16::from_be_bytes([buf[0], buf[1]]),
            dst_port: u16::from_be_bytes([buf[2], buf[3]]),
            checksum: u16::from_be_bytes([buf[6], buf[7]]),
            payload: &buf[8..length],
        })
    }
}

/// Verifies the UDP checksum. An all-zero checksum means "absent" over IPv4
/// and is accepted; over IPv6 it is invalid.
pub fn checksum_valid(src: IpAddr, dst: IpAddr, datagram: &[u8]) -> bool {
    if datagram.len() < 8 {
        return false;
    }
    let transmitted = u16::from_be_bytes([datagram[6], datagram[7]]);
    let pseudo = match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            if transmitted == 0 {
                return true;
            }
            pseudo_header_sum_v4(s, d, IPPROTO_UDP, datagram.len() as u16)
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            if transmitted == 0 {
                return false;
            }
            pseudo_header_sum_v6(s, d, IPPROTO_UDP, datagram.len() as u32)
        }
        _ => return false,
    };
    transport_checksum_valid(pseudo, datagram)
}

/// Builds a UDP datagram with the checksum filled in for the given endpoints.
pub fn build_datagram(
    src: IpAddr,
    dst: IpAddr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let total_len = 8 + payload.len();
    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(&src_port.to_be_bytes());
    out.extend_from_slice(&dst_port.to_be_bytes());
    out.extend_from_slice(&(total_len as u16).to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // checksum placeholder
    out.extend_from_slice(payload);

    let pseudo = match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => pseudo_header_sum_v4(s, d, IPPROTO_UDP, total_len as u16),
        (IpAddr::V6(s), IpAddr::V6(d)) => pseudo_header_sum_v6(s, d, IPPROTO_UDP, total_len as u32),
        _ => unreachable!("mixed address families in one UDP datagram"),
    };
    let mut csum = transport_checksum(pseudo, &out);
    if csum == 0 {
        // Zero means "no checksum" on the wire; RFC 768 transmits it as ones.
        csum = 0xffff;
    }
    out[6..8].copy_from_slice(&csum.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::net::Ipv4Addr;
    use pretty_assertions::assert_eq;

    #[test]
    fn build_parse_roundtrip_with_valid_checksum() {
        let src = IpAddr::V4(Ipv4Addr::new(10, 1, 2, 100));
        let dst = IpAddr::V4(Ipv4Addr::new(10, 200, 100, 1));
        let dgram = build_datagram(src, dst, 5353, 53, b"query");
        assert!(checksum_valid(src, dst, &dgram));

        let parsed = UdpDatagram::parse(&dgram).unwrap();
        assert_eq!(parsed.src_port, 5353);
        assert_eq!(parsed.dst_port, 53);
        assert_eq!(parsed.payload, b"query");
    }

    #[test]
    fn absent_checksum_accepted_over_ipv4() {
        let src = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));
        let dst = IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2));
        let mut dgram = build_datagram(src, dst, 1, 2, b"x");
        dgram[6..8].copy_from_slice(&[0, 0]);
        assert!(checksum_valid(src, dst, &dgram));
    }

    #[test]
    fn corrupted_checksum_rejected() {
        let src = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));
        let dst = IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2));
        let mut dgram = build_datagram(src, dst, 1, 2, b"x");
        dgram[8] ^= 0xff;
        assert!(!checksum_valid(src, dst, &dgram));
    }
}

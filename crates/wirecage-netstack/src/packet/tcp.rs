use core::net::IpAddr;

use super::checksum::{
    pseudo_header_sum_v4, pseudo_header_sum_v6, transport_checksum, transport_checksum_valid,
};
use super::{ensure_len, PacketError, IPPROTO_TCP};

pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_SYN: u8 = 0x02;
pub const FLAG_RST: u8 = 0x04;
pub const FLAG_PSH: u8 = 0x08;
pub const FLAG_ACK: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub payload: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(buf, 20)?;
        let data_offset = (buf[12] >> 4) as usize * 4;
        if data_offset < 20 {
            return Err(PacketError::Malformed("TCP data offset below 20"));
        }
        ensure_len(buf, data_offset)?;
        Ok(Self {
            src_port: u16::from_be_bytes([buf[0], buf[1]]),
            dst_port: u16::from_be_bytes([buf[2], buf[3]]),
            seq: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ack: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            flags: buf[13],
            window: u16::from_be_bytes([buf[14], buf[15]]),
            payload: &buf[data_offset..],
        })
    }

    pub fn has(self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// Verifies the TCP checksum of `segment` against the enclosing IP addresses.
pub fn checksum_valid(src: IpAddr, dst: IpAddr, segment: &[u8]) -> bool {
    let pseudo = match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => pseudo_header_sum_v4(s, d, IPPROTO_TCP, segment.len() as u16),
        (IpAddr::V6(s), IpAddr::V6(d)) => pseudo_header_sum_v6(s, d, IPPROTO_TCP, segment.len() as u32),
        _ => return false,
    };
    transport_checksum_valid(pseudo, segment)
}

/// Builds a TCP segment (20-byte header, no options) with the checksum filled
/// in for the given IP endpoints.
#[allow(clippy::too_many_arguments)]
pub fn build_segment(
    src: IpAddr,
    dst: IpAddr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    let total_len = 20 + payload.len();
    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(&src_port.to_be_bytes());
    out.extend_from_slice(&dst_port.to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&ack.to_be_bytes());
    out.push(5u8 << 4); // data offset + reserved
    out.push(flags);
    out.extend_from_slice(&window.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // checksum placeholder
    out.extend_from_slice(&0u16.to_be_bytes()); // urgent pointer
    out.extend_from_slice(payload);

    let pseudo = match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => pseudo_header_sum_v4(s, d, IPPROTO_TCP, total_len as u16),
        (IpAddr::V6(s), IpAddr::V6(d)) => pseudo_header_sum_v6(s, d, IPPROTO_TCP, total_len as u32),
        _ => unreachable!("mixed address families in one TCP segment"),
    };
    let csum = transport_checksum(pseudo, &out);
    out[16..18].copy_from_slice(&csum.to_be_bytes());
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
        let dst = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));
        let seg = build_segment(src, dst, 40000, 80, 1000, 2000, FLAG_ACK | FLAG_PSH, 65535, b"hi");
        assert!(checksum_valid(src, dst, &seg));

        let parsed = TcpSegment::parse(&seg).unwrap();
        assert_eq!(parsed.src_port, 40000);
        assert_eq!(parsed.dst_port, 80);
        assert_eq!(parsed.seq, 1000);
        assert_eq!(parsed.ack, 2000);
        assert!(parsed.has(FLAG_ACK));
        assert!(parsed.has(FLAG_PSH));
        assert_eq!(parsed.payload, b"hi");
    }

    #[test]
    fn flipped_payload_bit_fails_checksum() {
        let src = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
        let dst = IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8));
        let mut seg = build_segment(src, dst, 1, 2, 0, 0, FLAG_SYN, 65535, b"data");
        seg[22] ^= 0x01;
        assert!(!checksum_valid(src, dst, &seg));
    }
}

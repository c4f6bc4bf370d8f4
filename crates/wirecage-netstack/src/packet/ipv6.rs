use core::net::Ipv6Addr;

use super::{ensure_len, PacketError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Packet<'a> {
    pub payload_len: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub payload: &'a [u8],
}

impl<'a> Ipv6Packet<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(buf, 40)?;
        if buf[0] >> 4 != 6 {
            return Err(PacketError::Malformed("invalid IPv6 version"));
        }
        let payload_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        ensure_len(buf, 40 + payload_len)?;

        let mut src = [0u8; 16];
        src.copy_from_slice(&buf[8..24]);
        let mut dst = [0u8; 16];
        dst.copy_from_slice(&buf[24..40]);

        Ok(Self {
            payload_len: payload_len as u16,
            next_header: buf[6],
            hop_limit: buf[7],
            src: Ipv6Addr::from(src),
            dst: Ipv6Addr::from(dst),
            payload: &buf[40..40 + payload_len],
        })
    }

    pub fn serialize(
        src: Ipv6Addr,
        dst: Ipv6Addr,
        next_header: u8,
        hop_limit: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut out = vec![0u8; 40];
        out[0] = 6 << 4;
        out[4..6].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        out[6] = next_header;
        out[7] = hop_limit;
        out[8..24].copy_from_slice(&src.octets());
        out[24..40].copy_from_slice(&dst.octets());
        out.extend_from_slice(payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn serialize_parse_roundtrip() {
        let src: Ipv6Addr = "fd00::1".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::9".parse().unwrap();
        let frame = Ipv6Packet::serialize(src, dst, super::super::IPPROTO_TCP, 64, b"abc");
        let parsed = Ipv6Packet::parse(&frame).unwrap();
        assert_eq!(parsed.src, src);
        assert_eq!(parsed.dst, dst);
        assert_eq!(parsed.next_header, super::super::IPPROTO_TCP);
        assert_eq!(parsed.payload, b"abc");
    }

    #[test]
    fn wrong_version_rejected() {
        let frame = Ipv6Packet::serialize(
            Ipv6Addr::LOCALHOST,
            Ipv6Addr::LOCALHOST,
            super::super::IPPROTO_UDP,
            64,
            &[],
        );
        let mut bad = frame.clone();
        bad[0] = 4 << 4;
        assert_eq!(
            Ipv6Packet::parse(&bad),
            Err(PacketError::Malformed("invalid IPv6 version"))
        );
    }
}

use super::checksum::{finalize, sum_be_words};
use super::{ensure_len, PacketError};

pub const ICMPV4_ECHO_REPLY: u8 = 0;
pub const ICMPV4_ECHO_REQUEST: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpMessage<'a> {
    pub msg_type: u8,
    pub code: u8,
    pub checksum: u16,
    /// Everything after the 4-byte type/code/checksum prefix.
    pub body: &'a [u8],
}

impl<'a> IcmpMessage<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(buf, 4)?;
        Ok(Self {
            msg_type: buf[0],
            code: buf[1],
            checksum: u16::from_be_bytes([buf[2], buf[3]]),
            body: &buf[4..],
        })
    }
}

/// Verifies an ICMPv4 checksum (plain RFC 1071 over the whole message).
pub fn icmpv4_checksum_valid(message: &[u8]) -> bool {
    message.len() >= 4 && finalize(sum_be_words(message)) == 0
}

/// Builds an ICMPv4 echo reply mirroring the request's identifier, sequence
/// number and payload.
pub fn build_echo_reply(request_body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + request_body.len());
    out.push(ICMPV4_ECHO_REPLY);
    out.push(0); // code
    out.extend_from_slice(&0u16.to_be_bytes()); // checksum placeholder
    out.extend_from_slice(request_body);
    let csum = finalize(sum_be_words(&out));
    out[2..4].copy_from_slice(&csum.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn echo_reply_mirrors_body_and_checksums() {
        // id=0x1234 seq=1 plus a payload, as ping would send it.
        let body = [0x12, 0x34, 0x00, 0x01, b'a', b'b', b'c'];
        let reply = build_echo_reply(&body);
        assert!(icmpv4_checksum_valid(&reply));

        let parsed = IcmpMessage::parse(&reply).unwrap();
        assert_eq!(parsed.msg_type, ICMPV4_ECHO_REPLY);
        assert_eq!(parsed.code, 0);
        assert_eq!(parsed.body, &body);
    }
}

use base64::Engine;

use crate::TunnelError;

/// Decodes a standard-base64 32-byte WireGuard key, tolerating surrounding
/// whitespace (key files conventionally end with a newline).
pub fn decode_key(encoded: &str) -> Result<[u8; 32], TunnelError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| TunnelError::InvalidKey("not valid base64"))?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| TunnelError::InvalidKey("must decode to exactly 32 bytes"))?;
    Ok(key)
}

pub fn encode_key(key: &[u8; 32]) -> String {
    base64::engine::general_purpose::STANDARD.encode(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn roundtrip_and_whitespace_tolerance() {
        let key = [7u8; 32];
        let encoded = encode_key(&key);
        assert_eq!(decode_key(&encoded).unwrap(), key);
        assert_eq!(decode_key(&format!("{encoded}\n")).unwrap(), key);
    }

    #[test]
    fn wrong_length_rejected() {
        let short = base64::engine::general_purpose::STANDARD.encode([1u8; 16]);
        assert!(decode_key(&short).is_err());
        assert!(decode_key("not base64 at all!").is_err());
    }
}

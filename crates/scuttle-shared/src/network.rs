//! Network-scoping keys.
//!
//! The network key authenticates the handshake so that nodes of different
//! networks cannot talk to each other; the message HMAC key scopes message
//! signatures the same way.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha512;

use crate::constants::DEFAULT_NETWORK_KEY_HEX;

type HmacSha512 = Hmac<Sha512>;

/// HMAC-SHA-512 truncated to 32 bytes (NaCl `crypto_auth`).
pub fn auth_tag(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    let mut mac =
        <HmacSha512 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    let full = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&full[..32]);
    out
}

/// Verify a `crypto_auth` tag in constant time.
pub fn verify_auth_tag(key: &[u8; 32], data: &[u8], tag: &[u8]) -> bool {
    let mut mac = match <HmacSha512 as Mac>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(data);
    mac.verify_truncated_left(tag).is_ok()
}

/// Parse 32 bytes given as hex or standard base64.
pub fn parse_key_32(s: &str) -> Option<[u8; 32]> {
    let s = s.trim();
    let bytes = if s.len() == 64 {
        hex::decode(s).ok()?
    } else {
        STANDARD.decode(s).ok()?
    };
    if bytes.len() != 32 {
        return None;
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Some(key)
}

/// 32-byte key scoping the secret handshake to one network.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NetworkKey([u8; 32]);

impl NetworkKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn parse(s: &str) -> Option<Self> {
        parse_key_32(s).map(Self)
    }
}

impl Default for NetworkKey {
    /// The main public network.
    fn default() -> Self {
        let mut key = [0u8; 32];
        // The constant is a valid 64-char hex string.
        if let Ok(bytes) = hex::decode(DEFAULT_NETWORK_KEY_HEX) {
            key.copy_from_slice(&bytes);
        }
        Self(key)
    }
}

impl std::fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NetworkKey({}..)", &hex::encode(self.0)[..8])
    }
}

/// Optional key applied to message signatures. Empty means plain signatures.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHmac(Option<[u8; 32]>);

impl MessageHmac {
    pub fn new(key: [u8; 32]) -> Self {
        Self(Some(key))
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub fn parse(s: &str) -> Option<Self> {
        if s.trim().is_empty() {
            return Some(Self::none());
        }
        parse_key_32(s).map(Self::new)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Bytes that are actually signed for the given canonical message bytes.
    pub fn prepare(&self, data: &[u8]) -> Vec<u8> {
        match &self.0 {
            Some(key) => auth_tag(key, data).to_vec(),
            None => data.to_vec(),
        }
    }
}

impl std::fmt::Debug for MessageHmac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(_) => f.write_str("MessageHmac(set)"),
            None => f.write_str("MessageHmac(none)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_network_key() {
        let key = NetworkKey::default();
        assert_eq!(hex::encode(key.as_bytes()), DEFAULT_NETWORK_KEY_HEX);
    }

    #[test]
    fn test_auth_tag_verifies() {
        let key = [7u8; 32];
        let tag = auth_tag(&key, b"data");
        assert!(verify_auth_tag(&key, b"data", &tag));
        assert!(!verify_auth_tag(&key, b"other", &tag));
        assert!(!verify_auth_tag(&[8u8; 32], b"data", &tag));
    }

    #[test]
    fn test_parse_key_hex_and_base64() {
        let hex_key = "ab".repeat(32);
        assert_eq!(parse_key_32(&hex_key), Some([0xab; 32]));
        let b64 = STANDARD.encode([0x11u8; 32]);
        assert_eq!(parse_key_32(&b64), Some([0x11; 32]));
        assert_eq!(parse_key_32("abcd"), None);
    }

    #[test]
    fn test_message_hmac_prepare() {
        assert_eq!(MessageHmac::none().prepare(b"abc"), b"abc".to_vec());
        let hmac = MessageHmac::new([1u8; 32]);
        assert_eq!(hmac.prepare(b"abc").len(), 32);
    }
}

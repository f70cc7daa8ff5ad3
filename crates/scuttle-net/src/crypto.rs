//! NaCl primitives shared by the handshake and the box stream.

use crypto_secretbox::aead::{AeadInPlace, KeyInit};
use crypto_secretbox::{Key, Nonce, Tag, XSalsa20Poly1305};
use sha2::{Digest, Sha256};

pub(crate) const TAG_LEN: usize = 16;
pub(crate) const ZERO_NONCE: [u8; 24] = [0u8; 24];

pub(crate) fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Encrypt `buf` in place, returning the detached authenticator.
pub(crate) fn seal_detached(key: &[u8; 32], nonce: &[u8; 24], buf: &mut [u8]) -> [u8; TAG_LEN] {
    let cipher = XSalsa20Poly1305::new(Key::from_slice(key));
    let mut out = [0u8; TAG_LEN];
    // Only fails for buffers larger than the cipher's keystream.
    if let Ok(tag) = cipher.encrypt_in_place_detached(Nonce::from_slice(nonce), b"", buf) {
        out.copy_from_slice(&tag);
    }
    out
}

/// Decrypt `buf` in place; false when the authenticator does not match.
pub(crate) fn open_detached(
    key: &[u8; 32],
    nonce: &[u8; 24],
    buf: &mut [u8],
    tag: &[u8],
) -> bool {
    let cipher = XSalsa20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(nonce), b"", buf, Tag::from_slice(tag))
        .is_ok()
}

/// Secretbox in the NaCl layout: `tag || ciphertext`.
pub(crate) fn seal(key: &[u8; 32], nonce: &[u8; 24], plaintext: &[u8]) -> Vec<u8> {
    let mut body = plaintext.to_vec();
    let tag = seal_detached(key, nonce, &mut body);
    let mut out = Vec::with_capacity(TAG_LEN + body.len());
    out.extend_from_slice(&tag);
    out.extend_from_slice(&body);
    out
}

pub(crate) fn open(key: &[u8; 32], nonce: &[u8; 24], boxed: &[u8]) -> Option<Vec<u8>> {
    if boxed.len() < TAG_LEN {
        return None;
    }
    let (tag, ciphertext) = boxed.split_at(TAG_LEN);
    let mut body = ciphertext.to_vec();
    open_detached(key, nonce, &mut body, tag).then_some(body)
}

pub(crate) fn increment_nonce(nonce: &mut [u8; 24]) {
    for byte in nonce.iter_mut().rev() {
        let (value, overflow) = byte.overflowing_add(1);
        *byte = value;
        if !overflow {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = [3u8; 32];
        let boxed = seal(&key, &ZERO_NONCE, b"secret");
        assert_eq!(boxed.len(), TAG_LEN + 6);
        assert_eq!(open(&key, &ZERO_NONCE, &boxed).unwrap(), b"secret");
        assert!(open(&[4u8; 32], &ZERO_NONCE, &boxed).is_none());
    }

    #[test]
    fn test_increment_nonce_carries() {
        let mut nonce = [0u8; 24];
        nonce[23] = 0xff;
        nonce[22] = 0xff;
        increment_nonce(&mut nonce);
        assert_eq!(nonce[21], 1);
        assert_eq!(nonce[22], 0);
        assert_eq!(nonce[23], 0);
    }
}

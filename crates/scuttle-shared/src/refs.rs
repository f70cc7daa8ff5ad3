//! Sigil-encoded references.
//!
//! Every addressable thing in the network is named by a 32-byte value rendered
//! as `<sigil><base64>.<suffix>`:
//!
//! - feeds / identities: `@<key>.ed25519`
//! - messages:           `%<sha256>.sha256`
//! - blobs:              `&<sha256>.sha256`

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::constants::{HASH_SIZE, SUFFIX_ED25519, SUFFIX_SHA256};
use crate::error::RefError;

pub const FEED_SIGIL: char = '@';
pub const MESSAGE_SIGIL: char = '%';
pub const BLOB_SIGIL: char = '&';

fn parse_sigil(s: &str, sigil: char, suffix: &'static str) -> Result<[u8; 32], RefError> {
    let rest = s
        .strip_prefix(sigil)
        .ok_or(RefError::MissingSigil { expected: sigil })?;
    let payload = rest
        .strip_suffix(suffix)
        .and_then(|p| p.strip_suffix('.'))
        .ok_or(RefError::MissingSuffix { expected: suffix })?;
    let bytes = STANDARD
        .decode(payload)
        .map_err(|_| RefError::InvalidBase64)?;
    if bytes.len() != HASH_SIZE {
        return Err(RefError::InvalidLength(bytes.len()));
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

fn format_sigil(f: &mut fmt::Formatter<'_>, sigil: char, bytes: &[u8; 32], suffix: &str) -> fmt::Result {
    write!(f, "{}{}.{}", sigil, STANDARD.encode(bytes), suffix)
}

/// Implements string-based serde for a reference type using its
/// `Display`/`FromStr` pair.
macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

// ---------------------------------------------------------------------------
// PublicIdentity
// ---------------------------------------------------------------------------

/// The public half of an Ed25519 identity (`@<base64>.ed25519`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicIdentity([u8; 32]);

impl PublicIdentity {
    /// Build from raw key bytes, rejecting bytes that are not a valid point.
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, RefError> {
        VerifyingKey::from_bytes(&bytes).map_err(|_| RefError::InvalidKey)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, RefError> {
        VerifyingKey::from_bytes(&self.0).map_err(|_| RefError::InvalidKey)
    }

    /// Short form used in log lines.
    pub fn short(&self) -> String {
        let full = STANDARD.encode(self.0);
        format!("@{}", &full[..8])
    }
}

impl From<VerifyingKey> for PublicIdentity {
    fn from(key: VerifyingKey) -> Self {
        Self(key.to_bytes())
    }
}

impl fmt::Display for PublicIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_sigil(f, FEED_SIGIL, &self.0, SUFFIX_ED25519)
    }
}

impl fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicIdentity({self})")
    }
}

impl FromStr for PublicIdentity {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(parse_sigil(s, FEED_SIGIL, SUFFIX_ED25519)?)
    }
}

string_serde!(PublicIdentity);

// ---------------------------------------------------------------------------
// FeedRef
// ---------------------------------------------------------------------------

/// The append-only log authored by one identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedRef(PublicIdentity);

impl FeedRef {
    pub fn identity(&self) -> PublicIdentity {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl From<PublicIdentity> for FeedRef {
    fn from(identity: PublicIdentity) -> Self {
        Self(identity)
    }
}

impl From<FeedRef> for PublicIdentity {
    fn from(feed: FeedRef) -> Self {
        feed.0
    }
}

impl fmt::Display for FeedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for FeedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FeedRef({})", self.0)
    }
}

impl FromStr for FeedRef {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<PublicIdentity>().map(Self)
    }
}

string_serde!(FeedRef);

// ---------------------------------------------------------------------------
// MessageRef
// ---------------------------------------------------------------------------

/// SHA-256 of a signed message (`%<base64>.sha256`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageRef([u8; 32]);

impl MessageRef {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_sigil(f, MESSAGE_SIGIL, &self.0, SUFFIX_SHA256)
    }
}

impl fmt::Debug for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageRef({self})")
    }
}

impl FromStr for MessageRef {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_sigil(s, MESSAGE_SIGIL, SUFFIX_SHA256).map(Self)
    }
}

string_serde!(MessageRef);

// ---------------------------------------------------------------------------
// BlobRef
// ---------------------------------------------------------------------------

/// SHA-256 of blob content (`&<base64>.sha256`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobRef([u8; 32]);

impl BlobRef {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Reference of the given content.
    pub fn of_content(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex of the hash; the on-disk file name.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_sigil(f, BLOB_SIGIL, &self.0, SUFFIX_SHA256)
    }
}

impl fmt::Debug for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobRef({self})")
    }
}

impl FromStr for BlobRef {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_sigil(s, BLOB_SIGIL, SUFFIX_SHA256).map(Self)
    }
}

string_serde!(BlobRef);

// ---------------------------------------------------------------------------
// BanHash
// ---------------------------------------------------------------------------

/// SHA-256 over a reference's sigil string. Ban lists carry these instead of
/// the plaintext refs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BanHash([u8; 32]);

impl BanHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn of_feed(feed: &FeedRef) -> Self {
        Self(Sha256::digest(feed.to_string().as_bytes()).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, RefError> {
        let bytes = hex::decode(s.trim()).map_err(|_| RefError::InvalidBase64)?;
        if bytes.len() != HASH_SIZE {
            return Err(RefError::InvalidLength(bytes.len()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Display for BanHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BanHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BanHash({})", self.to_hex())
    }
}

impl FromStr for BanHash {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

string_serde!(BanHash);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    #[test]
    fn test_feed_ref_roundtrip() {
        let id = Identity::generate();
        let feed = FeedRef::from(id.public());
        let s = feed.to_string();
        assert!(s.starts_with('@'));
        assert!(s.ends_with(".ed25519"));
        assert_eq!(s.parse::<FeedRef>().unwrap(), feed);
    }

    #[test]
    fn test_message_ref_parse() {
        let s = "%uRECWB4KIeKoNMis2UYWyB2aQPvWmS3OePQvBj2zClg=.sha256";
        let r: MessageRef = s.parse().unwrap();
        assert_eq!(r.to_string(), s);
    }

    #[test]
    fn test_wrong_sigil_rejected() {
        let s = "&uRECWB4KIeKoNMis2UYWyB2aQPvWmS3OePQvBj2zClg=.sha256";
        assert_eq!(
            s.parse::<MessageRef>(),
            Err(RefError::MissingSigil { expected: '%' })
        );
    }

    #[test]
    fn test_wrong_suffix_rejected() {
        let s = "%uRECWB4KIeKoNMis2UYWyB2aQPvWmS3OePQvBj2zClg=.sha512";
        assert!(s.parse::<MessageRef>().is_err());
    }

    #[test]
    fn test_short_payload_rejected() {
        assert_eq!(
            "&AAAA.sha256".parse::<BlobRef>(),
            Err(RefError::InvalidLength(3))
        );
    }

    #[test]
    fn test_blob_ref_of_content() {
        let a = BlobRef::of_content(b"hello");
        let b = BlobRef::of_content(b"hello");
        assert_eq!(a, b);
        assert_ne!(a, BlobRef::of_content(b"world"));
        assert_eq!(a.to_hex().len(), 64);
    }

    #[test]
    fn test_ban_hash_is_hash_of_sigil() {
        let feed = FeedRef::from(Identity::generate().public());
        let hash = BanHash::of_feed(&feed);
        let expected: [u8; 32] = Sha256::digest(feed.to_string().as_bytes()).into();
        assert_eq!(hash.as_bytes(), &expected);
        assert_eq!(BanHash::from_hex(&hash.to_hex()).unwrap(), hash);
    }

    #[test]
    fn test_serde_as_string() {
        let blob = BlobRef::of_content(b"x");
        let json = serde_json::to_string(&blob).unwrap();
        assert_eq!(json, format!("\"{blob}\""));
        let back: BlobRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, blob);
    }
}

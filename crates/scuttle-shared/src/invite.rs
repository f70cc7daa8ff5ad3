use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::InviteError;
use crate::identity::Identity;
use crate::refs::PublicIdentity;

/// A pub invite: where to dial, whom to expect, and the seed of the
/// single-use key to dial with.
///
/// Accepted forms:
/// - `host:port:@key.ed25519~seed`
/// - `net:host:port~shs:key:seed` (multiserver address with seed)
#[derive(Clone, PartialEq, Eq)]
pub struct Invite {
    pub address: String,
    pub remote: PublicIdentity,
    seed: [u8; 32],
}

impl Invite {
    pub fn new(address: String, remote: PublicIdentity, seed: [u8; 32]) -> Self {
        Self {
            address,
            remote,
            seed,
        }
    }

    pub fn seed(&self) -> &[u8; 32] {
        &self.seed
    }

    /// Keypair the invite's holder dials the pub with.
    pub fn identity(&self) -> Identity {
        Identity::from_seed(&self.seed)
    }

    fn parse_legacy(s: &str) -> Result<Self, InviteError> {
        let (address_and_key, seed) = s
            .rsplit_once('~')
            .ok_or_else(|| InviteError::Malformed("missing seed".to_string()))?;
        let (address, key) = address_and_key
            .rsplit_once(":@")
            .ok_or_else(|| InviteError::Malformed("missing pub key".to_string()))?;
        let remote: PublicIdentity = format!("@{key}").parse()?;
        Ok(Self::new(address.to_string(), remote, decode_seed(seed)?))
    }

    fn parse_multiserver(s: &str) -> Result<Self, InviteError> {
        let rest = s
            .strip_prefix("net:")
            .ok_or_else(|| InviteError::Malformed("expected 'net:' prefix".to_string()))?;
        let (address, shs) = rest
            .split_once("~shs:")
            .ok_or_else(|| InviteError::Malformed("missing shs section".to_string()))?;
        let (key, seed) = shs
            .split_once(':')
            .ok_or_else(|| InviteError::Malformed("missing seed".to_string()))?;
        let remote: PublicIdentity = format!("@{key}.ed25519").parse()?;
        Ok(Self::new(address.to_string(), remote, decode_seed(seed)?))
    }
}

fn decode_seed(s: &str) -> Result<[u8; 32], InviteError> {
    let bytes = STANDARD
        .decode(s.trim())
        .map_err(|_| InviteError::Malformed("seed is not base64".to_string()))?;
    bytes
        .try_into()
        .map_err(|_| InviteError::Malformed("seed must be 32 bytes".to_string()))
}

impl FromStr for Invite {
    type Err = InviteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.starts_with("net:") {
            Self::parse_multiserver(s)
        } else {
            Self::parse_legacy(s)
        }
    }
}

impl fmt::Display for Invite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let remote = self.remote.to_string();
        write!(
            f,
            "{}:{}~{}",
            self.address,
            remote,
            STANDARD.encode(self.seed)
        )
    }
}

impl fmt::Debug for Invite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invite")
            .field("address", &self.address)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

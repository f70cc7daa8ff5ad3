use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::IdentityError;
use crate::refs::{FeedRef, PublicIdentity};

/// An Ed25519 keypair. The public half names the identity's feed.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

/// Serializable secret file format (`{curve, public, private, id}`), as
/// written by other Scuttlebutt implementations.
#[derive(Debug, Serialize, Deserialize)]
pub struct SecretFile {
    pub curve: String,
    /// `<base64 public key>.ed25519`
    pub public: String,
    /// `<base64 seed || public key>.ed25519`
    pub private: String,
    /// `@<base64 public key>.ed25519`
    pub id: String,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore an identity from its 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Public identity (`@<base64>.ed25519`)
    pub fn public(&self) -> PublicIdentity {
        PublicIdentity::from(self.signing_key.verifying_key())
    }

    /// The feed authored by this identity
    pub fn feed(&self) -> FeedRef {
        FeedRef::from(self.public())
    }

    pub fn seed(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Curve25519 secret scalar derived from the Ed25519 seed, as used by the
    /// secret handshake for long-term Diffie-Hellman.
    pub fn to_curve25519_secret(&self) -> x25519_dalek::StaticSecret {
        x25519_dalek::StaticSecret::from(self.signing_key.to_scalar_bytes())
    }

    /// Export in the secret file format
    pub fn to_secret_file(&self) -> SecretFile {
        let public = STANDARD.encode(self.signing_key.verifying_key().to_bytes());
        let mut keypair = [0u8; 64];
        keypair[..32].copy_from_slice(self.signing_key.as_bytes());
        keypair[32..].copy_from_slice(self.signing_key.verifying_key().as_bytes());
        SecretFile {
            curve: "ed25519".to_string(),
            public: format!("{public}.ed25519"),
            private: format!("{}.ed25519", STANDARD.encode(keypair)),
            id: self.public().to_string(),
        }
    }

    /// Import from the secret file format
    pub fn from_secret_file(file: &SecretFile) -> Result<Self, IdentityError> {
        if file.curve != "ed25519" {
            return Err(IdentityError::KeyFile(format!(
                "unsupported curve '{}'",
                file.curve
            )));
        }
        let encoded = file
            .private
            .strip_suffix(".ed25519")
            .unwrap_or(&file.private);
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| IdentityError::KeyFile(format!("invalid private key: {e}")))?;
        if bytes.len() != 64 && bytes.len() != 32 {
            return Err(IdentityError::InvalidKeyBytes);
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&bytes[..32]);
        let identity = Self::from_seed(&seed);

        if bytes.len() == 64 && bytes[32..] != identity.public().as_bytes()[..] {
            return Err(IdentityError::KeyFile(
                "public key does not match private key".to_string(),
            ));
        }
        Ok(identity)
    }

    /// Load the identity stored at `path`, or generate and persist a new one.
    pub fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| IdentityError::KeyFile(e.to_string()))?;
            // Legacy secret files carry comment lines starting with '#'.
            let json: String = content
                .lines()
                .filter(|line| !line.trim_start().starts_with('#'))
                .collect::<Vec<_>>()
                .join("\n");
            let file: SecretFile = serde_json::from_str(&json)
                .map_err(|e| IdentityError::KeyFile(e.to_string()))?;
            return Self::from_secret_file(&file);
        }

        let identity = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| IdentityError::KeyFile(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(&identity.to_secret_file())
            .map_err(|e| IdentityError::KeyFile(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| IdentityError::KeyFile(e.to_string()))?;
        Ok(identity)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public", &self.public())
            .finish_non_exhaustive()
    }
}

/// Verify a detached signature made by `identity`
pub fn verify_signature(
    identity: &PublicIdentity,
    message: &[u8],
    signature: &Signature,
) -> Result<(), IdentityError> {
    let verifying_key = identity
        .verifying_key()
        .map_err(|_| IdentityError::InvalidKeyBytes)?;
    verifying_key
        .verify(message, signature)
        .map_err(|_| IdentityError::InvalidSignature)
}

/// Curve25519 public key for a remote Ed25519 identity.
pub fn to_curve25519_public(
    identity: &PublicIdentity,
) -> Result<x25519_dalek::PublicKey, IdentityError> {
    let verifying_key = identity
        .verifying_key()
        .map_err(|_| IdentityError::InvalidKeyBytes)?;
    Ok(x25519_dalek::PublicKey::from(
        verifying_key.to_montgomery().to_bytes(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_from_seed_is_deterministic() {
        let id = Identity::generate();
        let restored = Identity::from_seed(id.seed());
        assert_eq!(id.public(), restored.public());
    }

    #[test]
    fn test_secret_file_roundtrip() {
        let id = Identity::generate();
        let file = id.to_secret_file();
        assert_eq!(file.id, id.public().to_string());
        let restored = Identity::from_secret_file(&file).unwrap();
        assert_eq!(id.public(), restored.public());
    }

    #[test]
    fn test_sign_verify() {
        let id = Identity::generate();
        let message = b"Hello, Scuttlebutt!";
        let signature = id.sign(message);

        assert!(verify_signature(&id.public(), message, &signature).is_ok());
        assert!(verify_signature(&id.public(), b"wrong", &signature).is_err());
    }

    #[test]
    fn test_curve25519_agreement_matches() {
        let a = Identity::generate();
        let b = Identity::generate();

        let ab = a
            .to_curve25519_secret()
            .diffie_hellman(&to_curve25519_public(&b.public()).unwrap());
        let ba = b
            .to_curve25519_secret()
            .diffie_hellman(&to_curve25519_public(&a.public()).unwrap());
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_load_or_generate_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret");
        let first = Identity::load_or_generate(&path).unwrap();
        let second = Identity::load_or_generate(&path).unwrap();
        assert_eq!(first.public(), second.public());
    }
}

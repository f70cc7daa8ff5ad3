//! Secret Handshake (SHS) over any async byte stream.
//!
//! 1. client -> server: `auth_tag(K, a_eph) || a_eph`
//! 2. server -> client: `auth_tag(K, b_eph) || b_eph`
//! 3. client -> server: `box[K|ab|aB](sig_A(K|B|sha256(ab)) || A)`
//! 4. server -> client: `box[K|ab|aB|Ab](sig_B(K|sig_A|A|sha256(ab)))`
//!
//! The result carries independent keys and nonces for each direction.

use std::time::Duration;

use ed25519_dalek::Signature;
use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use x25519_dalek::{PublicKey as CurvePublic, SharedSecret, StaticSecret};

use scuttle_shared::constants::HANDSHAKE_TIMEOUT_SECS;
use scuttle_shared::identity::{to_curve25519_public, verify_signature};
use scuttle_shared::network::{auth_tag, verify_auth_tag};
use scuttle_shared::{Identity, NetworkKey, PublicIdentity};

use crate::boxstream::BoxKeys;
use crate::crypto::{open, seal, sha256, ZERO_NONCE};
use crate::error::{HandshakeCause, HandshakeError};

const HELLO_LEN: usize = 64;
const CLIENT_AUTH_LEN: usize = 112;
const SERVER_ACCEPT_LEN: usize = 80;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(HANDSHAKE_TIMEOUT_SECS);

/// Outcome of a successful handshake.
#[derive(Debug, Clone)]
pub struct HandshakeResult {
    pub remote: PublicIdentity,
    pub write: BoxKeys,
    pub read: BoxKeys,
}

struct Ephemeral {
    secret: StaticSecret,
    public: CurvePublic,
}

impl Ephemeral {
    fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = CurvePublic::from(&secret);
        Self { secret, public }
    }

    fn hello(&self, network_key: &NetworkKey) -> [u8; HELLO_LEN] {
        let mut hello = [0u8; HELLO_LEN];
        hello[..32].copy_from_slice(&auth_tag(network_key.as_bytes(), self.public.as_bytes()));
        hello[32..].copy_from_slice(self.public.as_bytes());
        hello
    }
}

fn check_hello(network_key: &NetworkKey, hello: &[u8; HELLO_LEN]) -> Option<CurvePublic> {
    let (tag, key) = hello.split_at(32);
    if !verify_auth_tag(network_key.as_bytes(), key, tag) {
        return None;
    }
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(key);
    Some(CurvePublic::from(bytes))
}

/// Shared secrets known to both sides once step 3 is through.
struct Secrets {
    network_key: [u8; 32],
    ab: SharedSecret,
    a_b: SharedSecret,
    a_b2: Option<SharedSecret>,
}

impl Secrets {
    fn hash_ab(&self) -> [u8; 32] {
        sha256(&[self.ab.as_bytes()])
    }

    fn client_auth_key(&self) -> [u8; 32] {
        sha256(&[&self.network_key, self.ab.as_bytes(), self.a_b.as_bytes()])
    }

    fn server_accept_key(&self) -> Option<[u8; 32]> {
        let ab2 = self.a_b2.as_ref()?;
        Some(sha256(&[
            &self.network_key,
            self.ab.as_bytes(),
            self.a_b.as_bytes(),
            ab2.as_bytes(),
        ]))
    }

    /// Box stream keys for a side whose long-term key is `local` and whose
    /// peer used ephemeral key `remote_eph`.
    fn box_keys(
        &self,
        local: &PublicIdentity,
        local_eph: &CurvePublic,
        remote: &PublicIdentity,
        remote_eph: &CurvePublic,
    ) -> Option<(BoxKeys, BoxKeys)> {
        let shared = sha256(&[&self.server_accept_key()?]);
        let nonce = |eph: &CurvePublic| {
            let tag = auth_tag(&self.network_key, eph.as_bytes());
            let mut nonce = [0u8; 24];
            nonce.copy_from_slice(&tag[..24]);
            nonce
        };
        let read = BoxKeys {
            key: sha256(&[&shared, local.as_bytes()]),
            nonce: nonce(local_eph),
        };
        let write = BoxKeys {
            key: sha256(&[&shared, remote.as_bytes()]),
            nonce: nonce(remote_eph),
        };
        Some((read, write))
    }
}

async fn read_array<S, const N: usize>(io: &mut S) -> std::io::Result<[u8; N]>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; N];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn send<S>(io: &mut S, data: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    io.write_all(data).await?;
    io.flush().await
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Run the client side against a server expected to be `remote`.
pub async fn client<S>(
    io: &mut S,
    identity: &Identity,
    network_key: &NetworkKey,
    remote: &PublicIdentity,
) -> Result<HandshakeResult, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut step = 1;
    match tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        run_client(io, identity, network_key, remote, &mut step),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::new(step, HandshakeCause::Timeout)),
    }
}

async fn run_client<S>(
    io: &mut S,
    identity: &Identity,
    network_key: &NetworkKey,
    remote: &PublicIdentity,
    step: &mut u8,
) -> Result<HandshakeResult, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let local = identity.public();
    let remote_curve = to_curve25519_public(remote)
        .map_err(|_| HandshakeError::new(1, HandshakeCause::Signature))?;
    let eph = Ephemeral::generate();

    send(io, &eph.hello(network_key))
        .await
        .map_err(|e| HandshakeError::new(1, e))?;

    *step = 2;
    let hello = read_array::<_, HELLO_LEN>(io)
        .await
        .map_err(|e| HandshakeError::new(2, e))?;
    let server_eph = check_hello(network_key, &hello)
        .ok_or_else(|| HandshakeError::new(2, HandshakeCause::NetworkKey))?;

    *step = 3;
    let mut secrets = Secrets {
        network_key: *network_key.as_bytes(),
        ab: eph.secret.diffie_hellman(&server_eph),
        a_b: eph.secret.diffie_hellman(&remote_curve),
        a_b2: None,
    };
    let signed = [&secrets.network_key[..], remote.as_bytes(), &secrets.hash_ab()].concat();
    let sig_a = identity.sign(&signed).to_bytes();
    let auth = seal(
        &secrets.client_auth_key(),
        &ZERO_NONCE,
        &[&sig_a[..], local.as_bytes()].concat(),
    );
    send(io, &auth).await.map_err(|e| HandshakeError::new(3, e))?;

    *step = 4;
    secrets.a_b2 = Some(identity.to_curve25519_secret().diffie_hellman(&server_eph));
    let accept = read_array::<_, SERVER_ACCEPT_LEN>(io)
        .await
        .map_err(|e| HandshakeError::new(4, e))?;
    let accept_key = secrets
        .server_accept_key()
        .ok_or_else(|| HandshakeError::new(4, HandshakeCause::Decrypt))?;
    let sig_b = open(&accept_key, &ZERO_NONCE, &accept)
        .ok_or_else(|| HandshakeError::new(4, HandshakeCause::Decrypt))?;
    let sig_b = Signature::from_slice(&sig_b)
        .map_err(|_| HandshakeError::new(4, HandshakeCause::Signature))?;
    let expected = [
        &secrets.network_key[..],
        &sig_a,
        local.as_bytes(),
        &secrets.hash_ab(),
    ]
    .concat();
    verify_signature(remote, &expected, &sig_b)
        .map_err(|_| HandshakeError::new(4, HandshakeCause::Signature))?;

    let (read, write) = secrets
        .box_keys(&local, &eph.public, remote, &server_eph)
        .ok_or_else(|| HandshakeError::new(4, HandshakeCause::Decrypt))?;
    Ok(HandshakeResult {
        remote: *remote,
        write,
        read,
    })
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Run the server side; the client's identity is learned at step 3.
pub async fn server<S>(
    io: &mut S,
    identity: &Identity,
    network_key: &NetworkKey,
) -> Result<HandshakeResult, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut step = 1;
    match tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        run_server(io, identity, network_key, &mut step),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::new(step, HandshakeCause::Timeout)),
    }
}

async fn run_server<S>(
    io: &mut S,
    identity: &Identity,
    network_key: &NetworkKey,
    step: &mut u8,
) -> Result<HandshakeResult, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let local = identity.public();
    let hello = read_array::<_, HELLO_LEN>(io)
        .await
        .map_err(|e| HandshakeError::new(1, e))?;
    let client_eph = check_hello(network_key, &hello)
        .ok_or_else(|| HandshakeError::new(1, HandshakeCause::NetworkKey))?;

    *step = 2;
    let eph = Ephemeral::generate();
    send(io, &eph.hello(network_key))
        .await
        .map_err(|e| HandshakeError::new(2, e))?;

    *step = 3;
    let mut secrets = Secrets {
        network_key: *network_key.as_bytes(),
        ab: eph.secret.diffie_hellman(&client_eph),
        a_b: identity.to_curve25519_secret().diffie_hellman(&client_eph),
        a_b2: None,
    };
    let auth = read_array::<_, CLIENT_AUTH_LEN>(io)
        .await
        .map_err(|e| HandshakeError::new(3, e))?;
    let plain = open(&secrets.client_auth_key(), &ZERO_NONCE, &auth)
        .ok_or_else(|| HandshakeError::new(3, HandshakeCause::Decrypt))?;
    let (sig_a, client_key) = plain.split_at(64);

    let mut key_bytes = [0u8; 32];
    key_bytes.copy_from_slice(client_key);
    let remote = PublicIdentity::from_bytes(key_bytes).map_err(|e| HandshakeError::new(3, e))?;
    let sig = Signature::from_slice(sig_a)
        .map_err(|_| HandshakeError::new(3, HandshakeCause::Signature))?;
    let signed = [&secrets.network_key[..], local.as_bytes(), &secrets.hash_ab()].concat();
    verify_signature(&remote, &signed, &sig)
        .map_err(|_| HandshakeError::new(3, HandshakeCause::Signature))?;

    *step = 4;
    let remote_curve =
        to_curve25519_public(&remote).map_err(|_| HandshakeError::new(4, HandshakeCause::Signature))?;
    secrets.a_b2 = Some(eph.secret.diffie_hellman(&remote_curve));
    let accept_key = secrets
        .server_accept_key()
        .ok_or_else(|| HandshakeError::new(4, HandshakeCause::Decrypt))?;
    let to_sign = [
        &secrets.network_key[..],
        sig_a,
        remote.as_bytes(),
        &secrets.hash_ab(),
    ]
    .concat();
    let sig_b = identity.sign(&to_sign).to_bytes();
    send(io, &seal(&accept_key, &ZERO_NONCE, &sig_b))
        .await
        .map_err(|e| HandshakeError::new(4, e))?;

    let (read, write) = secrets
        .box_keys(&local, &eph.public, &remote, &client_eph)
        .ok_or_else(|| HandshakeError::new(4, HandshakeCause::Decrypt))?;
    Ok(HandshakeResult {
        remote,
        write,
        read,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxstream::box_stream;

    #[tokio::test]
    async fn test_handshake_then_ping_pong() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let bob_public = bob.public();
        let key = NetworkKey::default();

        let (mut client_io, mut server_io) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            let result = server(&mut server_io, &bob, &key).await.unwrap();
            let (mut reader, mut writer) = box_stream(server_io, result.read, result.write);
            let mut ping = [0u8; 4];
            reader.read_exact(&mut ping).await.unwrap();
            assert_eq!(&ping, b"ping");
            writer.write_all(b"pong").await.unwrap();
            result.remote
        });

        let result = client(&mut client_io, &alice, &key, &bob_public)
            .await
            .unwrap();
        assert_eq!(result.remote, bob_public);
        assert_ne!(result.read, result.write);

        let (mut reader, mut writer) = box_stream(client_io, result.read, result.write);
        writer.write_all(b"ping").await.unwrap();
        let mut pong = [0u8; 4];
        reader.read_exact(&mut pong).await.unwrap();
        assert_eq!(&pong, b"pong");

        assert_eq!(server_task.await.unwrap(), alice.public());
    }

    #[tokio::test]
    async fn test_network_key_mismatch_fails_at_step_two() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let bob_public = bob.public();

        let (mut client_io, mut server_io) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            let other = NetworkKey::new([42u8; 32]);
            server(&mut server_io, &bob, &other).await
        });

        let err = client(&mut client_io, &alice, &NetworkKey::default(), &bob_public)
            .await
            .unwrap_err();
        assert_eq!(err.step, 2);

        let server_err = server_task.await.unwrap().unwrap_err();
        assert_eq!(server_err.step, 1);
        assert!(matches!(server_err.cause, HandshakeCause::NetworkKey));
    }

    #[tokio::test]
    async fn test_wrong_server_identity_is_rejected() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let impostor = Identity::generate().public();
        let key = NetworkKey::default();

        let (mut client_io, mut server_io) = tokio::io::duplex(4096);
        let server_task =
            tokio::spawn(async move { server(&mut server_io, &bob, &key).await });

        let err = client(&mut client_io, &alice, &key, &impostor)
            .await
            .unwrap_err();
        assert!(err.step >= 3);

        let server_err = server_task.await.unwrap().unwrap_err();
        assert_eq!(server_err.step, 3);
    }
}

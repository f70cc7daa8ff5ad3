/// Application name
pub const APP_NAME: &str = "scuttle";

/// Network key of the main public Scuttlebutt network (hex).
pub const DEFAULT_NETWORK_KEY_HEX: &str =
    "d4a1cb88a66f02f8db635ce26441cc5dac1b08420ceaac230839b755845a9ffb";

/// Default TCP port for peer connections
pub const DEFAULT_PORT: u16 = 8008;

/// Default TCP listen address (host part empty means all interfaces)
pub const DEFAULT_LISTEN_ADDRESS: &str = ":8008";

/// Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Ed25519 seed size in bytes
pub const SEED_SIZE: usize = 32;

/// Ed25519 signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Size of a SHA-256 digest, used by message and blob references
pub const HASH_SIZE: usize = 32;

/// Legacy messages larger than this (in UTF-16 code units) are rejected.
pub const MAX_MESSAGE_SIZE: usize = 8192;

/// Default maximum blob size accepted from peers (5 MiB)
pub const DEFAULT_MAX_BLOB_SIZE: u64 = 5 * 1024 * 1024;

/// Default number of social-graph hops to replicate
pub const DEFAULT_HOPS: u32 = 2;

/// Handshake deadline in seconds
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 15;

/// Default deadline for async RPC requests in seconds
pub const RPC_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Sigil suffixes
pub const SUFFIX_ED25519: &str = "ed25519";
pub const SUFFIX_SHA256: &str = "sha256";

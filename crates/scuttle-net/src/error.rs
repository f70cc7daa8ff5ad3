use std::fmt;

use serde_json::Value;
use thiserror::Error;

use scuttle_shared::RefError;

#[derive(Error, Debug)]
pub enum BoxStreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Box stream authentication failed")]
    Authentication,

    #[error("Box stream closed by remote")]
    Closed,
}

/// What went wrong during one handshake step.
#[derive(Error, Debug)]
pub enum HandshakeCause {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out")]
    Timeout,

    #[error("network key mismatch")]
    NetworkKey,

    #[error("decryption failed")]
    Decrypt,

    #[error("invalid signature")]
    Signature,

    #[error("invalid key: {0}")]
    Key(#[from] RefError),
}

#[derive(Error, Debug)]
#[error("Handshake failed at step {step}: {cause}")]
pub struct HandshakeError {
    pub step: u8,
    #[source]
    pub cause: HandshakeCause,
}

impl HandshakeError {
    pub fn new(step: u8, cause: impl Into<HandshakeCause>) -> Self {
        Self {
            step,
            cause: cause.into(),
        }
    }
}

/// Error payload sent by the remote side of an RPC stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub name: String,
    pub message: String,
    pub stack: String,
    pub raw: Value,
}

impl RemoteError {
    pub fn from_value(raw: Value) -> Self {
        let field = |key: &str| {
            raw.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            name: field("name"),
            message: field("message"),
            stack: field("stack"),
            raw,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

#[derive(Error, Debug, Clone)]
pub enum RpcError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Remote error: {0}")]
    Remote(RemoteError),

    #[error("Request timed out")]
    Timeout,

    #[error("Request cancelled")]
    Cancelled,
}

impl RpcError {
    /// True for remote errors whose message contains `needle`.
    pub fn remote_message_contains(&self, needle: &str) -> bool {
        matches!(self, RpcError::Remote(e) if e.message.contains(needle))
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Protocol(format!("invalid JSON body: {e}"))
    }
}

#[derive(Error, Debug)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Peer rejected: {0}")]
    Rejected(String),

    #[error("Unknown peer {0}")]
    UnknownPeer(String),
}

pub type Result<T> = std::result::Result<T, NetError>;

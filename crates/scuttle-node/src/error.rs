use thiserror::Error;

use scuttle_net::{NetError, RpcError};
use scuttle_shared::{BlobRef, MessageError, ScuttleError};
use scuttle_store::StoreError;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Network error: {0}")]
    Net(#[from] NetError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error(transparent)]
    Shared(#[from] ScuttleError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The pub behind an invite already follows us.
    #[error("Already following")]
    AlreadyFollowing,

    #[error("Blob not found: {0}")]
    BlobNotFound(BlobRef),

    #[error("Blob too large: {size} bytes (max {max})")]
    BlobTooLarge { size: u64, max: u64 },
}

impl NodeError {
    /// True when the peer's connection is gone and retrying on it is
    /// pointless.
    pub fn is_connection_closed(&self) -> bool {
        matches!(
            self,
            NodeError::Rpc(RpcError::ConnectionClosed | RpcError::Cancelled)
        )
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;

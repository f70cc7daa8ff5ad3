//! # scuttle-shared
//!
//! Identities, sigil references and the legacy signed message format shared
//! by every crate of the node.

pub mod constants;
pub mod error;
pub mod feed;
pub mod identity;
pub mod invite;
pub mod message;
pub mod network;
pub mod refs;

pub use error::{FeedError, IdentityError, InviteError, MessageError, RefError, ScuttleError};
pub use feed::{Feed, FeedTip};
pub use identity::Identity;
pub use invite::Invite;
pub use message::{Content, Message, RawMessage};
pub use network::{MessageHmac, NetworkKey};
pub use refs::{BanHash, BlobRef, FeedRef, MessageRef, PublicIdentity};

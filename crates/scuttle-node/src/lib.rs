//! # scuttle-node
//!
//! A Secure Scuttlebutt peer: replication of feeds and blobs on top of the
//! transport in `scuttle-net` and the storage in `scuttle-store`.
//!
//! - [`buffer`] holds replicated messages until they can be appended in order
//! - [`replication`] serves and requests feeds over EBT or classic history
//!   streams
//! - [`blobs`] exchanges blob wants and downloads wanted blobs
//! - [`app`] is the command and query surface of a running node
//! - [`node`] wires everything together

pub mod app;
pub mod blobs;
pub mod buffer;
pub mod config;
pub mod error;
pub mod invite;
pub mod node;
pub mod replication;

pub use app::{App, PeerStatus, Status};
pub use blobs::BlobReplicator;
pub use buffer::{BufferConfig, MessageBuffer};
pub use config::NodeConfig;
pub use error::{NodeError, Result};
pub use node::Node;
pub use replication::FeedReplicator;

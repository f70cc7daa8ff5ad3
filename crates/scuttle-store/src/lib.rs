//! # scuttle-store
//!
//! Persistent state of the node. Repositories share one SQLite connection
//! holding a bucketed key-value table; every mutation happens inside
//! [`Database::transact`], so a feed append updates the message store,
//! receive log, contact graph and indices atomically. Blob content lives on
//! the filesystem in [`BlobStorage`].

pub mod ban_list;
pub mod blob_storage;
pub mod blobs;
pub mod clock;
pub mod database;
pub mod feeds;
pub mod graph;
pub mod kv;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod pubs;
pub mod receive_log;
pub mod transaction;
pub mod want_list;

mod error;

pub use blob_storage::BlobStorage;
pub use clock::{Clock, FixedClock, SystemClock};
pub use database::Database;
pub use error::{Result, StoreError};
pub use graph::build_social_graph;
pub use models::*;
pub use transaction::Adapters;

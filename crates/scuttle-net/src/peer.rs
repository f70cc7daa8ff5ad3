use scuttle_shared::PublicIdentity;

use crate::rpc::Connection;

/// A remote identity with its live RPC session.
#[derive(Debug, Clone)]
pub struct Peer {
    identity: PublicIdentity,
    conn: Connection,
}

impl Peer {
    pub fn new(conn: Connection) -> Self {
        Self {
            identity: *conn.remote(),
            conn,
        }
    }

    pub fn identity(&self) -> &PublicIdentity {
        &self.identity
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

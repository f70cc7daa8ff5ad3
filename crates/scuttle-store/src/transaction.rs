//! Transactional access to every repository at once.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, error};

use crate::ban_list::BanListRepository;
use crate::blobs::BlobRepository;
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::feeds::FeedRepository;
use crate::graph::SocialGraphRepository;
use crate::kv::Kv;
use crate::messages::MessageRepository;
use crate::pubs::PubRepository;
use crate::receive_log::ReceiveLogRepository;
use crate::want_list::{
    BlobWantListRepository, FeedWantListRepository, WantListRepository, BLOB_WANT_LIST,
    FEED_WANT_LIST,
};

const MAX_ATTEMPTS: usize = 5;

/// Repositories bound to one open transaction.
pub struct Adapters<'a> {
    pub feeds: FeedRepository<'a>,
    pub messages: MessageRepository<'a>,
    pub receive_log: ReceiveLogRepository<'a>,
    pub graph: SocialGraphRepository<'a>,
    pub ban_list: BanListRepository<'a>,
    pub feed_want_list: FeedWantListRepository<'a>,
    pub blob_want_list: BlobWantListRepository<'a>,
    pub blobs: BlobRepository<'a>,
    pub pubs: PubRepository<'a>,
    /// Time at which the transaction started.
    pub now: DateTime<Utc>,
}

impl<'a> Adapters<'a> {
    fn new(conn: &'a Connection, now: DateTime<Utc>) -> Self {
        let kv = Kv::new(conn);
        Self {
            feeds: FeedRepository::new(kv),
            messages: MessageRepository::new(kv),
            receive_log: ReceiveLogRepository::new(kv),
            graph: SocialGraphRepository::new(kv),
            ban_list: BanListRepository::new(kv),
            feed_want_list: WantListRepository::new(kv, FEED_WANT_LIST, now),
            blob_want_list: WantListRepository::new(kv, BLOB_WANT_LIST, now),
            blobs: BlobRepository::new(kv),
            pubs: PubRepository::new(kv),
            now,
        }
    }
}

impl Database {
    /// Run `body` in a write transaction and commit.
    ///
    /// `body` runs again from scratch when the commit hits a transient
    /// conflict, so it must not have side effects outside the transaction.
    pub fn transact<T>(&self, mut body: impl FnMut(&Adapters<'_>) -> Result<T>) -> Result<T> {
        self.run(TransactionBehavior::Immediate, &mut body)
    }

    /// Run `body` in a deferred transaction for reads.
    pub fn view<T>(&self, mut body: impl FnMut(&Adapters<'_>) -> Result<T>) -> Result<T> {
        self.run(TransactionBehavior::Deferred, &mut body)
    }

    fn run<T>(
        &self,
        behavior: TransactionBehavior,
        body: &mut impl FnMut(&Adapters<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 1;
        loop {
            match self.run_once(behavior, body) {
                Err(StoreError::Conflict) if attempt < MAX_ATTEMPTS => {
                    debug!(attempt, "transaction conflict, retrying");
                    attempt += 1;
                }
                Err(StoreError::Invariant(reason)) => {
                    error!(%reason, "storage invariant violated");
                    return Err(StoreError::Invariant(reason));
                }
                other => return other,
            }
        }
    }

    fn run_once<T>(
        &self,
        behavior: TransactionBehavior,
        body: &mut impl FnMut(&Adapters<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(behavior)?;
        let value = {
            let adapters = Adapters::new(&tx, self.clock().now());
            body(&adapters)?
        };
        tx.commit()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scuttle_shared::MessageRef;

    #[test]
    fn test_failed_body_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        let id = MessageRef::from_bytes([1; 32]);

        let result: Result<()> = db.transact(|tx| {
            tx.receive_log.put(&id)?;
            Err(StoreError::NotFound)
        });
        assert!(result.is_err());

        let found = db.view(|tx| tx.receive_log.get_sequence(&id));
        assert!(matches!(found, Err(StoreError::NotFound)));
    }

    #[test]
    fn test_committed_writes_are_visible() {
        let db = Database::open_in_memory().unwrap();
        let id = MessageRef::from_bytes([2; 32]);

        db.transact(|tx| tx.receive_log.put(&id)).unwrap();
        assert_eq!(db.view(|tx| tx.receive_log.get_sequence(&id)).unwrap(), 0);
    }
}

use scuttle_shared::message::PubAddress;
use scuttle_shared::{FeedRef, MessageRef};

use crate::error::{Result, StoreError};
use crate::kv::Kv;
use crate::models::PubRecord;

const PUBS: &str = "pubs";
const BY_PUB: &str = "by_pub";
const BY_MESSAGE: &str = "by_message";

/// Pub announcements indexed by the announced key and by message.
#[derive(Clone, Copy)]
pub struct PubRepository<'a> {
    kv: Kv<'a>,
}

impl<'a> PubRepository<'a> {
    pub fn new(kv: Kv<'a>) -> Self {
        Self { kv }
    }

    pub fn put(&self, author: &FeedRef, message: &MessageRef, address: &PubAddress) -> Result<()> {
        let record = PubRecord {
            author: *author,
            message: *message,
            address: address.clone(),
        };
        let value = serde_json::to_vec(&record)?;
        let pub_key = address.key.to_string();
        let message_key = message.to_string();

        self.kv
            .put(&[PUBS, BY_PUB, pub_key.as_str()], message_key.as_bytes(), &value)?;
        self.kv.put(&[PUBS, BY_MESSAGE], message_key.as_bytes(), &value)
    }

    pub fn delete(&self, message: &MessageRef) -> Result<()> {
        let message_key = message.to_string();
        if let Some(value) = self.kv.get(&[PUBS, BY_MESSAGE], message_key.as_bytes())? {
            let record: PubRecord = serde_json::from_slice(&value)?;
            let pub_key = record.address.key.to_string();
            self.kv
                .delete(&[PUBS, BY_PUB, pub_key.as_str()], message_key.as_bytes())?;
            self.kv.delete(&[PUBS, BY_MESSAGE], message_key.as_bytes())?;
        }
        Ok(())
    }

    /// Every recorded announcement.
    pub fn list(&self) -> Result<Vec<PubRecord>> {
        self.kv
            .list(&[PUBS, BY_MESSAGE])?
            .into_iter()
            .map(|(_, value)| serde_json::from_slice(&value).map_err(StoreError::from))
            .collect()
    }

    /// Announcements of the pub with the given key.
    pub fn for_pub(&self, key: &FeedRef) -> Result<Vec<PubRecord>> {
        let pub_key = key.to_string();
        self.kv
            .list(&[PUBS, BY_PUB, pub_key.as_str()])?
            .into_iter()
            .map(|(_, value)| serde_json::from_slice(&value).map_err(StoreError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use scuttle_shared::Identity;

    #[test]
    fn test_put_list_delete() {
        let db = Database::open_in_memory().unwrap();
        let author = Identity::generate().feed();
        let pub_id = Identity::generate().public();
        let msg = MessageRef::from_bytes([4; 32]);
        let address = PubAddress {
            key: pub_id,
            host: "pub.example.com".to_string(),
            port: 8008,
        };

        db.transact(|tx| {
            tx.pubs.put(&author, &msg, &address)?;
            assert_eq!(tx.pubs.list()?.len(), 1);
            assert_eq!(tx.pubs.for_pub(&FeedRef::from(pub_id))?[0].author, author);
            tx.pubs.delete(&msg)?;
            assert!(tx.pubs.list()?.is_empty());
            assert!(tx.pubs.for_pub(&FeedRef::from(pub_id))?.is_empty());
            Ok(())
        })
        .unwrap();
    }
}

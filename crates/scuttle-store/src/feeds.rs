use scuttle_shared::message::find_blob_refs;
use scuttle_shared::{Content, Feed, FeedRef, FeedTip, Message, MessageRef};
use tracing::{debug, warn};

use crate::ban_list::BanListRepository;
use crate::blobs::BlobRepository;
use crate::error::{Result, StoreError};
use crate::graph::SocialGraphRepository;
use crate::kv::Kv;
use crate::messages::MessageRepository;
use crate::pubs::PubRepository;
use crate::receive_log::{decode_u64, ReceiveLogRepository};

const FEEDS: &str = "feeds";

/// `feeds/<feedRef>/<seq:u64be> -> messageRef`
///
/// Appending through [`FeedRepository::update_feed`] also maintains the
/// message store, receive log, contact graph, blob and pub indices.
#[derive(Clone, Copy)]
pub struct FeedRepository<'a> {
    kv: Kv<'a>,
}

impl<'a> FeedRepository<'a> {
    pub fn new(kv: Kv<'a>) -> Self {
        Self { kv }
    }

    /// Open `feed` at its stored tip, run `update`, then persist every
    /// message it appended. Returns the messages that were persisted.
    pub fn update_feed(
        &self,
        feed_ref: &FeedRef,
        update: impl FnOnce(&mut Feed) -> Result<()>,
    ) -> Result<Vec<Message>> {
        if BanListRepository::new(self.kv).contains_feed(feed_ref)? {
            return Err(StoreError::Banned(*feed_ref));
        }

        let tip = self.tip(feed_ref)?;
        let mut feed = Feed::new(*feed_ref, tip);
        update(&mut feed)?;

        let appended = feed.into_appended();
        if appended.is_empty() {
            return Ok(appended);
        }
        if tip.is_none() {
            BanListRepository::new(self.kv).create_feed_mapping(feed_ref)?;
        }
        for message in &appended {
            self.persist(message)?;
        }
        debug!(
            feed = %feed_ref,
            count = appended.len(),
            sequence = appended.last().map(|m| m.sequence),
            "appended messages"
        );
        Ok(appended)
    }

    fn persist(&self, message: &Message) -> Result<()> {
        let feed_key = message.feed.to_string();
        self.kv.put(
            &[FEEDS, feed_key.as_str()],
            &message.sequence.to_be_bytes(),
            message.id.to_string().as_bytes(),
        )?;
        MessageRepository::new(self.kv).put(message)?;
        ReceiveLogRepository::new(self.kv).put(&message.id)?;

        match &message.content {
            Content::Contact(contact) => {
                SocialGraphRepository::new(self.kv).update_contact(
                    &message.feed,
                    &contact.contact,
                    |state| {
                        if let Some(following) = contact.following {
                            state.following = following;
                        }
                        if let Some(blocking) = contact.blocking {
                            state.blocking = blocking;
                        }
                    },
                )?;
            }
            Content::Pub(announcement) => {
                PubRepository::new(self.kv).put(
                    &message.feed,
                    &message.id,
                    &announcement.address,
                )?;
            }
            _ => {}
        }

        if !matches!(message.content, Content::Encrypted { .. }) {
            let blobs = find_blob_refs(&message.content_value()?);
            if !blobs.is_empty() {
                BlobRepository::new(self.kv).put(&message.id, &blobs)?;
            }
        }
        Ok(())
    }

    /// Current tip of `feed_ref`, `None` for an unknown feed.
    pub fn tip(&self, feed_ref: &FeedRef) -> Result<Option<FeedTip>> {
        let feed_key = feed_ref.to_string();
        match self.kv.last(&[FEEDS, feed_key.as_str()])? {
            Some((key, value)) => Ok(Some(FeedTip {
                id: parse_message_ref(&value)?,
                sequence: decode_u64(&key)?,
            })),
            None => Ok(None),
        }
    }

    pub fn get_feed(&self, feed_ref: &FeedRef) -> Result<Feed> {
        match self.tip(feed_ref)? {
            Some(tip) => Ok(Feed::new(*feed_ref, Some(tip))),
            None => Err(StoreError::NotFound),
        }
    }

    pub fn get_message(&self, feed_ref: &FeedRef, sequence: u64) -> Result<Message> {
        let feed_key = feed_ref.to_string();
        let value = self
            .kv
            .get(&[FEEDS, feed_key.as_str()], &sequence.to_be_bytes())?
            .ok_or(StoreError::NotFound)?;
        MessageRepository::new(self.kv).get(&parse_message_ref(&value)?)
    }

    /// Messages starting at `from` (default 1), at most `limit` of them.
    pub fn get_messages(
        &self,
        feed_ref: &FeedRef,
        from: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>> {
        let feed_key = feed_ref.to_string();
        let start = from.unwrap_or(1).max(1);
        let entries = self.kv.list_from(
            &[FEEDS, feed_key.as_str()],
            &start.to_be_bytes(),
            limit.unwrap_or(usize::MAX),
        )?;

        let messages = MessageRepository::new(self.kv);
        entries
            .into_iter()
            .map(|(_, value)| -> Result<Message> { messages.get(&parse_message_ref(&value)?) })
            .collect()
    }

    /// Every known feed, sorted.
    pub fn list(&self) -> Result<Vec<FeedRef>> {
        self.kv
            .child_buckets(&[FEEDS])?
            .into_iter()
            .map(|name| -> Result<FeedRef> { Ok(name.parse()?) })
            .collect()
    }

    pub fn count(&self) -> Result<u64> {
        Ok(self.kv.child_buckets(&[FEEDS])?.len() as u64)
    }

    /// Delete `feed_ref` and everything derived from its messages.
    pub fn delete_feed(&self, feed_ref: &FeedRef) -> Result<()> {
        let feed_key = feed_ref.to_string();
        let messages = MessageRepository::new(self.kv);
        let receive_log = ReceiveLogRepository::new(self.kv);
        let blobs = BlobRepository::new(self.kv);
        let pubs = PubRepository::new(self.kv);

        for (_, value) in self.kv.list(&[FEEDS, feed_key.as_str()])? {
            let id = parse_message_ref(&value)?;
            if !messages.delete(&id)? {
                warn!(feed = %feed_ref, message = %id, "feed entry without message");
            }
            receive_log.delete(&id)?;
            blobs.delete(&id)?;
            pubs.delete(&id)?;
        }

        self.kv.delete_bucket(&[FEEDS, feed_key.as_str()])?;
        SocialGraphRepository::new(self.kv).remove(feed_ref)?;
        BanListRepository::new(self.kv).remove_feed_mapping(feed_ref)?;
        debug!(feed = %feed_ref, "deleted feed");
        Ok(())
    }
}

fn parse_message_ref(value: &[u8]) -> Result<MessageRef> {
    let text = std::str::from_utf8(value)
        .map_err(|e| StoreError::Invariant(format!("feed entry: {e}")))?;
    Ok(text.parse()?)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::Database;
    use scuttle_shared::message::Contact;
    use scuttle_shared::{BanHash, BlobRef, Identity, MessageHmac};

    fn publish(db: &Database, identity: &Identity, content: serde_json::Value) -> MessageRef {
        let hmac = MessageHmac::none();
        db.transact(|tx| {
            let mut id = None;
            tx.feeds.update_feed(&identity.feed(), |feed| {
                id = Some(feed.create_message(identity, &hmac, Utc::now(), &content)?);
                Ok(())
            })?;
            id.ok_or(StoreError::NotFound)
        })
        .unwrap()
    }

    #[test]
    fn test_update_feed_appends_and_indexes() {
        let db = Database::open_in_memory().unwrap();
        let alice = Identity::generate();
        let bob = Identity::generate();
        let blob = BlobRef::of_content(b"picture");

        let first = publish(&db, &alice, json!({"type": "post", "text": "hi", "mentions": [blob.to_string()]}));
        publish(&db, &alice, Contact::follow(bob.feed()).to_content());

        db.transact(|tx| {
            let tip = tx.feeds.tip(&alice.feed())?.unwrap();
            assert_eq!(tip.sequence, 2);
            assert_eq!(tx.feeds.count()?, 1);
            assert_eq!(tx.feeds.list()?, vec![alice.feed()]);

            let messages = tx.feeds.get_messages(&alice.feed(), None, None)?;
            assert_eq!(messages.len(), 2);
            assert_eq!(messages[0].id, first);
            assert_eq!(messages[1].previous, Some(first));
            assert_eq!(tx.feeds.get_message(&alice.feed(), 2)?.id, tip.id);

            assert_eq!(tx.blobs.messages_for(&blob)?, vec![first]);
            let contacts = tx.graph.get_contacts(&alice.feed())?;
            assert_eq!(contacts.len(), 1);
            assert!(contacts[0].1.following);

            let log = tx.receive_log.list(0, 10)?;
            assert_eq!(log.len(), 2);
            assert_eq!(log[0].message.id, first);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_get_feed_not_found() {
        let db = Database::open_in_memory().unwrap();
        let feed = Identity::generate().feed();
        let result = db.transact(|tx| tx.feeds.get_feed(&feed));
        assert!(matches!(result, Err(StoreError::NotFound)));
    }

    #[test]
    fn test_banned_feed_rejects_appends() {
        let db = Database::open_in_memory().unwrap();
        let alice = Identity::generate();
        db.transact(|tx| tx.ban_list.add(&BanHash::of_feed(&alice.feed())))
            .unwrap();

        let result = db.transact(|tx| tx.feeds.update_feed(&alice.feed(), |_| Ok(())));
        assert!(matches!(result, Err(StoreError::Banned(_))));
    }

    #[test]
    fn test_ban_cascades_feed_deletion() {
        let db = Database::open_in_memory().unwrap();
        let alice = Identity::generate();
        let bob = Identity::generate();

        let mut ids = vec![publish(&db, &alice, Contact::follow(bob.feed()).to_content())];
        for i in 0..4 {
            ids.push(publish(&db, &alice, json!({"type": "post", "n": i})));
        }

        db.transact(|tx| tx.ban_list.add(&BanHash::of_feed(&alice.feed())))
            .unwrap();

        db.transact(|tx| {
            assert!(matches!(tx.feeds.get_feed(&alice.feed()), Err(StoreError::NotFound)));
            for id in &ids {
                assert!(matches!(tx.messages.get(id), Err(StoreError::NotFound)));
            }
            assert!(tx.graph.get_contacts(&alice.feed())?.is_empty());
            assert!(tx.receive_log.list(0, 10)?.is_empty());
            assert_eq!(tx.messages.count()?, 0);
            Ok(())
        })
        .unwrap();
    }
}

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{FeedError, ScuttleError};
use crate::identity::Identity;
use crate::message::{sign_message, verify_message, Message};
use crate::network::MessageHmac;
use crate::refs::{FeedRef, MessageRef};

/// Last message of a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedTip {
    pub id: MessageRef,
    pub sequence: u64,
}

/// A feed opened for appending.
///
/// Holds only the current tip plus the messages appended through this handle;
/// persistence of the delta is the caller's job.
#[derive(Debug, Clone)]
pub struct Feed {
    feed_ref: FeedRef,
    tip: Option<FeedTip>,
    appended: Vec<Message>,
}

impl Feed {
    pub fn new(feed_ref: FeedRef, tip: Option<FeedTip>) -> Self {
        Self {
            feed_ref,
            tip,
            appended: Vec::new(),
        }
    }

    pub fn feed_ref(&self) -> &FeedRef {
        &self.feed_ref
    }

    pub fn tip(&self) -> Option<FeedTip> {
        self.tip
    }

    /// Sequence of the last message, 0 for an empty feed.
    pub fn sequence(&self) -> u64 {
        self.tip.map_or(0, |t| t.sequence)
    }

    pub fn appended(&self) -> &[Message] {
        &self.appended
    }

    pub fn into_appended(self) -> Vec<Message> {
        self.appended
    }

    /// Append a verified message, enforcing contiguity with the tip.
    pub fn append(&mut self, message: Message) -> Result<(), FeedError> {
        if message.feed != self.feed_ref {
            return Err(FeedError::WrongAuthor {
                feed: self.feed_ref.to_string(),
                author: message.author.to_string(),
            });
        }

        let expected = self.sequence() + 1;
        if message.sequence != expected {
            return Err(FeedError::WrongSequence {
                expected,
                got: message.sequence,
            });
        }

        if message.previous != self.tip.map(|t| t.id) {
            return Err(FeedError::WrongPrevious);
        }

        self.tip = Some(FeedTip {
            id: message.id,
            sequence: message.sequence,
        });
        self.appended.push(message);
        Ok(())
    }

    /// Sign `content` as the next message of this feed and append it.
    pub fn create_message(
        &mut self,
        identity: &Identity,
        hmac: &MessageHmac,
        timestamp: DateTime<Utc>,
        content: &Value,
    ) -> Result<MessageRef, ScuttleError> {
        if identity.feed() != self.feed_ref {
            return Err(FeedError::WrongAuthor {
                feed: self.feed_ref.to_string(),
                author: identity.public().to_string(),
            }
            .into());
        }

        let raw = sign_message(
            identity,
            hmac,
            self.tip.map(|t| t.id),
            self.sequence() + 1,
            timestamp,
            content,
        )?;
        let message = verify_message(&raw, hmac)?;
        let id = message.id;
        self.append(message)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_feed_sequence_and_previous_chain() {
        let identity = Identity::generate();
        let hmac = MessageHmac::none();
        let mut feed = Feed::new(identity.feed(), None);

        let first = feed
            .create_message(&identity, &hmac, Utc::now(), &json!({"type": "post", "text": "1"}))
            .unwrap();
        feed.create_message(&identity, &hmac, Utc::now(), &json!({"type": "post", "text": "2"}))
            .unwrap();

        let messages = feed.appended();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sequence, 1);
        assert_eq!(messages[0].previous, None);
        assert_eq!(messages[1].sequence, 2);
        assert_eq!(messages[1].previous, Some(first));
        assert_eq!(feed.sequence(), 2);
    }

    #[test]
    fn test_append_rejects_gap() {
        let identity = Identity::generate();
        let hmac = MessageHmac::none();
        let mut source = Feed::new(identity.feed(), None);
        for i in 0..2 {
            source
                .create_message(&identity, &hmac, Utc::now(), &json!({"type": "post", "n": i}))
                .unwrap();
        }
        let messages = source.into_appended();

        let mut feed = Feed::new(identity.feed(), None);
        assert_eq!(
            feed.append(messages[1].clone()),
            Err(FeedError::WrongSequence { expected: 1, got: 2 })
        );
        feed.append(messages[0].clone()).unwrap();
        feed.append(messages[1].clone()).unwrap();
    }

    #[test]
    fn test_append_rejects_wrong_previous() {
        let identity = Identity::generate();
        let hmac = MessageHmac::none();
        let mut source = Feed::new(identity.feed(), None);
        for i in 0..2 {
            source
                .create_message(&identity, &hmac, Utc::now(), &json!({"type": "post", "n": i}))
                .unwrap();
        }
        let second = source.appended()[1].clone();

        let bogus_tip = FeedTip {
            id: MessageRef::from_bytes([7; 32]),
            sequence: 1,
        };
        let mut feed = Feed::new(identity.feed(), Some(bogus_tip));
        assert_eq!(feed.append(second), Err(FeedError::WrongPrevious));
    }

    #[test]
    fn test_append_rejects_foreign_author() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let mut source = Feed::new(alice.feed(), None);
        source
            .create_message(&alice, &MessageHmac::none(), Utc::now(), &json!({"type": "post"}))
            .unwrap();

        let mut feed = Feed::new(bob.feed(), None);
        assert!(matches!(
            feed.append(source.appended()[0].clone()),
            Err(FeedError::WrongAuthor { .. })
        ));
    }
}

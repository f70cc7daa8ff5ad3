//! Legacy signed messages: verification, signing and content parsing.

pub mod canonical;
pub mod content;
mod sign;
mod verify;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::MessageError;
use crate::refs::{FeedRef, MessageRef, PublicIdentity};

pub use content::{find_blob_refs, About, Contact, Content, Post, Pub, PubAddress};
pub use sign::sign_message;
pub use verify::{decode_stored, verify_message};

/// Canonical bytes of a signed message as produced by a feed author.
#[derive(Clone, PartialEq, Eq)]
pub struct RawMessage(Vec<u8>);

impl RawMessage {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Decode into a JSON value with key order preserved.
    pub fn to_value(&self) -> Result<Value, MessageError> {
        Ok(serde_json::from_slice(&self.0)?)
    }
}

impl std::fmt::Debug for RawMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RawMessage({} bytes)", self.0.len())
    }
}

/// A verified feed entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageRef,
    pub previous: Option<MessageRef>,
    pub sequence: u64,
    pub author: PublicIdentity,
    pub feed: FeedRef,
    /// Timestamp claimed by the author; not trusted for ordering.
    pub timestamp: DateTime<Utc>,
    pub content: Content,
    pub raw: RawMessage,
}

impl Message {
    /// The `content` field as JSON.
    pub fn content_value(&self) -> Result<Value, MessageError> {
        let mut value = self.raw.to_value()?;
        value
            .get_mut("content")
            .map(Value::take)
            .ok_or_else(|| MessageError::Shape("missing content".to_string()))
    }

    /// `{key, value, timestamp}` envelope used by `keys: true` history streams.
    pub fn to_keyed_value(&self, received_at: DateTime<Utc>) -> Result<Value, MessageError> {
        Ok(serde_json::json!({
            "key": self.id.to_string(),
            "value": self.raw.to_value()?,
            "timestamp": received_at.timestamp_millis(),
        }))
    }
}

/// A message is only first in its feed when it has no predecessor.
pub(crate) fn check_previous(
    sequence: u64,
    previous: Option<&MessageRef>,
) -> Result<(), MessageError> {
    let ok = match previous {
        None => sequence == 1,
        Some(_) => sequence > 1,
    };
    if ok {
        Ok(())
    } else {
        Err(MessageError::InconsistentPrevious {
            sequence,
            has_previous: previous.is_some(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::network::MessageHmac;
    use serde_json::json;

    #[test]
    fn test_sign_then_verify_derives_id_and_author() {
        let identity = Identity::generate();
        let hmac = MessageHmac::none();
        let raw = sign_message(
            &identity,
            &hmac,
            None,
            1,
            Utc::now(),
            &json!({"type": "post", "text": "hello"}),
        )
        .unwrap();

        let msg = verify_message(&raw, &hmac).unwrap();
        assert_eq!(msg.author, identity.public());
        assert_eq!(msg.feed, identity.feed());
        assert_eq!(msg.sequence, 1);
        assert_eq!(msg.previous, None);
        let expected = MessageRef::from_bytes(canonical::legacy_hash(
            std::str::from_utf8(raw.as_bytes()).unwrap(),
        ));
        assert_eq!(msg.id, expected);
        assert!(matches!(msg.content, Content::Post(ref p) if p.text == "hello"));
    }

    #[test]
    fn test_content_value() {
        let identity = Identity::generate();
        let raw = sign_message(
            &identity,
            &MessageHmac::none(),
            None,
            1,
            Utc::now(),
            &json!({"type": "x", "n": 3}),
        )
        .unwrap();
        let msg = verify_message(&raw, &MessageHmac::none()).unwrap();
        assert_eq!(msg.content_value().unwrap(), json!({"type": "x", "n": 3}));
    }

    #[test]
    fn test_check_previous() {
        let r = MessageRef::from_bytes([1; 32]);
        assert!(check_previous(1, None).is_ok());
        assert!(check_previous(2, Some(&r)).is_ok());
        assert!(check_previous(1, Some(&r)).is_err());
        assert!(check_previous(2, None).is_err());
    }
}

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use ed25519_dalek::Signature;
use serde_json::{Map, Value};

use super::canonical::{legacy_hash, to_canonical_string, utf16_len};
use super::{check_previous, Content, Message, RawMessage};
use crate::constants::MAX_MESSAGE_SIZE;
use crate::error::MessageError;
use crate::identity::verify_signature;
use crate::network::MessageHmac;
use crate::refs::{FeedRef, MessageRef, PublicIdentity};

const KEY_ORDER: [&str; 7] = [
    "previous",
    "author",
    "sequence",
    "timestamp",
    "hash",
    "content",
    "signature",
];

// Some old clients wrote sequence before author.
const KEY_ORDER_SWAPPED: [&str; 7] = [
    "previous",
    "sequence",
    "author",
    "timestamp",
    "hash",
    "content",
    "signature",
];

const SIGNATURE_SUFFIX: &str = ".sig.ed25519";

/// Verify a legacy message and derive its fields.
///
/// The input may be any JSON rendering of the message; it is re-encoded in
/// canonical form and the returned message carries the canonical bytes.
pub fn verify_message(raw: &RawMessage, hmac: &MessageHmac) -> Result<Message, MessageError> {
    decode(raw, Some(hmac))
}

/// Decode bytes that were verified before they were stored, skipping the
/// signature check.
pub fn decode_stored(raw: &RawMessage) -> Result<Message, MessageError> {
    decode(raw, None)
}

fn decode(raw: &RawMessage, hmac: Option<&MessageHmac>) -> Result<Message, MessageError> {
    let value: Value = serde_json::from_slice(raw.as_bytes())?;
    let map = match value {
        Value::Object(map) => map,
        _ => return Err(MessageError::Shape("message is not an object".to_string())),
    };

    let keys: Vec<&str> = map.keys().map(String::as_str).collect();
    if keys != KEY_ORDER && keys != KEY_ORDER_SWAPPED {
        return Err(MessageError::Shape(format!("unexpected keys {keys:?}")));
    }

    let canonical = to_canonical_string(&Value::Object(map.clone()))?;
    let size = utf16_len(&canonical);
    if size > MAX_MESSAGE_SIZE {
        return Err(MessageError::TooLarge(size));
    }

    let previous = match &map["previous"] {
        Value::Null => None,
        Value::String(s) => Some(
            s.parse::<MessageRef>()
                .map_err(|source| MessageError::Ref { field: "previous", source })?,
        ),
        _ => return Err(MessageError::Shape("previous is not a string".to_string())),
    };

    let author = map["author"]
        .as_str()
        .ok_or_else(|| MessageError::Shape("author is not a string".to_string()))?
        .parse::<PublicIdentity>()
        .map_err(|source| MessageError::Ref { field: "author", source })?;

    let sequence = map["sequence"]
        .as_u64()
        .filter(|s| *s >= 1)
        .ok_or_else(|| MessageError::Shape("sequence is not a positive integer".to_string()))?;
    check_previous(sequence, previous.as_ref())?;

    let timestamp = parse_timestamp(&map["timestamp"])?;

    if map["hash"].as_str() != Some("sha256") {
        return Err(MessageError::Shape("hash must be 'sha256'".to_string()));
    }

    let content_value = &map["content"];
    match content_value {
        Value::Object(content) => {
            if !content.get("type").map_or(false, Value::is_string) {
                return Err(MessageError::Shape("content has no type".to_string()));
            }
        }
        Value::String(s) if s.ends_with(".box") => {}
        _ => return Err(MessageError::Shape("invalid content".to_string())),
    }

    let signature = parse_signature(&map["signature"])?;
    if let Some(hmac) = hmac {
        let mut unsigned: Map<String, Value> = map.clone();
        unsigned.remove("signature");
        let signed_bytes = to_canonical_string(&Value::Object(unsigned))?;
        verify_signature(&author, &hmac.prepare(signed_bytes.as_bytes()), &signature)
            .map_err(|_| MessageError::InvalidSignature)?;
    }

    Ok(Message {
        id: MessageRef::from_bytes(legacy_hash(&canonical)),
        previous,
        sequence,
        author,
        feed: FeedRef::from(author),
        timestamp,
        content: Content::parse(content_value),
        raw: RawMessage::new(canonical.into_bytes()),
    })
}

fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, MessageError> {
    let millis = value
        .as_f64()
        .ok_or_else(|| MessageError::Shape("timestamp is not a number".to_string()))?;
    Ok(DateTime::from_timestamp_millis(millis as i64).unwrap_or_default())
}

fn parse_signature(value: &Value) -> Result<Signature, MessageError> {
    let encoded = value
        .as_str()
        .and_then(|s| s.strip_suffix(SIGNATURE_SUFFIX))
        .ok_or_else(|| MessageError::Shape("malformed signature".to_string()))?;
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|_| MessageError::Shape("signature is not base64".to_string()))?;
    Signature::from_slice(&bytes).map_err(|_| MessageError::InvalidSignature)
}

pub(super) fn encode_signature(signature: &Signature) -> String {
    format!("{}{}", STANDARD.encode(signature.to_bytes()), SIGNATURE_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::message::sign_message;
    use serde_json::json;

    fn signed(identity: &Identity, hmac: &MessageHmac) -> RawMessage {
        sign_message(
            identity,
            hmac,
            None,
            1,
            Utc::now(),
            &json!({"type": "post", "text": "hi"}),
        )
        .unwrap()
    }

    #[test]
    fn test_compact_json_is_recanonicalized() {
        let identity = Identity::generate();
        let raw = signed(&identity, &MessageHmac::none());
        let compact = serde_json::to_vec(&raw.to_value().unwrap()).unwrap();

        let msg = verify_message(&RawMessage::new(compact), &MessageHmac::none()).unwrap();
        assert_eq!(msg.raw, raw);
    }

    #[test]
    fn test_float_content_survives_reencoding() {
        let identity = Identity::generate();
        let raw = sign_message(
            &identity,
            &MessageHmac::none(),
            None,
            1,
            Utc::now(),
            &json!({"type": "vote", "weight": 1.0, "huge": 1e21, "tiny": 2.5e-7}),
        )
        .unwrap();
        let text = String::from_utf8(raw.as_bytes().to_vec()).unwrap();
        assert!(text.contains("\"weight\": 1,"));
        assert!(text.contains("\"huge\": 1e+21,"));
        assert!(text.contains("\"tiny\": 2.5e-7\n"));

        // Compact serde output writes `1.0` and `1e21`; both must verify.
        let compact = serde_json::to_vec(&raw.to_value().unwrap()).unwrap();
        let msg = verify_message(&RawMessage::new(compact), &MessageHmac::none()).unwrap();
        assert_eq!(msg.raw, raw);
    }

    #[test]
    fn test_tampered_content_fails() {
        let identity = Identity::generate();
        let raw = signed(&identity, &MessageHmac::none());
        let text = String::from_utf8(raw.into_bytes()).unwrap().replace("\"hi\"", "\"ho\"");

        let err = verify_message(&RawMessage::new(text.into_bytes()), &MessageHmac::none());
        assert!(matches!(err, Err(MessageError::InvalidSignature)));
    }

    #[test]
    fn test_hmac_network_mismatch_fails() {
        let identity = Identity::generate();
        let hmac = MessageHmac::new([9u8; 32]);
        let raw = signed(&identity, &hmac);

        assert!(verify_message(&raw, &hmac).is_ok());
        assert!(matches!(
            verify_message(&raw, &MessageHmac::none()),
            Err(MessageError::InvalidSignature)
        ));
    }

    #[test]
    fn test_wrong_key_order_rejected() {
        let identity = Identity::generate();
        let raw = signed(&identity, &MessageHmac::none());
        let value = raw.to_value().unwrap();
        let mut reordered = Map::new();
        reordered.insert("author".to_string(), value["author"].clone());
        for key in ["previous", "sequence", "timestamp", "hash", "content", "signature"] {
            reordered.insert(key.to_string(), value[key].clone());
        }
        let bytes = serde_json::to_vec(&Value::Object(reordered)).unwrap();

        assert!(matches!(
            verify_message(&RawMessage::new(bytes), &MessageHmac::none()),
            Err(MessageError::Shape(_))
        ));
    }

    #[test]
    fn test_too_large_rejected() {
        let identity = Identity::generate();
        let text = "x".repeat(MAX_MESSAGE_SIZE);
        let err = sign_message(
            &identity,
            &MessageHmac::none(),
            None,
            1,
            Utc::now(),
            &json!({"type": "post", "text": text}),
        );
        assert!(matches!(err, Err(MessageError::TooLarge(_))));
    }
}

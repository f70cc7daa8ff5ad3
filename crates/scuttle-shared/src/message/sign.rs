use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::canonical::{to_canonical_string, utf16_len};
use super::verify::encode_signature;
use super::{check_previous, RawMessage};
use crate::constants::MAX_MESSAGE_SIZE;
use crate::error::MessageError;
use crate::identity::Identity;
use crate::network::MessageHmac;
use crate::refs::MessageRef;

/// Sign a new legacy message authored by `identity`.
pub fn sign_message(
    identity: &Identity,
    hmac: &MessageHmac,
    previous: Option<MessageRef>,
    sequence: u64,
    timestamp: DateTime<Utc>,
    content: &Value,
) -> Result<RawMessage, MessageError> {
    check_previous(sequence, previous.as_ref())?;

    match content {
        Value::Object(map) if map.get("type").map_or(false, Value::is_string) => {}
        Value::String(s) if s.ends_with(".box") => {}
        _ => return Err(MessageError::Shape("content needs a type".to_string())),
    }

    let mut map = Map::new();
    map.insert(
        "previous".to_string(),
        previous.map_or(Value::Null, |p| Value::from(p.to_string())),
    );
    map.insert("author".to_string(), Value::from(identity.public().to_string()));
    map.insert("sequence".to_string(), Value::from(sequence));
    map.insert("timestamp".to_string(), Value::from(timestamp.timestamp_millis()));
    map.insert("hash".to_string(), Value::from("sha256"));
    map.insert("content".to_string(), content.clone());

    let unsigned = to_canonical_string(&Value::Object(map.clone()))?;
    let signature = identity.sign(&hmac.prepare(unsigned.as_bytes()));
    map.insert("signature".to_string(), Value::from(encode_signature(&signature)));

    let canonical = to_canonical_string(&Value::Object(map))?;
    let size = utf16_len(&canonical);
    if size > MAX_MESSAGE_SIZE {
        return Err(MessageError::TooLarge(size));
    }
    Ok(RawMessage::new(canonical.into_bytes()))
}

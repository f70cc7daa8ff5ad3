//! Typed message content.
//!
//! Only the content types the node acts on are parsed. Everything else, and
//! private (boxed) content, is carried as raw bytes and still stored and
//! replicated.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::refs::{BlobRef, FeedRef, MessageRef, PublicIdentity};

#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Contact(Contact),
    About(About),
    Pub(Pub),
    Post(Post),
    /// A known-shaped object of a type this node does not interpret.
    Unknown { content_type: Option<String>, raw: Vec<u8> },
    /// Private content: a base64 string ending in `.box`.
    Encrypted { raw: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub contact: FeedRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub following: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocking: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct About {
    pub about: PublicIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<BlobRef>,
}

/// Address announced in a `pub` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubAddress {
    pub key: PublicIdentity,
    pub host: String,
    pub port: u16,
}

impl PubAddress {
    pub fn to_host_port(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pub {
    pub address: PubAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<MessageRef>,
}

impl Content {
    /// Interpret a message's `content` field.
    pub fn parse(value: &Value) -> Self {
        let raw = || serde_json::to_vec(value).unwrap_or_default();

        match value {
            Value::String(s) => Content::Encrypted {
                raw: s.as_bytes().to_vec(),
            },
            Value::Object(map) => {
                let content_type = map.get("type").and_then(Value::as_str);
                let parsed = match content_type {
                    Some("contact") => serde_json::from_value(value.clone()).ok().map(Content::Contact),
                    Some("about") => serde_json::from_value(value.clone()).ok().map(Content::About),
                    Some("pub") => serde_json::from_value(value.clone()).ok().map(Content::Pub),
                    Some("post") => serde_json::from_value(value.clone()).ok().map(Content::Post),
                    _ => None,
                };
                parsed.unwrap_or_else(|| Content::Unknown {
                    content_type: content_type.map(str::to_string),
                    raw: raw(),
                })
            }
            _ => Content::Unknown {
                content_type: None,
                raw: raw(),
            },
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        match self {
            Content::Contact(_) => Some("contact"),
            Content::About(_) => Some("about"),
            Content::Pub(_) => Some("pub"),
            Content::Post(_) => Some("post"),
            Content::Unknown { content_type, .. } => content_type.as_deref(),
            Content::Encrypted { .. } => None,
        }
    }
}

impl Contact {
    pub fn follow(target: FeedRef) -> Self {
        Self {
            contact: target,
            following: Some(true),
            blocking: None,
        }
    }

    pub fn unfollow(target: FeedRef) -> Self {
        Self {
            contact: target,
            following: Some(false),
            blocking: None,
        }
    }

    pub fn block(target: FeedRef) -> Self {
        Self {
            contact: target,
            following: Some(false),
            blocking: Some(true),
        }
    }

    pub fn unblock(target: FeedRef) -> Self {
        Self {
            contact: target,
            following: None,
            blocking: Some(false),
        }
    }

    /// JSON content ready for signing.
    pub fn to_content(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("type".to_string(), Value::from("contact"));
        map.insert("contact".to_string(), Value::from(self.contact.to_string()));
        if let Some(following) = self.following {
            map.insert("following".to_string(), Value::from(following));
        }
        if let Some(blocking) = self.blocking {
            map.insert("blocking".to_string(), Value::from(blocking));
        }
        Value::Object(map)
    }
}

/// All blob references mentioned anywhere inside `value`.
pub fn find_blob_refs(value: &Value) -> Vec<BlobRef> {
    let mut found = Vec::new();
    collect_blob_refs(value, &mut found);
    found.sort();
    found.dedup();
    found
}

fn collect_blob_refs(value: &Value, found: &mut Vec<BlobRef>) {
    match value {
        Value::String(s) if s.starts_with('&') => {
            if let Ok(blob) = s.parse::<BlobRef>() {
                found.push(blob);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_blob_refs(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect_blob_refs(v, found)),
        _ => {}
    }
}

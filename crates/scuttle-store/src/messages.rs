use scuttle_shared::message::decode_stored;
use scuttle_shared::{Message, MessageRef, RawMessage};

use crate::error::{Result, StoreError};
use crate::kv::Kv;

pub(crate) const MESSAGES: &str = "messages";

/// `messages/<messageRef> -> raw bytes`
#[derive(Clone, Copy)]
pub struct MessageRepository<'a> {
    kv: Kv<'a>,
}

impl<'a> MessageRepository<'a> {
    pub fn new(kv: Kv<'a>) -> Self {
        Self { kv }
    }

    pub fn put(&self, message: &Message) -> Result<()> {
        self.kv.put(
            &[MESSAGES],
            message.id.to_string().as_bytes(),
            message.raw.as_bytes(),
        )
    }

    pub fn get(&self, id: &MessageRef) -> Result<Message> {
        let raw = self.get_raw(id)?;
        let message = decode_stored(&raw)?;
        if message.id != *id {
            return Err(StoreError::Invariant(format!(
                "stored message {id} hashes to {}",
                message.id
            )));
        }
        Ok(message)
    }

    pub fn get_raw(&self, id: &MessageRef) -> Result<RawMessage> {
        self.kv
            .get(&[MESSAGES], id.to_string().as_bytes())?
            .map(RawMessage::new)
            .ok_or(StoreError::NotFound)
    }

    pub fn contains(&self, id: &MessageRef) -> Result<bool> {
        self.kv.contains(&[MESSAGES], id.to_string().as_bytes())
    }

    pub fn delete(&self, id: &MessageRef) -> Result<bool> {
        self.kv.delete(&[MESSAGES], id.to_string().as_bytes())
    }

    pub fn count(&self) -> Result<u64> {
        self.kv.count(&[MESSAGES])
    }
}

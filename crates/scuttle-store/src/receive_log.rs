use scuttle_shared::MessageRef;
use tracing::warn;

use crate::error::{Result, StoreError};
use crate::kv::Kv;
use crate::messages::MessageRepository;
use crate::models::ReceivedMessage;

const RECEIVE_LOG: &str = "receive_log";
const BY_REF: &str = "receive_log_by_ref";
const META: &str = "receive_log_meta";
const NEXT_KEY: &[u8] = b"next";

/// Global order in which messages were accepted.
///
/// Sequences start at 0 and never decrease, even after entries are deleted.
#[derive(Clone, Copy)]
pub struct ReceiveLogRepository<'a> {
    kv: Kv<'a>,
}

impl<'a> ReceiveLogRepository<'a> {
    pub fn new(kv: Kv<'a>) -> Self {
        Self { kv }
    }

    /// Append `id`, returning its sequence. Appending a ref twice returns the
    /// original sequence.
    pub fn put(&self, id: &MessageRef) -> Result<u64> {
        if let Some(existing) = self.lookup(id)? {
            return Ok(existing);
        }
        let sequence = self.next_sequence()?;
        self.write(id, sequence)?;
        Ok(sequence)
    }

    /// Insert under a caller-chosen sequence, used when importing a log.
    pub fn put_under_specific_sequence(&self, id: &MessageRef, sequence: u64) -> Result<()> {
        if let Some(taken_by) = self.kv.get(&[RECEIVE_LOG], &sequence.to_be_bytes())? {
            if taken_by != id.to_string().as_bytes() {
                return Err(StoreError::SequenceTaken(sequence));
            }
            return Ok(());
        }
        if let Some(existing) = self.lookup(id)? {
            return Err(StoreError::Invariant(format!(
                "{id} is already in the receive log at {existing}"
            )));
        }
        self.write(id, sequence)
    }

    pub fn get_sequence(&self, id: &MessageRef) -> Result<u64> {
        self.lookup(id)?.ok_or(StoreError::NotFound)
    }

    /// Up to `limit` messages starting at `start`, skipping deleted entries.
    pub fn list(&self, start: u64, limit: usize) -> Result<Vec<ReceivedMessage>> {
        let messages = MessageRepository::new(self.kv);
        let mut result = Vec::with_capacity(limit.min(256));

        for (key, value) in self.kv.list_from(&[RECEIVE_LOG], &start.to_be_bytes(), limit)? {
            let sequence = decode_u64(&key)?;
            let id: MessageRef = std::str::from_utf8(&value)
                .map_err(|e| StoreError::Invariant(format!("receive log value: {e}")))?
                .parse()?;
            match messages.get(&id) {
                Ok(message) => result.push(ReceivedMessage { sequence, message }),
                Err(StoreError::NotFound) => {
                    warn!(sequence, message = %id, "receive log points at a missing message");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(result)
    }

    /// Remove the entry for `id`; its sequence is not reused.
    pub fn delete(&self, id: &MessageRef) -> Result<()> {
        if let Some(sequence) = self.lookup(id)? {
            self.kv.delete(&[RECEIVE_LOG], &sequence.to_be_bytes())?;
            self.kv.delete(&[BY_REF], id.to_string().as_bytes())?;
        }
        Ok(())
    }

    fn lookup(&self, id: &MessageRef) -> Result<Option<u64>> {
        self.kv
            .get(&[BY_REF], id.to_string().as_bytes())?
            .map(|v| decode_u64(&v))
            .transpose()
    }

    fn next_sequence(&self) -> Result<u64> {
        self.kv
            .get(&[META], NEXT_KEY)?
            .map(|v| decode_u64(&v))
            .transpose()
            .map(|next| next.unwrap_or(0))
    }

    fn write(&self, id: &MessageRef, sequence: u64) -> Result<()> {
        let key = id.to_string();
        self.kv
            .put(&[RECEIVE_LOG], &sequence.to_be_bytes(), key.as_bytes())?;
        self.kv
            .put(&[BY_REF], key.as_bytes(), &sequence.to_be_bytes())?;
        if sequence >= self.next_sequence()? {
            self.kv
                .put(&[META], NEXT_KEY, &(sequence + 1).to_be_bytes())?;
        }
        Ok(())
    }
}

pub(crate) fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Invariant(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(array))
}

use scuttle_shared::{BlobRef, MessageRef};

use crate::error::{Result, StoreError};
use crate::kv::Kv;

const BLOBS: &str = "blobs";
const BY_MESSAGE: &str = "by_message";
const BY_BLOB: &str = "by_blob";

/// Which messages mention which blobs, indexed both ways.
#[derive(Clone, Copy)]
pub struct BlobRepository<'a> {
    kv: Kv<'a>,
}

impl<'a> BlobRepository<'a> {
    pub fn new(kv: Kv<'a>) -> Self {
        Self { kv }
    }

    pub fn put(&self, message: &MessageRef, blobs: &[BlobRef]) -> Result<()> {
        let message_key = message.to_string();
        for blob in blobs {
            let blob_key = blob.to_string();
            self.kv
                .put(&[BLOBS, BY_MESSAGE, message_key.as_str()], blob_key.as_bytes(), &[])?;
            self.kv
                .put(&[BLOBS, BY_BLOB, blob_key.as_str()], message_key.as_bytes(), &[])?;
        }
        Ok(())
    }

    pub fn delete(&self, message: &MessageRef) -> Result<()> {
        let message_key = message.to_string();
        for (blob_key, _) in self.kv.list(&[BLOBS, BY_MESSAGE, message_key.as_str()])? {
            let blob_key = String::from_utf8(blob_key)
                .map_err(|e| StoreError::Invariant(format!("blob key: {e}")))?;
            self.kv
                .delete(&[BLOBS, BY_BLOB, blob_key.as_str()], message_key.as_bytes())?;
        }
        self.kv.delete_bucket(&[BLOBS, BY_MESSAGE, message_key.as_str()])
    }

    /// Messages that mention `blob`.
    pub fn messages_for(&self, blob: &BlobRef) -> Result<Vec<MessageRef>> {
        let blob_key = blob.to_string();
        self.kv
            .list(&[BLOBS, BY_BLOB, blob_key.as_str()])?
            .into_iter()
            .map(|(key, _)| -> Result<MessageRef> {
                let text = std::str::from_utf8(&key)
                    .map_err(|e| StoreError::Invariant(format!("message key: {e}")))?;
                Ok(text.parse()?)
            })
            .collect()
    }

    /// Blobs mentioned by `message`.
    pub fn blobs_for(&self, message: &MessageRef) -> Result<Vec<BlobRef>> {
        let message_key = message.to_string();
        self.kv
            .list(&[BLOBS, BY_MESSAGE, message_key.as_str()])?
            .into_iter()
            .map(|(key, _)| -> Result<BlobRef> {
                let text = std::str::from_utf8(&key)
                    .map_err(|e| StoreError::Invariant(format!("blob key: {e}")))?;
                Ok(text.parse()?)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[test]
    fn test_bidirectional_mapping() {
        let db = Database::open_in_memory().unwrap();
        let msg = MessageRef::from_bytes([1; 32]);
        let other = MessageRef::from_bytes([2; 32]);
        let blob = BlobRef::of_content(b"data");

        db.transact(|tx| {
            tx.blobs.put(&msg, &[blob])?;
            tx.blobs.put(&other, &[blob])?;
            assert_eq!(tx.blobs.blobs_for(&msg)?, vec![blob]);
            assert_eq!(tx.blobs.messages_for(&blob)?.len(), 2);

            tx.blobs.delete(&msg)?;
            assert!(tx.blobs.blobs_for(&msg)?.is_empty());
            assert_eq!(tx.blobs.messages_for(&blob)?, vec![other]);
            Ok(())
        })
        .unwrap();
    }
}

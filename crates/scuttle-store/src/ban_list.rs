use scuttle_shared::{BanHash, FeedRef};
use tracing::info;

use crate::error::{Result, StoreError};
use crate::feeds::FeedRepository;
use crate::kv::Kv;
use crate::models::{BanMapping, BannableType};

const BAN_LIST: &str = "ban_list";
const HASHES: &str = "hashes";
const MAPPING: &str = "mapping";

/// Banned hashes plus the local reverse mapping needed to purge content.
#[derive(Clone, Copy)]
pub struct BanListRepository<'a> {
    kv: Kv<'a>,
}

impl<'a> BanListRepository<'a> {
    pub fn new(kv: Kv<'a>) -> Self {
        Self { kv }
    }

    /// Ban `hash`. A known feed behind the hash is deleted in the same
    /// transaction.
    pub fn add(&self, hash: &BanHash) -> Result<()> {
        self.kv
            .put(&[BAN_LIST, HASHES], hash.to_hex().as_bytes(), &[])?;

        if let Some(mapping) = self.lookup_mapping(hash)? {
            match mapping.typ {
                BannableType::Feed => {
                    let feed: FeedRef = mapping.reference.parse()?;
                    info!(feed = %feed, "deleting banned feed");
                    FeedRepository::new(self.kv).delete_feed(&feed)?;
                }
            }
        }
        Ok(())
    }

    pub fn remove(&self, hash: &BanHash) -> Result<()> {
        self.kv.delete(&[BAN_LIST, HASHES], hash.to_hex().as_bytes())?;
        Ok(())
    }

    pub fn contains(&self, hash: &BanHash) -> Result<bool> {
        self.kv.contains(&[BAN_LIST, HASHES], hash.to_hex().as_bytes())
    }

    pub fn contains_feed(&self, feed: &FeedRef) -> Result<bool> {
        self.contains(&BanHash::of_feed(feed))
    }

    pub fn create_feed_mapping(&self, feed: &FeedRef) -> Result<()> {
        let mapping = BanMapping {
            typ: BannableType::Feed,
            reference: feed.to_string(),
        };
        self.kv.put(
            &[BAN_LIST, MAPPING],
            BanHash::of_feed(feed).to_hex().as_bytes(),
            &serde_json::to_vec(&mapping)?,
        )
    }

    pub fn remove_feed_mapping(&self, feed: &FeedRef) -> Result<()> {
        self.kv
            .delete(&[BAN_LIST, MAPPING], BanHash::of_feed(feed).to_hex().as_bytes())?;
        Ok(())
    }

    pub fn lookup_mapping(&self, hash: &BanHash) -> Result<Option<BanMapping>> {
        self.kv
            .get(&[BAN_LIST, MAPPING], hash.to_hex().as_bytes())?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(StoreError::from))
            .transpose()
    }

    /// Drop every banned hash. Mappings are kept.
    pub fn clear(&self) -> Result<()> {
        self.kv.delete_bucket(&[BAN_LIST, HASHES])
    }

    pub fn list(&self) -> Result<Vec<BanHash>> {
        self.kv
            .list(&[BAN_LIST, HASHES])?
            .into_iter()
            .map(|(key, _)| -> Result<BanHash> {
                let hex = std::str::from_utf8(&key)
                    .map_err(|e| StoreError::Invariant(format!("ban list key: {e}")))?;
                Ok(BanHash::from_hex(hex)?)
            })
            .collect()
    }
}

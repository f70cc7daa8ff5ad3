use std::fmt::Display;
use std::marker::PhantomData;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use scuttle_shared::{BlobRef, FeedRef, RefError};

use crate::error::{Result, StoreError};
use crate::kv::Kv;
use crate::models::WantListEntry;

pub(crate) const BLOB_WANT_LIST: &str = "blob_want_list";
pub(crate) const FEED_WANT_LIST: &str = "feed_want_list";

/// Refs wanted until an expiry time.
///
/// Expired entries are never returned and are deleted when encountered.
#[derive(Clone, Copy)]
pub struct WantListRepository<'a, R> {
    kv: Kv<'a>,
    bucket: &'static str,
    now: DateTime<Utc>,
    _ref: PhantomData<R>,
}

pub type BlobWantListRepository<'a> = WantListRepository<'a, BlobRef>;
pub type FeedWantListRepository<'a> = WantListRepository<'a, FeedRef>;

impl<'a, R> WantListRepository<'a, R>
where
    R: Display + FromStr<Err = RefError>,
{
    pub(crate) fn new(kv: Kv<'a>, bucket: &'static str, now: DateTime<Utc>) -> Self {
        Self {
            kv,
            bucket,
            now,
            _ref: PhantomData,
        }
    }

    /// Want `reference` until `until`. An existing later expiry is kept.
    pub fn add(&self, reference: &R, until: DateTime<Utc>) -> Result<()> {
        let key = reference.to_string();
        if let Some(existing) = self.read(key.as_bytes())? {
            if existing >= until {
                return Ok(());
            }
        }
        self.kv
            .put(&[self.bucket], key.as_bytes(), until.to_rfc3339().as_bytes())
    }

    pub fn contains(&self, reference: &R) -> Result<bool> {
        let key = reference.to_string();
        match self.read(key.as_bytes())? {
            Some(until) if until > self.now => Ok(true),
            Some(_) => {
                self.kv.delete(&[self.bucket], key.as_bytes())?;
                Ok(false)
            }
            None => Ok(false),
        }
    }

    pub fn delete(&self, reference: &R) -> Result<()> {
        self.kv
            .delete(&[self.bucket], reference.to_string().as_bytes())?;
        Ok(())
    }

    /// Unexpired entries; expired ones are pruned on the way.
    pub fn list(&self) -> Result<Vec<WantListEntry<R>>> {
        let mut entries = Vec::new();
        for (key, value) in self.kv.list(&[self.bucket])? {
            let until = parse_until(&value)?;
            if until <= self.now {
                self.kv.delete(&[self.bucket], &key)?;
                continue;
            }
            let reference = std::str::from_utf8(&key)
                .map_err(|e| StoreError::Invariant(format!("want list key: {e}")))?
                .parse::<R>()?;
            entries.push(WantListEntry { reference, until });
        }
        Ok(entries)
    }

    fn read(&self, key: &[u8]) -> Result<Option<DateTime<Utc>>> {
        self.kv
            .get(&[self.bucket], key)?
            .map(|value| parse_until(&value))
            .transpose()
    }
}

fn parse_until(value: &[u8]) -> Result<DateTime<Utc>> {
    let text = std::str::from_utf8(value)
        .map_err(|e| StoreError::Invariant(format!("want list value: {e}")))?;
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Invariant(format!("want list timestamp: {e}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::clock::FixedClock;
    use crate::Database;

    #[test]
    fn test_expired_entries_pruned_lazily() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let delta = Duration::seconds(10);
        let clock = Arc::new(FixedClock::new(t0 - delta));
        let db = Database::open_in_memory()
            .unwrap()
            .with_clock(clock.clone());
        let blob = BlobRef::of_content(b"hello");

        db.transact(|tx| tx.blob_want_list.add(&blob, t0)).unwrap();
        let listed = db.transact(|tx| tx.blob_want_list.list()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].reference, blob);

        clock.set(t0 + delta);
        assert!(db.transact(|tx| tx.blob_want_list.list()).unwrap().is_empty());
        assert!(db.transact(|tx| tx.blob_want_list.list()).unwrap().is_empty());

        // The prune was committed: even an earlier clock no longer sees it.
        clock.set(t0 - delta);
        assert!(db.transact(|tx| tx.blob_want_list.list()).unwrap().is_empty());
    }

    #[test]
    fn test_add_keeps_later_expiry() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(t0));
        let db = Database::open_in_memory().unwrap().with_clock(clock);
        let feed = scuttle_shared::Identity::generate().feed();

        let later = t0 + Duration::hours(2);
        let earlier = t0 + Duration::hours(1);
        let listed = db
            .transact(|tx| {
                tx.feed_want_list.add(&feed, later)?;
                tx.feed_want_list.add(&feed, earlier)?;
                tx.feed_want_list.list()
            })
            .unwrap();
        assert_eq!(listed[0].until, later);

        db.transact(|tx| {
            assert!(tx.feed_want_list.contains(&feed)?);
            tx.feed_want_list.delete(&feed)?;
            assert!(!tx.feed_want_list.contains(&feed)?);
            Ok(())
        })
        .unwrap();
    }
}

//! Nested buckets on top of the `kv` table.
//!
//! A bucket is addressed by its path components. Children of a bucket are
//! found with a range scan because their joined path starts with the parent
//! path followed by the separator.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;

const SEPARATOR: char = '\u{1f}';
// First character after the separator, bounding the range of child buckets.
const SEPARATOR_END: char = '\u{20}';

pub type Entry = (Vec<u8>, Vec<u8>);

pub(crate) fn bucket_path(path: &[&str]) -> String {
    let mut out = String::new();
    for (i, component) in path.iter().enumerate() {
        if i > 0 {
            out.push(SEPARATOR);
        }
        out.push_str(component);
    }
    out
}

/// Bucket operations bound to one open transaction.
#[derive(Clone, Copy)]
pub struct Kv<'a> {
    conn: &'a Connection,
}

impl<'a> Kv<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, bucket: &[&str], key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self
            .conn
            .prepare_cached("SELECT value FROM kv WHERE bucket = ?1 AND key = ?2")?
            .query_row(params![bucket_path(bucket), key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn contains(&self, bucket: &[&str], key: &[u8]) -> Result<bool> {
        Ok(self.get(bucket, key)?.is_some())
    }

    pub fn put(&self, bucket: &[&str], key: &[u8], value: &[u8]) -> Result<()> {
        self.conn
            .prepare_cached("INSERT OR REPLACE INTO kv (bucket, key, value) VALUES (?1, ?2, ?3)")?
            .execute(params![bucket_path(bucket), key, value])?;
        Ok(())
    }

    /// Returns whether a value was removed.
    pub fn delete(&self, bucket: &[&str], key: &[u8]) -> Result<bool> {
        let affected = self
            .conn
            .prepare_cached("DELETE FROM kv WHERE bucket = ?1 AND key = ?2")?
            .execute(params![bucket_path(bucket), key])?;
        Ok(affected > 0)
    }

    /// All entries of a bucket in key order.
    pub fn list(&self, bucket: &[&str]) -> Result<Vec<Entry>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT key, value FROM kv WHERE bucket = ?1 ORDER BY key")?;
        let rows = stmt.query_map(params![bucket_path(bucket)], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Entries with `key >= start` in key order, at most `limit` of them.
    pub fn list_from(&self, bucket: &[&str], start: &[u8], limit: usize) -> Result<Vec<Entry>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT key, value FROM kv WHERE bucket = ?1 AND key >= ?2 ORDER BY key LIMIT ?3",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![bucket_path(bucket), start, limit], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Entry with the greatest key.
    pub fn last(&self, bucket: &[&str]) -> Result<Option<Entry>> {
        let entry = self
            .conn
            .prepare_cached(
                "SELECT key, value FROM kv WHERE bucket = ?1 ORDER BY key DESC LIMIT 1",
            )?
            .query_row(params![bucket_path(bucket)], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;
        Ok(entry)
    }

    pub fn count(&self, bucket: &[&str]) -> Result<u64> {
        let count: i64 = self
            .conn
            .prepare_cached("SELECT COUNT(*) FROM kv WHERE bucket = ?1")?
            .query_row(params![bucket_path(bucket)], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Remove a bucket together with every nested bucket.
    pub fn delete_bucket(&self, bucket: &[&str]) -> Result<()> {
        let path = bucket_path(bucket);
        let (lower, upper) = child_range(&path);
        self.conn
            .prepare_cached(
                "DELETE FROM kv WHERE bucket = ?1 OR (bucket >= ?2 AND bucket < ?3)",
            )?
            .execute(params![path, lower, upper])?;
        Ok(())
    }

    /// Names of the direct, non-empty child buckets in sorted order.
    pub fn child_buckets(&self, bucket: &[&str]) -> Result<Vec<String>> {
        let path = bucket_path(bucket);
        let (lower, upper) = child_range(&path);
        let mut stmt = self.conn.prepare_cached(
            "SELECT DISTINCT bucket FROM kv WHERE bucket >= ?1 AND bucket < ?2 ORDER BY bucket",
        )?;
        let rows = stmt.query_map(params![lower, upper], |row| row.get::<_, String>(0))?;

        let mut children: Vec<String> = Vec::new();
        for row in rows {
            let full = row?;
            let child = full[lower.len()..]
                .split(SEPARATOR)
                .next()
                .unwrap_or_default()
                .to_string();
            if children.last() != Some(&child) {
                children.push(child);
            }
        }
        Ok(children)
    }
}

fn child_range(path: &str) -> (String, String) {
    let mut lower = path.to_string();
    lower.push(SEPARATOR);
    let mut upper = path.to_string();
    upper.push(SEPARATOR_END);
    (lower, upper)
}

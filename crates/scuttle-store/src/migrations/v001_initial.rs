//! v001 -- Bucket table.
//!
//! Every repository lives in the single `kv` table. A bucket path such as
//! `feeds/<feedRef>` is stored as its components joined with the unit
//! separator (0x1F), so all nested buckets of a path sort directly after it.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    bucket TEXT NOT NULL,     -- path components joined with 0x1F
    key    BLOB NOT NULL,
    value  BLOB NOT NULL,
    PRIMARY KEY (bucket, key)
) WITHOUT ROWID;
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}

//! The artwork cache: rendered images keyed on source item and requested
//! size, with timestamp-based aging tied to the underlying files.

use rusqlite::{Connection, OptionalExtension, params};

use super::CacheError;

pub(super) const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS artwork ( \
       id                  INTEGER PRIMARY KEY NOT NULL, \
       type                INTEGER NOT NULL DEFAULT 0, \
       persistentid        INTEGER NOT NULL, \
       max_w               INTEGER NOT NULL, \
       max_h               INTEGER NOT NULL, \
       format              INTEGER NOT NULL, \
       filepath            VARCHAR(4096) NOT NULL, \
       db_timestamp        INTEGER DEFAULT 0, \
       data                BLOB \
     );",
    "CREATE INDEX IF NOT EXISTS idx_persistentidwh ON artwork(type, persistentid, max_w, max_h);",
    "CREATE INDEX IF NOT EXISTS idx_pathtime ON artwork(filepath, db_timestamp);",
];

/// One rendered image to store
#[derive(Debug, Clone)]
pub struct ArtworkEntry {
    /// Source kind (item or group artwork)
    pub type_: i64,
    pub persistent_id: i64,
    pub max_w: i64,
    pub max_h: i64,
    /// Image format code; 0 marks a negative entry (no artwork found)
    pub format: i64,
    pub filepath: String,
    pub data: Vec<u8>,
}

pub(super) fn add(conn: &Connection, entry: &ArtworkEntry) -> Result<(), CacheError> {
    conn.execute(
        "INSERT INTO artwork (type, persistentid, max_w, max_h, format, filepath, db_timestamp, data) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
        params![
            entry.type_,
            entry.persistent_id,
            entry.max_w,
            entry.max_h,
            entry.format,
            entry.filepath,
            unix_now(),
            entry.data,
        ],
    )?;
    Ok(())
}

pub(super) fn get(
    conn: &Connection,
    type_: i64,
    persistent_id: i64,
    max_w: i64,
    max_h: i64,
) -> Result<Option<(i64, Vec<u8>)>, CacheError> {
    Ok(conn
        .query_row(
            "SELECT format, data FROM artwork \
             WHERE type = ?1 AND persistentid = ?2 AND max_w = ?3 AND max_h = ?4;",
            params![type_, persistent_id, max_w, max_h],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?)
}

/// The file at `path` was scanned again. Rows at least as new as the file
/// are still valid and get their timestamp bumped; when `delete_older` is
/// set, rows predating the file's modification are dropped (the image
/// changed).
pub(super) fn ping(
    conn: &Connection,
    path: &str,
    mtime: i64,
    delete_older: bool,
) -> Result<(), CacheError> {
    conn.execute(
        "UPDATE artwork SET db_timestamp = ?1 WHERE filepath = ?2 AND db_timestamp >= ?3;",
        params![unix_now(), path, mtime],
    )?;

    if delete_older {
        conn.execute(
            "DELETE FROM artwork WHERE filepath = ?1 AND db_timestamp < ?2;",
            params![path, mtime],
        )?;
    }
    Ok(())
}

/// Drop entries whose files have not been seen since `older_than`
pub(super) fn purge_cruft(conn: &Connection, older_than: i64) -> Result<(), CacheError> {
    let deleted = conn.execute(
        "DELETE FROM artwork WHERE db_timestamp < ?1;",
        [older_than],
    )?;
    if deleted > 0 {
        tracing::debug!("artwork cache purged {deleted} stale entries");
    }
    Ok(())
}

fn unix_now() -> i64 {
    #[allow(clippy::cast_possible_wrap)]
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}

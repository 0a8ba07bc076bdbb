//! The transcode-header cache. Mirrors the library's file table and stores
//! one prepared MP4/ALAC header per file under the "mp4" format key.

use std::collections::HashSet;

use rusqlite::{Connection, OptionalExtension, params};

use super::{CacheError, LibraryFile};

pub(super) const FORMAT_MP4: &str = "mp4";

pub(super) const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS files ( \
       id                 INTEGER PRIMARY KEY NOT NULL, \
       time_modified      INTEGER DEFAULT 0, \
       filepath           VARCHAR(4096) NOT NULL \
     );",
    "CREATE TABLE IF NOT EXISTS data ( \
       id                 INTEGER PRIMARY KEY NOT NULL, \
       timestamp          INTEGER DEFAULT 0, \
       file_id            INTEGER DEFAULT 0, \
       format             VARCHAR(255) NOT NULL, \
       header             BLOB, \
       UNIQUE(file_id, format) ON CONFLICT REPLACE \
     );",
];

/// Walk the library files and the cached files, both sorted by id, and make
/// the cache mirror the library: insert new rows, delete vanished ones,
/// refresh rows whose `time_modified` moved. Returns the number of changes.
pub(super) fn sync_files(conn: &Connection, files: &[LibraryFile]) -> Result<usize, CacheError> {
    let mut library: Vec<&LibraryFile> = files.iter().collect();
    library.sort_by_key(|f| f.id);

    let cached: Vec<(i64, i64)> = {
        let mut stmt = conn.prepare("SELECT id, time_modified FROM files ORDER BY id;")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.filter_map(Result::ok).collect()
    };

    let mut changes = 0;
    let mut lib_iter = library.into_iter().peekable();
    let mut cache_iter = cached.into_iter().peekable();

    loop {
        match (lib_iter.peek(), cache_iter.peek()) {
            (Some(lib), Some((cache_id, cache_mtime))) => {
                if lib.id < *cache_id {
                    insert(conn, lib)?;
                    changes += 1;
                    lib_iter.next();
                } else if lib.id > *cache_id {
                    remove(conn, *cache_id)?;
                    changes += 1;
                    cache_iter.next();
                } else {
                    if lib.time_modified != *cache_mtime {
                        refresh(conn, lib)?;
                        changes += 1;
                    }
                    lib_iter.next();
                    cache_iter.next();
                }
            }
            (Some(lib), None) => {
                insert(conn, lib)?;
                changes += 1;
                lib_iter.next();
            }
            (None, Some((cache_id, _))) => {
                remove(conn, *cache_id)?;
                changes += 1;
                cache_iter.next();
            }
            (None, None) => break,
        }
    }

    Ok(changes)
}

fn insert(conn: &Connection, file: &LibraryFile) -> Result<(), CacheError> {
    conn.execute(
        "INSERT INTO files (id, time_modified, filepath) VALUES (?1, ?2, ?3);",
        params![file.id, file.time_modified, file.path],
    )?;
    Ok(())
}

fn remove(conn: &Connection, file_id: i64) -> Result<(), CacheError> {
    conn.execute("DELETE FROM files WHERE id = ?1;", [file_id])?;
    conn.execute("DELETE FROM data WHERE file_id = ?1;", [file_id])?;
    Ok(())
}

/// The file changed on disk: update the row and invalidate its header so
/// the pump prepares a fresh one
fn refresh(conn: &Connection, file: &LibraryFile) -> Result<(), CacheError> {
    conn.execute(
        "UPDATE files SET time_modified = ?1, filepath = ?2 WHERE id = ?3;",
        params![file.time_modified, file.path, file.id],
    )?;
    conn.execute("DELETE FROM data WHERE file_id = ?1;", [file.id])?;
    Ok(())
}

/// The next file without a prepared header, skipping in-flight jobs
pub(super) fn next_without_header(
    conn: &Connection,
    exclude: &HashSet<i64>,
) -> Result<Option<(i64, String)>, CacheError> {
    let candidates: Vec<(i64, String)> = {
        let mut stmt = conn.prepare(
            "SELECT f.id, f.filepath FROM files f \
             LEFT JOIN data d ON d.file_id = f.id AND d.format = ?1 \
             WHERE d.id IS NULL ORDER BY f.id LIMIT ?2;",
        )?;
        let limit = (exclude.len() + 1) as i64;
        let rows = stmt.query_map(params![FORMAT_MP4, limit], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        rows.filter_map(Result::ok).collect()
    };

    Ok(candidates.into_iter().find(|(id, _)| !exclude.contains(id)))
}

pub(super) fn header_store(conn: &Connection, file_id: i64, header: &[u8]) -> Result<(), CacheError> {
    conn.execute(
        "INSERT INTO data (timestamp, file_id, format, header) VALUES (?1, ?2, ?3, ?4);",
        params![unix_now(), file_id, FORMAT_MP4, header],
    )?;
    Ok(())
}

pub(super) fn header_get(
    conn: &Connection,
    file_id: i64,
    format: &str,
) -> Result<Option<Vec<u8>>, CacheError> {
    let header: Option<Option<Vec<u8>>> = conn
        .query_row(
            "SELECT header FROM data WHERE file_id = ?1 AND format = ?2;",
            params![file_id, format],
            |row| row.get(0),
        )
        .optional()?;
    // A stored empty header means preparation failed; that is a miss
    Ok(header.flatten().filter(|h| !h.is_empty()))
}

/// Current cache contents sorted by id, used by the sync tests
pub(super) fn files_snapshot(conn: &Connection) -> Result<Vec<(i64, i64)>, CacheError> {
    let mut stmt = conn.prepare("SELECT id, time_modified FROM files ORDER BY id;")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.filter_map(Result::ok).collect())
}

fn unix_now() -> i64 {
    #[allow(clippy::cast_possible_wrap)]
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}

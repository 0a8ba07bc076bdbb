//! The DAAP reply cache: gzipped replies for the twenty most recent slow
//! queries, rebuilt in the background when the library changes.

use rusqlite::{Connection, OptionalExtension, params};

use super::CacheError;

pub(super) const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS replies ( \
       id                 INTEGER PRIMARY KEY NOT NULL, \
       query              VARCHAR(4096) NOT NULL, \
       reply              BLOB \
     );",
    "CREATE TABLE IF NOT EXISTS queries ( \
       id                 INTEGER PRIMARY KEY NOT NULL, \
       query              VARCHAR(4096) UNIQUE NOT NULL, \
       user_agent         VARCHAR(1024), \
       is_remote          INTEGER DEFAULT 0, \
       msec               INTEGER DEFAULT 0, \
       timestamp          INTEGER DEFAULT 0 \
     );",
    "CREATE INDEX IF NOT EXISTS idx_query ON replies (query);",
];

/// Only queries the DAAP module can regenerate offline are cacheable
#[must_use]
pub fn is_cacheable(query: &str) -> bool {
    let path = query.split('?').next().unwrap_or(query);
    if !path.starts_with("/databases/") {
        return false;
    }
    path.contains("/items") || path.contains("/containers/")
}

/// Remove the transient parameters so logically identical queries share one
/// cache slot
#[must_use]
pub fn normalize(query: &str) -> String {
    let Some((path, params)) = query.split_once('?') else {
        return query.to_string();
    };

    let kept: Vec<&str> = params
        .split('&')
        .filter(|p| {
            let key = p.split('=').next().unwrap_or("");
            key != "session-id" && key != "revision-number"
        })
        .collect();

    if kept.is_empty() {
        path.to_string()
    } else {
        format!("{}?{}", path, kept.join("&"))
    }
}

/// Upsert a query and trim the table to the most recent `limit`
pub(super) fn add_query(
    conn: &Connection,
    query: &str,
    user_agent: &str,
    is_remote: bool,
    msec: i64,
    limit: i64,
) -> Result<(), CacheError> {
    let query = normalize(query);
    let now = unix_now();

    conn.execute(
        "INSERT INTO queries (query, user_agent, is_remote, msec, timestamp) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(query) DO UPDATE SET timestamp = ?5, msec = ?4;",
        params![query, user_agent, is_remote as i64, msec, now],
    )?;

    conn.execute(
        "DELETE FROM queries WHERE id NOT IN \
         (SELECT id FROM queries ORDER BY timestamp DESC, id DESC LIMIT ?1);",
        [limit],
    )?;

    tracing::debug!("DAAP query added to cache ({msec} ms): {query}");
    Ok(())
}

pub(super) fn get_reply(conn: &Connection, query: &str) -> Result<Option<Vec<u8>>, CacheError> {
    let query = normalize(query);
    Ok(conn
        .query_row(
            "SELECT reply FROM replies WHERE query = ?1;",
            [query],
            |row| row.get(0),
        )
        .optional()?)
}

/// Drop all cached replies and regenerate them from the stored queries
pub(super) fn rebuild_replies(
    conn: &Connection,
    rebuild: &(dyn Fn(&str, &str, bool) -> Option<Vec<u8>> + Send + Sync),
) -> Result<(), CacheError> {
    conn.execute("DELETE FROM replies;", [])?;

    let queries: Vec<(String, String, bool)> = {
        let mut stmt =
            conn.prepare("SELECT query, user_agent, is_remote FROM queries ORDER BY timestamp;")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                row.get::<_, i64>(2)? != 0,
            ))
        })?;
        rows.filter_map(Result::ok).collect()
    };

    let mut rebuilt = 0;
    for (query, user_agent, is_remote) in queries {
        let Some(reply) = rebuild(&query, &user_agent, is_remote) else {
            tracing::warn!("DAAP reply rebuild produced nothing for: {query}");
            continue;
        };
        conn.execute(
            "INSERT INTO replies (query, reply) VALUES (?1, ?2);",
            params![query, reply],
        )?;
        rebuilt += 1;
    }

    tracing::debug!("DAAP reply cache rebuilt, {rebuilt} replies");
    Ok(())
}

fn unix_now() -> i64 {
    #[allow(clippy::cast_possible_wrap)]
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}

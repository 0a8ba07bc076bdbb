use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;

use super::*;
use crate::worker::WorkerPool;

fn memory_db(version: i64, schema: &[&str]) -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS admin(key VARCHAR(32) PRIMARY KEY NOT NULL, value VARCHAR(32) NOT NULL);",
    )
    .unwrap();
    for statement in schema {
        conn.execute_batch(statement).unwrap();
    }
    conn.execute(
        "INSERT INTO admin (key, value) VALUES ('cache_version', ?1);",
        [version.to_string()],
    )
    .unwrap();
    conn
}

fn query_count(conn: &Connection) -> i64 {
    conn.query_row("SELECT COUNT(*) FROM queries;", [], |r| r.get(0))
        .unwrap()
}

#[test]
fn daap_normalize_strips_transient_params() {
    assert_eq!(
        daap::normalize("/databases/1/items?meta=all&session-id=42&type=music"),
        "/databases/1/items?meta=all&type=music"
    );
    assert_eq!(
        daap::normalize("/databases/1/items?session-id=42&revision-number=7"),
        "/databases/1/items"
    );
    assert_eq!(daap::normalize("/databases/1/items"), "/databases/1/items");
}

#[test]
fn daap_allow_list() {
    assert!(is_cacheable("/databases/1/items?meta=all"));
    assert!(is_cacheable("/databases/1/containers/3/items"));
    assert!(!is_cacheable("/server-info"));
    assert!(!is_cacheable("/login"));
    assert!(!is_cacheable("/databases/1/browse/artists"));
}

#[test]
fn daap_cache_keeps_twenty_most_recent_queries() {
    let conn = memory_db(CACHE_DAAP_VERSION, daap::SCHEMA);

    for i in 0..25 {
        daap::add_query(
            &conn,
            &format!("/databases/1/items?meta=q{i}"),
            "iTunes/12",
            false,
            250,
            DAAP_QUERY_LIMIT,
        )
        .unwrap();
    }

    assert_eq!(query_count(&conn), 20);

    // The survivors are the 20 most recent ones (q5..q24)
    let mut stmt = conn.prepare("SELECT query FROM queries ORDER BY id;").unwrap();
    let queries: Vec<String> = stmt
        .query_map([], |r| r.get(0))
        .unwrap()
        .filter_map(Result::ok)
        .collect();
    assert_eq!(queries.len(), 20);
    assert!(queries[0].contains("q5"));
    assert!(queries[19].contains("q24"));
}

#[test]
fn daap_re_adding_a_query_does_not_duplicate() {
    let conn = memory_db(CACHE_DAAP_VERSION, daap::SCHEMA);

    for _ in 0..3 {
        daap::add_query(&conn, "/databases/1/items?meta=x", "ua", false, 300, 20).unwrap();
    }
    assert_eq!(query_count(&conn), 1);
}

#[test]
fn daap_rebuild_and_lookup_with_different_session_id() {
    let conn = memory_db(CACHE_DAAP_VERSION, daap::SCHEMA);

    daap::add_query(
        &conn,
        "/databases/1/items?meta=all&session-id=99",
        "Remote",
        true,
        500,
        20,
    )
    .unwrap();

    daap::rebuild_replies(&conn, &|query, user_agent, is_remote| {
        assert_eq!(query, "/databases/1/items?meta=all");
        assert_eq!(user_agent, "Remote");
        assert!(is_remote);
        Some(b"gzipped-reply".to_vec())
    })
    .unwrap();

    // Hit with a different session-id: stripped before lookup
    let reply = daap::get_reply(&conn, "/databases/1/items?meta=all&session-id=42").unwrap();
    assert_eq!(reply, Some(b"gzipped-reply".to_vec()));

    let miss = daap::get_reply(&conn, "/databases/1/items?meta=other").unwrap();
    assert_eq!(miss, None);
}

#[test]
fn artwork_ping_bumps_and_deletes() {
    let conn = memory_db(CACHE_ARTWORK_VERSION, artwork::SCHEMA);

    artwork::add(
        &conn,
        &ArtworkEntry {
            type_: 0,
            persistent_id: 1234,
            max_w: 600,
            max_h: 600,
            format: 1,
            filepath: "/music/album/cover.jpg".to_string(),
            data: vec![0xff, 0xd8],
        },
    )
    .unwrap();

    let t0: i64 = conn
        .query_row("SELECT db_timestamp FROM artwork;", [], |r| r.get(0))
        .unwrap();

    // File unchanged: timestamp bumped to now
    artwork::ping(&conn, "/music/album/cover.jpg", t0, false).unwrap();
    let bumped: i64 = conn
        .query_row("SELECT db_timestamp FROM artwork;", [], |r| r.get(0))
        .unwrap();
    assert!(bumped >= t0);

    let found = artwork::get(&conn, 0, 1234, 600, 600).unwrap();
    assert_eq!(found, Some((1, vec![0xff, 0xd8])));

    // File modified after our row: the del flag removes it
    artwork::ping(&conn, "/music/album/cover.jpg", bumped + 1, true).unwrap();
    assert_eq!(artwork::get(&conn, 0, 1234, 600, 600).unwrap(), None);
}

#[test]
fn artwork_purge_cruft_uses_reference_time() {
    let conn = memory_db(CACHE_ARTWORK_VERSION, artwork::SCHEMA);

    artwork::add(
        &conn,
        &ArtworkEntry {
            type_: 0,
            persistent_id: 1,
            max_w: 64,
            max_h: 64,
            format: 1,
            filepath: "/a.jpg".to_string(),
            data: vec![1],
        },
    )
    .unwrap();

    let now: i64 = conn
        .query_row("SELECT db_timestamp FROM artwork;", [], |r| r.get(0))
        .unwrap();

    artwork::purge_cruft(&conn, now).unwrap();
    assert_eq!(artwork::get(&conn, 0, 1, 64, 64).unwrap(), None);
}

#[test]
fn xcode_sync_mirrors_library_files() {
    let conn = memory_db(CACHE_XCODE_VERSION, xcode::SCHEMA);

    // Seed the cache with [(2,100),(3,90),(5,100)]
    for (id, mtime) in [(2, 100), (3, 90), (5, 100)] {
        conn.execute(
            "INSERT INTO files (id, time_modified, filepath) VALUES (?1, ?2, ?3);",
            rusqlite::params![id, mtime, format!("/f{id}.flac")],
        )
        .unwrap();
    }
    // File 3 had a prepared header that must go away on refresh
    conn.execute(
        "INSERT INTO data (file_id, format, header) VALUES (3, 'mp4', x'AA');",
        [],
    )
    .unwrap();

    let library = vec![
        LibraryFile { id: 1, time_modified: 100, path: "/f1.flac".into() },
        LibraryFile { id: 3, time_modified: 100, path: "/f3.flac".into() },
        LibraryFile { id: 5, time_modified: 100, path: "/f5.flac".into() },
    ];
    xcode::sync_files(&conn, &library).unwrap();

    assert_eq!(
        xcode::files_snapshot(&conn).unwrap(),
        vec![(1, 100), (3, 100), (5, 100)]
    );

    // The stale header of the refreshed file is gone
    assert_eq!(xcode::header_get(&conn, 3, "mp4").unwrap(), None);
}

#[test]
fn xcode_header_roundtrip_and_empty_marker() {
    let conn = memory_db(CACHE_XCODE_VERSION, xcode::SCHEMA);

    conn.execute(
        "INSERT INTO files (id, time_modified, filepath) VALUES (7, 1, '/x.flac');",
        [],
    )
    .unwrap();

    let next = xcode::next_without_header(&conn, &std::collections::HashSet::new()).unwrap();
    assert_eq!(next, Some((7, "/x.flac".to_string())));

    xcode::header_store(&conn, 7, b"ftypM4A ").unwrap();
    assert_eq!(
        xcode::header_get(&conn, 7, "mp4").unwrap(),
        Some(b"ftypM4A ".to_vec())
    );

    // Prepared files are no longer work items
    assert_eq!(
        xcode::next_without_header(&conn, &std::collections::HashSet::new()).unwrap(),
        None
    );

    // An empty header marks a failed prepare and reads as a miss
    conn.execute("DELETE FROM data WHERE file_id = 7;", []).unwrap();
    xcode::header_store(&conn, 7, b"").unwrap();
    assert_eq!(xcode::header_get(&conn, 7, "mp4").unwrap(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn cache_thread_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        daap_path: dir.path().join("daap.db"),
        artwork_path: dir.path().join("artwork.db"),
        xcode_path: dir.path().join("xcode.db"),
        daap_threshold_ms: 100,
        daap_rebuild_delay: Duration::from_millis(100),
        xcode_sync_delay: Duration::from_millis(100),
        ..CacheConfig::default()
    };

    let workers = Arc::new(WorkerPool::start(2, None, None));
    let cache = Cache::start(
        config,
        Arc::new(|query, _, _| Some(format!("reply:{query}").into_bytes())),
        Arc::new(|path| Some(format!("header:{path}").into_bytes())),
        workers,
    )
    .unwrap();
    let handle = cache.handle();

    // Below the threshold: not cached
    handle.daap_add("/databases/1/items?meta=fast", "ua", false, 10).unwrap();
    // Above the threshold: cached and rebuilt
    handle
        .daap_add("/databases/1/items?meta=all&session-id=1", "ua", false, 400)
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;

    let hit = handle.daap_get("/databases/1/items?meta=all&session-id=777").await;
    assert_eq!(hit, Some(b"reply:/databases/1/items?meta=all".to_vec()));
    assert_eq!(handle.daap_get("/databases/1/items?meta=fast").await, None);

    // Transcode sync and the prepare pump
    handle
        .library_updated(vec![LibraryFile {
            id: 1,
            time_modified: 5,
            path: "/song.flac".into(),
        }])
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;

    let header = handle.xcode_header_get(1, "mp4").await;
    assert_eq!(header, Some(b"header:/song.flac".to_vec()));

    // Artwork stash shortcut
    handle.artwork_stash(vec![9, 9], "/cover.png", 2).unwrap();
    assert_eq!(handle.artwork_read("/cover.png").await, Some((2, vec![9, 9])));
    assert_eq!(handle.artwork_read("/other.png").await, None);

    cache.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn cache_suspend_gates_the_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        daap_path: dir.path().join("daap.db"),
        artwork_path: dir.path().join("artwork.db"),
        xcode_path: dir.path().join("xcode.db"),
        daap_threshold_ms: 0,
        daap_rebuild_delay: Duration::from_millis(80),
        ..CacheConfig::default()
    };

    let workers = Arc::new(WorkerPool::start(1, None, None));
    let cache = Cache::start(
        config,
        Arc::new(|_, _, _| Some(b"reply".to_vec())),
        Arc::new(|_| None),
        workers,
    )
    .unwrap();
    let handle = cache.handle();

    handle.daap_suspend().unwrap();
    handle.daap_add("/databases/1/items?meta=x", "ua", false, 10).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Suspended: the timer fired but no replies were built
    assert_eq!(handle.daap_get("/databases/1/items?meta=x").await, None);

    handle.daap_resume().unwrap();
    handle.daap_add("/databases/1/items?meta=x", "ua", false, 10).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(
        handle.daap_get("/databases/1/items?meta=x").await,
        Some(b"reply".to_vec())
    );

    cache.stop();
}

#[test]
fn version_mismatch_drops_tables() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("daap.db");

    {
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE admin(key VARCHAR(32) PRIMARY KEY NOT NULL, value VARCHAR(32) NOT NULL); \
             CREATE TABLE replies (id INTEGER PRIMARY KEY NOT NULL, query VARCHAR(4096) NOT NULL, reply BLOB); \
             CREATE TABLE queries (id INTEGER PRIMARY KEY NOT NULL, query VARCHAR(4096) UNIQUE NOT NULL, \
               user_agent VARCHAR(1024), is_remote INTEGER DEFAULT 0, msec INTEGER DEFAULT 0, timestamp INTEGER DEFAULT 0); \
             INSERT INTO admin (key, value) VALUES ('cache_version', '3'); \
             INSERT INTO queries (query) VALUES ('/databases/1/items?old');",
        )
        .unwrap();
    }

    let conn = open_database(&path, &CacheConfig::default(), CACHE_DAAP_VERSION, daap::SCHEMA).unwrap();

    // The old contents are gone, the version is current
    assert_eq!(query_count(&conn), 0);
    let version: String = conn
        .query_row("SELECT value FROM admin WHERE key = 'cache_version';", [], |r| r.get(0))
        .unwrap();
    assert_eq!(version, CACHE_DAAP_VERSION.to_string());
}

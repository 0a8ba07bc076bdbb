//! Cache subsystem driven through its public handle, the way the DAAP and
//! artwork front-ends use it.

use std::sync::Arc;
use std::time::Duration;

use tonecast::cache::{ArtworkEntry, Cache, CacheConfig, LibraryFile, is_cacheable};
use tonecast::worker::WorkerPool;

fn test_config(dir: &tempfile::TempDir) -> CacheConfig {
    CacheConfig {
        daap_path: dir.path().join("daap.db"),
        artwork_path: dir.path().join("artwork.db"),
        xcode_path: dir.path().join("xcode.db"),
        daap_threshold_ms: 0,
        daap_rebuild_delay: Duration::from_millis(100),
        xcode_sync_delay: Duration::from_millis(100),
        ..CacheConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn daap_reply_cache_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let workers = Arc::new(WorkerPool::start(2, None, None));

    let cache = Cache::start(
        test_config(&dir),
        Arc::new(|query, _, _| Some(format!("gz:{query}").into_bytes())),
        Arc::new(|_| None),
        workers,
    )
    .unwrap();
    let handle = cache.handle();

    handle
        .daap_add("/databases/1/items?meta=dmap.itemname&session-id=9", "iTunes/12.9", false, 900)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    // S6: the hit survives a different session-id
    let reply = handle
        .daap_get("/databases/1/items?meta=dmap.itemname&session-id=42")
        .await;
    assert_eq!(
        reply,
        Some(b"gz:/databases/1/items?meta=dmap.itemname".to_vec())
    );

    // Non-allow-listed queries never enter the cache
    assert!(is_cacheable("/databases/1/containers/5/items"));
    assert!(!is_cacheable("/update"));
    handle.daap_add("/update?rev=2", "iTunes/12.9", false, 900).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(handle.daap_get("/update?rev=2").await, None);

    cache.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn artwork_cache_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let workers = Arc::new(WorkerPool::start(2, None, None));

    let cache = Cache::start(
        test_config(&dir),
        Arc::new(|_, _, _| None),
        Arc::new(|_| None),
        workers,
    )
    .unwrap();
    let handle = cache.handle();

    handle
        .artwork_add(ArtworkEntry {
            type_: 0,
            persistent_id: 77,
            max_w: 300,
            max_h: 300,
            format: 1,
            filepath: "/music/x/cover.jpg".to_string(),
            data: vec![0xff, 0xd8, 0xff],
        })
        .unwrap();

    let hit = handle.artwork_get(0, 77, 300, 300).await;
    assert_eq!(hit, Some((1, vec![0xff, 0xd8, 0xff])));

    // Other size: miss
    assert_eq!(handle.artwork_get(0, 77, 600, 600).await, None);

    // A changed file with the delete flag removes the row
    handle
        .artwork_ping("/music/x/cover.jpg", i64::MAX, true)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.artwork_get(0, 77, 300, 300).await, None);

    cache.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn transcode_headers_follow_the_library() {
    let dir = tempfile::tempdir().unwrap();
    let workers = Arc::new(WorkerPool::start(4, None, None));

    let cache = Cache::start(
        test_config(&dir),
        Arc::new(|_, _, _| None),
        Arc::new(|path| Some(format!("hdr:{path}").into_bytes())),
        workers,
    )
    .unwrap();
    let handle = cache.handle();

    handle
        .library_updated(vec![
            LibraryFile { id: 1, time_modified: 100, path: "/a.flac".into() },
            LibraryFile { id: 3, time_modified: 100, path: "/b.flac".into() },
        ])
        .unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(
        handle.xcode_header_get(1, "mp4").await,
        Some(b"hdr:/a.flac".to_vec())
    );
    assert_eq!(
        handle.xcode_header_get(3, "mp4").await,
        Some(b"hdr:/b.flac".to_vec())
    );

    // A library update that removes file 3 removes its header too
    handle
        .library_updated(vec![LibraryFile {
            id: 1,
            time_modified: 100,
            path: "/a.flac".into(),
        }])
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(handle.xcode_header_get(3, "mp4").await, None);
    assert!(handle.xcode_header_get(1, "mp4").await.is_some());

    cache.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn prepared_mp4_headers_are_servable() {
    // The real header preparation produces an MP4 init segment from the
    // ALAC encoder configuration
    let dir = tempfile::tempdir().unwrap();
    let workers = Arc::new(WorkerPool::start(2, None, None));

    let cache = Cache::start(
        test_config(&dir),
        Arc::new(|_, _, _| None),
        Arc::new(|_| {
            tonecast::alac::Mp4Header::prepare(tonecast::types::AudioQuality::default())
                .ok()
                .map(|h| h.to_bytes())
        }),
        workers,
    )
    .unwrap();
    let handle = cache.handle();

    handle
        .library_updated(vec![LibraryFile {
            id: 9,
            time_modified: 1,
            path: "/song.flac".into(),
        }])
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let header = handle.xcode_header_get(9, "mp4").await.expect("header prepared");
    assert_eq!(&header[4..8], b"ftyp");

    cache.stop();
}

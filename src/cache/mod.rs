//! The cache subsystem: three SQLite databases behind one dedicated thread.
//!
//! All SQL runs on the cache thread; callers post commands over a queue and
//! optionally wait for the reply. The DAAP reply cache keeps gzipped replies
//! for the twenty most recent slow queries and rebuilds them in the
//! background after library updates; the artwork cache stores rendered
//! images keyed on source and size; the transcode cache mirrors the library
//! file table and prepares MP4/ALAC headers on the worker pool so device
//! sessions can stream pre-built headers.
//!
//! Cache errors are deliberately soft: callers treat them as cache misses.

mod artwork;
mod daap;
mod xcode;

#[cfg(test)]
mod tests;

pub use artwork::ArtworkEntry;
pub use daap::is_cacheable;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::worker::WorkerPool;

/// Schema versions; a mismatch drops and recreates the tables
const CACHE_DAAP_VERSION: i64 = 5;
const CACHE_ARTWORK_VERSION: i64 = 5;
const CACHE_XCODE_VERSION: i64 = 1;

/// Maximum queries kept in the DAAP cache
const DAAP_QUERY_LIMIT: i64 = 20;

/// Concurrent header-prepare jobs
const XCODE_NTHREADS: usize = 4;

/// Errors from the cache subsystem
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("cache thread is gone")]
    Gone,
}

/// Builds a gzipped DAAP reply for a query during a background rebuild.
/// Arguments: query, user agent, is_remote.
pub type DaapRebuildFn = Arc<dyn Fn(&str, &str, bool) -> Option<Vec<u8>> + Send + Sync>;

/// Prepares the MP4/ALAC header for a library file; the slow, blocking part
/// that runs on the worker pool
pub type XcodeHeaderFn = Arc<dyn Fn(&str) -> Option<Vec<u8>> + Send + Sync>;

/// Cache configuration
#[derive(Clone)]
pub struct CacheConfig {
    pub daap_path: PathBuf,
    pub artwork_path: PathBuf,
    pub xcode_path: PathBuf,
    /// Only queries slower than this get cached (0 caches everything)
    pub daap_threshold_ms: i64,
    /// Delay between a DAAP add and the reply rebuild
    pub daap_rebuild_delay: Duration,
    /// Delay between a library update and the transcode table sync
    pub xcode_sync_delay: Duration,
    pub xcode_enabled: bool,
    /// Pragmas applied to every connection
    pub journal_mode: String,
    pub synchronous: i64,
    /// Applied when above -1
    pub mmap_size: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            daap_path: PathBuf::from("cache_daap.db"),
            artwork_path: PathBuf::from("cache_artwork.db"),
            xcode_path: PathBuf::from("cache_xcode.db"),
            daap_threshold_ms: 100,
            daap_rebuild_delay: Duration::from_secs(60),
            xcode_sync_delay: Duration::from_secs(10),
            xcode_enabled: true,
            journal_mode: "DELETE".to_string(),
            synchronous: 1,
            mmap_size: -1,
        }
    }
}

/// A library file, as reported by a library-update notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryFile {
    pub id: i64,
    pub time_modified: i64,
    pub path: String,
}

pub(crate) enum Command {
    DaapAdd {
        query: String,
        user_agent: String,
        is_remote: bool,
        msec: i64,
    },
    DaapGet {
        query: String,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    DaapSuspend,
    DaapResume,
    ArtworkAdd {
        entry: ArtworkEntry,
    },
    ArtworkGet {
        type_: i64,
        persistent_id: i64,
        max_w: i64,
        max_h: i64,
        reply: oneshot::Sender<Option<(i64, Vec<u8>)>>,
    },
    ArtworkPing {
        path: String,
        mtime: i64,
        delete_older: bool,
    },
    ArtworkPurge {
        older_than: i64,
    },
    ArtworkStash {
        data: Vec<u8>,
        path: String,
        format: i64,
    },
    ArtworkRead {
        path: String,
        reply: oneshot::Sender<Option<(i64, Vec<u8>)>>,
    },
    LibraryUpdate {
        files: Vec<LibraryFile>,
    },
    XcodeHeaderGet {
        file_id: i64,
        format: String,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    XcodeJobDone {
        file_id: i64,
        header: Option<Vec<u8>>,
    },
    Shutdown,
}

/// Cloneable handle used by every caller of the cache
#[derive(Clone)]
pub struct CacheHandle {
    tx: mpsc::Sender<Command>,
}

impl CacheHandle {
    fn post(&self, command: Command) -> Result<(), CacheError> {
        self.tx.send(command).map_err(|_| CacheError::Gone)
    }

    /// Record a served DAAP query so its reply gets cached
    pub fn daap_add(
        &self,
        query: &str,
        user_agent: &str,
        is_remote: bool,
        msec: i64,
    ) -> Result<(), CacheError> {
        self.post(Command::DaapAdd {
            query: query.to_string(),
            user_agent: user_agent.to_string(),
            is_remote,
            msec,
        })
    }

    /// Look up a cached DAAP reply
    pub async fn daap_get(&self, query: &str) -> Option<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.post(Command::DaapGet {
            query: query.to_string(),
            reply: tx,
        })
        .ok()?;
        rx.await.ok().flatten()
    }

    /// Gate the rebuild timer around bulk library scans
    pub fn daap_suspend(&self) -> Result<(), CacheError> {
        self.post(Command::DaapSuspend)
    }

    pub fn daap_resume(&self) -> Result<(), CacheError> {
        self.post(Command::DaapResume)
    }

    pub fn artwork_add(&self, entry: ArtworkEntry) -> Result<(), CacheError> {
        self.post(Command::ArtworkAdd { entry })
    }

    pub async fn artwork_get(
        &self,
        type_: i64,
        persistent_id: i64,
        max_w: i64,
        max_h: i64,
    ) -> Option<(i64, Vec<u8>)> {
        let (tx, rx) = oneshot::channel();
        self.post(Command::ArtworkGet {
            type_,
            persistent_id,
            max_w,
            max_h,
            reply: tx,
        })
        .ok()?;
        rx.await.ok().flatten()
    }

    /// Bump `db_timestamp` for rows of an unchanged file; optionally delete
    /// rows older than `mtime`
    pub fn artwork_ping(&self, path: &str, mtime: i64, delete_older: bool) -> Result<(), CacheError> {
        self.post(Command::ArtworkPing {
            path: path.to_string(),
            mtime,
            delete_older,
        })
    }

    /// Delete rows whose `db_timestamp` predates `older_than`
    pub fn artwork_purge_cruft(&self, older_than: i64) -> Result<(), CacheError> {
        self.post(Command::ArtworkPurge { older_than })
    }

    /// Keep one image in the in-memory stash slot
    pub fn artwork_stash(&self, data: Vec<u8>, path: &str, format: i64) -> Result<(), CacheError> {
        self.post(Command::ArtworkStash {
            data,
            path: path.to_string(),
            format,
        })
    }

    /// Read the stash if it matches `path`
    pub async fn artwork_read(&self, path: &str) -> Option<(i64, Vec<u8>)> {
        let (tx, rx) = oneshot::channel();
        self.post(Command::ArtworkRead {
            path: path.to_string(),
            reply: tx,
        })
        .ok()?;
        rx.await.ok().flatten()
    }

    /// Schedule a transcode-table sync against the current library files
    pub fn library_updated(&self, files: Vec<LibraryFile>) -> Result<(), CacheError> {
        self.post(Command::LibraryUpdate { files })
    }

    /// Fetch a prepared transcode header
    pub async fn xcode_header_get(&self, file_id: i64, format: &str) -> Option<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.post(Command::XcodeHeaderGet {
            file_id,
            format: format.to_string(),
            reply: tx,
        })
        .ok()?;
        rx.await.ok().flatten()
    }
}

/// The running cache subsystem
pub struct Cache {
    handle: CacheHandle,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Cache {
    /// Open the databases and start the cache thread
    pub fn start(
        config: CacheConfig,
        daap_rebuild: DaapRebuildFn,
        xcode_header: XcodeHeaderFn,
        workers: Arc<WorkerPool>,
    ) -> Result<Self, CacheError> {
        let daap_hdl = open_database(&config.daap_path, &config, CACHE_DAAP_VERSION, daap::SCHEMA)?;
        let artwork_hdl = open_database(
            &config.artwork_path,
            &config,
            CACHE_ARTWORK_VERSION,
            artwork::SCHEMA,
        )?;
        let xcode_hdl =
            open_database(&config.xcode_path, &config, CACHE_XCODE_VERSION, xcode::SCHEMA)?;

        let (tx, rx) = mpsc::channel();
        let handle = CacheHandle { tx };

        let thread_handle = handle.clone();
        let thread = std::thread::Builder::new()
            .name("cache".to_string())
            .spawn(move || {
                let mut state = CacheThread {
                    config,
                    daap_hdl,
                    artwork_hdl,
                    xcode_hdl,
                    daap_rebuild,
                    xcode_header,
                    workers,
                    handle: thread_handle,
                    suspended: false,
                    daap_rebuild_at: None,
                    xcode_sync_at: None,
                    xcode_pending: None,
                    xcode_jobs_running: 0,
                    xcode_in_flight: std::collections::HashSet::new(),
                    stash: None,
                };
                state.run(&rx);
            })
            .map_err(|_| CacheError::Gone)?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    #[must_use]
    pub fn handle(&self) -> CacheHandle {
        self.handle.clone()
    }

    pub fn stop(mut self) {
        let _ = self.handle.post(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn open_database(
    path: &std::path::Path,
    config: &CacheConfig,
    version: i64,
    schema: &[&str],
) -> Result<Connection, CacheError> {
    let conn = Connection::open(path)?;

    pragma_set(&conn, config)?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS admin( \
           key VARCHAR(32) PRIMARY KEY NOT NULL, \
           value VARCHAR(32) NOT NULL \
         );",
    )?;

    let have: Option<i64> = conn
        .query_row(
            "SELECT value FROM admin WHERE key = 'cache_version';",
            [],
            |row| row.get::<_, String>(0),
        )
        .map(|v| v.parse().ok())
        .unwrap_or(None);

    if have != Some(version) {
        if have.is_some() {
            tracing::info!(
                "cache schema at {} is version {:?}, want {version}; rebuilding",
                path.display(),
                have
            );
        }
        // Drop everything except admin, then recreate
        drop_user_tables(&conn)?;
        for statement in schema {
            conn.execute_batch(statement)?;
        }
        conn.execute(
            "INSERT OR REPLACE INTO admin (key, value) VALUES ('cache_version', ?1);",
            [version.to_string()],
        )?;
    }

    Ok(conn)
}

fn drop_user_tables(conn: &Connection) -> Result<(), CacheError> {
    let tables: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type IN ('table', 'index') \
             AND name NOT LIKE 'sqlite_%' AND name != 'admin';",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.filter_map(Result::ok).collect()
    };

    for table in tables {
        // Indexes on dropped tables disappear with them; ignore the rest
        let _ = conn.execute_batch(&format!("DROP TABLE IF EXISTS {table};"));
    }
    Ok(())
}

fn pragma_set(conn: &Connection, config: &CacheConfig) -> Result<(), CacheError> {
    conn.pragma_update(None, "journal_mode", &config.journal_mode)?;
    conn.pragma_update(None, "synchronous", config.synchronous)?;
    if config.mmap_size > -1 {
        conn.pragma_update(None, "mmap_size", config.mmap_size)?;
    }
    Ok(())
}

struct CacheThread {
    config: CacheConfig,
    daap_hdl: Connection,
    artwork_hdl: Connection,
    xcode_hdl: Connection,
    daap_rebuild: DaapRebuildFn,
    xcode_header: XcodeHeaderFn,
    workers: Arc<WorkerPool>,
    handle: CacheHandle,
    suspended: bool,
    daap_rebuild_at: Option<Instant>,
    xcode_sync_at: Option<Instant>,
    xcode_pending: Option<Vec<LibraryFile>>,
    xcode_jobs_running: usize,
    /// Files with a header job currently on the worker pool
    xcode_in_flight: std::collections::HashSet<i64>,
    stash: Option<(String, i64, Vec<u8>)>,
}

impl CacheThread {
    fn run(&mut self, rx: &mpsc::Receiver<Command>) {
        loop {
            let command = match self.next_deadline() {
                None => rx.recv().ok(),
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    match rx.recv_timeout(timeout) {
                        Ok(command) => Some(command),
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            self.timers_fire();
                            continue;
                        }
                        Err(mpsc::RecvTimeoutError::Disconnected) => None,
                    }
                }
            };

            let Some(command) = command else { break };
            if !self.dispatch(command) {
                break;
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.daap_rebuild_at, self.xcode_sync_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    fn timers_fire(&mut self) {
        let now = Instant::now();

        if self.daap_rebuild_at.is_some_and(|at| at <= now) {
            self.daap_rebuild_at = None;
            if self.suspended {
                tracing::debug!("DAAP reply rebuild skipped, cache suspended");
            } else if let Err(e) =
                daap::rebuild_replies(&self.daap_hdl, self.daap_rebuild.as_ref())
            {
                tracing::error!("DAAP reply rebuild failed: {e}");
            }
        }

        if self.xcode_sync_at.is_some_and(|at| at <= now) {
            self.xcode_sync_at = None;
            if let Some(files) = self.xcode_pending.take() {
                match xcode::sync_files(&self.xcode_hdl, &files) {
                    Ok(changes) if changes > 0 => tracing::debug!("transcode cache synced, {changes} changes"),
                    Ok(_) => {}
                    Err(e) => tracing::error!("transcode cache sync failed: {e}"),
                }
                self.xcode_pump();
            }
        }
    }

    /// Keep up to four header-prepare jobs running on the worker pool. The
    /// cache thread stays the only writer; workers post results back.
    fn xcode_pump(&mut self) {
        if !self.config.xcode_enabled {
            return;
        }

        while self.xcode_jobs_running < XCODE_NTHREADS {
            let next = match xcode::next_without_header(&self.xcode_hdl, &self.xcode_in_flight) {
                Ok(next) => next,
                Err(e) => {
                    tracing::error!("transcode cache query failed: {e}");
                    return;
                }
            };
            let Some((file_id, path)) = next else {
                return;
            };

            self.xcode_in_flight.insert(file_id);
            self.xcode_jobs_running += 1;
            let header_fn = self.xcode_header.clone();
            let handle = self.handle.clone();
            self.workers.execute(Box::new(move || {
                let header = header_fn(&path);
                let _ = handle.post(Command::XcodeJobDone { file_id, header });
            }));
        }
    }

    /// Returns false on shutdown
    fn dispatch(&mut self, command: Command) -> bool {
        match command {
            Command::DaapAdd {
                query,
                user_agent,
                is_remote,
                msec,
            } => {
                if msec < self.config.daap_threshold_ms {
                    return true;
                }
                if !daap::is_cacheable(&query) {
                    tracing::debug!("DAAP query not eligible for caching: {query}");
                    return true;
                }
                match daap::add_query(&self.daap_hdl, &query, &user_agent, is_remote, msec, DAAP_QUERY_LIMIT) {
                    Ok(()) => {
                        self.daap_rebuild_at =
                            Some(Instant::now() + self.config.daap_rebuild_delay);
                    }
                    Err(e) => tracing::error!("DAAP cache add failed: {e}"),
                }
            }
            Command::DaapGet { query, reply } => {
                let result = daap::get_reply(&self.daap_hdl, &query).unwrap_or_else(|e| {
                    tracing::error!("DAAP cache get failed: {e}");
                    None
                });
                let _ = reply.send(result);
            }
            Command::DaapSuspend => self.suspended = true,
            Command::DaapResume => self.suspended = false,
            Command::ArtworkAdd { entry } => {
                if let Err(e) = artwork::add(&self.artwork_hdl, &entry) {
                    tracing::error!("artwork cache add failed: {e}");
                }
            }
            Command::ArtworkGet {
                type_,
                persistent_id,
                max_w,
                max_h,
                reply,
            } => {
                let result = artwork::get(&self.artwork_hdl, type_, persistent_id, max_w, max_h)
                    .unwrap_or_else(|e| {
                        tracing::error!("artwork cache get failed: {e}");
                        None
                    });
                let _ = reply.send(result);
            }
            Command::ArtworkPing {
                path,
                mtime,
                delete_older,
            } => {
                if let Err(e) = artwork::ping(&self.artwork_hdl, &path, mtime, delete_older) {
                    tracing::error!("artwork cache ping failed: {e}");
                }
            }
            Command::ArtworkPurge { older_than } => {
                if let Err(e) = artwork::purge_cruft(&self.artwork_hdl, older_than) {
                    tracing::error!("artwork cache purge failed: {e}");
                }
            }
            Command::ArtworkStash { data, path, format } => {
                self.stash = Some((path, format, data));
            }
            Command::ArtworkRead { path, reply } => {
                let result = self
                    .stash
                    .as_ref()
                    .filter(|(stashed_path, _, _)| *stashed_path == path)
                    .map(|(_, format, data)| (*format, data.clone()));
                let _ = reply.send(result);
            }
            Command::LibraryUpdate { files } => {
                self.xcode_pending = Some(files);
                self.xcode_sync_at = Some(Instant::now() + self.config.xcode_sync_delay);
            }
            Command::XcodeHeaderGet {
                file_id,
                format,
                reply,
            } => {
                let result = xcode::header_get(&self.xcode_hdl, file_id, &format)
                    .unwrap_or_else(|e| {
                        tracing::error!("transcode cache get failed: {e}");
                        None
                    });
                let _ = reply.send(result);
            }
            Command::XcodeJobDone { file_id, header } => {
                self.xcode_jobs_running = self.xcode_jobs_running.saturating_sub(1);
                self.xcode_in_flight.remove(&file_id);

                // A failed prepare stores an empty header so the pump does
                // not retry the same broken file forever
                let header = header.unwrap_or_else(|| {
                    tracing::warn!("header prepare for file {file_id} produced nothing");
                    Vec::new()
                });
                if let Err(e) = xcode::header_store(&self.xcode_hdl, file_id, &header) {
                    tracing::error!("transcode header store failed: {e}");
                }
                self.xcode_pump();
            }
            Command::Shutdown => return false,
        }
        true
    }
}

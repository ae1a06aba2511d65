//! Embedded store - SQLite in WAL mode, shared by server and worker
//!
//! All persistent state lives in one database file. The server and the
//! worker each build their own `Store` (and therefore their own connection
//! pool and prepared-statement caches); WAL mode plus SQLite's single-writer
//! lock is the only cross-process synchronization primitive.
//!
//! # Architecture
//!
//! ```text
//! Server process                        Worker process
//!   Store (r2d2 pool, N conns)            Store (r2d2 pool, N conns)
//!       │                                     │
//!       └────────────┐           ┌────────────┘
//!                    ▼           ▼
//!               brain.db (WAL + -shm/-wal sidecars)
//! ```
//!
//! Hot-path statements go through rusqlite's per-connection statement cache
//! (`prepare_cached`), so each statement is compiled once per pooled
//! connection.

pub mod document;
pub mod migrations;

use crate::error::{BrainError, Result};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Pooled connection type used by every component.
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Maximum connections per process. WAL allows many readers but only one
/// writer at a time; a small pool keeps checkout latency low without
/// stacking up writers behind the lock.
const POOL_SIZE: u32 = 4;

/// Total backoff budget for busy/locked retries inside one operation.
const BUSY_RETRY_BUDGET: Duration = Duration::from_millis(300);

/// Handle to the shared database. Cheap to clone; components hold a clone.
#[derive(Clone)]
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

impl Store {
    /// Open (or create) the database at `path`, apply pragmas, and run
    /// forward-only migrations. Refuses a store whose schema is ahead of
    /// this binary.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(&path).with_init(|conn| {
            // Per-connection pragmas. journal_mode is persistent but cheap
            // to re-issue; the rest must be set on every connection.
            conn.execute_batch(
                r#"
                PRAGMA journal_mode=WAL;
                PRAGMA synchronous=NORMAL;
                PRAGMA busy_timeout=5000;
                PRAGMA cache_size=-64000;     -- 64MB page cache
                PRAGMA mmap_size=268435456;   -- 256MB mmap window
                PRAGMA foreign_keys=ON;
                "#,
            )
        });

        let pool = Pool::builder()
            .max_size(POOL_SIZE)
            .connection_timeout(Duration::from_secs(5))
            .build(manager)
            .map_err(|e| BrainError::Other(anyhow::anyhow!("open pool: {e}")))?;

        let store = Self { pool, path };

        {
            let conn = store.conn()?;
            // auto_vacuum must be configured before the first table is
            // created; a no-op on an existing database.
            conn.execute_batch("PRAGMA auto_vacuum=INCREMENTAL;")?;
            migrations::run(&conn)?;
        }

        tracing::info!(path = %store.path.display(), "store opened");
        Ok(store)
    }

    /// Check out a pooled connection.
    pub fn conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Path of the database file (workers pass it to the python bridge).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the database file in bytes, for the health summary.
    pub fn file_size(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}

/// Run `f`, retrying transient (busy/locked) failures with exponential
/// backoff until the retry budget is exhausted. Everything else returns
/// immediately.
pub fn with_busy_retry<T>(mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let deadline = Instant::now() + BUSY_RETRY_BUDGET;
    let mut delay = Duration::from_millis(10);
    loop {
        match f() {
            Err(e) if e.is_transient() && Instant::now() + delay < deadline => {
                tracing::debug!(delay_ms = delay.as_millis() as u64, "store busy, retrying");
                std::thread::sleep(delay);
                delay *= 2;
            }
            other => return other,
        }
    }
}

//! Worker liveness via filesystem heartbeats
//!
//! Each worker process touches `<workers_dir>/<worker_id>.alive` on a short
//! interval. The stale-claim sweeper treats a worker as dead when its file
//! is missing or older than [`STALE_AFTER`]. Keeping the heartbeat set on
//! the filesystem (not in a table) leaves the store's table set fixed.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// How often a live worker touches its heartbeat file.
pub const INTERVAL: Duration = Duration::from_secs(5);

/// A heartbeat older than this marks the worker dead.
pub const STALE_AFTER: Duration = Duration::from_secs(15);

pub fn path(workers_dir: &Path, worker_id: &str) -> PathBuf {
    workers_dir.join(format!("{worker_id}.alive"))
}

/// Create or refresh the heartbeat file.
pub fn touch(workers_dir: &Path, worker_id: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(workers_dir)?;
    std::fs::write(path(workers_dir, worker_id), b"")
}

/// Whether `worker_id` has a fresh heartbeat.
pub fn is_alive(workers_dir: &Path, worker_id: &str) -> bool {
    std::fs::metadata(path(workers_dir, worker_id))
        .and_then(|m| m.modified())
        .map(|modified| {
            modified
                .elapsed()
                .map(|age| age < STALE_AFTER)
                .unwrap_or(true) // clock skew: a future mtime is still alive
        })
        .unwrap_or(false)
}

/// Remove the heartbeat on clean shutdown so the sweeper reclaims promptly.
pub fn remove(workers_dir: &Path, worker_id: &str) {
    let _ = std::fs::remove_file(path(workers_dir, worker_id));
}

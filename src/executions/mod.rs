//! Execution subsystem, server side
//!
//! Accepts code-run requests, durably queues them, and exposes
//! status/output for monitoring. The server never executes user code and
//! never blocks on the worker: `queue` returns immediately after the
//! insert, and log files are read lazily on demand, one snapshot per call.
//!
//! The runtime half (claim loop, child spawn, output streaming) lives in
//! the `worker` module; the two halves only share the store and the
//! executions directory.

pub mod language;

use crate::error::{BrainError, Result};
use crate::store::{with_busy_retry, Store};
use crate::util::{now_iso, truncate_utf8_safe};
use crate::worker::heartbeat;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use language::{Detector, Language};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Appended to stdout by `get_output` when the stream was cut at the
/// inline cap.
pub const TRUNCATION_MARKER: &str = "\n[Output truncated]";

/// Bytes of code shown in `list_recent` previews.
const PREVIEW_BYTES: usize = 80;

/// Submissions at or below this length on a single line are treated as
/// interactive and queued ahead of the pack.
const INTERACTIVE_CODE_BYTES: usize = 200;

/// Substrings that mark obviously long-running code, queued behind the pack.
const LONG_RUNNING_MARKERS: &[&str] = &[
    "sleep", "while True", "while true", "tail -f", "watch ", "serve_forever", "input(",
];

/// Acknowledgement returned by `queue`.
#[derive(Debug, Clone, Serialize)]
pub struct QueueReceipt {
    pub id: Uuid,
    pub status: &'static str,
    pub language: Language,
}

/// Lifecycle metadata for one execution. Never includes log bodies.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStatus {
    pub id: Uuid,
    pub session_id: Option<Uuid>,
    pub language: String,
    pub status: String,
    pub priority: i64,
    pub created_at: String,
    pub claimed_at: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub exit_code: Option<i64>,
    pub error_message: Option<String>,
    pub wall_time_ms: Option<i64>,
    pub cpu_time_ms: Option<i64>,
    pub max_memory_mb: Option<f64>,
    pub output_size_bytes: i64,
    pub error_size_bytes: i64,
    pub output_truncated: bool,
    pub worker_id: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
}

/// Captured stdout/stderr, read lazily from the log files.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
}

/// One row of `list_recent`: metadata plus a short code preview.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub id: Uuid,
    pub language: String,
    pub status: String,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub exit_code: Option<i64>,
    pub code_preview: String,
}

/// The server-side execution component. Cheap to clone.
#[derive(Clone)]
pub struct Executions {
    store: Store,
    exec_dir: PathBuf,
    detector: Arc<Detector>,
}

impl std::fmt::Debug for Executions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executions")
            .field("exec_dir", &self.exec_dir)
            .finish()
    }
}

impl Executions {
    pub fn new(store: Store, exec_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&exec_dir)?;
        Ok(Self {
            store,
            exec_dir,
            detector: Arc::new(Detector::new()),
        })
    }

    pub fn exec_dir(&self) -> &Path {
        &self.exec_dir
    }

    /// Insert a new queued execution and return immediately. The language
    /// is detected from content unless the caller forces it.
    pub fn queue(
        &self,
        code: &str,
        language: Option<Language>,
        session_id: Option<Uuid>,
    ) -> Result<QueueReceipt> {
        if code.trim().is_empty() {
            return Err(BrainError::Resource("code must be non-empty".into()));
        }

        let id = Uuid::new_v4();
        let language = language.unwrap_or_else(|| self.detector.detect(code));
        let priority = derive_priority(code);
        let code_hash = {
            let mut hasher = Sha256::new();
            hasher.update(code.as_bytes());
            format!("{:x}", hasher.finalize())
        };
        let output_file = self.exec_dir.join(format!("{id}.out"));
        let error_file = self.exec_dir.join(format!("{id}.err"));
        let now = now_iso();

        with_busy_retry(|| {
            let conn = self.store.conn()?;
            conn.prepare_cached(
                "INSERT INTO executions (id, session_id, code, language, code_hash, priority,
                                         status, created_at, queued_at, output_file, error_file)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', ?7, ?7, ?8, ?9)",
            )?
            .execute(params![
                id.to_string(),
                session_id.map(|s| s.to_string()),
                code,
                language.as_str(),
                code_hash,
                priority,
                now,
                output_file.to_string_lossy(),
                error_file.to_string_lossy(),
            ])?;
            Ok(())
        })?;

        tracing::info!(execution_id = %id, %language, priority, "execution queued");
        Ok(QueueReceipt {
            id,
            status: "queued",
            language,
        })
    }

    /// Lifecycle metadata only; never touches the log files.
    pub fn get_status(&self, id: Uuid) -> Result<ExecutionStatus> {
        let conn = self.store.conn()?;
        let mut stmt =
            conn.prepare_cached(&format!("{STATUS_COLUMNS} FROM executions WHERE id = ?1"))?;
        stmt.query_row(params![id.to_string()], status_from_row)
            .optional()?
            .ok_or_else(|| BrainError::NotFound(format!("execution {id}")))
    }

    /// Read captured output by opening the log files lazily. Appends the
    /// truncation marker after stdout when the stream was cut.
    pub fn get_output(&self, id: Uuid) -> Result<ExecutionOutput> {
        let (output_file, error_file, truncated): (Option<String>, Option<String>, bool) = {
            let conn = self.store.conn()?;
            let mut stmt = conn.prepare_cached(
                "SELECT output_file, error_file, output_truncated FROM executions WHERE id = ?1",
            )?;
            stmt.query_row(params![id.to_string()], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })
            .optional()?
            .ok_or_else(|| BrainError::NotFound(format!("execution {id}")))?
        };

        let read = |path: Option<String>| {
            path.map(|p| std::fs::read_to_string(p).unwrap_or_default())
                .unwrap_or_default()
        };
        let mut stdout = read(output_file);
        if truncated {
            stdout.push_str(TRUNCATION_MARKER);
        }
        Ok(ExecutionOutput {
            stdout,
            stderr: read(error_file),
        })
    }

    /// Recent executions for a session, newest first, with code previews.
    pub fn list_recent(&self, session_id: Option<Uuid>, limit: usize) -> Result<Vec<ExecutionSummary>> {
        let conn = self.store.conn()?;
        let sql = match session_id {
            Some(_) => {
                "SELECT id, language, status, created_at, completed_at, exit_code, code
                 FROM executions WHERE session_id = ?1 ORDER BY created_at DESC LIMIT ?2"
            }
            None => {
                "SELECT id, language, status, created_at, completed_at, exit_code, code
                 FROM executions WHERE ?1 IS NULL ORDER BY created_at DESC LIMIT ?2"
            }
        };
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(
            params![session_id.map(|s| s.to_string()), limit as i64],
            summary_from_row,
        )?;
        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?);
        }
        Ok(summaries)
    }

    /// Cancel a still-queued execution. Running rows are handled by the
    /// stale sweeps; terminal rows never transition again.
    pub fn cancel(&self, id: Uuid) -> Result<bool> {
        with_busy_retry(|| {
            let conn = self.store.conn()?;
            let changed = conn
                .prepare_cached(
                    "UPDATE executions
                     SET status = 'cancelled', completed_at = ?2,
                         error_message = 'cancelled before claim'
                     WHERE id = ?1 AND status = 'queued'",
                )?
                .execute(params![id.to_string(), now_iso()])?;
            Ok(changed > 0)
        })
    }

    /// Bulk-mark rows that have been `running` longer than `max_age` as
    /// `timeout`. The worker's own deadline normally fires first; this is
    /// the server-side backstop.
    pub fn cancel_stale(&self, max_age: Duration) -> Result<usize> {
        let cutoff = (Utc::now() - ChronoDuration::seconds(max_age.as_secs() as i64))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        with_busy_retry(|| {
            let conn = self.store.conn()?;
            let changed = conn
                .prepare_cached(
                    "UPDATE executions
                     SET status = 'timeout', completed_at = ?2,
                         error_message = 'exceeded wall-clock limit (server sweep)'
                     WHERE status = 'running' AND started_at < ?1",
                )?
                .execute(params![cutoff, now_iso()])?;
            if changed > 0 {
                tracing::warn!(count = changed, "stale running executions marked timeout");
            }
            Ok(changed)
        })
    }

    /// Requeue rows whose claiming worker is no longer heartbeat-alive.
    /// Rows out of retries are terminated as `failed` instead. This is the
    /// only recovery path that crosses execution boundaries.
    pub fn sweep_stale_claims(&self, stale_after: Duration, workers_dir: &Path) -> Result<usize> {
        let cutoff = (Utc::now() - ChronoDuration::seconds(stale_after.as_secs() as i64))
            .to_rfc3339_opts(SecondsFormat::Millis, true);

        with_busy_retry(|| {
            let conn = self.store.conn()?;
            let stale: Vec<(String, Option<String>, i64, i64)> = conn
                .prepare_cached(
                    "SELECT id, worker_id, retry_count, max_retries FROM executions
                     WHERE status = 'running' AND claimed_at < ?1",
                )?
                .query_map(params![cutoff], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
                })?
                .collect::<std::result::Result<_, _>>()?;

            let mut recovered = 0;
            for (id, worker_id, retry_count, max_retries) in stale {
                if let Some(worker_id) = &worker_id {
                    if heartbeat::is_alive(workers_dir, worker_id) {
                        continue;
                    }
                }

                // The status guard keeps this from racing a worker that
                // finishes between the select and the update.
                if retry_count + 1 >= max_retries {
                    let changed = conn
                        .prepare_cached(
                            "UPDATE executions
                             SET status = 'failed', completed_at = ?2,
                                 error_message = 'worker died; retries exhausted'
                             WHERE id = ?1 AND status = 'running'",
                        )?
                        .execute(params![id, now_iso()])?;
                    if changed > 0 {
                        tracing::error!(execution_id = %id, "stale claim failed permanently");
                        recovered += 1;
                    }
                } else {
                    let changed = conn
                        .prepare_cached(
                            "UPDATE executions
                             SET status = 'queued', retry_count = retry_count + 1,
                                 worker_id = NULL, pid = NULL,
                                 claimed_at = NULL, started_at = NULL
                             WHERE id = ?1 AND status = 'running'",
                        )?
                        .execute(params![id])?;
                    if changed > 0 {
                        tracing::warn!(execution_id = %id, "stale claim returned to queue");
                        recovered += 1;
                    }
                }
            }
            Ok(recovered)
        })
    }

    /// Row counts per status, for the health summary.
    pub fn counts_by_status(&self) -> Result<HashMap<String, i64>> {
        let conn = self.store.conn()?;
        let mut stmt =
            conn.prepare_cached("SELECT status, COUNT(*) FROM executions GROUP BY status")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        let mut counts = HashMap::new();
        for row in rows {
            let (status, count) = row?;
            counts.insert(status, count);
        }
        Ok(counts)
    }
}

/// Base 5; short single-line snippets jump ahead, obviously long-running
/// code falls behind.
fn derive_priority(code: &str) -> i64 {
    let mut priority = 5i64;
    if code.len() <= INTERACTIVE_CODE_BYTES && !code.trim().contains('\n') {
        priority += 2;
    }
    if LONG_RUNNING_MARKERS.iter().any(|m| code.contains(m)) {
        priority -= 2;
    }
    priority.clamp(1, 10)
}

const STATUS_COLUMNS: &str = "SELECT id, session_id, language, status, priority, created_at, \
                              claimed_at, started_at, completed_at, exit_code, error_message, \
                              wall_time_ms, cpu_time_ms, max_memory_mb, output_size_bytes, \
                              error_size_bytes, output_truncated, worker_id, retry_count, \
                              max_retries";

fn status_from_row(r: &Row<'_>) -> rusqlite::Result<ExecutionStatus> {
    let id: String = r.get(0)?;
    let session_id: Option<String> = r.get(1)?;
    Ok(ExecutionStatus {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        session_id: session_id.and_then(|s| Uuid::parse_str(&s).ok()),
        language: r.get(2)?,
        status: r.get(3)?,
        priority: r.get(4)?,
        created_at: r.get(5)?,
        claimed_at: r.get(6)?,
        started_at: r.get(7)?,
        completed_at: r.get(8)?,
        exit_code: r.get(9)?,
        error_message: r.get(10)?,
        wall_time_ms: r.get(11)?,
        cpu_time_ms: r.get(12)?,
        max_memory_mb: r.get(13)?,
        output_size_bytes: r.get(14)?,
        error_size_bytes: r.get(15)?,
        output_truncated: r.get(16)?,
        worker_id: r.get(17)?,
        retry_count: r.get(18)?,
        max_retries: r.get(19)?,
    })
}

fn summary_from_row(r: &Row<'_>) -> rusqlite::Result<ExecutionSummary> {
    let id: String = r.get(0)?;
    let code: String = r.get(6)?;
    Ok(ExecutionSummary {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        language: r.get(1)?,
        status: r.get(2)?,
        created_at: r.get(3)?,
        completed_at: r.get(4)?,
        exit_code: r.get(5)?,
        code_preview: truncate_utf8_safe(&code, PREVIEW_BYTES).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn test_executions() -> (tempfile::TempDir, Executions) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("brain.db")).unwrap();
        let executions = Executions::new(store, dir.path().join("executions")).unwrap();
        (dir, executions)
    }

    fn set_row(executions: &Executions, id: Uuid, sql: &str) {
        let conn = executions.store.conn().unwrap();
        conn.execute(
            &format!("UPDATE executions SET {sql} WHERE id = ?1"),
            params![id.to_string()],
        )
        .unwrap();
    }

    #[test]
    fn queue_inserts_queued_row() {
        let (_dir, executions) = test_executions();
        let receipt = executions.queue("print(6*7)", None, None).unwrap();
        assert_eq!(receipt.status, "queued");
        assert_eq!(receipt.language, Language::Python);

        let status = executions.get_status(receipt.id).unwrap();
        assert_eq!(status.status, "queued");
        assert_eq!(status.language, "python");
        assert!(status.worker_id.is_none());
        assert!(status.exit_code.is_none());
    }

    #[test]
    fn forced_language_overrides_detection() {
        let (_dir, executions) = test_executions();
        let receipt = executions
            .queue("print(6*7)", Some(Language::Shell), None)
            .unwrap();
        assert_eq!(receipt.language, Language::Shell);
    }

    #[test]
    fn empty_code_is_rejected() {
        let (_dir, executions) = test_executions();
        assert!(matches!(
            executions.queue("  \n ", None, None).unwrap_err(),
            BrainError::Resource(_)
        ));
    }

    #[test]
    fn priority_prefers_interactive_snippets() {
        assert!(derive_priority("print(1)") > derive_priority("import time\ntime.sleep(999)"));
        assert_eq!(derive_priority("print(1)"), 7);
        assert_eq!(derive_priority("while True:\n    pass"), 3);
        // Always within bounds.
        assert!((1..=10).contains(&derive_priority(&"x\n".repeat(500))));
    }

    #[test]
    fn get_status_unknown_is_not_found() {
        let (_dir, executions) = test_executions();
        assert!(matches!(
            executions.get_status(Uuid::new_v4()).unwrap_err(),
            BrainError::NotFound(_)
        ));
    }

    #[test]
    fn get_output_reads_files_and_appends_marker() {
        let (_dir, executions) = test_executions();
        let receipt = executions.queue("echo hi", None, None).unwrap();

        // No files yet: empty output, no error.
        let output = executions.get_output(receipt.id).unwrap();
        assert_eq!(output.stdout, "");
        assert_eq!(output.stderr, "");

        let out_path = executions.exec_dir().join(format!("{}.out", receipt.id));
        std::fs::write(&out_path, "hi\n").unwrap();
        set_row(&executions, receipt.id, "output_truncated = 1");

        let output = executions.get_output(receipt.id).unwrap();
        assert_eq!(output.stdout, format!("hi\n{TRUNCATION_MARKER}"));
    }

    #[test]
    fn cancel_only_hits_queued_rows() {
        let (_dir, executions) = test_executions();
        let receipt = executions.queue("echo hi", None, None).unwrap();
        assert!(executions.cancel(receipt.id).unwrap());
        assert_eq!(executions.get_status(receipt.id).unwrap().status, "cancelled");

        // Terminal rows never transition again.
        assert!(!executions.cancel(receipt.id).unwrap());

        let running = executions.queue("echo hi", None, None).unwrap();
        set_row(&executions, running.id, "status = 'running', worker_id = 'w1'");
        assert!(!executions.cancel(running.id).unwrap());
    }

    #[test]
    fn cancel_stale_marks_old_running_rows() {
        let (_dir, executions) = test_executions();
        let receipt = executions.queue("sleep 999", None, None).unwrap();
        set_row(
            &executions,
            receipt.id,
            "status = 'running', worker_id = 'w1', started_at = '2000-01-01T00:00:00.000Z'",
        );

        assert_eq!(executions.cancel_stale(Duration::from_secs(60)).unwrap(), 1);
        let status = executions.get_status(receipt.id).unwrap();
        assert_eq!(status.status, "timeout");
        assert!(status.error_message.is_some());

        // Second sweep finds nothing: terminal states stay terminal.
        assert_eq!(executions.cancel_stale(Duration::from_secs(60)).unwrap(), 0);
    }

    #[test]
    fn sweep_requeues_stale_claim_and_increments_retry() {
        let (dir, executions) = test_executions();
        let workers_dir = dir.path().join("workers");
        std::fs::create_dir_all(&workers_dir).unwrap();

        let receipt = executions.queue("echo hi", None, None).unwrap();
        set_row(
            &executions,
            receipt.id,
            "status = 'running', worker_id = 'dead-worker', \
             claimed_at = '2000-01-01T00:00:00.000Z', started_at = '2000-01-01T00:00:00.000Z'",
        );

        let recovered = executions
            .sweep_stale_claims(Duration::from_secs(60), &workers_dir)
            .unwrap();
        assert_eq!(recovered, 1);
        let status = executions.get_status(receipt.id).unwrap();
        assert_eq!(status.status, "queued");
        assert_eq!(status.retry_count, 1);
        assert!(status.worker_id.is_none());
    }

    #[test]
    fn sweep_spares_heartbeat_alive_workers() {
        let (dir, executions) = test_executions();
        let workers_dir = dir.path().join("workers");
        heartbeat::touch(&workers_dir, "live-worker").unwrap();

        let receipt = executions.queue("echo hi", None, None).unwrap();
        set_row(
            &executions,
            receipt.id,
            "status = 'running', worker_id = 'live-worker', \
             claimed_at = '2000-01-01T00:00:00.000Z'",
        );

        let recovered = executions
            .sweep_stale_claims(Duration::from_secs(60), &workers_dir)
            .unwrap();
        assert_eq!(recovered, 0);
        assert_eq!(executions.get_status(receipt.id).unwrap().status, "running");
    }

    #[test]
    fn sweep_fails_job_out_of_retries() {
        let (dir, executions) = test_executions();
        let workers_dir = dir.path().join("workers");
        std::fs::create_dir_all(&workers_dir).unwrap();

        let receipt = executions.queue("echo hi", None, None).unwrap();
        set_row(
            &executions,
            receipt.id,
            "status = 'running', worker_id = 'dead-worker', retry_count = 2, \
             claimed_at = '2000-01-01T00:00:00.000Z'",
        );

        executions
            .sweep_stale_claims(Duration::from_secs(60), &workers_dir)
            .unwrap();
        let status = executions.get_status(receipt.id).unwrap();
        assert_eq!(status.status, "failed");
        assert!(status.retry_count <= status.max_retries);
    }

    #[test]
    fn list_recent_scopes_to_session_and_previews_code() {
        let (_dir, executions) = test_executions();
        let session = Uuid::new_v4();
        let long_code = format!("print('{}')", "x".repeat(200));
        executions.queue(&long_code, None, Some(session)).unwrap();
        executions.queue("echo other", None, None).unwrap();

        let recent = executions.list_recent(Some(session), 10).unwrap();
        assert_eq!(recent.len(), 1);
        assert!(recent[0].code_preview.len() <= PREVIEW_BYTES);

        let all = executions.list_recent(None, 10).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn status_serializes_without_log_bodies() {
        let (_dir, executions) = test_executions();
        let receipt = executions.queue("echo hi", None, None).unwrap();
        let status = executions.get_status(receipt.id).unwrap();
        let json: Value = serde_json::to_value(&status).unwrap();
        assert!(json.get("stdout").is_none());
        assert!(json.get("code").is_none());
    }
}

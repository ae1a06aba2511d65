//! Execution worker
//!
//! Runs as its own OS process (`brain worker`) against the shared store.
//! Each claim-loop slot is a dedicated OS thread: poll for a queued job,
//! claim it atomically, spawn the child interpreter, stream its output into
//! buffered log files, record the terminal state, loop. Multiple worker
//! processes may run concurrently; the single-statement claim keeps every
//! job on exactly one of them.
//!
//! # Job state machine
//!
//! ```text
//! [queued] ──atomic claim──▶ [running] ──spawn──▶ child ──stream──▶ log files
//!                                │                  │
//!                                │                  ├── exit(0) ─▶ [completed]
//!                                │                  ├── exit(≠0) ▶ [failed]
//!                                │                  ├── deadline ─▶ [timeout]
//!                                │                  └── server cancel ▶ child killed
//!                                └── worker dies ─▶ recovered by the stale sweep
//! ```

pub mod heartbeat;
pub mod output;
pub mod python;

use crate::error::{BrainError, Result};
use crate::executions::language::Language;
use crate::store::{with_busy_retry, Store};
use crate::util::now_iso;
use output::{OutputBuffer, OutputSummary};
use rusqlite::{params, OptionalExtension};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Grace between SIGTERM and SIGKILL on timeout or cancel.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Cadence of child `try_wait` polls.
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Cadence of cancel-observation reads while a child runs.
const CANCEL_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub concurrency: usize,
    pub exec_dir: PathBuf,
    pub workers_dir: PathBuf,
    pub wall_clock_limit: Duration,
    pub inline_output_cap: u64,
    pub poll_interval: Duration,
}

/// A job this worker just transitioned out of `queued`.
#[derive(Debug)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub code: String,
    pub language: Language,
    pub output_file: PathBuf,
    pub error_file: PathBuf,
}

/// Atomically claim the best queued job: one conditional UPDATE that
/// selects and transitions the row in a single statement, so no other
/// transaction can observe it as still queued in between. Zero changed
/// rows means the queue is empty.
pub fn claim(store: &Store, worker_id: &str) -> Result<Option<ClaimedJob>> {
    with_busy_retry(|| {
        let conn = store.conn()?;
        let row = conn
            .prepare_cached(
                r#"
                UPDATE executions
                SET status = 'running', worker_id = ?1, claimed_at = ?2, started_at = ?2
                WHERE id = (
                    SELECT id FROM executions
                    WHERE status = 'queued' AND retry_count < max_retries
                    ORDER BY priority DESC, created_at ASC
                    LIMIT 1
                )
                RETURNING id, code, language, output_file, error_file
                "#,
            )?
            .query_row(params![worker_id, now_iso()], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                ))
            })
            .optional()?;

        Ok(row.map(|(id, code, language, output_file, error_file)| ClaimedJob {
            id: Uuid::parse_str(&id).unwrap_or_default(),
            code,
            language: language.parse().unwrap_or(Language::Python),
            output_file: PathBuf::from(output_file),
            error_file: PathBuf::from(error_file),
        }))
    })
}

/// A running worker process: heartbeat thread plus N claim-loop slots.
pub struct WorkerHandle {
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    worker_id: String,
    workers_dir: PathBuf,
}

/// Start the claim loops. Returns a handle the caller uses to stop them
/// (typically on ctrl-c).
pub fn start(store: Store, config: WorkerConfig) -> Result<WorkerHandle> {
    heartbeat::touch(&config.workers_dir, &config.worker_id)?;
    std::fs::create_dir_all(&config.exec_dir)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut threads = Vec::new();

    // Heartbeat thread: the sweeper treats this worker as dead once these
    // touches stop.
    {
        let shutdown = shutdown.clone();
        let workers_dir = config.workers_dir.clone();
        let worker_id = config.worker_id.clone();
        threads.push(
            thread::Builder::new()
                .name("brain-heartbeat".into())
                .spawn(move || {
                    while !shutdown.load(Ordering::Relaxed) {
                        if let Err(e) = heartbeat::touch(&workers_dir, &worker_id) {
                            tracing::warn!(error = %e, "heartbeat touch failed");
                        }
                        thread::sleep(heartbeat::INTERVAL);
                    }
                })
                .expect("spawn heartbeat thread"),
        );
    }

    for slot in 0..config.concurrency.max(1) {
        let shutdown = shutdown.clone();
        let store = store.clone();
        let config = config.clone();
        threads.push(
            thread::Builder::new()
                .name(format!("brain-worker-{slot}"))
                .spawn(move || {
                    tracing::info!(worker_id = %config.worker_id, slot, "claim loop started");
                    while !shutdown.load(Ordering::Relaxed) {
                        match claim(&store, &config.worker_id) {
                            Ok(Some(job)) => {
                                let id = job.id;
                                match execute_job(&store, &config, job) {
                                    Ok(()) => {}
                                    Err(BrainError::Cancelled(reason)) => {
                                        tracing::info!(execution_id = %id, %reason, "job cancelled");
                                    }
                                    Err(e) => {
                                        tracing::error!(execution_id = %id, error = %e, "job execution failed");
                                    }
                                }
                            }
                            Ok(None) => thread::sleep(config.poll_interval),
                            Err(e) => {
                                tracing::warn!(error = %e, "claim failed, backing off");
                                thread::sleep(config.poll_interval);
                            }
                        }
                    }
                    tracing::info!(worker_id = %config.worker_id, slot, "claim loop stopped");
                })
                .expect("spawn claim loop"),
        );
    }

    tracing::info!(
        worker_id = %config.worker_id,
        slots = config.concurrency.max(1),
        "worker started"
    );
    Ok(WorkerHandle {
        shutdown,
        threads,
        worker_id: config.worker_id,
        workers_dir: config.workers_dir,
    })
}

impl WorkerHandle {
    /// Signal every loop to stop, join them, and drop the heartbeat so the
    /// sweeper reclaims anything left behind promptly.
    pub fn stop(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.threads {
            let _ = handle.join();
        }
        heartbeat::remove(&self.workers_dir, &self.worker_id);
        tracing::info!(worker_id = %self.worker_id, "worker stopped");
    }
}

/// Everything that happens to one claimed job, from spawn to terminal row.
/// One failed job never affects the next: errors are recorded on the row
/// and the claim loop continues.
fn execute_job(store: &Store, config: &WorkerConfig, job: ClaimedJob) -> Result<()> {
    tracing::info!(execution_id = %job.id, language = %job.language, "executing");
    let started = Instant::now();

    let script_path = match write_script(config, &job, store) {
        Ok(path) => path,
        Err(e) => {
            record_terminal(store, job.id, &Terminal::spawn_failure(format!("write script: {e}")))?;
            return Ok(());
        }
    };

    let mut command = match job.language {
        Language::Python => {
            let mut c = Command::new("python3");
            c.arg(&script_path);
            c
        }
        Language::Shell => {
            let mut c = Command::new("sh");
            c.arg(&script_path);
            c
        }
    };
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .current_dir(&config.exec_dir);
    {
        // Own process group: timeout/cancel signals must reach grandchildren
        // too, or a leaked child keeps the output pipes open past the kill.
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let rusage_before = children_rusage();
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            record_terminal(
                store,
                job.id,
                &Terminal::spawn_failure(format!("spawn {}: {e}", job.language)),
            )?;
            return Ok(());
        }
    };

    {
        let conn = store.conn()?;
        conn.prepare_cached("UPDATE executions SET pid = ?2 WHERE id = ?1")?
            .execute(params![job.id.to_string(), child.id() as i64])?;
    }

    // Stream both pipes into buffered log files on their own threads; the
    // buffers own the flush policy and the inline cap.
    let stdout_pump = pump_stream(
        child.stdout.take().expect("stdout piped"),
        OutputBuffer::create(&job.output_file, config.inline_output_cap)?,
    );
    let stderr_pump = pump_stream(
        child.stderr.take().expect("stderr piped"),
        OutputBuffer::create(&job.error_file, config.inline_output_cap)?,
    );

    let deadline = started + config.wall_clock_limit;
    let mut last_cancel_check = Instant::now();
    let mut timed_out = false;
    let mut cancelled = false;

    let exit_status = loop {
        if let Some(status) = child.try_wait()? {
            break Some(status);
        }
        if Instant::now() >= deadline {
            timed_out = true;
            terminate(&mut child);
            break child.try_wait()?;
        }
        if last_cancel_check.elapsed() >= CANCEL_POLL {
            last_cancel_check = Instant::now();
            if !row_still_running(store, job.id)? {
                // The server (cancel_stale or an explicit cancel) already
                // wrote the terminal state; our only duty is the child.
                cancelled = true;
                terminate(&mut child);
                break child.try_wait()?;
            }
        }
        thread::sleep(WAIT_POLL);
    };

    let wall_time_ms = started.elapsed().as_millis() as i64;
    let out_summary = stdout_pump.join().unwrap_or_else(|_| Err(pump_panic()));
    let err_summary = stderr_pump.join().unwrap_or_else(|_| Err(pump_panic()));
    let rusage_after = children_rusage();

    if cancelled {
        return Err(BrainError::Cancelled(format!(
            "server cancelled execution {} mid-run",
            job.id
        )));
    }

    let terminal = match (&out_summary, &err_summary) {
        // Flush failure (e.g. disk full): the job fails and the buffer is
        // dropped, but the worker itself keeps going.
        (Err(e), _) | (_, Err(e)) => Terminal::spawn_failure(format!("log write failed: {e}")),
        (Ok(out), Ok(err)) => {
            let cpu_time_ms = (rusage_after.cpu_ms - rusage_before.cpu_ms).max(0);
            let max_memory_mb = rusage_after.max_rss_kb as f64 / 1024.0;
            let exit_code = exit_status.as_ref().and_then(|s| s.code()).map(i64::from);

            // Row status and error_message come from the taxonomy so the
            // audit trail reads the same as surfaced errors.
            let (status, error_message) = if timed_out {
                let e = BrainError::Timeout(format!(
                    "exceeded wall-clock limit of {}s",
                    config.wall_clock_limit.as_secs()
                ));
                ("timeout", Some(e.to_string()))
            } else if exit_code == Some(0) {
                ("completed", None)
            } else {
                let e = BrainError::ExecutionFailed(match exit_code {
                    Some(code) => format!("exited with status {code}"),
                    None => "terminated by signal".to_string(),
                });
                ("failed", Some(e.to_string()))
            };

            Terminal {
                status,
                exit_code,
                error_message,
                wall_time_ms,
                cpu_time_ms: Some(cpu_time_ms),
                max_memory_mb: Some(max_memory_mb),
                out: *out,
                err: *err,
            }
        }
    };

    let recorded = record_terminal(store, job.id, &terminal)?;
    if !recorded {
        // Someone else (stale sweep, server timeout) got there first;
        // terminal states never transition again.
        tracing::warn!(execution_id = %job.id, "terminal state already written elsewhere");
    } else {
        tracing::info!(
            execution_id = %job.id,
            status = terminal.status,
            wall_time_ms,
            "execution finished"
        );
    }
    Ok(())
}

/// Terminal row update. The `status = 'running'` guard makes double-terminal
/// writes impossible no matter who races us.
fn record_terminal(store: &Store, id: Uuid, terminal: &Terminal) -> Result<bool> {
    with_busy_retry(|| {
        let conn = store.conn()?;
        let changed = conn
            .prepare_cached(
                "UPDATE executions
                 SET status = ?2, completed_at = ?3, exit_code = ?4, error_message = ?5,
                     wall_time_ms = ?6, cpu_time_ms = ?7, max_memory_mb = ?8,
                     output_size_bytes = ?9, error_size_bytes = ?10, output_truncated = ?11
                 WHERE id = ?1 AND status = 'running'",
            )?
            .execute(params![
                id.to_string(),
                terminal.status,
                now_iso(),
                terminal.exit_code,
                terminal.error_message,
                terminal.wall_time_ms,
                terminal.cpu_time_ms,
                terminal.max_memory_mb,
                terminal.out.bytes_written as i64,
                terminal.err.bytes_written as i64,
                terminal.out.truncated || terminal.err.truncated,
            ])?;
        Ok(changed > 0)
    })
}

#[derive(Debug)]
struct Terminal {
    status: &'static str,
    exit_code: Option<i64>,
    error_message: Option<String>,
    wall_time_ms: i64,
    cpu_time_ms: Option<i64>,
    max_memory_mb: Option<f64>,
    out: OutputSummary,
    err: OutputSummary,
}

impl Terminal {
    fn spawn_failure(message: String) -> Self {
        Self {
            status: "failed",
            exit_code: None,
            error_message: Some(message),
            wall_time_ms: 0,
            cpu_time_ms: None,
            max_memory_mb: None,
            out: OutputSummary {
                bytes_written: 0,
                truncated: false,
            },
            err: OutputSummary {
                bytes_written: 0,
                truncated: false,
            },
        }
    }
}

/// Write the job's code beside its logs: `<id>.py` with the brain bridge
/// prepended, or `<id>.sh` verbatim. Kept after the run for audit.
fn write_script(config: &WorkerConfig, job: &ClaimedJob, store: &Store) -> std::io::Result<PathBuf> {
    let (extension, body) = match job.language {
        Language::Python => ("py", python::wrap_with_bridge(&job.code, store.path())),
        Language::Shell => ("sh", job.code.clone()),
    };
    let path = config.exec_dir.join(format!("{}.{extension}", job.id));
    std::fs::write(&path, body)?;
    Ok(path)
}

fn row_still_running(store: &Store, id: Uuid) -> Result<bool> {
    let conn = store.conn()?;
    let status: Option<String> = conn
        .prepare_cached("SELECT status FROM executions WHERE id = ?1")?
        .query_row(params![id.to_string()], |r| r.get(0))
        .optional()?;
    Ok(status.as_deref() == Some("running"))
}

/// SIGTERM to the child's process group, grace, then SIGKILL.
fn terminate(child: &mut Child) {
    let pgid = child.id() as i32;
    unsafe {
        libc::kill(-pgid, libc::SIGTERM);
    }
    let deadline = Instant::now() + KILL_GRACE;
    while Instant::now() < deadline {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        thread::sleep(WAIT_POLL);
    }
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
    let _ = child.wait();
}

fn pump_stream<R: Read + Send + 'static>(
    mut reader: R,
    mut buffer: OutputBuffer,
) -> JoinHandle<std::io::Result<OutputSummary>> {
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => buffer.push(&chunk[..n])?,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buffer.finish()
    })
}

fn pump_panic() -> std::io::Error {
    std::io::Error::other("output pump thread panicked")
}

struct ChildrenRusage {
    cpu_ms: i64,
    max_rss_kb: i64,
}

/// Cumulative rusage of reaped children. The delta around one child is
/// approximate when slots run concurrently.
fn children_rusage() -> ChildrenRusage {
    unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_CHILDREN, &mut usage) == 0 {
            let cpu_ms = (usage.ru_utime.tv_sec as i64 + usage.ru_stime.tv_sec as i64) * 1000
                + (usage.ru_utime.tv_usec as i64 + usage.ru_stime.tv_usec as i64) / 1000;
            ChildrenRusage {
                cpu_ms,
                max_rss_kb: usage.ru_maxrss as i64,
            }
        } else {
            ChildrenRusage {
                cpu_ms: 0,
                max_rss_kb: 0,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executions::Executions;

    fn test_setup() -> (tempfile::TempDir, Store, Executions) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("brain.db")).unwrap();
        let executions = Executions::new(store.clone(), dir.path().join("executions")).unwrap();
        (dir, store, executions)
    }

    fn test_config(dir: &tempfile::TempDir) -> WorkerConfig {
        WorkerConfig {
            worker_id: "test-worker".into(),
            concurrency: 1,
            exec_dir: dir.path().join("executions"),
            workers_dir: dir.path().join("workers"),
            wall_clock_limit: Duration::from_secs(5),
            inline_output_cap: 1024 * 1024,
            poll_interval: Duration::from_millis(50),
        }
    }

    #[test]
    fn claim_on_empty_queue_returns_none() {
        let (_dir, store, _executions) = test_setup();
        assert!(claim(&store, "w1").unwrap().is_none());
    }

    #[test]
    fn claim_takes_highest_priority_first() {
        let (_dir, store, executions) = test_setup();
        let slow = executions.queue("import time\ntime.sleep(1)", None, None).unwrap();
        let fast = executions.queue("print(1)", None, None).unwrap();

        let first = claim(&store, "w1").unwrap().unwrap();
        assert_eq!(first.id, fast.id, "interactive snippet should be claimed first");
        let second = claim(&store, "w1").unwrap().unwrap();
        assert_eq!(second.id, slow.id);
        assert!(claim(&store, "w1").unwrap().is_none());
    }

    #[test]
    fn claim_sets_worker_and_running_state() {
        let (_dir, store, executions) = test_setup();
        let receipt = executions.queue("echo hi", None, None).unwrap();
        claim(&store, "w1").unwrap().unwrap();

        let status = executions.get_status(receipt.id).unwrap();
        assert_eq!(status.status, "running");
        assert_eq!(status.worker_id.as_deref(), Some("w1"));
        assert!(status.claimed_at.is_some());
        assert!(status.started_at.is_some());
    }

    #[test]
    fn claim_skips_jobs_out_of_retries() {
        let (_dir, store, executions) = test_setup();
        let receipt = executions.queue("echo hi", None, None).unwrap();
        let conn = store.conn().unwrap();
        conn.execute(
            "UPDATE executions SET retry_count = max_retries WHERE id = ?1",
            params![receipt.id.to_string()],
        )
        .unwrap();
        drop(conn);
        assert!(claim(&store, "w1").unwrap().is_none());
    }

    #[test]
    fn concurrent_claims_hand_out_each_job_once() {
        let (_dir, store, executions) = test_setup();
        let receipt = executions.queue("echo hi", None, None).unwrap();

        let mut handles = Vec::new();
        for i in 0..5 {
            let store = store.clone();
            handles.push(thread::spawn(move || {
                let worker_id = format!("w{i}");
                claim(&store, &worker_id).unwrap().map(|_| worker_id)
            }));
        }
        let winners: Vec<String> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(winners.len(), 1, "exactly one worker may claim the row");

        let status = executions.get_status(receipt.id).unwrap();
        assert_eq!(status.status, "running");
        assert_eq!(status.worker_id.as_deref(), Some(winners[0].as_str()));
    }

    #[test]
    fn terminal_guard_prevents_double_terminal() {
        let (_dir, store, executions) = test_setup();
        let receipt = executions.queue("echo hi", None, None).unwrap();
        claim(&store, "w1").unwrap().unwrap();

        let terminal = Terminal {
            status: "completed",
            exit_code: Some(0),
            error_message: None,
            wall_time_ms: 1,
            cpu_time_ms: Some(0),
            max_memory_mb: Some(0.0),
            out: OutputSummary { bytes_written: 0, truncated: false },
            err: OutputSummary { bytes_written: 0, truncated: false },
        };
        assert!(record_terminal(&store, receipt.id, &terminal).unwrap());
        // A second terminal write of any kind changes nothing.
        assert!(!record_terminal(&store, receipt.id, &terminal).unwrap());
        assert_eq!(executions.get_status(receipt.id).unwrap().status, "completed");
    }

    #[test]
    fn shell_job_runs_to_completion() {
        let (dir, store, executions) = test_setup();
        let receipt = executions.queue("echo brain-$((6*7))", None, None).unwrap();
        let job = claim(&store, "test-worker").unwrap().unwrap();
        execute_job(&store, &test_config(&dir), job).unwrap();

        let status = executions.get_status(receipt.id).unwrap();
        assert_eq!(status.status, "completed");
        assert_eq!(status.exit_code, Some(0));
        assert!(status.wall_time_ms.is_some());

        let output = executions.get_output(receipt.id).unwrap();
        assert_eq!(output.stdout.trim(), "brain-42");
        assert!(!output.stdout.contains("[Output truncated]"));
    }

    #[test]
    fn failing_shell_job_records_exit_code() {
        let (dir, store, executions) = test_setup();
        let receipt = executions.queue("exit 3", Some(Language::Shell), None).unwrap();
        let job = claim(&store, "test-worker").unwrap().unwrap();
        execute_job(&store, &test_config(&dir), job).unwrap();

        let status = executions.get_status(receipt.id).unwrap();
        assert_eq!(status.status, "failed");
        assert_eq!(status.exit_code, Some(3));
        assert!(status.error_message.unwrap().contains("3"));
    }

    #[test]
    fn timeout_kills_child_and_marks_row() {
        let (dir, store, executions) = test_setup();
        let receipt = executions.queue("sleep 30", Some(Language::Shell), None).unwrap();
        let job = claim(&store, "test-worker").unwrap().unwrap();

        let mut config = test_config(&dir);
        config.wall_clock_limit = Duration::from_secs(1);
        let begun = Instant::now();
        execute_job(&store, &config, job).unwrap();
        assert!(begun.elapsed() < Duration::from_secs(15), "must not wait out the sleep");

        let status = executions.get_status(receipt.id).unwrap();
        assert_eq!(status.status, "timeout");
        assert!(status.error_message.unwrap().contains("wall-clock"));
    }

    #[test]
    fn missing_interpreter_fails_job_not_worker() {
        let (dir, store, executions) = test_setup();
        let receipt = executions.queue("whatever", Some(Language::Python), None).unwrap();
        let job = claim(&store, "test-worker").unwrap().unwrap();
        // Break the script directory so the write fails before spawn.
        let mut config = test_config(&dir);
        config.exec_dir = dir.path().join("does-not-exist-and-cannot");
        std::fs::write(dir.path().join("does-not-exist-and-cannot"), b"file, not dir").unwrap();
        execute_job(&store, &config, job).unwrap();

        let status = executions.get_status(receipt.id).unwrap();
        assert_eq!(status.status, "failed");
        assert!(status.error_message.is_some());
    }

    #[test]
    #[ignore = "requires python3 on PATH"]
    fn python_job_prints_and_completes() {
        let (dir, store, executions) = test_setup();
        let receipt = executions.queue("print(6*7)", Some(Language::Python), None).unwrap();
        let job = claim(&store, "test-worker").unwrap().unwrap();
        execute_job(&store, &test_config(&dir), job).unwrap();

        let status = executions.get_status(receipt.id).unwrap();
        assert_eq!(status.status, "completed");
        assert_eq!(status.exit_code, Some(0));
        assert_eq!(executions.get_output(receipt.id).unwrap().stdout.trim(), "42");
    }

    #[test]
    #[ignore = "requires python3 on PATH"]
    fn python_bridge_reads_memories() {
        let (dir, store, executions) = test_setup();
        let memory = crate::memory::Memory::new(store.clone(), 300);
        memory
            .set("greeting", &serde_json::json!({"text": "hello"}), None, &[], None, None)
            .unwrap();

        let receipt = executions
            .queue(
                "rows = brain.get_memories(5)\nprint(rows[0]['key'])",
                Some(Language::Python),
                None,
            )
            .unwrap();
        let job = claim(&store, "test-worker").unwrap().unwrap();
        execute_job(&store, &test_config(&dir), job).unwrap();

        assert_eq!(
            executions.get_output(receipt.id).unwrap().stdout.trim(),
            "greeting"
        );
    }
}

//! Forward-only schema migrations
//!
//! Each migration has a monotonically increasing version and a checksum of
//! its SQL text. `schema_version` holds the head version; `migration_history`
//! records every applied migration with its checksum and timestamp. Opening
//! a store that is ahead of this binary, or whose recorded checksums no
//! longer match, is refused with an integrity error.

use crate::error::{BrainError, Result};
use crate::util::now_iso;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

struct Migration {
    version: i64,
    sql: &'static str,
}

/// Initial schema: all tables, the FTS5 shadow with its triggers, and the
/// indexes the claim/search/reap paths depend on.
const SCHEMA_V1: &str = r#"
-- Memories: durable key -> document mapping with tier lifecycle
CREATE TABLE memories (
    key             TEXT PRIMARY KEY CHECK (key <> ''),
    value           BLOB NOT NULL,
    is_compressed   INTEGER NOT NULL DEFAULT 0,
    type            TEXT NOT NULL DEFAULT 'general',
    tags            TEXT NOT NULL DEFAULT '',
    source          TEXT,
    context         TEXT,
    search_text     TEXT NOT NULL DEFAULT '',
    is_private      INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    accessed_at     TEXT NOT NULL,
    access_count    INTEGER NOT NULL DEFAULT 0,
    update_count    INTEGER NOT NULL DEFAULT 0,
    storage_tier    TEXT NOT NULL DEFAULT 'warm'
                    CHECK (storage_tier IN ('hot', 'warm', 'cold')),
    memory_score    REAL NOT NULL DEFAULT 0.5,
    size_bytes      INTEGER NOT NULL DEFAULT 0,
    checksum        TEXT NOT NULL
);
CREATE INDEX idx_memories_tier_score ON memories(storage_tier, memory_score DESC);
CREATE INDEX idx_memories_accessed ON memories(accessed_at DESC, access_count DESC);
CREATE INDEX idx_memories_type ON memories(type);

-- Full-text shadow of memories (external content mode).
-- Kept in sync by the triggers below; a shadow row exists iff the
-- memories row exists.
CREATE VIRTUAL TABLE memories_fts USING fts5(
    key,
    search_text,
    tags,
    content=memories,
    content_rowid=rowid,
    tokenize='porter unicode61'
);
CREATE TRIGGER memories_fts_insert AFTER INSERT ON memories BEGIN
    INSERT INTO memories_fts(rowid, key, search_text, tags)
    VALUES (new.rowid, new.key, new.search_text, new.tags);
END;
CREATE TRIGGER memories_fts_delete AFTER DELETE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, key, search_text, tags)
    VALUES ('delete', old.rowid, old.key, old.search_text, old.tags);
END;
CREATE TRIGGER memories_fts_update AFTER UPDATE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, key, search_text, tags)
    VALUES ('delete', old.rowid, old.key, old.search_text, old.tags);
    INSERT INTO memories_fts(rowid, key, search_text, tags)
    VALUES (new.rowid, new.key, new.search_text, new.tags);
END;

-- Sessions: ephemeral conversation context
CREATE TABLE sessions (
    id                TEXT PRIMARY KEY,
    user_id           TEXT NOT NULL,
    started_at        TEXT NOT NULL,
    last_accessed     TEXT NOT NULL,
    expires_at        TEXT NOT NULL,
    data              TEXT NOT NULL DEFAULT '{}',
    initial_context   TEXT,
    is_active         INTEGER NOT NULL DEFAULT 1,
    terminated_reason TEXT,
    interaction_count INTEGER NOT NULL DEFAULT 0,
    memory_ops        INTEGER NOT NULL DEFAULT 0,
    execution_ops     INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX idx_sessions_active ON sessions(last_accessed DESC) WHERE is_active = 1;

-- Append-only audit log of session state changes
CREATE TABLE session_events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    event_type TEXT NOT NULL,
    detail     TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX idx_session_events_session ON session_events(session_id);

-- Executions: durable job queue plus audit trail of finished runs
CREATE TABLE executions (
    id                TEXT PRIMARY KEY,
    session_id        TEXT,
    code              TEXT NOT NULL,
    language          TEXT NOT NULL CHECK (language IN ('python', 'shell')),
    code_hash         TEXT NOT NULL,
    priority          INTEGER NOT NULL DEFAULT 5 CHECK (priority BETWEEN 1 AND 10),
    status            TEXT NOT NULL DEFAULT 'queued'
                      CHECK (status IN ('queued', 'claimed', 'running',
                                        'completed', 'failed', 'cancelled', 'timeout')),
    worker_id         TEXT,
    pid               INTEGER,
    created_at        TEXT NOT NULL,
    queued_at         TEXT NOT NULL,
    claimed_at        TEXT,
    started_at        TEXT,
    completed_at      TEXT,
    exit_code         INTEGER,
    error_message     TEXT,
    max_memory_mb     REAL,
    cpu_time_ms       INTEGER,
    wall_time_ms      INTEGER,
    output_file       TEXT,
    error_file        TEXT,
    output_size_bytes INTEGER NOT NULL DEFAULT 0,
    error_size_bytes  INTEGER NOT NULL DEFAULT 0,
    output_truncated  INTEGER NOT NULL DEFAULT 0,
    retry_count       INTEGER NOT NULL DEFAULT 0,
    max_retries       INTEGER NOT NULL DEFAULT 3
);
CREATE INDEX idx_executions_queue
    ON executions(status, priority DESC, created_at ASC) WHERE status = 'queued';
CREATE INDEX idx_executions_running
    ON executions(worker_id, status) WHERE status = 'running';
CREATE INDEX idx_executions_session ON executions(session_id, created_at DESC);
"#;

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: SCHEMA_V1,
}];

/// Version this binary migrates to.
pub fn head_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

fn checksum(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Apply pending migrations and verify the history of already-applied ones.
pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS migration_history (
            version    INTEGER PRIMARY KEY,
            checksum   TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );
        "#,
    )?;

    let current: i64 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |r| r.get(0))
        .optional()?
        .unwrap_or(0);

    let head = head_version();
    if current > head {
        return Err(BrainError::Integrity(format!(
            "store schema v{current} is newer than this binary (v{head}); refusing to run"
        )));
    }

    // Verify checksums of everything already applied before touching the
    // schema again.
    for migration in MIGRATIONS.iter().filter(|m| m.version <= current) {
        let recorded: Option<String> = conn
            .query_row(
                "SELECT checksum FROM migration_history WHERE version = ?1",
                params![migration.version],
                |r| r.get(0),
            )
            .optional()?;
        match recorded {
            Some(ref c) if *c == checksum(migration.sql) => {}
            Some(_) => {
                return Err(BrainError::Integrity(format!(
                    "migration v{} checksum mismatch; store was built by a different binary",
                    migration.version
                )))
            }
            None => {
                return Err(BrainError::Integrity(format!(
                    "migration v{} applied but missing from migration_history",
                    migration.version
                )))
            }
        }
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        tracing::info!(version = migration.version, "applying migration");
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO migration_history (version, checksum, applied_at) VALUES (?1, ?2, ?3)",
            params![migration.version, checksum(migration.sql), now_iso()],
        )?;
        tx.execute("DELETE FROM schema_version", [])?;
        tx.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            params![migration.version],
        )?;
        tx.commit()?;
    }

    Ok(())
}

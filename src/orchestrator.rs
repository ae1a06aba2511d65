//! Orchestrator and boot flow
//!
//! Owns component wiring and the `init` named operation that assembles the
//! bounded context a fresh caller sees. Components are constructed once, in
//! dependency order, and shared as one immutable bundle; every operation
//! receives the bundle instead of reaching for global state.

use crate::error::{BrainError, Result};
use crate::executions::Executions;
use crate::memory::{Memory, MemoryEntry, ACTIVE_PROJECT_TYPE, INIT_SET_LIMIT};
use crate::sessions::Sessions;
use crate::store::Store;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// The immutable component bundle. Built once at startup, cloned cheaply
/// into every operation and the monitoring surface.
#[derive(Debug, Clone)]
pub struct Components {
    pub store: Store,
    pub memory: Memory,
    pub sessions: Sessions,
    pub executions: Executions,
}

impl Components {
    /// Construct every component in dependency order against an already
    /// opened (and migrated) store, then validate the tables each one
    /// relies on.
    pub fn build(
        store: Store,
        hot_capacity: usize,
        session_timeout_hours: u64,
        exec_dir: PathBuf,
    ) -> Result<Self> {
        let memory = Memory::new(store.clone(), hot_capacity);
        let sessions = Sessions::new(store.clone(), session_timeout_hours);
        let executions = Executions::new(store.clone(), exec_dir)?;

        let components = Self {
            store,
            memory,
            sessions,
            executions,
        };
        components.validate_tables()?;
        Ok(components)
    }

    fn validate_tables(&self) -> Result<()> {
        let conn = self.store.conn()?;
        for table in [
            "memories",
            "memories_fts",
            "sessions",
            "session_events",
            "executions",
        ] {
            let found: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = ?1",
                [table],
                |r| r.get(0),
            )?;
            if found == 0 {
                return Err(BrainError::Integrity(format!("missing table {table}")));
            }
        }
        Ok(())
    }
}

/// Timer cadences and thresholds for the background maintenance tasks.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub rebalance_interval: Duration,
    pub stale_sweep_interval: Duration,
    pub session_cleanup_interval: Duration,
    /// A `running` row older than this with no live heartbeat is stale.
    pub stale_claim_after: Duration,
    pub workers_dir: PathBuf,
}

/// The result document of the `init` operation.
#[derive(Debug, Clone, Serialize)]
pub struct InitDocument {
    pub session_id: Uuid,
    pub status: &'static str,
    pub user: String,
    pub context: ContextDocument,
    pub loaded_memories: usize,
    pub suggestions: Vec<String>,
}

/// The bounded context assembled from the init set.
#[derive(Debug, Clone, Serialize)]
pub struct ContextDocument {
    pub preferences: Option<Value>,
    pub active_project: Option<Value>,
    pub recent_memories: Vec<RecentMemory>,
}

/// One init-set entry outside the two special slots.
#[derive(Debug, Clone, Serialize)]
pub struct RecentMemory {
    pub key: String,
    #[serde(rename = "type")]
    pub memory_type: String,
    pub memory_score: f64,
    pub value: Value,
}

#[derive(Clone)]
pub struct Orchestrator {
    components: Arc<Components>,
    started_at: Instant,
}

impl Orchestrator {
    pub fn new(components: Components) -> Self {
        Self {
            components: Arc::new(components),
            started_at: Instant::now(),
        }
    }

    pub fn components(&self) -> &Components {
        &self.components
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// The single entry operation: resume or create a session, assemble the
    /// bounded context from the init set, snapshot it onto the session, and
    /// return the whole document. This document is the only memory state a
    /// caller sees without an explicit search.
    pub fn init(&self, session_id: Option<Uuid>) -> Result<InitDocument> {
        let resumed = match session_id {
            Some(id) => self.components.sessions.get(id)?,
            None => None,
        };
        let (session, status) = match resumed {
            Some(session) => (session, "resumed"),
            None => (self.components.sessions.create()?, "new"),
        };

        let entries = self.components.memory.top_for_init(INIT_SET_LIMIT)?;
        let loaded_memories = entries.len();
        let context = assemble_context(entries);

        let snapshot = serde_json::to_value(&context)?;
        self.components
            .sessions
            .set_initial_context(session.id, &snapshot)?;

        let suggestions = build_suggestions(&context);
        tracing::info!(
            session_id = %session.id,
            status,
            loaded_memories,
            "init context assembled"
        );

        Ok(InitDocument {
            session_id: session.id,
            status,
            user: session.user_id,
            context,
            loaded_memories,
            suggestions,
        })
    }

    /// Composite status: top-level system counters, plus session and/or
    /// execution details when ids are supplied.
    pub fn status(&self, session_id: Option<Uuid>, execution_id: Option<Uuid>) -> Result<Value> {
        let memory_stats = self.components.memory.stats()?;
        let execution_counts = self.components.executions.counts_by_status()?;
        let mut doc = json!({
            "system": {
                "uptime_secs": self.uptime().as_secs(),
                "store_bytes": self.components.store.file_size(),
                "memory": memory_stats,
                "hot_capacity": self.components.memory.hot_capacity(),
                "executions": execution_counts,
                "active_sessions": self.components.sessions.active_count()?,
            }
        });

        if let Some(id) = session_id {
            match self.components.sessions.get(id)? {
                Some(session) => {
                    let events = self.components.sessions.events(id)?;
                    let tail: Vec<_> = events.iter().rev().take(10).rev().collect();
                    doc["session_events"] = serde_json::to_value(tail)?;
                    doc["session"] = serde_json::to_value(session)?;
                }
                None => {
                    doc["session"] = Value::Null;
                }
            }
        }
        if let Some(id) = execution_id {
            doc["execution"] = serde_json::to_value(self.components.executions.get_status(id)?)?;
        }
        Ok(doc)
    }

    /// One stale sweep before accepting work, then the periodic timers:
    /// memory rebalance, stale-claim sweep, session cleanup. Every tick
    /// logs and continues; maintenance never kills the server.
    pub fn start_maintenance(&self, config: MaintenanceConfig) -> Vec<tokio::task::JoinHandle<()>> {
        let mut tasks = Vec::new();

        {
            let orchestrator = self.clone();
            let config = config.clone();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(config.rebalance_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                tick.tick().await; // immediate first tick consumed
                loop {
                    tick.tick().await;
                    if let Err(e) = orchestrator.components.memory.rebalance() {
                        tracing::error!(error = %e, "memory rebalance failed");
                    }
                }
            }));
        }

        {
            let orchestrator = self.clone();
            let config = config.clone();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(config.stale_sweep_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    if let Err(e) = orchestrator
                        .components
                        .executions
                        .sweep_stale_claims(config.stale_claim_after, &config.workers_dir)
                    {
                        tracing::error!(error = %e, "stale-claim sweep failed");
                    }
                    // Backstop for live-but-stuck workers: past this age the
                    // server marks the row timeout and the worker's cancel
                    // poll kills the child.
                    if let Err(e) = orchestrator
                        .components
                        .executions
                        .cancel_stale(config.stale_claim_after)
                    {
                        tracing::error!(error = %e, "timeout backstop sweep failed");
                    }
                }
            }));
        }

        {
            let orchestrator = self.clone();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(config.session_cleanup_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    if let Err(e) = orchestrator.components.sessions.cleanup() {
                        tracing::error!(error = %e, "session cleanup failed");
                    }
                }
            }));
        }

        tasks
    }
}

fn assemble_context(entries: Vec<MemoryEntry>) -> ContextDocument {
    let mut preferences = None;
    let mut active_project = None;
    let mut recent_memories = Vec::new();

    for entry in entries {
        if entry.key == "user_preferences" && preferences.is_none() {
            preferences = Some(entry.value);
        } else if entry.memory_type == ACTIVE_PROJECT_TYPE && active_project.is_none() {
            active_project = Some(entry.value);
        } else {
            recent_memories.push(RecentMemory {
                key: entry.key,
                memory_type: entry.memory_type,
                memory_score: entry.memory_score,
                value: entry.value,
            });
        }
    }

    ContextDocument {
        preferences,
        active_project,
        recent_memories,
    }
}

fn build_suggestions(context: &ContextDocument) -> Vec<String> {
    let mut suggestions = Vec::new();
    if context.preferences.is_none() {
        suggestions
            .push("No preferences stored; remember a `user_preferences` memory to personalize startup".into());
    }
    if context.active_project.is_none() {
        suggestions.push("No active project set; remember an `active_project` memory".into());
    }
    suggestions
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_orchestrator() -> (tempfile::TempDir, Orchestrator) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("brain.db")).unwrap();
        let components =
            Components::build(store, 300, 24, dir.path().join("executions")).unwrap();
        (dir, Orchestrator::new(components))
    }

    #[test]
    fn cold_start_init_creates_fresh_session() {
        let (_dir, orchestrator) = test_orchestrator();
        let doc = orchestrator.init(None).unwrap();
        assert_eq!(doc.status, "new");
        assert_eq!(doc.loaded_memories, 0);
        assert!(doc.context.preferences.is_none());
        assert!(!doc.session_id.is_nil());
        assert!(!doc.suggestions.is_empty());
    }

    #[test]
    fn preferences_roundtrip_via_init() {
        let (_dir, orchestrator) = test_orchestrator();
        let prefs = json!({"lang": "Python", "style": "concise"});
        orchestrator
            .components()
            .memory
            .set("user_preferences", &prefs, Some("user_preferences"), &[], None, None)
            .unwrap();

        let doc = orchestrator.init(None).unwrap();
        assert!(doc.loaded_memories >= 1);
        assert_eq!(doc.context.preferences, Some(prefs));

        let conn = orchestrator.components().store.conn().unwrap();
        let tier: String = conn
            .query_row(
                "SELECT storage_tier FROM memories WHERE key = 'user_preferences'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tier, "hot");
    }

    #[test]
    fn init_resumes_valid_session() {
        let (_dir, orchestrator) = test_orchestrator();
        let first = orchestrator.init(None).unwrap();
        let second = orchestrator.init(Some(first.session_id)).unwrap();
        assert_eq!(second.status, "resumed");
        assert_eq!(second.session_id, first.session_id);

        // An unknown id falls back to a fresh session rather than failing.
        let third = orchestrator.init(Some(Uuid::new_v4())).unwrap();
        assert_eq!(third.status, "new");
        assert_ne!(third.session_id, first.session_id);
    }

    #[test]
    fn init_snapshots_context_onto_session() {
        let (_dir, orchestrator) = test_orchestrator();
        orchestrator
            .components()
            .memory
            .set("fact", &json!("water is wet"), None, &[], None, None)
            .unwrap();
        let doc = orchestrator.init(None).unwrap();

        let session = orchestrator
            .components()
            .sessions
            .get(doc.session_id)
            .unwrap()
            .unwrap();
        let snapshot = session.initial_context.unwrap();
        assert!(snapshot.get("recent_memories").is_some());
    }

    #[test]
    fn active_project_lands_in_context_slot() {
        let (_dir, orchestrator) = test_orchestrator();
        let project = json!({"name": "brain", "phase": "core"});
        orchestrator
            .components()
            .memory
            .set("current_project", &project, Some("active_project"), &[], None, None)
            .unwrap();

        let doc = orchestrator.init(None).unwrap();
        assert_eq!(doc.context.active_project, Some(project));
        assert!(doc.context.recent_memories.iter().all(|m| m.key != "current_project"));
    }

    #[test]
    fn status_reports_system_counters() {
        let (_dir, orchestrator) = test_orchestrator();
        orchestrator
            .components()
            .memory
            .set("k", &json!(1), None, &[], None, None)
            .unwrap();
        orchestrator
            .components()
            .executions
            .queue("echo hi", None, None)
            .unwrap();

        let doc = orchestrator.status(None, None).unwrap();
        assert_eq!(doc["system"]["memory"]["total"], 1);
        assert_eq!(doc["system"]["executions"]["queued"], 1);
        assert!(doc.get("session").is_none());
    }

    #[test]
    fn status_includes_requested_entities() {
        let (_dir, orchestrator) = test_orchestrator();
        let session = orchestrator.components().sessions.create().unwrap();
        let receipt = orchestrator
            .components()
            .executions
            .queue("echo hi", None, None)
            .unwrap();

        let doc = orchestrator
            .status(Some(session.id), Some(receipt.id))
            .unwrap();
        assert_eq!(doc["session"]["id"], json!(session.id.to_string()));
        assert_eq!(doc["execution"]["status"], "queued");

        // Unknown session reports null, unknown execution is an error.
        let doc = orchestrator.status(Some(Uuid::new_v4()), None).unwrap();
        assert_eq!(doc["session"], Value::Null);
        assert!(orchestrator.status(None, Some(Uuid::new_v4())).is_err());
    }
}

//! Session lifecycle
//!
//! Issues opaque session ids, carries a small mutable `data` document, and
//! auto-touches / auto-expires. The server keeps a private in-memory cache;
//! the store row is authoritative and cache entries rebuild from it on miss
//! or restart. Every create/update appends a row to the `session_events`
//! audit log.
//!
//! Expiry is inactivity-based: every successful `get`/`update` advances
//! `last_accessed` and slides `expires_at` forward by the configured
//! timeout, so a session is reaped once it has been idle longer than the
//! timeout. Expired sessions are never reactivated.

use crate::error::{BrainError, Result};
use crate::store::{with_busy_retry, Store};
use crate::util::now_iso;
use chrono::{Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// One session row, as cached in the server and returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: String,
    pub started_at: String,
    pub last_accessed: String,
    pub expires_at: String,
    pub data: Value,
    pub initial_context: Option<Value>,
    pub is_active: bool,
    pub terminated_reason: Option<String>,
    pub interaction_count: i64,
    pub memory_ops: i64,
    pub execution_ops: i64,
}

/// Append-only audit record of a session state change.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub id: i64,
    pub session_id: Uuid,
    pub event_type: String,
    pub detail: Option<String>,
    pub created_at: String,
}

/// Per-session activity counter buckets.
#[derive(Debug, Clone, Copy)]
pub enum Activity {
    Memory,
    Execution,
}

/// The session component. Cheap to clone; the cache is shared within the
/// process and private to it.
#[derive(Debug, Clone)]
pub struct Sessions {
    store: Store,
    timeout: Duration,
    cache: Arc<Mutex<HashMap<Uuid, Session>>>,
}

impl Sessions {
    pub fn new(store: Store, timeout_hours: u64) -> Self {
        Self {
            store,
            timeout: Duration::hours(timeout_hours as i64),
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a fresh session. `user_id` comes from the environment.
    pub fn create(&self) -> Result<Session> {
        let id = Uuid::new_v4();
        let user_id = std::env::var("USER").unwrap_or_else(|_| "unknown".into());
        let now = now_iso();
        let expires_at = self.expiry_from_now();

        let session = Session {
            id,
            user_id: user_id.clone(),
            started_at: now.clone(),
            last_accessed: now.clone(),
            expires_at: expires_at.clone(),
            data: Value::Object(Default::default()),
            initial_context: None,
            is_active: true,
            terminated_reason: None,
            interaction_count: 0,
            memory_ops: 0,
            execution_ops: 0,
        };

        with_busy_retry(|| {
            let conn = self.store.conn()?;
            let tx = conn.unchecked_transaction()?;
            tx.prepare_cached(
                "INSERT INTO sessions (id, user_id, started_at, last_accessed, expires_at, data)
                 VALUES (?1, ?2, ?3, ?3, ?4, '{}')",
            )?
            .execute(params![id.to_string(), user_id, now, expires_at])?;
            emit_event(&tx, id, "created", None)?;
            tx.commit()?;
            Ok(())
        })?;

        self.cache.lock().unwrap().insert(id, session.clone());
        tracing::info!(session_id = %id, user = %session.user_id, "session created");
        Ok(session)
    }

    /// Fetch an active, unexpired session, touching its access time.
    /// Returns `None` for unknown, expired, or terminated ids - never an
    /// error.
    pub fn get(&self, id: Uuid) -> Result<Option<Session>> {
        let now = now_iso();
        let expires_at = self.expiry_from_now();

        let session = with_busy_retry(|| {
            let conn = self.store.conn()?;
            let tx = conn.unchecked_transaction()?;
            let row = tx
                .prepare_cached(&format!(
                    "{SESSION_COLUMNS} FROM sessions
                     WHERE id = ?1 AND is_active = 1 AND expires_at > ?2"
                ))?
                .query_row(params![id.to_string(), now], session_from_row)
                .optional()?;

            let Some(mut session) = row else {
                return Ok(None);
            };

            tx.prepare_cached(
                "UPDATE sessions SET last_accessed = ?2, expires_at = ?3 WHERE id = ?1",
            )?
            .execute(params![id.to_string(), now, expires_at])?;
            tx.commit()?;

            session.last_accessed = now.clone();
            session.expires_at = expires_at.clone();
            Ok(Some(session))
        })?;

        let mut cache = self.cache.lock().unwrap();
        match &session {
            Some(s) => {
                cache.insert(id, s.clone());
            }
            None => {
                cache.remove(&id);
            }
        }
        Ok(session)
    }

    /// Replace the session's `data` document wholesale, advancing
    /// `last_accessed` and logging which top-level keys changed. Fails with
    /// `NotFound` when the session is not active.
    pub fn update(&self, id: Uuid, data: Value) -> Result<Session> {
        let now = now_iso();
        let expires_at = self.expiry_from_now();
        let encoded = serde_json::to_string(&data)?;

        let session = with_busy_retry(|| {
            let conn = self.store.conn()?;
            let tx = conn.unchecked_transaction()?;
            let row = tx
                .prepare_cached(&format!(
                    "{SESSION_COLUMNS} FROM sessions
                     WHERE id = ?1 AND is_active = 1 AND expires_at > ?2"
                ))?
                .query_row(params![id.to_string(), now], session_from_row)
                .optional()?;

            let Some(mut session) = row else {
                return Err(BrainError::NotFound(format!("session {id} is not active")));
            };

            let changed = changed_keys(&session.data, &data);
            tx.prepare_cached(
                "UPDATE sessions
                 SET data = ?2, last_accessed = ?3, expires_at = ?4,
                     interaction_count = interaction_count + 1
                 WHERE id = ?1",
            )?
            .execute(params![id.to_string(), encoded, now, expires_at])?;
            emit_event(
                &tx,
                id,
                "updated",
                Some(serde_json::json!({ "changed": changed }).to_string()),
            )?;
            tx.commit()?;

            session.data = data.clone();
            session.last_accessed = now.clone();
            session.expires_at = expires_at.clone();
            session.interaction_count += 1;
            Ok(session)
        })?;

        self.cache.lock().unwrap().insert(id, session.clone());
        Ok(session)
    }

    /// Persist the orchestrator's assembled context snapshot on the row.
    pub fn set_initial_context(&self, id: Uuid, context: &Value) -> Result<()> {
        let encoded = serde_json::to_string(context)?;
        with_busy_retry(|| {
            let conn = self.store.conn()?;
            let changed = conn
                .prepare_cached(
                    "UPDATE sessions SET initial_context = ?2 WHERE id = ?1 AND is_active = 1",
                )?
                .execute(params![id.to_string(), encoded])?;
            if changed == 0 {
                return Err(BrainError::NotFound(format!("session {id} is not active")));
            }
            Ok(())
        })?;
        if let Some(cached) = self.cache.lock().unwrap().get_mut(&id) {
            cached.initial_context = Some(context.clone());
        }
        Ok(())
    }

    /// Bump one of the per-session activity counters.
    pub fn record_activity(&self, id: Uuid, activity: Activity) -> Result<()> {
        let column = match activity {
            Activity::Memory => "memory_ops",
            Activity::Execution => "execution_ops",
        };
        let conn = self.store.conn()?;
        conn.execute(
            &format!("UPDATE sessions SET {column} = {column} + 1 WHERE id = ?1"),
            params![id.to_string()],
        )?;
        Ok(())
    }

    /// Reap every expired-but-active session, marking it inactive with
    /// reason `expired` and logging an event. Returns the reap count.
    /// Idempotent: a second pass with no activity in between reaps nothing.
    pub fn cleanup(&self) -> Result<usize> {
        let now = now_iso();
        let reaped: Vec<Uuid> = with_busy_retry(|| {
            let conn = self.store.conn()?;
            let tx = conn.unchecked_transaction()?;
            let ids: Vec<Uuid> = tx
                .prepare_cached(
                    "SELECT id FROM sessions WHERE is_active = 1 AND expires_at < ?1",
                )?
                .query_map(params![now], |r| r.get::<_, String>(0))?
                .filter_map(|r| r.ok().and_then(|s| Uuid::parse_str(&s).ok()))
                .collect();

            for id in &ids {
                tx.prepare_cached(
                    "UPDATE sessions SET is_active = 0, terminated_reason = 'expired'
                     WHERE id = ?1",
                )?
                .execute(params![id.to_string()])?;
                emit_event(&tx, *id, "expired", None)?;
            }
            tx.commit()?;
            Ok(ids)
        })?;

        let mut cache = self.cache.lock().unwrap();
        for id in &reaped {
            cache.remove(id);
        }
        if !reaped.is_empty() {
            tracing::info!(count = reaped.len(), "expired sessions reaped");
        }
        Ok(reaped.len())
    }

    /// Audit log for one session, oldest first.
    pub fn events(&self, id: Uuid) -> Result<Vec<SessionEvent>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, session_id, event_type, detail, created_at
             FROM session_events WHERE session_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![id.to_string()], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, String>(4)?,
            ))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (event_id, session_id, event_type, detail, created_at) = row?;
            events.push(SessionEvent {
                id: event_id,
                session_id: Uuid::parse_str(&session_id)
                    .map_err(|e| BrainError::Integrity(format!("bad session id: {e}")))?,
                event_type,
                detail,
                created_at,
            });
        }
        Ok(events)
    }

    /// Count of active sessions, for the health summary.
    pub fn active_count(&self) -> Result<i64> {
        let conn = self.store.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE is_active = 1 AND expires_at > ?1",
            params![now_iso()],
            |r| r.get(0),
        )?)
    }

    fn expiry_from_now(&self) -> String {
        (Utc::now() + self.timeout).to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    #[cfg(test)]
    pub(crate) fn drop_cache(&self) {
        self.cache.lock().unwrap().clear();
    }
}

const SESSION_COLUMNS: &str = "SELECT id, user_id, started_at, last_accessed, expires_at, data, \
                               initial_context, is_active, terminated_reason, interaction_count, \
                               memory_ops, execution_ops";

fn session_from_row(r: &Row<'_>) -> rusqlite::Result<Session> {
    let id: String = r.get(0)?;
    let data: String = r.get(5)?;
    let initial_context: Option<String> = r.get(6)?;
    Ok(Session {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        user_id: r.get(1)?,
        started_at: r.get(2)?,
        last_accessed: r.get(3)?,
        expires_at: r.get(4)?,
        data: serde_json::from_str(&data).unwrap_or(Value::Null),
        initial_context: initial_context.and_then(|c| serde_json::from_str(&c).ok()),
        is_active: r.get(7)?,
        terminated_reason: r.get(8)?,
        interaction_count: r.get(9)?,
        memory_ops: r.get(10)?,
        execution_ops: r.get(11)?,
    })
}

fn emit_event(conn: &Connection, id: Uuid, event_type: &str, detail: Option<String>) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO session_events (session_id, event_type, detail, created_at)
         VALUES (?1, ?2, ?3, ?4)",
    )?
    .execute(params![id.to_string(), event_type, detail, now_iso()])?;
    Ok(())
}

/// Top-level keys that differ between the old and new data documents
/// (added, removed, or changed), sorted for stable event detail.
fn changed_keys(old: &Value, new: &Value) -> Vec<String> {
    let empty = serde_json::Map::new();
    let old_map = old.as_object().unwrap_or(&empty);
    let new_map = new.as_object().unwrap_or(&empty);

    let mut changed: Vec<String> = Vec::new();
    for (key, value) in new_map {
        if old_map.get(key) != Some(value) {
            changed.push(key.clone());
        }
    }
    for key in old_map.keys() {
        if !new_map.contains_key(key) {
            changed.push(key.clone());
        }
    }
    changed.sort();
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_sessions() -> (tempfile::TempDir, Sessions) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("brain.db")).unwrap();
        (dir, Sessions::new(store, 24))
    }

    fn force_expired(sessions: &Sessions, id: Uuid) {
        let conn = sessions.store().conn().unwrap();
        conn.execute(
            "UPDATE sessions SET expires_at = '2000-01-01T00:00:00.000Z' WHERE id = ?1",
            params![id.to_string()],
        )
        .unwrap();
    }

    #[test]
    fn create_then_get_roundtrips() {
        let (_dir, sessions) = test_sessions();
        let created = sessions.create().unwrap();
        let fetched = sessions.get(created.id).unwrap().unwrap();
        assert_eq!(fetched.id, created.id);
        assert!(fetched.is_active);
        assert!(fetched.started_at <= fetched.last_accessed);
        assert!(fetched.last_accessed <= fetched.expires_at);
    }

    #[test]
    fn get_unknown_returns_none() {
        let (_dir, sessions) = test_sessions();
        assert!(sessions.get(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn get_touches_last_accessed() {
        let (_dir, sessions) = test_sessions();
        let created = sessions.create().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let fetched = sessions.get(created.id).unwrap().unwrap();
        assert!(fetched.last_accessed > created.last_accessed);
    }

    #[test]
    fn expired_session_is_unreachable() {
        let (_dir, sessions) = test_sessions();
        let created = sessions.create().unwrap();
        force_expired(&sessions, created.id);
        assert!(sessions.get(created.id).unwrap().is_none());
    }

    #[test]
    fn update_replaces_data_and_logs_changed_keys() {
        let (_dir, sessions) = test_sessions();
        let created = sessions.create().unwrap();
        sessions
            .update(created.id, json!({"topic": "rust", "depth": 1}))
            .unwrap();
        let updated = sessions
            .update(created.id, json!({"topic": "rust", "depth": 2}))
            .unwrap();
        assert_eq!(updated.data, json!({"topic": "rust", "depth": 2}));
        assert_eq!(updated.interaction_count, 2);

        let events = sessions.events(created.id).unwrap();
        let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(kinds, ["created", "updated", "updated"]);
        let last_detail = events.last().unwrap().detail.as_deref().unwrap();
        assert!(last_detail.contains("depth"));
        assert!(!last_detail.contains("topic"), "unchanged key must not be logged");
    }

    #[test]
    fn update_on_expired_session_fails() {
        let (_dir, sessions) = test_sessions();
        let created = sessions.create().unwrap();
        force_expired(&sessions, created.id);
        let err = sessions.update(created.id, json!({})).unwrap_err();
        assert!(matches!(err, BrainError::NotFound(_)));
    }

    #[test]
    fn cleanup_reaps_expired_and_is_idempotent() {
        let (_dir, sessions) = test_sessions();
        let alive = sessions.create().unwrap();
        let dead = sessions.create().unwrap();
        force_expired(&sessions, dead.id);

        assert_eq!(sessions.cleanup().unwrap(), 1);
        assert_eq!(sessions.cleanup().unwrap(), 0, "second pass reaps nothing");
        assert!(sessions.get(alive.id).unwrap().is_some());
        assert!(sessions.get(dead.id).unwrap().is_none());

        let events = sessions.events(dead.id).unwrap();
        assert_eq!(events.last().unwrap().event_type, "expired");
    }

    #[test]
    fn cache_rebuilds_from_row() {
        let (_dir, sessions) = test_sessions();
        let created = sessions.create().unwrap();
        sessions.update(created.id, json!({"k": "v"})).unwrap();
        sessions.drop_cache();
        let fetched = sessions.get(created.id).unwrap().unwrap();
        assert_eq!(fetched.data, json!({"k": "v"}));
    }

    #[test]
    fn initial_context_snapshot_persists() {
        let (_dir, sessions) = test_sessions();
        let created = sessions.create().unwrap();
        let snapshot = json!({"loaded_memories": 2});
        sessions.set_initial_context(created.id, &snapshot).unwrap();
        sessions.drop_cache();
        let fetched = sessions.get(created.id).unwrap().unwrap();
        assert_eq!(fetched.initial_context, Some(snapshot));
    }

    #[test]
    fn activity_counters_accumulate() {
        let (_dir, sessions) = test_sessions();
        let created = sessions.create().unwrap();
        sessions.record_activity(created.id, Activity::Memory).unwrap();
        sessions.record_activity(created.id, Activity::Execution).unwrap();
        sessions.record_activity(created.id, Activity::Execution).unwrap();
        let fetched = sessions.get(created.id).unwrap().unwrap();
        assert_eq!(fetched.memory_ops, 1);
        assert_eq!(fetched.execution_ops, 2);
    }
}

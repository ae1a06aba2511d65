//! Tiered memory store (hot / warm / cold)
//!
//! Durable key -> document mapping with keyword search and an automatic
//! tiering policy that keeps the top-scoring entries ready for the
//! orchestrator's init set. The FTS5 shadow table is maintained by triggers
//! (see `store::migrations`), so every write path here touches only the
//! `memories` table.
//!
//! Scoring and the rebalance pass live in [`tiering`].

pub mod tiering;

use crate::error::{BrainError, Result};
use crate::store::document::{self, EncodedValue};
use crate::store::{with_busy_retry, Store};
use crate::util::now_iso;
use chrono::{Duration, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;

/// Types that are pinned to the hot tier and carry full type weight in
/// scoring.
pub const PRIVILEGED_TYPES: &[&str] = &["user_preferences", "system_critical"];

/// Memory type recognized specially by the init set (at most one current).
pub const ACTIVE_PROJECT_TYPE: &str = "active_project";

/// Default number of entries the init set may carry.
pub const INIT_SET_LIMIT: usize = 300;

pub fn is_privileged(memory_type: &str) -> bool {
    PRIVILEGED_TYPES.contains(&memory_type)
}

/// One decoded memory row.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryEntry {
    pub key: String,
    pub value: Value,
    #[serde(rename = "type")]
    pub memory_type: String,
    pub tags: Vec<String>,
    pub storage_tier: String,
    pub memory_score: f64,
    pub accessed_at: String,
    pub access_count: i64,
}

/// One search result, ordered by `relevance` (fts rank x memory score).
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub key: String,
    pub value: Value,
    #[serde(rename = "type")]
    pub memory_type: String,
    pub tags: Vec<String>,
    pub memory_score: f64,
    pub relevance: f64,
}

/// Totals by tier plus aggregate byte size.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStats {
    pub hot: i64,
    pub warm: i64,
    pub cold: i64,
    pub total: i64,
    pub total_bytes: i64,
}

/// The memory component. Cheap to clone; all state is in the store.
#[derive(Debug, Clone)]
pub struct Memory {
    store: Store,
    hot_capacity: usize,
}

impl Memory {
    pub fn new(store: Store, hot_capacity: usize) -> Self {
        Self {
            store,
            hot_capacity,
        }
    }

    pub fn hot_capacity(&self) -> usize {
        self.hot_capacity
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    /// Upsert a memory. On conflict the value is replaced, `update_count`
    /// incremented, and the score nudged upward; privileged types are forced
    /// to the hot tier.
    pub fn set(
        &self,
        key: &str,
        value: &Value,
        memory_type: Option<&str>,
        tags: &[String],
        source: Option<&str>,
        context: Option<&str>,
    ) -> Result<()> {
        if key.is_empty() {
            return Err(BrainError::Resource("memory key must be non-empty".into()));
        }
        let memory_type = memory_type.unwrap_or("general");
        let encoded: EncodedValue = document::encode(value)?;
        let tags_flat = tags.join(" ");
        let is_private = tags.iter().any(|t| t == "private");
        let search_text = format!("{} {}", key, document::search_text(value));
        let tier = if is_privileged(memory_type) { "hot" } else { "warm" };
        let now = now_iso();

        with_busy_retry(|| {
            let conn = self.store.conn()?;
            conn.prepare_cached(
                r#"
                INSERT INTO memories (key, value, is_compressed, type, tags, source, context,
                                      search_text, is_private, created_at, updated_at, accessed_at,
                                      access_count, update_count, storage_tier, memory_score,
                                      size_bytes, checksum)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?10, 0, 0, ?11, 0.5, ?12, ?13)
                ON CONFLICT(key) DO UPDATE SET
                    value         = excluded.value,
                    is_compressed = excluded.is_compressed,
                    type          = excluded.type,
                    tags          = excluded.tags,
                    source        = COALESCE(excluded.source, source),
                    context       = COALESCE(excluded.context, context),
                    search_text   = excluded.search_text,
                    is_private    = excluded.is_private,
                    updated_at    = excluded.updated_at,
                    accessed_at   = excluded.accessed_at,
                    update_count  = update_count + 1,
                    storage_tier  = CASE
                        WHEN excluded.type IN ('user_preferences', 'system_critical') THEN 'hot'
                        ELSE storage_tier
                    END,
                    memory_score  = MIN(1.0, memory_score * 0.9 + 0.1),
                    size_bytes    = excluded.size_bytes,
                    checksum      = excluded.checksum
                "#,
            )?
            .execute(params![
                key,
                encoded.bytes,
                encoded.is_compressed,
                memory_type,
                tags_flat,
                source,
                context,
                search_text,
                is_private,
                now,
                tier,
                encoded.size_bytes as i64,
                encoded.checksum,
            ])?;
            Ok(())
        })?;

        tracing::debug!(key, r#type = memory_type, tier, "memory set");
        Ok(())
    }

    /// Read one memory, touching its access time, count, and score in the
    /// same transaction. Returns `None` when the key does not exist.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        with_busy_retry(|| {
            let conn = self.store.conn()?;
            let tx = conn.unchecked_transaction()?;

            let row: Option<(Vec<u8>, bool, String)> = tx
                .prepare_cached(
                    "SELECT value, is_compressed, checksum FROM memories WHERE key = ?1",
                )?
                .query_row(params![key], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
                .optional()?;

            let Some((bytes, is_compressed, checksum)) = row else {
                return Ok(None);
            };

            // Decode before touching: a corrupt row keeps its counters and
            // tier untouched, and the failure surfaces as an integrity error.
            let value = match document::decode(&bytes, is_compressed, &checksum) {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(key, error = %e, "memory failed integrity check; flagged for recovery");
                    return Err(e);
                }
            };

            tx.prepare_cached(
                r#"
                UPDATE memories
                SET accessed_at  = ?2,
                    access_count = access_count + 1,
                    memory_score = MIN(1.0, memory_score * 0.95 + 0.05)
                WHERE key = ?1
                "#,
            )?
            .execute(params![key, now_iso()])?;
            tx.commit()?;

            Ok(Some(value))
        })
    }

    /// FTS-ranked keyword search over hot and warm, public entries only.
    ///
    /// Query terms are split on whitespace; each becomes a quoted prefix
    /// term, OR-combined. Results are ordered by `(-bm25) x memory_score`
    /// descending, ties broken by most recent access.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let fts_query = build_fts_query(query);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }

        with_busy_retry(|| {
            let conn = self.store.conn()?;
            let mut stmt = conn.prepare_cached(
                r#"
                SELECT m.key, m.value, m.is_compressed, m.checksum, m.type, m.tags,
                       m.memory_score,
                       (-bm25(memories_fts)) * m.memory_score AS relevance
                FROM memories_fts
                JOIN memories m ON memories_fts.rowid = m.rowid
                WHERE memories_fts MATCH ?1
                  AND m.storage_tier IN ('hot', 'warm')
                  AND m.is_private = 0
                ORDER BY relevance DESC, m.accessed_at DESC
                LIMIT ?2
                "#,
            )?;

            let rows = stmt.query_map(params![fts_query, limit as i64], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, Vec<u8>>(1)?,
                    r.get::<_, bool>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, f64>(6)?,
                    r.get::<_, f64>(7)?,
                ))
            })?;

            let mut hits = Vec::new();
            for row in rows {
                let (key, bytes, is_compressed, checksum, memory_type, tags, score, relevance) =
                    row?;
                let value = document::decode(&bytes, is_compressed, &checksum)?;
                hits.push(SearchHit {
                    key,
                    value,
                    memory_type,
                    tags: split_tags(&tags),
                    memory_score: score,
                    relevance,
                });
            }
            Ok(hits)
        })
    }

    /// Deterministic init set: all `user_preferences`, the current
    /// `active_project` if any, everything accessed in the last 7 days by
    /// score, then fill from warm by score. Never returns cold rows, never
    /// exceeds `n`.
    pub fn top_for_init(&self, n: usize) -> Result<Vec<MemoryEntry>> {
        let recent_cutoff = (Utc::now() - Duration::days(7))
            .to_rfc3339_opts(SecondsFormat::Millis, true);

        with_busy_retry(|| {
            let conn = self.store.conn()?;
            let mut entries: Vec<MemoryEntry> = Vec::new();
            let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();

            let mut push_query = |sql: &str, params: &[&dyn rusqlite::ToSql]| -> Result<()> {
                let mut stmt = conn.prepare_cached(sql)?;
                let rows = stmt.query_map(params, entry_from_row)?;
                for row in rows {
                    let (entry, bytes, is_compressed, checksum) = row?;
                    if entries.len() >= n || seen.contains(&entry.key) {
                        continue;
                    }
                    let value = document::decode(&bytes, is_compressed, &checksum)?;
                    seen.insert(entry.key.clone());
                    entries.push(MemoryEntry { value, ..entry });
                }
                Ok(())
            };

            // (a) preferences, (b) active project, (c) recently accessed by
            // score, (d) warm fill by score. Cold is excluded everywhere.
            push_query(
                &format!(
                    "{ENTRY_COLUMNS} FROM memories
                     WHERE type = 'user_preferences' AND storage_tier != 'cold'
                     ORDER BY key"
                ),
                &[],
            )?;
            push_query(
                &format!(
                    "{ENTRY_COLUMNS} FROM memories
                     WHERE type = ?1 AND storage_tier != 'cold'
                     ORDER BY updated_at DESC LIMIT 1"
                ),
                &[&ACTIVE_PROJECT_TYPE],
            )?;
            push_query(
                &format!(
                    "{ENTRY_COLUMNS} FROM memories
                     WHERE accessed_at >= ?1 AND storage_tier IN ('hot', 'warm')
                     ORDER BY memory_score DESC, accessed_at DESC LIMIT ?2"
                ),
                &[&recent_cutoff, &(n as i64)],
            )?;
            push_query(
                &format!(
                    "{ENTRY_COLUMNS} FROM memories
                     WHERE storage_tier = 'warm'
                     ORDER BY memory_score DESC, accessed_at DESC LIMIT ?1"
                ),
                &[&(n as i64)],
            )?;

            Ok(entries)
        })
    }

    /// Totals by tier and aggregate byte size.
    pub fn stats(&self) -> Result<MemoryStats> {
        let conn = self.store.conn()?;
        let mut stats = MemoryStats::default();
        let mut stmt = conn.prepare_cached(
            "SELECT storage_tier, COUNT(*), COALESCE(SUM(size_bytes), 0)
             FROM memories GROUP BY storage_tier",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?))
        })?;
        for row in rows {
            let (tier, count, bytes) = row?;
            match tier.as_str() {
                "hot" => stats.hot = count,
                "warm" => stats.warm = count,
                "cold" => stats.cold = count,
                _ => {}
            }
            stats.total += count;
            stats.total_bytes += bytes;
        }
        Ok(stats)
    }

    /// Delete a memory outright. The FTS trigger removes the shadow row.
    /// Returns whether a row existed.
    pub fn forget(&self, key: &str) -> Result<bool> {
        with_busy_retry(|| {
            let conn = self.store.conn()?;
            let changed = conn
                .prepare_cached("DELETE FROM memories WHERE key = ?1")?
                .execute(params![key])?;
            Ok(changed > 0)
        })
    }

    /// Hourly maintenance pass; see [`tiering::rebalance`].
    pub fn rebalance(&self) -> Result<tiering::RebalanceSummary> {
        tiering::rebalance(&self.store, self.hot_capacity)
    }
}

const ENTRY_COLUMNS: &str = "SELECT key, value, is_compressed, checksum, type, tags, \
                             storage_tier, memory_score, accessed_at, access_count";

/// Maps an `ENTRY_COLUMNS` row, deferring value decode to the caller.
#[allow(clippy::type_complexity)]
fn entry_from_row(r: &Row<'_>) -> rusqlite::Result<(MemoryEntry, Vec<u8>, bool, String)> {
    Ok((
        MemoryEntry {
            key: r.get(0)?,
            value: Value::Null,
            memory_type: r.get(4)?,
            tags: split_tags(&r.get::<_, String>(5)?),
            storage_tier: r.get(6)?,
            memory_score: r.get(7)?,
            accessed_at: r.get(8)?,
            access_count: r.get(9)?,
        },
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
    ))
}

fn split_tags(flat: &str) -> Vec<String> {
    flat.split_whitespace().map(str::to_string).collect()
}

/// Whitespace-split the user query into quoted prefix terms, OR-combined.
/// Quoting keeps FTS5 operators inert in user input.
fn build_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"*", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

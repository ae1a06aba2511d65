//! Scoring and tier rebalancing
//!
//! Runs on a fixed cadence (about hourly). Scores blend three signals:
//! recency, frequency, and a type bonus for privileged types. The rebalance
//! pass then moves rows between tiers and finally enforces the hot-tier
//! capacity with an emergency demotion of the least valuable rows.

use crate::error::Result;
use crate::store::Store;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::params;

/// Rebalance promotes warm rows into hot only up to this count, leaving
/// headroom below the hard capacity for new privileged writes.
const PROMOTION_CEILING: i64 = 250;

/// Hot rows idle longer than this and scoring below
/// [`DEMOTION_SCORE_FLOOR`] drop to warm.
const HOT_IDLE_HOURS: i64 = 24;
const DEMOTION_SCORE_FLOOR: f64 = 0.7;

/// Warm rows idle longer than this with fewer accesses than
/// [`COLD_ACCESS_FLOOR`] drop to cold.
const COLD_IDLE_DAYS: i64 = 30;
const COLD_ACCESS_FLOOR: i64 = 5;

/// Normalizes `log10(access_count + 1)` to the unit interval; full credit at
/// 100 accesses.
const FREQUENCY_NORM: f64 = 2.0;

#[derive(Debug, Default, Clone, Copy)]
pub struct RebalanceSummary {
    pub rescored: usize,
    pub demoted_to_warm: usize,
    pub promoted_to_hot: usize,
    pub demoted_to_cold: usize,
    pub evicted: usize,
}

/// Blend of recency, frequency, and type bonus, clamped to [0, 1].
pub fn compute_score(age_days: f64, access_count: i64, privileged: bool) -> f64 {
    let recency = (-age_days.max(0.0) / 7.0).exp();
    let frequency = (((access_count.max(0) as f64) + 1.0).log10() / FREQUENCY_NORM).min(1.0);
    let type_weight = if privileged { 1.0 } else { 0.1 };
    (0.4 * recency + 0.4 * frequency + 0.2 * type_weight).clamp(0.0, 1.0)
}

/// One full rebalance pass:
/// 1. recompute every score from current age/frequency,
/// 2. demote stale low-scoring hot rows to warm,
/// 3. promote the best warm rows into hot up to the promotion ceiling,
/// 4. demote long-idle rarely-used warm rows to cold,
/// 5. emergency-demote until hot fits the configured capacity.
pub fn rebalance(store: &Store, hot_capacity: usize) -> Result<RebalanceSummary> {
    let now = Utc::now();
    let mut summary = RebalanceSummary::default();

    let conn = store.conn()?;

    // 1. Rescore. Row-at-a-time in one transaction; the table is small
    //    (hundreds of hot/warm rows) and this keeps the formula in one
    //    place instead of splitting it between Rust and SQL.
    {
        let tx = conn.unchecked_transaction()?;
        let rows: Vec<(String, String, i64, String)> = tx
            .prepare_cached("SELECT key, accessed_at, access_count, type FROM memories")?
            .query_map([], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut update = tx.prepare_cached("UPDATE memories SET memory_score = ?2 WHERE key = ?1")?;
        for (key, accessed_at, access_count, memory_type) in rows {
            let age_days = parse_age_days(&accessed_at, now);
            let score = compute_score(
                age_days,
                access_count,
                super::is_privileged(&memory_type),
            );
            update.execute(params![key, score])?;
            summary.rescored += 1;
        }
        drop(update);
        tx.commit()?;
    }

    let hot_idle_cutoff = iso_before(now, Duration::hours(HOT_IDLE_HOURS));
    let cold_idle_cutoff = iso_before(now, Duration::days(COLD_IDLE_DAYS));

    // 2. hot -> warm
    summary.demoted_to_warm = conn
        .prepare_cached(
            "UPDATE memories SET storage_tier = 'warm'
             WHERE storage_tier = 'hot'
               AND type NOT IN ('user_preferences', 'system_critical')
               AND accessed_at < ?1
               AND memory_score < ?2",
        )?
        .execute(params![hot_idle_cutoff, DEMOTION_SCORE_FLOOR])?;

    // 3. warm -> hot, best scores first, up to the promotion ceiling.
    //    The floor matches the demotion threshold so a row demoted in step 2
    //    cannot bounce straight back.
    let hot_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE storage_tier = 'hot'",
        [],
        |r| r.get(0),
    )?;
    let headroom = (PROMOTION_CEILING - hot_count).max(0);
    if headroom > 0 {
        summary.promoted_to_hot = conn
            .prepare_cached(
                "UPDATE memories SET storage_tier = 'hot'
                 WHERE key IN (
                     SELECT key FROM memories
                     WHERE storage_tier = 'warm' AND memory_score >= ?2
                     ORDER BY memory_score DESC, accessed_at DESC LIMIT ?1
                 )",
            )?
            .execute(params![headroom, DEMOTION_SCORE_FLOOR])?;
    }

    // 4. warm -> cold
    summary.demoted_to_cold = conn
        .prepare_cached(
            "UPDATE memories SET storage_tier = 'cold'
             WHERE storage_tier = 'warm'
               AND accessed_at < ?1
               AND access_count < ?2",
        )?
        .execute(params![cold_idle_cutoff, COLD_ACCESS_FLOOR])?;

    // 5. Emergency eviction: oldest-accessed, least-used, non-privileged
    //    rows drop to warm until hot fits the capacity again.
    summary.evicted = evict_hot_overflow(&conn, hot_capacity)?;

    tracing::info!(
        rescored = summary.rescored,
        demoted_to_warm = summary.demoted_to_warm,
        promoted_to_hot = summary.promoted_to_hot,
        demoted_to_cold = summary.demoted_to_cold,
        evicted = summary.evicted,
        "memory rebalance complete"
    );
    Ok(summary)
}

/// Demote hot overflow down to `hot_capacity`. Also called outside the full
/// rebalance when a write pushes the hot tier past its cap.
pub fn evict_hot_overflow(conn: &rusqlite::Connection, hot_capacity: usize) -> Result<usize> {
    let hot_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE storage_tier = 'hot'",
        [],
        |r| r.get(0),
    )?;
    let overflow = hot_count - hot_capacity as i64;
    if overflow <= 0 {
        return Ok(0);
    }

    let evicted = conn
        .prepare_cached(
            "UPDATE memories SET storage_tier = 'warm'
             WHERE key IN (
                 SELECT key FROM memories
                 WHERE storage_tier = 'hot'
                   AND type NOT IN ('user_preferences', 'system_critical')
                 ORDER BY accessed_at ASC, access_count ASC
                 LIMIT ?1
             )",
        )?
        .execute(params![overflow])?;
    tracing::warn!(evicted, "hot tier overflow, demoted least-used rows");
    Ok(evicted)
}

fn parse_age_days(accessed_at: &str, now: DateTime<Utc>) -> f64 {
    DateTime::parse_from_rfc3339(accessed_at)
        .map(|t| (now - t.with_timezone(&Utc)).num_seconds() as f64 / 86_400.0)
        .unwrap_or(0.0)
}

fn iso_before(now: DateTime<Utc>, ago: Duration) -> String {
    (now - ago).to_rfc3339_opts(SecondsFormat::Millis, true)
}

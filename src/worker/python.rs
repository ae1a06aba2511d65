//! Read-only `brain` object injected into Python executions
//!
//! A generated prelude gives executed Python a convenience handle over the
//! store: `brain.query(sql, params)`, `brain.get_memories(limit)`, and
//! `brain.search_memories(text)`. The connection is opened read-only
//! (`file:...?mode=ro`), so this is a trust-based convenience, not a
//! sandbox boundary. Shell executions get no bridge.

use std::path::Path;

/// Prepend the bridge prelude to user code. The prelude is self-contained
/// stdlib Python and degrades to `brain = None` when the store cannot be
/// opened.
pub fn wrap_with_bridge(code: &str, db_path: &Path) -> String {
    let prelude = bridge_prelude(db_path);
    format!("{prelude}\n{code}")
}

fn bridge_prelude(db_path: &Path) -> String {
    // Compressed values are stored as zstd blobs the stdlib cannot decode;
    // the bridge surfaces those as value=None and callers fall back to
    // brain.query for metadata.
    format!(
        r#"import json as _json
import sqlite3 as _sqlite3

class _Brain:
    def __init__(self, path):
        self._conn = _sqlite3.connect("file:{{}}?mode=ro".format(path), uri=True)
        self._conn.row_factory = _sqlite3.Row

    def query(self, sql, params=()):
        cur = self._conn.execute(sql, params)
        return [dict(row) for row in cur.fetchall()]

    def get_memories(self, limit=10):
        rows = self.query(
            "SELECT key, type, tags, storage_tier, memory_score, "
            "CASE WHEN is_compressed THEN NULL ELSE CAST(value AS TEXT) END AS value "
            "FROM memories ORDER BY memory_score DESC, accessed_at DESC LIMIT ?",
            (limit,),
        )
        for row in rows:
            if row["value"] is not None:
                try:
                    row["value"] = _json.loads(row["value"])
                except ValueError:
                    pass
        return rows

    def search_memories(self, text):
        terms = " OR ".join(
            '"{{}}"*'.format(term.replace('"', '""')) for term in text.split()
        )
        if not terms:
            return []
        return self.query(
            "SELECT m.key, m.type, m.storage_tier, m.memory_score "
            "FROM memories_fts JOIN memories m ON memories_fts.rowid = m.rowid "
            "WHERE memories_fts MATCH ? "
            "AND m.storage_tier IN ('hot', 'warm') AND m.is_private = 0",
            (terms,),
        )

try:
    brain = _Brain({db_path:?})
except Exception:
    brain = None
"#,
        db_path = db_path.to_string_lossy()
    )
}

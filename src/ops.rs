//! Named-operation surface
//!
//! The transport-agnostic seam between the core and whatever carries
//! operations to it. Every operation yields a lazy sequence of chunks into
//! a sink: zero or more progress lines, then exactly one terminal chunk -
//! either a final document or an error line. Errors never cross the sink as
//! exceptions; the dispatch itself is infallible.

use crate::error::Result;
use crate::executions::language::Language;
use crate::orchestrator::Orchestrator;
use crate::sessions::Activity;
use crate::util::truncate_utf8_safe;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Bytes of each recall match preview line.
const MATCH_PREVIEW_BYTES: usize = 120;

/// One operation request, as decoded off the transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpRequest {
    Init {
        session_id: Option<Uuid>,
    },
    Status {
        session_id: Option<Uuid>,
        execution_id: Option<Uuid>,
    },
    Remember {
        key: String,
        value: Value,
        #[serde(rename = "type")]
        memory_type: Option<String>,
        #[serde(default)]
        tags: Vec<String>,
        session_id: Option<Uuid>,
    },
    Recall {
        query: String,
        limit: Option<usize>,
        session_id: Option<Uuid>,
    },
    Execute {
        code: String,
        language: Option<Language>,
        session_id: Option<Uuid>,
    },
    Forget {
        key: String,
    },
    Cancel {
        execution_id: Uuid,
    },
}

/// One element of an operation's lazy output.
#[derive(Debug, Clone)]
pub enum Chunk {
    /// User-visible progress text.
    Progress(String),
    /// The terminal document of a successful operation.
    Final(Value),
    /// The terminal chunk of a failed operation.
    Error(String),
}

impl Chunk {
    /// Render for a plain-text transport.
    pub fn render(&self) -> String {
        match self {
            Chunk::Progress(text) => text.clone(),
            Chunk::Final(doc) => serde_json::to_string_pretty(doc).unwrap_or_default(),
            Chunk::Error(message) => format!("⚠️ Error: {message}"),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Chunk::Progress(_))
    }
}

/// Run one operation to completion, yielding chunks into `sink`. Always
/// ends with exactly one terminal chunk and never returns an error: every
/// failure becomes an `Error` chunk.
pub async fn dispatch(orchestrator: &Orchestrator, request: OpRequest, sink: mpsc::Sender<Chunk>) {
    let outcome = run_op(orchestrator, request, &sink).await;
    let terminal = match outcome {
        Ok(doc) => Chunk::Final(doc),
        Err(e) => {
            tracing::warn!(error = %e, "operation failed");
            Chunk::Error(e.to_string())
        }
    };
    let _ = sink.send(terminal).await;
}

async fn run_op(
    orchestrator: &Orchestrator,
    request: OpRequest,
    sink: &mpsc::Sender<Chunk>,
) -> Result<Value> {
    let progress = |text: String| {
        let sink = sink.clone();
        async move {
            let _ = sink.send(Chunk::Progress(text)).await;
        }
    };

    match request {
        OpRequest::Init { session_id } => {
            progress("Initializing brain context...".into()).await;
            let doc = orchestrator.init(session_id)?;
            Ok(serde_json::to_value(doc)?)
        }

        OpRequest::Status {
            session_id,
            execution_id,
        } => orchestrator.status(session_id, execution_id),

        OpRequest::Remember {
            key,
            value,
            memory_type,
            tags,
            session_id,
        } => {
            progress(format!("Storing memory '{key}'...")).await;
            orchestrator
                .components()
                .memory
                .set(&key, &value, memory_type.as_deref(), &tags, None, None)?;
            bump_memory_activity(orchestrator, session_id);
            Ok(json!({ "status": "stored", "key": key }))
        }

        OpRequest::Recall {
            query,
            limit,
            session_id,
        } => {
            let hits = orchestrator
                .components()
                .memory
                .search(&query, limit.unwrap_or(10))?;
            bump_memory_activity(orchestrator, session_id);
            for hit in &hits {
                let preview = truncate_utf8_safe(&hit.value.to_string(), MATCH_PREVIEW_BYTES)
                    .to_string();
                progress(format!(
                    "• {} [{}] ({:.2}) {}",
                    hit.key, hit.memory_type, hit.memory_score, preview
                ))
                .await;
            }
            Ok(json!({ "query": query, "matches": hits.len() }))
        }

        OpRequest::Execute {
            code,
            language,
            session_id,
        } => {
            let receipt = orchestrator
                .components()
                .executions
                .queue(&code, language, session_id)?;
            if let Some(id) = session_id {
                // Best-effort counter bump; the queue insert already landed.
                if let Err(e) = orchestrator
                    .components()
                    .sessions
                    .record_activity(id, Activity::Execution)
                {
                    tracing::debug!(error = %e, "session activity bump failed");
                }
            }
            Ok(json!({
                "execution_id": receipt.id,
                "status": receipt.status,
                "language": receipt.language,
            }))
        }

        OpRequest::Forget { key } => {
            let removed = orchestrator.components().memory.forget(&key)?;
            Ok(json!({ "key": key, "removed": removed }))
        }

        OpRequest::Cancel { execution_id } => {
            // Only queued rows cancel directly; a running row is terminated
            // by the sweeps and observed by its worker.
            let cancelled = orchestrator.components().executions.cancel(execution_id)?;
            Ok(json!({ "execution_id": execution_id, "cancelled": cancelled }))
        }
    }
}

/// Best-effort memory-activity bump for session-bound operations.
fn bump_memory_activity(orchestrator: &Orchestrator, session_id: Option<Uuid>) {
    if let Some(id) = session_id {
        if let Err(e) = orchestrator
            .components()
            .sessions
            .record_activity(id, Activity::Memory)
        {
            tracing::debug!(error = %e, "session activity bump failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::Components;
    use crate::store::Store;
    use serde_json::json;

    async fn run(orchestrator: &Orchestrator, request: OpRequest) -> Vec<Chunk> {
        let (tx, mut rx) = mpsc::channel(64);
        dispatch(orchestrator, request, tx).await;
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    fn test_orchestrator() -> (tempfile::TempDir, Orchestrator) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("brain.db")).unwrap();
        let components =
            Components::build(store, 300, 24, dir.path().join("executions")).unwrap();
        (dir, Orchestrator::new(components))
    }

    fn final_doc(chunks: &[Chunk]) -> &Value {
        match chunks.last().expect("at least one chunk") {
            Chunk::Final(doc) => doc,
            other => panic!("expected final document, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn every_op_ends_with_exactly_one_terminal_chunk() {
        let (_dir, orchestrator) = test_orchestrator();
        let requests = vec![
            OpRequest::Init { session_id: None },
            OpRequest::Status { session_id: None, execution_id: None },
            OpRequest::Remember {
                key: "k".into(),
                value: json!(1),
                memory_type: None,
                tags: vec![],
                session_id: None,
            },
            OpRequest::Recall { query: "k".into(), limit: None, session_id: None },
            OpRequest::Execute { code: "echo hi".into(), language: None, session_id: None },
            OpRequest::Forget { key: "k".into() },
            OpRequest::Cancel { execution_id: Uuid::new_v4() },
        ];
        for request in requests {
            let chunks = run(&orchestrator, request).await;
            let terminals = chunks.iter().filter(|c| c.is_terminal()).count();
            assert_eq!(terminals, 1);
            assert!(chunks.last().unwrap().is_terminal());
        }
    }

    #[tokio::test]
    async fn remember_then_recall_streams_match_lines() {
        let (_dir, orchestrator) = test_orchestrator();
        run(
            &orchestrator,
            OpRequest::Remember {
                key: "editor".into(),
                value: json!({"name": "helix"}),
                memory_type: None,
                tags: vec![],
                session_id: None,
            },
        )
        .await;

        let chunks = run(
            &orchestrator,
            OpRequest::Recall { query: "helix".into(), limit: None, session_id: None },
        )
        .await;
        let progress: Vec<&Chunk> = chunks.iter().filter(|c| !c.is_terminal()).collect();
        assert_eq!(progress.len(), 1);
        assert!(progress[0].render().contains("editor"));
        assert_eq!(final_doc(&chunks)["matches"], 1);
    }

    #[tokio::test]
    async fn execute_yields_queued_receipt() {
        let (_dir, orchestrator) = test_orchestrator();
        let chunks = run(
            &orchestrator,
            OpRequest::Execute { code: "print(1)".into(), language: None, session_id: None },
        )
        .await;
        let doc = final_doc(&chunks);
        assert_eq!(doc["status"], "queued");
        assert!(doc["execution_id"].is_string());
    }

    #[tokio::test]
    async fn errors_surface_as_terminal_chunks_not_panics() {
        let (_dir, orchestrator) = test_orchestrator();
        let chunks = run(
            &orchestrator,
            OpRequest::Execute { code: "   ".into(), language: None, session_id: None },
        )
        .await;
        match chunks.last().unwrap() {
            Chunk::Error(message) => assert!(message.contains("code")),
            other => panic!("expected error chunk, got {other:?}"),
        }
        assert!(chunks.last().unwrap().render().starts_with("⚠️ Error:"));
    }

    #[tokio::test]
    async fn init_op_returns_full_document_shape() {
        let (_dir, orchestrator) = test_orchestrator();
        let chunks = run(&orchestrator, OpRequest::Init { session_id: None }).await;
        let doc = final_doc(&chunks);
        for field in ["session_id", "status", "user", "context", "loaded_memories", "suggestions"] {
            assert!(doc.get(field).is_some(), "missing field {field}");
        }
        assert_eq!(doc["status"], "new");
    }

    #[tokio::test]
    async fn cancel_op_reports_whether_row_was_cancellable() {
        let (_dir, orchestrator) = test_orchestrator();
        let receipt = orchestrator
            .components()
            .executions
            .queue("echo hi", None, None)
            .unwrap();

        let chunks = run(&orchestrator, OpRequest::Cancel { execution_id: receipt.id }).await;
        assert_eq!(final_doc(&chunks)["cancelled"], true);

        // Already terminal: the op still completes, reporting false.
        let chunks = run(&orchestrator, OpRequest::Cancel { execution_id: receipt.id }).await;
        assert_eq!(final_doc(&chunks)["cancelled"], false);
    }

    #[test]
    fn op_request_decodes_from_transport_json() {
        let request: OpRequest = serde_json::from_str(
            r#"{"op": "remember", "key": "k", "value": {"a": 1}, "type": "general"}"#,
        )
        .unwrap();
        assert!(matches!(request, OpRequest::Remember { .. }));

        let request: OpRequest =
            serde_json::from_str(r#"{"op": "execute", "code": "ls", "language": "shell"}"#)
                .unwrap();
        assert!(matches!(
            request,
            OpRequest::Execute { language: Some(Language::Shell), .. }
        ));
    }
}

//! Request transcript replay.
//!
//! Drives recorded requests through [`ServerHooks`] the way a server
//! integration would, so a ruleset and pipeline configuration can be
//! exercised end to end without a real HTTP server.
//!
//! # Transcript Format
//!
//! One JSON object per line. Blank lines and lines starting with `#`
//! are ignored.
//!
//! ```text
//! {"label": "login", "request": {"server.request.query": {"user": "alice"}}, "user_id": "alice"}
//! {"request": {"server.request.body": {"q": "x' OR 1=1"}},
//!  "sinks": [{"kind": "SQL_INJECTION", "location": "db.query", "value": "SELECT .. 'x' OR 1=1'"}]}
//! {"request": {}, "error": "upstream timeout"}
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use reqshield_appsec::{
    DetectionEngine, HandlerOutcome, LifecycleState, Request, SecurityPipeline, ServerHooks, Sink,
    status_response, tags,
};
use reqshield_core::span::{RecordingSpan, TraceSpan};
use reqshield_core::types::{Action, Attributes};

/// Upper bound on waiting for the pipeline to finalize a replayed request.
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(2);

/// One recorded request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranscriptEntry {
    /// Free-form label echoed in the outcome.
    #[serde(default)]
    pub label: Option<String>,
    /// Inbound addresses.
    #[serde(default)]
    pub request: Attributes,
    /// Outbound addresses sent with the finish notification.
    #[serde(default)]
    pub response: Attributes,
    /// Authenticated user checked against the ruleset during the handler.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Sink calls made by the handler.
    #[serde(default)]
    pub sinks: Vec<SinkCall>,
    /// Makes the handler fail with this message.
    #[serde(default)]
    pub error: Option<String>,
}

/// A sink call recorded in a transcript.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkCall {
    pub kind: String,
    pub location: String,
    pub value: String,
}

/// How a replayed request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Completed,
    Blocked,
    Failed,
}

/// Result of replaying one transcript line.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayOutcome {
    /// 1-based transcript line number.
    pub line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub request_id: String,
    pub verdict: Verdict,
    /// Whether the request passed admission control.
    pub analyzed: bool,
    pub actions: Vec<Action>,
    /// Vulnerabilities attached to the root span.
    pub vulnerabilities: usize,
}

/// Parse a JSON-lines transcript into `(line_number, entry)` pairs.
pub fn parse_transcript(content: &str) -> Result<Vec<(usize, TranscriptEntry)>> {
    content
        .lines()
        .enumerate()
        .map(|(idx, line)| (idx + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(number, line)| {
            serde_json::from_str(line)
                .map(|entry| (number, entry))
                .with_context(|| format!("invalid transcript entry on line {number}"))
        })
        .collect()
}

/// Read and replay a transcript file.
pub async fn replay_file<E: DetectionEngine>(
    pipeline: &SecurityPipeline<E>,
    hooks: &ServerHooks,
    path: &Path,
) -> Result<Vec<ReplayOutcome>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read transcript {}", path.display()))?;
    replay(pipeline, hooks, &content).await
}

/// Replay every entry of a transcript in order.
pub async fn replay<E: DetectionEngine>(
    pipeline: &SecurityPipeline<E>,
    hooks: &ServerHooks,
    content: &str,
) -> Result<Vec<ReplayOutcome>> {
    let entries = parse_transcript(content)?;
    tracing::info!(requests = entries.len(), "replaying request transcript");

    let mut outcomes = Vec::with_capacity(entries.len());
    for (line, entry) in entries {
        outcomes.push(replay_entry(pipeline, hooks, line, entry).await);
    }
    Ok(outcomes)
}

/// Replay a single request through the hooks.
pub async fn replay_entry<E: DetectionEngine>(
    pipeline: &SecurityPipeline<E>,
    hooks: &ServerHooks,
    line: usize,
    entry: TranscriptEntry,
) -> ReplayOutcome {
    let span = Arc::new(RecordingSpan::new_root());
    let request = Request::new(entry.request.clone(), span.clone());
    let request_id = request.id();

    let outcome = hooks
        .handle_request(Arc::clone(&request), |_abort| run_handler(pipeline, &entry))
        .await;

    let (verdict, actions) = match outcome {
        HandlerOutcome::Completed(HandlerFlow::UserBlocked) => {
            hooks.finish_response(&request, status_response(403));
            (Verdict::Blocked, vec![Action::Block])
        }
        HandlerOutcome::Completed(HandlerFlow::Served) => {
            hooks.finish_response(&request, entry.response.clone());
            (Verdict::Completed, Vec::new())
        }
        HandlerOutcome::Failed(_) => (Verdict::Failed, Vec::new()),
        HandlerOutcome::Aborted { actions } => (Verdict::Blocked, actions),
    };

    if hooks.has_subscriber() && !wait_finalized(&request).await {
        tracing::warn!(%request_id, line, "request not finalized in time");
    }

    let vulnerabilities = span
        .tag(tags::IAST_JSON)
        .and_then(|summary| summary["vulnerabilities"].as_array().map(Vec::len))
        .unwrap_or(0);

    ReplayOutcome {
        line,
        label: entry.label,
        request_id: request_id.to_string(),
        verdict,
        analyzed: span.tag(tags::IAST_ENABLED) == Some(json!(1)),
        actions,
        vulnerabilities,
    }
}

enum HandlerFlow {
    Served,
    UserBlocked,
}

/// Simulated request handler. `handle_request` runs it inside the request's scope.
async fn run_handler<E: DetectionEngine>(
    pipeline: &SecurityPipeline<E>,
    entry: &TranscriptEntry,
) -> Result<HandlerFlow, String> {
    // Requests denied admission have no context and get no analysis.
    if let Some(ctx) = pipeline.store().current() {
        let request_id = ctx.request_id();

        if let Some(user_id) = entry.user_id.as_deref()
            && pipeline.check_user(request_id, user_id).await
        {
            return Ok(HandlerFlow::UserBlocked);
        }

        for call in &entry.sinks {
            let sink = Sink::new(&call.kind, &call.location, &call.value);
            pipeline.report_sink(request_id, &sink);
        }
    }

    match &entry.error {
        Some(message) => Err(message.clone()),
        None => Ok(HandlerFlow::Served),
    }
}

async fn wait_finalized(request: &Request) -> bool {
    tokio::time::timeout(FINALIZE_TIMEOUT, async {
        while request.state().get() != LifecycleState::Done {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_skips_comments_and_blank_lines() {
        let content = r#"
# warmup
{"label": "a", "request": {"server.request.query": {"q": "1"}}}

{"request": {}, "error": "boom"}
"#;
        let entries = parse_transcript(content).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, 3);
        assert_eq!(entries[0].1.label.as_deref(), Some("a"));
        assert_eq!(entries[1].1.error.as_deref(), Some("boom"));
    }

    #[test]
    fn parse_reports_line_number() {
        let err = parse_transcript("{}\n{not json").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn verdict_serializes_snake_case() {
        assert_eq!(serde_json::to_value(Verdict::Blocked).unwrap(), json!("blocked"));
    }
}

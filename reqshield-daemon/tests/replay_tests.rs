//! Transcript replay tests.
//!
//! Builds an orchestrator over an inline ruleset and replays recorded
//! requests through the server hooks end to end.

use std::io::Write;

use reqshield_core::config::ReqshieldConfig;
use reqshield_core::types::Action;
use reqshield_daemon::orchestrator::Orchestrator;
use reqshield_daemon::replay::{self, Verdict};

const RULES: &str = r#"
version: "1.0.0"
rules:
  - id: sqli-001
    name: SQL injection attempt
    tags:
      type: sql_injection
    conditions:
      - address: server.request.query
        modifier: contains
        value: "' OR 1=1"
    on_match: [block]
  - id: usr-001
    name: Banned user
    conditions:
      - address: usr.id
        value: mallory
    on_match: [block]
"#;

const TRANSCRIPT: &str = r#"
# clean request
{"label": "clean", "request": {"server.request.query": {"q": "hello"}}, "response": {"server.response.status": 200}}
{"label": "sqli", "request": {"server.request.query": {"q": "x' OR 1=1"}}}
{"label": "banned-user", "request": {"server.request.query": {"q": "hi"}}, "user_id": "mallory"}
{"label": "tainted-sink", "request": {"server.request.body": {"name": "robert"}}, "sinks": [{"kind": "SQL_INJECTION", "location": "db.query", "value": "SELECT * FROM users WHERE name = 'robert'"}]}
{"label": "failure", "request": {}, "error": "upstream timeout"}
"#;

fn config() -> ReqshieldConfig {
    let mut config = ReqshieldConfig::default();
    config.waf.rules_inline = RULES.to_owned();
    config.waf.timeout_ms = 200;
    config.overhead.max_concurrent_requests = 16;
    config.overhead.sampling_budget = 1000;
    config.reporter.dedup_window_secs = 0;
    config
}

#[tokio::test]
async fn test_replay_transcript_end_to_end() {
    // Given: A running orchestrator with the inline ruleset
    let mut orchestrator = Orchestrator::build_from_config(config()).await.unwrap();
    orchestrator.start().unwrap();

    // When: Replaying the transcript
    let outcomes = replay::replay(
        orchestrator.pipeline(),
        orchestrator.hooks(),
        TRANSCRIPT,
    )
    .await
    .unwrap();

    // Then: Every entry has the expected verdict
    let verdicts: Vec<_> = outcomes.iter().map(|o| o.verdict).collect();
    assert_eq!(
        verdicts,
        vec![
            Verdict::Completed,
            Verdict::Blocked,
            Verdict::Blocked,
            Verdict::Completed,
            Verdict::Failed,
        ]
    );
    assert!(outcomes.iter().all(|o| o.analyzed));
    assert_eq!(outcomes[0].line, 3);
    assert_eq!(outcomes[1].actions, vec![Action::Block]);
    assert_eq!(outcomes[2].actions, vec![Action::Block]);
    assert_eq!(outcomes[3].vulnerabilities, 1);
    assert_eq!(outcomes[0].vulnerabilities, 0);

    // All admitted requests were released
    assert_eq!(orchestrator.pipeline().overhead().in_flight(), 0);
    assert!(orchestrator.pipeline().store().is_empty());
    assert_eq!(orchestrator.pipeline().taint().transaction_count(), 0);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_replay_without_subscriber_skips_analysis() {
    // Given: An orchestrator that was never started
    let orchestrator = Orchestrator::build_from_config(config()).await.unwrap();

    // When
    let outcomes = replay::replay(
        orchestrator.pipeline(),
        orchestrator.hooks(),
        r#"{"request": {"server.request.query": {"q": "x' OR 1=1"}}}"#,
    )
    .await
    .unwrap();

    // Then: Nothing blocks and nothing is analyzed
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].verdict, Verdict::Completed);
    assert!(!outcomes[0].analyzed);
}

#[tokio::test]
async fn test_replay_file_from_disk() {
    // Given: A transcript file
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{"label": "one", "request": {{"server.request.query": {{"q": "a"}}}}}}"#
    )
    .unwrap();

    let mut orchestrator = Orchestrator::build_from_config(config()).await.unwrap();
    orchestrator.start().unwrap();

    // When
    let outcomes = orchestrator.replay(file.path()).await.unwrap();

    // Then
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].label.as_deref(), Some("one"));
    assert_eq!(outcomes[0].verdict, Verdict::Completed);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_replay_rejects_malformed_transcript() {
    let orchestrator = Orchestrator::build_from_config(config()).await.unwrap();
    let result = replay::replay(orchestrator.pipeline(), orchestrator.hooks(), "{oops").await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_replay_outcome_serializes_as_json_line() {
    let mut orchestrator = Orchestrator::build_from_config(config()).await.unwrap();
    orchestrator.start().unwrap();

    let outcomes = replay::replay(
        orchestrator.pipeline(),
        orchestrator.hooks(),
        r#"{"label": "sqli", "request": {"server.request.query": {"q": "x' OR 1=1"}}}"#,
    )
    .await
    .unwrap();

    let line = serde_json::to_value(&outcomes[0]).unwrap();
    assert_eq!(line["verdict"], "blocked");
    assert_eq!(line["actions"][0], "block");
    assert_eq!(line["label"], "sqli");

    orchestrator.shutdown().await;
}

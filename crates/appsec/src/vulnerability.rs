//! 취약점 수집 및 보고
//!
//! - [`VulnerabilityBatch`]: 요청 하나의 취약점을 `(kind, location)` 기준으로
//!   중복 제거하며 순서대로 모으고, 정확히 한 번만 비워집니다.
//! - [`VulnerabilityReporter`]: 요청 종료 시 묶음을 받아 요청 간 중복 제거 윈도우를
//!   적용한 뒤 크기 제한이 있는 JSON 요약을 루트 스팬에 태그로 남깁니다.
//!
//! 보고 실패는 로그로 남기고 버립니다. 응답에는 영향을 주지 않습니다.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use reqshield_core::event::{SecurityEvent, VulnerabilityEvent};
use reqshield_core::metrics as m;
use reqshield_core::span::{MAX_TAG_VALUE_BYTES, TraceSpan};
use reqshield_core::types::RequestId;

use crate::config::AppsecConfig;
use crate::events::try_publish;
use crate::tags;

/// 증거 미리보기 최대 길이 (문자 수)
const MAX_EVIDENCE_PREVIEW_CHARS: usize = 64;

/// 요청 간 중복 제거를 위해 추적하는 최대 항목 수
///
/// 초과하면 만료 항목을 정리하고, 그래도 넘치면 가장 오래된 항목부터 버립니다.
const MAX_TRACKED_FINDINGS: usize = 4_096;

/// 취약점 하나
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Vulnerability {
    /// 취약점 종류 (예: `SQL_INJECTION`)
    pub kind: String,
    /// 발생 위치 (싱크 식별자)
    pub location: String,
    /// 증거 값의 해시
    pub evidence_hash: u64,
    /// 증거 값 미리보기
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

impl Vulnerability {
    /// 증거 값으로부터 취약점을 만듭니다. 증거는 잘린 미리보기만 보관합니다.
    pub fn new(kind: impl Into<String>, location: impl Into<String>, evidence: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        evidence.hash(&mut hasher);

        let preview: String = evidence.chars().take(MAX_EVIDENCE_PREVIEW_CHARS).collect();
        Self {
            kind: kind.into(),
            location: location.into(),
            evidence_hash: hasher.finish(),
            evidence: (!preview.is_empty()).then_some(preview),
        }
    }

    fn key(&self) -> (String, String) {
        (self.kind.clone(), self.location.clone())
    }
}

/// 요청 하나의 취약점 묶음
#[derive(Debug, Default)]
pub struct VulnerabilityBatch {
    findings: Vec<Vulnerability>,
    seen: HashSet<(String, String)>,
    flushed: bool,
}

impl VulnerabilityBatch {
    /// 같은 `(kind, location)`이 이미 기록되었는지 여부
    pub fn contains(&self, kind: &str, location: &str) -> bool {
        self.seen.contains(&(kind.to_owned(), location.to_owned()))
    }

    /// 취약점을 추가합니다. 중복이거나 이미 비워진 묶음이면 `false`입니다.
    pub fn push(&mut self, vulnerability: Vulnerability) -> bool {
        if self.flushed || !self.seen.insert(vulnerability.key()) {
            return false;
        }
        self.findings.push(vulnerability);
        true
    }

    /// 묶음을 비웁니다. 두 번째 호출부터는 `None`입니다.
    pub fn take(&mut self) -> Option<Vec<Vulnerability>> {
        if self.flushed {
            return None;
        }
        self.flushed = true;
        Some(std::mem::take(&mut self.findings))
    }

    /// 기록된 취약점 수
    pub fn len(&self) -> usize {
        self.findings.len()
    }

    /// 비어 있는지 여부
    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }
}

/// 취약점 보고기
pub struct VulnerabilityReporter {
    dedup_window: Duration,
    max_summary_findings: usize,
    /// (kind, location) -> 마지막 보고 시각
    recent: Mutex<HashMap<(String, String), Instant>>,
    event_tx: Option<mpsc::Sender<SecurityEvent>>,
    total_reported: AtomicU64,
    dedup_suppressed: AtomicU64,
    faults: AtomicU64,
}

impl VulnerabilityReporter {
    /// 설정에서 보고기를 생성합니다.
    pub fn new(config: &AppsecConfig) -> Self {
        Self {
            dedup_window: config.dedup_window,
            max_summary_findings: config.max_summary_findings,
            recent: Mutex::new(HashMap::new()),
            event_tx: None,
            total_reported: AtomicU64::new(0),
            dedup_suppressed: AtomicU64::new(0),
            faults: AtomicU64::new(0),
        }
    }

    /// 보고된 묶음을 전송할 채널을 설정합니다.
    pub fn with_event_sender(mut self, tx: mpsc::Sender<SecurityEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// 요청의 취약점을 루트 스팬에 보고하고, 보고된 수를 반환합니다.
    ///
    /// 실패는 로그로 남기고 0을 반환합니다.
    pub fn send_vulnerabilities(
        &self,
        request_id: RequestId,
        findings: Vec<Vulnerability>,
        span: &dyn TraceSpan,
    ) -> usize {
        if findings.is_empty() {
            return 0;
        }

        let mut seen = HashSet::new();
        let unique: Vec<Vulnerability> = findings
            .into_iter()
            .filter(|v| seen.insert(v.key()))
            .collect();

        let fresh = self.filter_recent(unique);
        if fresh.is_empty() {
            debug!(%request_id, "all vulnerabilities suppressed by dedup window");
            return 0;
        }

        let summary = self.summary(&fresh);
        if let Err(e) = span.set_tag(tags::IAST_JSON, summary.clone()) {
            self.faults.fetch_add(1, Ordering::Relaxed);
            counter!(m::IAST_REPORTING_FAULTS_TOTAL).increment(1);
            warn!(
                %request_id,
                error = %e,
                count = fresh.len(),
                "failed to attach vulnerabilities to span, discarding"
            );
            return 0;
        }

        self.remember(&fresh);

        for v in &fresh {
            counter!(m::IAST_VULNERABILITIES_REPORTED_TOTAL, m::LABEL_KIND => v.kind.clone())
                .increment(1);
        }
        self.total_reported
            .fetch_add(fresh.len() as u64, Ordering::Relaxed);

        if let Some(tx) = &self.event_tx {
            let event = VulnerabilityEvent::new(
                request_id,
                span.trace_id().to_string(),
                fresh.len(),
                summary,
            );
            try_publish(tx, SecurityEvent::Vulnerability(event));
        }

        debug!(%request_id, count = fresh.len(), "vulnerabilities reported");
        fresh.len()
    }

    /// 최근에 보고된 항목을 걸러냅니다.
    fn filter_recent(&self, findings: Vec<Vulnerability>) -> Vec<Vulnerability> {
        if self.dedup_window.is_zero() {
            return findings;
        }

        let recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        let before = findings.len();
        let fresh: Vec<Vulnerability> = findings
            .into_iter()
            .filter(|v| {
                recent
                    .get(&v.key())
                    .is_none_or(|at| at.elapsed() >= self.dedup_window)
            })
            .collect();

        let suppressed = before - fresh.len();
        if suppressed > 0 {
            self.dedup_suppressed
                .fetch_add(suppressed as u64, Ordering::Relaxed);
            counter!(m::IAST_VULNERABILITIES_SUPPRESSED_TOTAL).increment(suppressed as u64);
        }
        fresh
    }

    fn remember(&self, findings: &[Vulnerability]) {
        if self.dedup_window.is_zero() {
            return;
        }
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        for v in findings {
            recent.insert(v.key(), now);
        }
        if recent.len() > MAX_TRACKED_FINDINGS {
            let window = self.dedup_window;
            recent.retain(|_, at| at.elapsed() < window);
        }
        if recent.len() > MAX_TRACKED_FINDINGS {
            let excess = recent.len() - MAX_TRACKED_FINDINGS;
            let mut by_age: Vec<_> = recent
                .iter()
                .map(|(key, at)| (*at, key.clone()))
                .collect();
            by_age.sort_unstable_by_key(|(at, _)| *at);
            for (_, key) in by_age.into_iter().take(excess) {
                recent.remove(&key);
            }
            debug!(evicted = excess, "dedup table full, evicted oldest findings");
        }
    }

    /// 스팬에 첨부할 요약을 만듭니다.
    ///
    /// 최대 `max_summary_findings`개, 직렬화 크기는 태그 한도 이내로 제한합니다.
    fn summary(&self, findings: &[Vulnerability]) -> Value {
        let mut entries: Vec<Value> = findings
            .iter()
            .take(self.max_summary_findings)
            .map(|v| {
                json!({
                    "type": v.kind,
                    "hash": v.evidence_hash,
                    "location": { "path": v.location },
                    "evidence": { "value": v.evidence },
                })
            })
            .collect();

        loop {
            let omitted = findings.len() - entries.len();
            let summary = if omitted > 0 {
                json!({ "vulnerabilities": entries, "truncated": omitted })
            } else {
                json!({ "vulnerabilities": entries })
            };
            if summary.to_string().len() <= MAX_TAG_VALUE_BYTES || entries.is_empty() {
                return summary;
            }
            entries.pop();
        }
    }

    /// 만료된 중복 제거 항목을 정리합니다.
    pub fn cleanup_expired(&self) {
        let window = self.dedup_window;
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent.retain(|_, at| at.elapsed() < window);
    }

    /// 보고된 총 취약점 수
    pub fn total_reported(&self) -> u64 {
        self.total_reported.load(Ordering::Relaxed)
    }

    /// 중복 제거 윈도우로 억제된 취약점 수
    pub fn dedup_suppressed(&self) -> u64 {
        self.dedup_suppressed.load(Ordering::Relaxed)
    }

    /// 보고 실패 수
    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqshield_core::span::RecordingSpan;

    fn reporter(dedup_window: Duration) -> VulnerabilityReporter {
        VulnerabilityReporter::new(&AppsecConfig {
            dedup_window,
            ..Default::default()
        })
    }

    fn sqli(location: &str) -> Vulnerability {
        Vulnerability::new("SQL_INJECTION", location, "SELECT * FROM users WHERE id = '1'")
    }

    #[test]
    fn batch_dedups_by_kind_and_location() {
        let mut batch = VulnerabilityBatch::default();
        assert!(batch.push(sqli("db.query")));
        assert!(!batch.push(sqli("db.query")));
        assert!(batch.push(sqli("db.exec")));
        assert!(batch.contains("SQL_INJECTION", "db.query"));
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn batch_flushes_once() {
        let mut batch = VulnerabilityBatch::default();
        batch.push(sqli("db.query"));
        assert_eq!(batch.take().map(|v| v.len()), Some(1));
        assert!(batch.take().is_none());
        assert!(!batch.push(sqli("db.exec")));
    }

    #[test]
    fn evidence_preview_is_truncated() {
        let long = "x".repeat(500);
        let v = Vulnerability::new("XSS", "render", &long);
        assert_eq!(v.evidence.as_deref().map(str::len), Some(64));
        assert_ne!(v.evidence_hash, Vulnerability::new("XSS", "render", "y").evidence_hash);
    }

    #[tokio::test]
    async fn duplicates_in_one_flush_reported_once() {
        let reporter = reporter(Duration::ZERO);
        let span = RecordingSpan::new_root();

        let count = reporter.send_vulnerabilities(
            RequestId::from_raw(1),
            vec![sqli("db.query"), sqli("db.query")],
            &span,
        );
        assert_eq!(count, 1);

        let tag = span.tag(tags::IAST_JSON).unwrap();
        assert_eq!(tag["vulnerabilities"].as_array().unwrap().len(), 1);
        assert_eq!(tag["vulnerabilities"][0]["type"], "SQL_INJECTION");
    }

    #[tokio::test(start_paused = true)]
    async fn dedup_window_suppresses_across_requests() {
        let reporter = reporter(Duration::from_secs(60));

        let first = RecordingSpan::new_root();
        assert_eq!(
            reporter.send_vulnerabilities(RequestId::from_raw(1), vec![sqli("db.query")], &first),
            1
        );

        let second = RecordingSpan::new_root();
        assert_eq!(
            reporter.send_vulnerabilities(RequestId::from_raw(2), vec![sqli("db.query")], &second),
            0
        );
        assert!(second.tag(tags::IAST_JSON).is_none());
        assert_eq!(reporter.dedup_suppressed(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        let third = RecordingSpan::new_root();
        assert_eq!(
            reporter.send_vulnerabilities(RequestId::from_raw(3), vec![sqli("db.query")], &third),
            1
        );
        assert_eq!(reporter.total_reported(), 2);
    }

    #[tokio::test]
    async fn span_failure_is_swallowed() {
        let reporter = reporter(Duration::from_secs(60));
        let span = RecordingSpan::new_root();
        span.finish();

        let count =
            reporter.send_vulnerabilities(RequestId::from_raw(1), vec![sqli("db.query")], &span);
        assert_eq!(count, 0);
        assert_eq!(reporter.faults(), 1);

        // 실패한 보고는 중복 제거 대상으로 기록되지 않음
        let retry = RecordingSpan::new_root();
        assert_eq!(
            reporter.send_vulnerabilities(RequestId::from_raw(2), vec![sqli("db.query")], &retry),
            1
        );
    }

    #[tokio::test]
    async fn summary_is_bounded() {
        let reporter = VulnerabilityReporter::new(&AppsecConfig {
            dedup_window: Duration::ZERO,
            max_summary_findings: 3,
            ..Default::default()
        });
        let span = RecordingSpan::new_root();
        let findings: Vec<Vulnerability> = (0..10).map(|i| sqli(&format!("sink-{i}"))).collect();

        assert_eq!(
            reporter.send_vulnerabilities(RequestId::from_raw(1), findings, &span),
            10
        );
        let tag = span.tag(tags::IAST_JSON).unwrap();
        assert_eq!(tag["vulnerabilities"].as_array().unwrap().len(), 3);
        assert_eq!(tag["truncated"], 7);
    }

    #[tokio::test]
    async fn flushed_batch_published_as_event() {
        let (tx, mut rx) = mpsc::channel(4);
        let reporter = reporter(Duration::ZERO).with_event_sender(tx);
        let span = RecordingSpan::new_root();

        reporter.send_vulnerabilities(RequestId::from_raw(9), vec![sqli("db.query")], &span);
        match rx.try_recv().unwrap() {
            SecurityEvent::Vulnerability(event) => {
                assert_eq!(event.request_id, RequestId::from_raw(9));
                assert_eq!(event.count, 1);
                assert_eq!(event.metadata.trace_id, span.trace_id().to_string());
            }
            other => panic!("unexpected event: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_removes_expired_entries() {
        let reporter = reporter(Duration::from_secs(10));
        let span = RecordingSpan::new_root();
        reporter.send_vulnerabilities(RequestId::from_raw(1), vec![sqli("db.query")], &span);

        tokio::time::advance(Duration::from_secs(11)).await;
        reporter.cleanup_expired();
        assert!(reporter.recent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dedup_table_evicts_oldest_when_full() {
        let reporter = reporter(Duration::from_secs(3600));
        let first = sqli("db.query.0");
        reporter.remember(std::slice::from_ref(&first));
        tokio::time::advance(Duration::from_millis(1)).await;

        let live: Vec<_> = (1..=MAX_TRACKED_FINDINGS)
            .map(|i| sqli(&format!("db.query.{i}")))
            .collect();
        reporter.remember(&live);

        let recent = reporter.recent.lock().unwrap();
        assert_eq!(recent.len(), MAX_TRACKED_FINDINGS);
        assert!(!recent.contains_key(&first.key()));
        assert!(recent.contains_key(&live[0].key()));
    }
}

//! 트레이스 스팬 추상화 — 요청의 루트 스팬에 태그를 붙이는 인터페이스
//!
//! 분석 결과(분석 여부 마커, 취약점 요약, 에러)는 요청의 루트 스팬에 태그로 기록됩니다.
//! 실제 트레이서 연동은 [`TraceSpan`] trait을 구현하여 제공하며,
//! [`RecordingSpan`]은 태그를 메모리에 보관하는 기본 구현입니다.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde_json::Value;

/// 스팬 태그 기록 실패
#[derive(Debug, thiserror::Error)]
pub enum SpanError {
    /// 이미 종료된 스팬
    #[error("span {span_id} already finished")]
    Finished { span_id: u64 },

    /// 태그 값이 허용 크기를 초과
    #[error("tag '{key}' too large: {size} bytes (max: {max})")]
    TagTooLarge { key: String, size: usize, max: usize },
}

/// 요청의 루트 스팬
///
/// `Send + Sync` 바운드로 여러 태스크에서 공유할 수 있습니다.
pub trait TraceSpan: Send + Sync {
    /// 스팬 ID
    fn span_id(&self) -> u64;

    /// 트레이스 ID
    fn trace_id(&self) -> u64;

    /// 태그를 기록합니다. 같은 키는 덮어씁니다.
    fn set_tag(&self, key: &str, value: Value) -> Result<(), SpanError>;

    /// 기록된 태그를 조회합니다.
    fn tag(&self, key: &str) -> Option<Value>;
}

static NEXT_SPAN_ID: AtomicU64 = AtomicU64::new(1);

/// 태그 값 최대 크기 (직렬화 기준 바이트)
pub const MAX_TAG_VALUE_BYTES: usize = 25 * 1024;

/// 태그를 메모리에 보관하는 스팬
///
/// 트레이서가 없는 환경(데몬 리플레이, 테스트)에서 사용합니다.
#[derive(Debug)]
pub struct RecordingSpan {
    span_id: u64,
    trace_id: u64,
    tags: Mutex<BTreeMap<String, Value>>,
    finished: AtomicBool,
}

impl RecordingSpan {
    /// 새 루트 스팬을 만듭니다. 트레이스 ID는 스팬 ID와 같습니다.
    pub fn new_root() -> Self {
        let id = NEXT_SPAN_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            span_id: id,
            trace_id: id,
            tags: Mutex::new(BTreeMap::new()),
            finished: AtomicBool::new(false),
        }
    }

    /// 스팬을 종료합니다. 이후 태그 기록은 실패합니다.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }

    /// 기록된 모든 태그의 사본을 반환합니다.
    pub fn tags(&self) -> BTreeMap<String, Value> {
        self.tags
            .lock()
            .map(|tags| tags.clone())
            .unwrap_or_default()
    }
}

impl TraceSpan for RecordingSpan {
    fn span_id(&self) -> u64 {
        self.span_id
    }

    fn trace_id(&self) -> u64 {
        self.trace_id
    }

    fn set_tag(&self, key: &str, value: Value) -> Result<(), SpanError> {
        if self.finished.load(Ordering::Acquire) {
            return Err(SpanError::Finished {
                span_id: self.span_id,
            });
        }

        let size = value.to_string().len();
        if size > MAX_TAG_VALUE_BYTES {
            return Err(SpanError::TagTooLarge {
                key: key.to_owned(),
                size,
                max: MAX_TAG_VALUE_BYTES,
            });
        }

        // poison 상태여도 태그 맵 자체는 일관적이므로 계속 사용합니다
        let mut tags = self.tags.lock().unwrap_or_else(|e| e.into_inner());
        tags.insert(key.to_owned(), value);
        Ok(())
    }

    fn tag(&self, key: &str) -> Option<Value> {
        self.tags.lock().ok()?.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn root_spans_get_distinct_ids() {
        let a = RecordingSpan::new_root();
        let b = RecordingSpan::new_root();
        assert_ne!(a.span_id(), b.span_id());
        assert_eq!(a.span_id(), a.trace_id());
    }

    #[test]
    fn set_tag_overwrites() {
        let span = RecordingSpan::new_root();
        span.set_tag("appsec.iast.enabled", json!(0)).unwrap();
        span.set_tag("appsec.iast.enabled", json!(1)).unwrap();
        assert_eq!(span.tag("appsec.iast.enabled"), Some(json!(1)));
        assert_eq!(span.tags().len(), 1);
    }

    #[test]
    fn finished_span_rejects_tags() {
        let span = RecordingSpan::new_root();
        span.finish();
        let err = span.set_tag("k", json!("v")).unwrap_err();
        assert!(matches!(err, SpanError::Finished { .. }));
    }

    #[test]
    fn oversized_tag_rejected() {
        let span = RecordingSpan::new_root();
        let big = "x".repeat(MAX_TAG_VALUE_BYTES + 1);
        let err = span.set_tag("big", json!(big)).unwrap_err();
        assert!(matches!(err, SpanError::TagTooLarge { .. }));
        assert!(span.tag("big").is_none());
    }
}

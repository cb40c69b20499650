//! 이벤트 시스템 — 분석 결과를 다운스트림으로 전달하는 기본 단위
//!
//! 파이프라인은 탐지 결과를 직접 외부로 보내지 않고 이벤트로 발행합니다.
//! [`EventMetadata`]는 모든 이벤트에 공통으로 포함되는 메타데이터이며,
//! [`Event`] trait은 모든 이벤트 타입이 구현해야 하는 인터페이스입니다.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::types::{Action, RequestId};

// --- 모듈명 상수 ---

/// 탐지 엔진(WAF) 모듈명
pub const MODULE_WAF: &str = "waf";
/// 취약점 분석(taint) 모듈명
pub const MODULE_IAST: &str = "iast";

// --- 이벤트 타입 상수 ---

/// 공격 탐지 이벤트 타입
pub const EVENT_TYPE_ATTACK: &str = "attack";
/// 취약점 보고 이벤트 타입
pub const EVENT_TYPE_VULNERABILITY: &str = "vulnerability";

/// 이벤트 메타데이터 — 모든 이벤트에 공통으로 포함되는 추적 정보
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// 이벤트 발생 시각
    pub timestamp: SystemTime,
    /// 이벤트를 생성한 모듈명 (예: "waf", "iast")
    pub source_module: String,
    /// 분산 추적 ID — 요청의 루트 스팬 트레이스 ID
    pub trace_id: String,
}

impl EventMetadata {
    /// 기존 trace_id를 사용하여 새 메타데이터를 생성합니다.
    pub fn new(source_module: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            source_module: source_module.into(),
            trace_id: trace_id.into(),
        }
    }

    /// 새로운 UUID v4 trace_id를 생성하여 메타데이터를 만듭니다.
    ///
    /// 스팬이 없는 요청에서 사용합니다.
    pub fn with_new_trace(source_module: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            source_module: source_module.into(),
            trace_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl fmt::Display for EventMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] source={} trace={}",
            unix_timestamp_str(self.timestamp),
            self.source_module,
            self.trace_id,
        )
    }
}

/// 모든 이벤트가 구현해야 하는 기본 trait
///
/// `Send + Sync + 'static` 바운드로 `tokio::mpsc` 채널을 통한
/// 안전한 전송을 보장합니다.
pub trait Event: Send + Sync + 'static {
    /// 이벤트 고유 ID (UUID v4)
    fn event_id(&self) -> &str;

    /// 이벤트 메타데이터 (timestamp, source_module, trace_id)
    fn metadata(&self) -> &EventMetadata;

    /// 이벤트 타입명 (로깅 및 라우팅에 사용)
    fn event_type(&self) -> &str;
}

/// 탐지 엔진이 공격을 관측했을 때 발행되는 이벤트
///
/// 엔진 호출 1회에 대해 최대 한 번 발행됩니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackEvent {
    /// 이벤트 고유 ID
    pub id: String,
    /// 이벤트 메타데이터
    pub metadata: EventMetadata,
    /// 대상 요청
    pub request_id: RequestId,
    /// 매칭 당시 룰셋 버전
    pub rules_version: String,
    /// 엔진이 반환한 매칭 결과 (엔진 정의 JSON)
    pub matches: serde_json::Value,
    /// 엔진이 요청한 완화 액션
    pub actions: Vec<Action>,
}

impl AttackEvent {
    /// 요청의 트레이스에 연결된 공격 이벤트를 생성합니다.
    pub fn new(
        request_id: RequestId,
        trace_id: impl Into<String>,
        rules_version: impl Into<String>,
        matches: serde_json::Value,
        actions: Vec<Action>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            metadata: EventMetadata::new(MODULE_WAF, trace_id),
            request_id,
            rules_version: rules_version.into(),
            matches,
            actions,
        }
    }

    /// 차단 액션이 포함되어 있는지 여부
    pub fn is_blocking(&self) -> bool {
        self.actions.iter().any(Action::is_blocking)
    }
}

impl Event for AttackEvent {
    fn event_id(&self) -> &str {
        &self.id
    }

    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    fn event_type(&self) -> &str {
        EVENT_TYPE_ATTACK
    }
}

impl fmt::Display for AttackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AttackEvent[{}] request={} rules_version={} blocking={}",
            &self.id[..8.min(self.id.len())],
            self.request_id,
            self.rules_version,
            self.is_blocking(),
        )
    }
}

/// 요청 종료 시 플러시된 취약점 묶음 이벤트
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VulnerabilityEvent {
    /// 이벤트 고유 ID
    pub id: String,
    /// 이벤트 메타데이터
    pub metadata: EventMetadata,
    /// 대상 요청
    pub request_id: RequestId,
    /// 보고된 취약점 수 (요약에서 잘린 항목 포함)
    pub count: usize,
    /// 스팬에 첨부된 것과 같은 요약 JSON
    pub summary: serde_json::Value,
}

impl VulnerabilityEvent {
    /// 요청의 트레이스에 연결된 취약점 이벤트를 생성합니다.
    pub fn new(
        request_id: RequestId,
        trace_id: impl Into<String>,
        count: usize,
        summary: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            metadata: EventMetadata::new(MODULE_IAST, trace_id),
            request_id,
            count,
            summary,
        }
    }
}

impl Event for VulnerabilityEvent {
    fn event_id(&self) -> &str {
        &self.id
    }

    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    fn event_type(&self) -> &str {
        EVENT_TYPE_VULNERABILITY
    }
}

impl fmt::Display for VulnerabilityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VulnerabilityEvent[{}] request={} count={}",
            &self.id[..8.min(self.id.len())],
            self.request_id,
            self.count,
        )
    }
}

/// 다운스트림으로 전달되는 보안 이벤트
///
/// 하나의 채널로 두 종류의 이벤트를 전달하기 위한 합 타입입니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SecurityEvent {
    /// 공격 관측
    Attack(AttackEvent),
    /// 취약점 보고
    Vulnerability(VulnerabilityEvent),
}

impl SecurityEvent {
    /// 내부 이벤트를 `Event` trait 객체로 반환합니다.
    pub fn as_event(&self) -> &dyn Event {
        match self {
            Self::Attack(e) => e,
            Self::Vulnerability(e) => e,
        }
    }
}

impl fmt::Display for SecurityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attack(e) => e.fmt(f),
            Self::Vulnerability(e) => e.fmt(f),
        }
    }
}

fn unix_timestamp_str(time: SystemTime) -> String {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(duration) => format!("{}", duration.as_secs()),
        Err(_) => "unknown".to_owned(),
    }
}

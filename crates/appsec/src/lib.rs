//! # reqshield-appsec
//!
//! 요청 단위 보안 분석 파이프라인입니다.
//!
//! 서버가 처리하는 요청마다 룰 기반 탐지 엔진(WAF)을 실행해 차단 여부를 결정하고,
//! 선택적으로 taint 흐름 분석을 수행해 취약점을 보고합니다. 모든 분석은 요청별/전역
//! 예산 안에서만 수행되어 보안 분석이 요청 처리 비용을 지배하지 않도록 합니다.
//!
//! # 아키텍처
//! ```text
//! ServerHooks --(RequestEvent)--> SecurityPipeline
//!                                   |-- OverheadController (어드미션, 할당량)
//!                                   |-- RequestContextStore (요청 ID -> 컨텍스트)
//!                                   |     `-- WafContext -> DetectionEngine
//!                                   |-- TaintTracker
//!                                   `-- VulnerabilityReporter --> span tag / SecurityEvent
//! ```
//!
//! # 주요 컴포넌트
//! - [`waf`]: 탐지 엔진 trait과 요청 단위 핸들, YAML 룰셋 참조 엔진
//! - [`overhead`]: 동시성 + 샘플링 어드미션 게이트
//! - [`context`]: 요청 컨텍스트 저장소와 태스크 로컬 범위
//! - [`taint`]: 요청별 오염 추적 트랜잭션
//! - [`vulnerability`]: 취약점 중복 제거와 스팬 보고
//! - [`lifecycle`]: 요청 생명주기 상태
//! - [`hooks`]: 서버 알림 발행 인터페이스
//! - [`pipeline`]: 오케스트레이션

pub mod config;
pub mod context;
pub mod error;
mod events;
pub mod hooks;
pub mod lifecycle;
pub mod overhead;
pub mod pipeline;
pub mod taint;
pub mod vulnerability;
pub mod waf;

/// 루트 스팬 태그 이름
pub mod tags {
    /// 요청이 심층 분석 대상인지 여부 (1/0)
    pub const IAST_ENABLED: &str = "appsec.iast.enabled";
    /// 취약점 요약 JSON
    pub const IAST_JSON: &str = "appsec.iast.json";
    /// 요청 처리 에러 메시지
    pub const ERROR: &str = "error";
    /// 인증된 사용자 ID
    pub const USER_ID: &str = "usr.id";
}

pub use config::{AppsecConfig, RulesSource};
pub use context::{RequestContext, RequestContextStore, current_request_id, with_request};
pub use error::AppsecError;
pub use hooks::{
    HandlerOutcome, Request, RequestEvent, ServerHooks, StartDecision, status_response,
};
pub use lifecycle::{LifecycleCell, LifecycleState};
pub use overhead::{Operation, OverheadController, RequestBudget};
pub use pipeline::{SecurityPipeline, SecurityPipelineBuilder, Sink};
pub use taint::{TaintOrigin, TaintTracker};
pub use vulnerability::{Vulnerability, VulnerabilityBatch, VulnerabilityReporter};
pub use waf::{
    DetectionEngine, EngineContext, EngineOutcome, RulesetEngine, WafContext, WafRunResult,
};
